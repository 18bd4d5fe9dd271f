//! Directory-listing transport
//!
//! Each protocol (FTP, FTPS, SFTP) implements [`RemoteClient`]; the
//! [`Client`] enum dispatches to the configured one and [`RemoteLister`]
//! wraps a full connect/login/list/quit sequence behind the
//! [`DirectoryLister`] interface consumed by the poll scheduler.

pub mod ftp;
pub mod ftps;
pub mod sftp;

pub use ftp::FtpClient;
pub use ftps::FtpsClient;
pub use sftp::SftpClient;

use crate::config::{Config, Protocol};
use crate::logging::log;
use chrono::{DateTime, NaiveDateTime, Utc};
use secrecy::SecretString;
use std::io;
use std::net::{SocketAddr, ToSocketAddrs};
use std::time::Duration;
use thiserror::Error;

/// Error type for protocol operations
pub type FtpError = suppaftp::FtpError;

/// One regular file of a remote directory listing
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileInfo {
    /// File name without directory part, unique within one listing
    pub name: String,
    /// Size in bytes
    pub size: u64,
    /// Modification time as reported by the remote server
    pub mod_time: DateTime<Utc>,
}

/// Failure to enumerate the remote directory during one poll cycle
#[derive(Debug, Error)]
pub enum ListingError {
    #[error("cannot connect to {address}: {source}")]
    Connect {
        address: String,
        #[source]
        source: FtpError,
    },
    #[error("login as '{user}' failed: {source}")]
    Login {
        user: String,
        #[source]
        source: FtpError,
    },
    #[error("cannot list directory '{dir}': {source}")]
    List {
        dir: String,
        #[source]
        source: FtpError,
    },
}

/// Source of directory listings
pub trait DirectoryLister {
    /// Lists the regular files of `dir` in the order the server returns them
    fn list(&mut self, dir: &str) -> Result<Vec<FileInfo>, ListingError>;
}

/// Configuration for protocol connections
#[derive(Debug, Clone, Copy, Default)]
pub struct ProtocolConfig {
    /// Skip TLS certificate verification (for FTPS with self-signed certs)
    pub insecure_skip_verify: bool,
}

/// Login credentials for the remote server
#[derive(Debug, Clone)]
pub struct Credentials {
    pub user: String,
    pub password: SecretString,
    /// SSH private key used instead of the password (SFTP only)
    pub keyfile: Option<String>,
}

/// Common interface of the protocol clients
pub trait RemoteClient {
    /// Connect to a server, trying every resolved address in turn
    fn connect(
        host: &str,
        port: u16,
        timeout: Duration,
        config: &ProtocolConfig,
    ) -> Result<Self, FtpError>
    where
        Self: Sized;

    /// Authenticate the connection
    fn login(&mut self, credentials: &Credentials) -> Result<(), FtpError>;

    /// List regular files of `dir` with size and modification time
    fn list(&mut self, dir: &str) -> Result<Vec<FileInfo>, FtpError>;

    /// Quit/disconnect from the server
    fn quit(self) -> Result<(), FtpError>;
}

/// Strips any directory part some servers prepend to NLST results
pub(crate) fn base_name(entry: &str) -> &str {
    entry
        .trim_end_matches('/')
        .rsplit('/')
        .next()
        .unwrap_or(entry)
}

/// Connects to the first address `host:port` resolves to that accepts
///
/// Returns the error of the last address tried when none does.
pub(crate) fn connect_any<T, F>(host: &str, port: u16, mut attempt: F) -> Result<T, FtpError>
where
    F: FnMut(SocketAddr) -> Result<T, FtpError>,
{
    let mut last_error = None;
    for addr in (host, port).to_socket_addrs().map_err(FtpError::ConnectionError)? {
        match attempt(addr) {
            Ok(client) => return Ok(client),
            Err(e) => last_error = Some(e),
        }
    }
    Err(last_error.unwrap_or_else(|| {
        FtpError::ConnectionError(io::Error::new(
            io::ErrorKind::NotFound,
            format!("{} did not resolve to any address", host),
        ))
    }))
}

/// Builds a listing from NLST names, asking `stat` for each name's
/// modification time and size
///
/// Names that cannot be stat'ed (directories reject MDTM and SIZE on most
/// servers) are left out of the listing.
pub(crate) fn collect_entries<F>(names: Vec<String>, mut stat: F) -> Vec<FileInfo>
where
    F: FnMut(&str) -> Result<(NaiveDateTime, usize), FtpError>,
{
    let mut entries = Vec::with_capacity(names.len());
    for entry in &names {
        let name = base_name(entry);
        if name.is_empty() || name == "." || name == ".." {
            continue;
        }
        match stat(name) {
            Ok((modified, size)) => entries.push(FileInfo {
                name: name.to_string(),
                size: size as u64,
                mod_time: modified.and_utc(),
            }),
            Err(e) => {
                let _ = log(&format!(
                    "Skipping '{}', cannot get modification time or size: {}",
                    name,
                    e.to_string().replace('\n', "")
                ));
            }
        }
    }
    entries
}

/// Enum wrapper for FTP/FTPS/SFTP clients
pub enum Client {
    Ftp(FtpClient),
    Ftps(FtpsClient),
    Sftp(SftpClient),
}

impl Client {
    /// Connect to a server and create a client of the appropriate type
    pub fn connect(
        proto: Protocol,
        host: &str,
        port: u16,
        timeout: Duration,
        config: &ProtocolConfig,
    ) -> Result<Self, FtpError> {
        match proto {
            Protocol::Ftp => Ok(Client::Ftp(FtpClient::connect(host, port, timeout, config)?)),
            Protocol::Ftps => Ok(Client::Ftps(FtpsClient::connect(host, port, timeout, config)?)),
            Protocol::Sftp => Ok(Client::Sftp(SftpClient::connect(host, port, timeout, config)?)),
        }
    }

    pub fn login(&mut self, credentials: &Credentials) -> Result<(), FtpError> {
        match self {
            Client::Ftp(client) => client.login(credentials),
            Client::Ftps(client) => client.login(credentials),
            Client::Sftp(client) => client.login(credentials),
        }
    }

    pub fn list(&mut self, dir: &str) -> Result<Vec<FileInfo>, FtpError> {
        match self {
            Client::Ftp(client) => client.list(dir),
            Client::Ftps(client) => client.list(dir),
            Client::Sftp(client) => client.list(dir),
        }
    }

    pub fn quit(self) -> Result<(), FtpError> {
        match self {
            Client::Ftp(client) => client.quit(),
            Client::Ftps(client) => client.quit(),
            Client::Sftp(client) => client.quit(),
        }
    }
}

/// Lister opening a fresh connection for every listing
#[derive(Debug, Clone)]
pub struct RemoteLister {
    protocol: Protocol,
    host: String,
    port: u16,
    timeout: Duration,
    protocol_config: ProtocolConfig,
    credentials: Credentials,
}

impl RemoteLister {
    pub fn new(
        protocol: Protocol,
        host: &str,
        port: u16,
        timeout: Duration,
        protocol_config: ProtocolConfig,
        credentials: Credentials,
    ) -> Self {
        RemoteLister {
            protocol,
            host: host.to_string(),
            port,
            timeout,
            protocol_config,
            credentials,
        }
    }

    pub fn from_config(config: &Config) -> Self {
        RemoteLister::new(
            config.protocol(),
            &config.host,
            config.port(),
            config.connect_timeout(),
            ProtocolConfig {
                insecure_skip_verify: config.insecure_skip_verify,
            },
            config.credentials(),
        )
    }
}

impl DirectoryLister for RemoteLister {
    fn list(&mut self, dir: &str) -> Result<Vec<FileInfo>, ListingError> {
        let _ = log(&format!(
            "Making {} connection to {}:{}",
            self.protocol, self.host, self.port
        ));
        let mut client = Client::connect(
            self.protocol,
            &self.host,
            self.port,
            self.timeout,
            &self.protocol_config,
        )
        .map_err(|e| ListingError::Connect {
            address: format!("{}:{}", self.host, self.port),
            source: e,
        })?;

        if let Err(e) = client.login(&self.credentials) {
            let _ = client.quit();
            return Err(ListingError::Login {
                user: self.credentials.user.clone(),
                source: e,
            });
        }

        let result = client.list(dir).map_err(|e| ListingError::List {
            dir: dir.to_string(),
            source: e,
        });

        if let Err(e) = client.quit() {
            let _ = log(&format!("Error disconnecting from {}: {}", self.host, e));
        }
        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::NaiveDate;
    use std::io;

    fn at(h: u32, m: u32, s: u32) -> NaiveDateTime {
        NaiveDate::from_ymd_opt(2024, 3, 1)
            .unwrap()
            .and_hms_opt(h, m, s)
            .unwrap()
    }

    #[test]
    fn test_base_name() {
        assert_eq!(base_name("a.csv"), "a.csv");
        assert_eq!(base_name("/incoming/a.csv"), "a.csv");
        assert_eq!(base_name("incoming/sub/"), "sub");
    }

    #[test]
    fn test_collect_entries_keeps_server_order_and_skips_unstatable() {
        let names = vec![
            "b.csv".to_string(),
            "archive".to_string(),
            ".".to_string(),
            "/data/a.csv".to_string(),
        ];
        let entries = collect_entries(names, |name| match name {
            "b.csv" => Ok((at(10, 0, 0), 20)),
            "a.csv" => Ok((at(9, 0, 0), 10)),
            _ => Err(FtpError::ConnectionError(io::Error::new(
                io::ErrorKind::Other,
                "550 not a plain file",
            ))),
        });

        let names: Vec<&str> = entries.iter().map(|e| e.name.as_str()).collect();
        assert_eq!(names, vec!["b.csv", "a.csv"]);
        assert_eq!(entries[0].size, 20);
        assert_eq!(entries[1].mod_time, at(9, 0, 0).and_utc());
    }

    #[test]
    fn test_listing_error_messages() {
        let err = ListingError::List {
            dir: "/incoming".to_string(),
            source: FtpError::ConnectionError(io::Error::new(io::ErrorKind::Other, "reset")),
        };
        assert!(err.to_string().contains("cannot list directory '/incoming'"));
    }

    #[test]
    fn test_remote_lister_reports_connect_failure() {
        // Port 1 on localhost is not expected to accept connections
        let mut lister = RemoteLister::new(
            Protocol::Ftp,
            "127.0.0.1",
            1,
            Duration::from_secs(2),
            ProtocolConfig::default(),
            Credentials {
                user: "user".to_string(),
                password: SecretString::new("secret".to_string()),
                keyfile: None,
            },
        );
        assert!(matches!(
            lister.list("/incoming"),
            Err(ListingError::Connect { .. })
        ));
    }

    #[test]
    fn test_connect_any_returns_last_error() {
        let mut tried = Vec::new();
        let result: Result<(), FtpError> = connect_any("127.0.0.1", 2121, |addr| {
            tried.push(addr);
            Err(FtpError::ConnectionError(io::Error::new(
                io::ErrorKind::ConnectionRefused,
                format!("refused by {}", addr),
            )))
        });

        assert_eq!(tried, vec!["127.0.0.1:2121".parse::<SocketAddr>().unwrap()]);
        match result {
            Err(FtpError::ConnectionError(e)) => {
                assert_eq!(e.kind(), io::ErrorKind::ConnectionRefused)
            }
            other => panic!("expected connection error, got {:?}", other),
        }
    }

    #[test]
    fn test_connect_any_stops_at_first_success() {
        let mut calls = 0;
        let port = connect_any("127.0.0.1", 990, |addr| {
            calls += 1;
            Ok(addr.port())
        });
        assert_eq!(port.unwrap(), 990);
        assert_eq!(calls, 1);
    }
}

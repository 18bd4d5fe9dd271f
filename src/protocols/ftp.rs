//! Plain FTP client implementation
//!
//! This module provides the `FtpClient` which implements the `RemoteClient`
//! trait for standard (unencrypted) FTP connections.

use secrecy::ExposeSecret;
use std::time::Duration;
use suppaftp::types::FileType;
use suppaftp::FtpStream;

use crate::protocols::{collect_entries, connect_any, Credentials, FileInfo, FtpError, ProtocolConfig, RemoteClient};

/// FTP client for plain (unencrypted) FTP connections
pub struct FtpClient {
    stream: FtpStream,
}

impl RemoteClient for FtpClient {
    fn connect(
        host: &str,
        port: u16,
        timeout: Duration,
        _config: &ProtocolConfig,
    ) -> Result<Self, FtpError>
    where
        Self: Sized,
    {
        connect_any(host, port, |addr| {
            let stream = FtpStream::connect_timeout(addr, timeout)?;
            Ok(FtpClient { stream })
        })
    }

    fn login(&mut self, credentials: &Credentials) -> Result<(), FtpError> {
        self.stream
            .login(&credentials.user, credentials.password.expose_secret())
    }

    fn list(&mut self, dir: &str) -> Result<Vec<FileInfo>, FtpError> {
        self.stream.cwd(dir)?;
        self.stream.transfer_type(FileType::Binary)?;
        let names = self.stream.nlst(None)?;

        let stream = &mut self.stream;
        Ok(collect_entries(names, |name| {
            let modified = stream.mdtm(name)?;
            let size = stream.size(name)?;
            Ok((modified, size))
        }))
    }

    fn quit(mut self) -> Result<(), FtpError> {
        self.stream.quit()
    }
}

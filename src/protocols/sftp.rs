//! SFTP (SSH File Transfer Protocol) client implementation
//!
//! Uses the ssh2 crate. Host keys are not verified, matching how the
//! source has always been deployed against in-cluster SFTP servers.

use crate::logging::log;
use crate::protocols::{connect_any, Credentials, FileInfo, FtpError, ProtocolConfig, RemoteClient};
use chrono::DateTime;
use secrecy::ExposeSecret;
use ssh2::{FileStat, Session, Sftp};
use std::io;
use std::net::TcpStream;
use std::path::{Path, PathBuf};
use std::time::Duration;

fn sftp_error(kind: io::ErrorKind, message: String) -> FtpError {
    FtpError::ConnectionError(io::Error::new(kind, message))
}

/// SFTP client for SSH File Transfer Protocol connections
pub struct SftpClient {
    session: Session,
    sftp: Option<Sftp>,
}

impl SftpClient {
    fn channel(&mut self) -> Result<&Sftp, FtpError> {
        if self.sftp.is_none() {
            let sftp = self.session.sftp().map_err(|e| {
                sftp_error(
                    io::ErrorKind::ConnectionRefused,
                    format!("[SFTP] Failed to create SFTP channel: {}", e),
                )
            })?;
            self.sftp = Some(sftp);
        }
        self.sftp.as_ref().ok_or_else(|| {
            sftp_error(io::ErrorKind::NotConnected, "[SFTP] No SFTP channel".to_string())
        })
    }
}

impl RemoteClient for SftpClient {
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
            let stream = TcpStream::connect_timeout(&addr, timeout).map_err(FtpError::ConnectionError)?;
            stream
                .set_read_timeout(Some(timeout))
                .and_then(|()| stream.set_write_timeout(Some(timeout)))
                .map_err(FtpError::ConnectionError)?;

            let mut session = Session::new().map_err(|e| {
                sftp_error(
                    io::ErrorKind::Other,
                    format!("[SFTP] Failed to create SSH session: {}", e),
                )
            })?;
            session.set_tcp_stream(stream);
            session.handshake().map_err(|e| {
                sftp_error(
                    io::ErrorKind::ConnectionRefused,
                    format!("[SFTP] SSH handshake with {} failed: {}", addr, e),
                )
            })?;
            session.set_timeout(timeout.as_millis() as u32);

            Ok(SftpClient { session, sftp: None })
        })
    }

    fn login(&mut self, credentials: &Credentials) -> Result<(), FtpError> {
        let user = credentials.user.as_str();
        let result = match &credentials.keyfile {
            Some(keyfile) => self.session.userauth_pubkey_file(
                user,
                None,
                Path::new(keyfile),
                Some(credentials.password.expose_secret().as_str()).filter(|p| !p.is_empty()),
            ),
            None => self
                .session
                .userauth_password(user, credentials.password.expose_secret()),
        };

        result.map_err(|e| {
            sftp_error(
                io::ErrorKind::PermissionDenied,
                format!("SFTP authentication failed for user '{}': {}", user, e),
            )
        })
    }

    fn list(&mut self, dir: &str) -> Result<Vec<FileInfo>, FtpError> {
        let entries = self.channel()?.readdir(Path::new(dir)).map_err(|e| {
            sftp_error(
                io::ErrorKind::Other,
                format!("[SFTP] Failed to list directory '{}': {}", dir, e),
            )
        })?;

        Ok(regular_files(entries))
    }

    fn quit(self) -> Result<(), FtpError> {
        let _ = self
            .session
            .disconnect(None, "closing", None);
        Ok(())
    }
}

/// Keeps regular files from a `readdir` result, logging the ones that
/// cannot be reported
///
/// mtime has one-second resolution.
fn regular_files(entries: Vec<(PathBuf, FileStat)>) -> Vec<FileInfo> {
    let mut files = Vec::with_capacity(entries.len());
    for (path, stat) in entries {
        if !stat.is_file() {
            continue;
        }
        let Some(name) = path.file_name().and_then(|n| n.to_str()) else {
            let _ = log(&format!("Skipping '{}', name is not valid UTF-8", path.display()));
            continue;
        };
        let Some(mod_time) = stat.mtime.and_then(|t| DateTime::from_timestamp(t as i64, 0)) else {
            let _ = log(&format!("Skipping '{}', server reported no modification time", name));
            continue;
        };
        files.push(FileInfo {
            name: name.to_string(),
            size: stat.size.unwrap_or(0),
            mod_time,
        });
    }
    files
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::ffi::OsStr;
    use std::os::unix::ffi::OsStrExt;

    fn stat(perm: u32, mtime: Option<u64>) -> FileStat {
        FileStat {
            size: Some(42),
            uid: None,
            gid: None,
            perm: Some(perm),
            atime: None,
            mtime,
        }
    }

    #[test]
    fn test_regular_files_skips_unreportable_entries() {
        let entries = vec![
            (PathBuf::from("/incoming/a.csv"), stat(0o100644, Some(100))),
            (PathBuf::from("/incoming/archive"), stat(0o040755, Some(100))),
            (PathBuf::from("/incoming/b.csv"), stat(0o100644, None)),
            (
                PathBuf::from(OsStr::from_bytes(b"/incoming/caf\xe9.csv")),
                stat(0o100644, Some(100)),
            ),
        ];

        let files = regular_files(entries);

        assert_eq!(files.len(), 1);
        assert_eq!(files[0].name, "a.csv");
        assert_eq!(files[0].size, 42);
        assert_eq!(files[0].mod_time.timestamp(), 100);
    }

    #[test]
    fn test_sftp_client_send() {
        fn assert_send<T: Send>() {}
        assert_send::<SftpClient>();
    }
}

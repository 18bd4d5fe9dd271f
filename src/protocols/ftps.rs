//! FTPS (FTP over TLS) client implementation
//!
//! Explicit TLS via rustls with the ring provider. Server certificates are
//! checked against the native root store unless `insecure_skip_verify` is set.

use rustls::client::danger::{HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier};
use rustls::crypto::{ring, WebPkiSupportedAlgorithms};
use rustls::pki_types::{CertificateDer, ServerName, UnixTime};
use rustls::{ClientConfig, DigitallySignedStruct, RootCertStore, SignatureScheme};
use secrecy::ExposeSecret;
use std::sync::Arc;
use std::time::Duration;
use suppaftp::types::{FileType, Mode};
use suppaftp::{RustlsConnector, RustlsFtpStream, Status};

use crate::logging::log;
use crate::protocols::{
    collect_entries, connect_any, Credentials, FileInfo, FtpError, ProtocolConfig, RemoteClient,
};

/// Skips certificate chain and host name validation for self-signed
/// servers; handshake signatures are still checked against the presented
/// certificate
#[derive(Debug)]
struct UnverifiedChain {
    algorithms: WebPkiSupportedAlgorithms,
}

impl ServerCertVerifier for UnverifiedChain {
    fn verify_server_cert(
        &self,
        _end_entity: &CertificateDer<'_>,
        _intermediates: &[CertificateDer<'_>],
        _server_name: &ServerName<'_>,
        _ocsp_response: &[u8],
        _now: UnixTime,
    ) -> Result<ServerCertVerified, rustls::Error> {
        Ok(ServerCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        rustls::crypto::verify_tls12_signature(message, cert, dss, &self.algorithms)
    }

    fn verify_tls13_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        rustls::crypto::verify_tls13_signature(message, cert, dss, &self.algorithms)
    }

    fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
        self.algorithms.supported_schemes()
    }
}

fn native_roots() -> RootCertStore {
    let mut roots = RootCertStore::empty();
    let loaded = rustls_native_certs::load_native_certs();
    let (added, ignored) = roots.add_parsable_certificates(loaded.certs);
    if ignored > 0 || !loaded.errors.is_empty() {
        let _ = log(&format!(
            "Warning: loaded {} native root certificate(s), ignored {}, errors: {:?}",
            added, ignored, loaded.errors
        ));
    }
    roots
}

/// Builds the client TLS configuration shared by all connection attempts
fn tls_config(config: &ProtocolConfig) -> Result<Arc<ClientConfig>, FtpError> {
    let provider = Arc::new(ring::default_provider());
    let builder = ClientConfig::builder_with_provider(provider.clone())
        .with_safe_default_protocol_versions()
        .map_err(|e| FtpError::SecureError(e.to_string()))?;

    let tls = if config.insecure_skip_verify {
        let verifier = UnverifiedChain {
            algorithms: provider.signature_verification_algorithms,
        };
        builder
            .dangerous()
            .with_custom_certificate_verifier(Arc::new(verifier))
            .with_no_client_auth()
    } else {
        builder.with_root_certificates(native_roots()).with_no_client_auth()
    };
    Ok(Arc::new(tls))
}

/// FTPS client for encrypted FTP over TLS connections
pub struct FtpsClient {
    stream: RustlsFtpStream,
}

impl RemoteClient for FtpsClient {
    fn connect(
        host: &str,
        port: u16,
        timeout: Duration,
        config: &ProtocolConfig,
    ) -> Result<Self, FtpError>
    where
        Self: Sized,
    {
        let tls = tls_config(config)?;
        connect_any(host, port, |addr| {
            let plain = RustlsFtpStream::connect_timeout(addr, timeout)?;
            let mut stream = plain.into_secure(RustlsConnector::from(tls.clone()), host)?;
            // Listings travel on the data channel, so protect it too
            stream.custom_command("PROT P", &[Status::CommandOk])?;
            stream.set_mode(Mode::Passive);
            stream.set_passive_nat_workaround(true);
            Ok(FtpsClient { stream })
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

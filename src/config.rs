use crate::engine::BoundaryTracking;
use crate::protocols::Credentials;
use crate::publisher::DEFAULT_EVENT_TYPE;
use secrecy::SecretString;
use serde::Deserialize;
use std::fmt;
use std::fs;
use std::time::Duration;
use thiserror::Error;

/// Environment variable overriding `user`
pub const ENV_USER: &str = "FTP_USER";
/// Environment variable overriding `password`
pub const ENV_PASSWORD: &str = "FTP_PASSWORD";

/// Upper bound for every `*_secs` setting (one week)
pub const MAX_DURATION_SECS: u64 = 7 * 24 * 60 * 60;

/// Protocol used to reach the watched directory
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Protocol {
    Ftp,
    Ftps,
    Sftp,
}

impl Protocol {
    pub fn default_port(self) -> u16 {
        match self {
            Protocol::Ftp | Protocol::Ftps => 21,
            Protocol::Sftp => 22,
        }
    }

    /// URI scheme used in event sources
    pub fn scheme(self) -> &'static str {
        match self {
            Protocol::Ftp => "ftp",
            Protocol::Ftps => "ftps",
            Protocol::Sftp => "sftp",
        }
    }
}

impl fmt::Display for Protocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.scheme().to_uppercase())
    }
}

/// Location and retry policy of the state record
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct StoreConfig {
    /// Record name (JSON field: name)
    pub name: String,
    /// Record namespace (JSON field: namespace, default "default")
    #[serde(default = "default_namespace")]
    pub namespace: String,
    /// Root directory of the file-backed record store (JSON field: path)
    #[serde(default = "default_store_path")]
    pub path: String,
    /// Seconds between attempts while the store is not ready (JSON field: init_interval_secs)
    #[serde(default = "default_init_interval")]
    pub init_interval_secs: u64,
    /// Seconds before startup gives up on the store (JSON field: init_timeout_secs)
    #[serde(default = "default_init_timeout")]
    pub init_timeout_secs: u64,
}

fn default_namespace() -> String {
    "default".to_string()
}
fn default_store_path() -> String {
    "./state".to_string()
}
fn default_init_interval() -> u64 {
    1
}
fn default_init_timeout() -> u64 {
    30
}
fn default_dir() -> String {
    ".".to_string()
}
fn default_poll_interval() -> u64 {
    10
}
fn default_connect_timeout() -> u64 {
    30
}
fn default_event_type() -> String {
    DEFAULT_EVENT_TYPE.to_string()
}
fn empty_secret() -> SecretString {
    SecretString::new(String::new())
}

/// Source configuration, immutable once loaded
#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    /// Server hostname or IP address (JSON field: host)
    pub host: String,
    /// Server port, protocol default when absent (JSON field: port)
    #[serde(default)]
    pub port: Option<u16>,
    /// "ftp", "ftps" or "sftp" (JSON field: protocol)
    #[serde(default)]
    pub protocol: Option<Protocol>,
    /// Older spelling of the protocol choice: true means SFTP (JSON field: secure)
    #[serde(default)]
    pub secure: Option<bool>,
    /// Watched directory (JSON field: dir)
    #[serde(default = "default_dir")]
    pub dir: String,
    /// Login name, overridden by FTP_USER (JSON field: user)
    #[serde(default)]
    pub user: String,
    /// Password, overridden by FTP_PASSWORD; passphrase when `keyfile` is set (JSON field: password)
    #[serde(default = "empty_secret")]
    pub password: SecretString,
    /// SSH private key for SFTP (JSON field: keyfile)
    #[serde(default)]
    pub keyfile: Option<String>,
    /// URL events are posted to (JSON field: sink)
    pub sink: String,
    /// Seconds between polls (JSON field: poll_interval_secs)
    #[serde(default = "default_poll_interval")]
    pub poll_interval_secs: u64,
    /// Connect and I/O timeout in seconds (JSON field: connect_timeout_secs)
    #[serde(default = "default_connect_timeout")]
    pub connect_timeout_secs: u64,
    /// Accept any FTPS server certificate (JSON field: insecure_skip_verify)
    #[serde(default)]
    pub insecure_skip_verify: bool,
    /// State record settings (JSON field: store)
    pub store: StoreConfig,
    /// "name_set" or "single_name" (JSON field: boundary_tracking)
    #[serde(default)]
    pub boundary_tracking: BoundaryTracking,
    /// CloudEvents type attribute (JSON field: event_type)
    #[serde(default = "default_event_type")]
    pub event_type: String,
}

/// Configuration errors
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("cannot read config file {path}: {source}")]
    Read {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("invalid JSON in config file {path}: {source}")]
    Parse {
        path: String,
        #[source]
        source: serde_json::Error,
    },
    #[error("invalid configuration: {0}")]
    Invalid(String),
}

impl Config {
    /// Effective protocol; `protocol` wins over the legacy `secure` flag, SFTP otherwise
    pub fn protocol(&self) -> Protocol {
        match (self.protocol, self.secure) {
            (Some(p), _) => p,
            (None, Some(false)) => Protocol::Ftp,
            (None, _) => Protocol::Sftp,
        }
    }

    pub fn port(&self) -> u16 {
        self.port.unwrap_or_else(|| self.protocol().default_port())
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_secs(self.poll_interval_secs)
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_secs)
    }

    pub fn store_init_interval(&self) -> Duration {
        Duration::from_secs(self.store.init_interval_secs)
    }

    pub fn store_init_timeout(&self) -> Duration {
        Duration::from_secs(self.store.init_timeout_secs)
    }

    pub fn credentials(&self) -> Credentials {
        Credentials {
            user: self.user.clone(),
            password: self.password.clone(),
            keyfile: self.keyfile.clone(),
        }
    }

    /// Replaces credentials with FTP_USER / FTP_PASSWORD when set
    pub fn apply_env_overrides(&mut self) {
        if let Ok(user) = std::env::var(ENV_USER) {
            self.user = user;
        }
        if let Ok(password) = std::env::var(ENV_PASSWORD) {
            self.password = SecretString::new(password);
        }
    }

    /// Checks values serde cannot express
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.host.trim().is_empty() {
            return Err(ConfigError::Invalid("host must not be empty".to_string()));
        }
        if self.user.trim().is_empty() {
            return Err(ConfigError::Invalid(format!(
                "user must be set in the config file or via {}",
                ENV_USER
            )));
        }
        if self.sink.trim().is_empty() {
            return Err(ConfigError::Invalid("sink must not be empty".to_string()));
        }
        if self.store.name.trim().is_empty() {
            return Err(ConfigError::Invalid("store.name must not be empty".to_string()));
        }
        if self.poll_interval_secs == 0 {
            return Err(ConfigError::Invalid(
                "poll_interval_secs must be a positive number".to_string(),
            ));
        }
        if self.connect_timeout_secs == 0 {
            return Err(ConfigError::Invalid(
                "connect_timeout_secs must be a positive number".to_string(),
            ));
        }
        for (field, secs) in [
            ("poll_interval_secs", self.poll_interval_secs),
            ("connect_timeout_secs", self.connect_timeout_secs),
            ("store.init_interval_secs", self.store.init_interval_secs),
            ("store.init_timeout_secs", self.store.init_timeout_secs),
        ] {
            if secs > MAX_DURATION_SECS {
                return Err(ConfigError::Invalid(format!(
                    "{} must not exceed {} seconds",
                    field, MAX_DURATION_SECS
                )));
            }
        }
        if self.keyfile.is_some() && self.protocol() != Protocol::Sftp {
            return Err(ConfigError::Invalid("keyfile is only supported with sftp".to_string()));
        }
        Ok(())
    }
}

/// Parses and validates the JSON configuration file
///
/// Credentials from the environment take precedence over the file.
///
/// # Errors
/// - File not found or unreadable
/// - Invalid JSON or missing required fields
/// - Values failing `Config::validate`
pub fn parse_config(filename: &str) -> Result<Config, ConfigError> {
    let contents = fs::read_to_string(filename).map_err(|e| ConfigError::Read {
        path: filename.to_string(),
        source: e,
    })?;
    let mut config: Config = serde_json::from_str(&contents).map_err(|e| ConfigError::Parse {
        path: filename.to_string(),
        source: e,
    })?;
    config.apply_env_overrides();
    config.validate()?;
    Ok(config)
}

#[cfg(test)]
mod tests {
    use super::*;
    use secrecy::ExposeSecret;
    use serial_test::serial;
    use std::io::Write;
    use std::path::PathBuf;
    use tempfile::tempdir;

    fn write_config(contents: &str) -> (tempfile::TempDir, String) {
        let dir = tempdir().unwrap();
        let mut path = PathBuf::from(dir.path());
        path.push("ftpsource.json");
        let mut file = fs::File::create(&path).unwrap();
        file.write_all(contents.as_bytes()).unwrap();
        (dir, path.to_str().unwrap().to_string())
    }

    const MINIMAL: &str = r#"{"host":"files.example.com","user":"watcher","password":"pw",
        "sink":"http://broker/default","store":{"name":"ftp-state"}}"#;

    #[test]
    #[serial]
    fn test_parse_minimal_config_defaults() {
        temp_env::with_vars_unset([ENV_USER, ENV_PASSWORD], || {
            let (_dir, path) = write_config(MINIMAL);
            let config = parse_config(&path).unwrap();

            assert_eq!(config.protocol(), Protocol::Sftp);
            assert_eq!(config.port(), 22);
            assert_eq!(config.dir, ".");
            assert_eq!(config.poll_interval(), Duration::from_secs(10));
            assert_eq!(config.connect_timeout(), Duration::from_secs(30));
            assert_eq!(config.store.namespace, "default");
            assert_eq!(config.store.path, "./state");
            assert_eq!(config.store_init_interval(), Duration::from_secs(1));
            assert_eq!(config.store_init_timeout(), Duration::from_secs(30));
            assert_eq!(config.boundary_tracking, BoundaryTracking::NameSet);
            assert_eq!(config.event_type, DEFAULT_EVENT_TYPE);
            assert_eq!(config.password.expose_secret(), "pw");
        });
    }

    #[test]
    #[serial]
    fn test_parse_full_config() {
        let (_dir, path) = write_config(
            r#"{"host":"10.0.0.5","port":2121,"protocol":"ftps","dir":"/incoming",
            "user":"watcher","password":"pw","sink":"http://broker/default",
            "poll_interval_secs":60,"connect_timeout_secs":5,"insecure_skip_verify":true,
            "store":{"name":"ftp-state","namespace":"sources","path":"/var/lib/ftpsource",
                     "init_interval_secs":2,"init_timeout_secs":120},
            "boundary_tracking":"single_name","event_type":"com.example.file"}"#,
        );
        temp_env::with_vars_unset([ENV_USER, ENV_PASSWORD], || {
            let config = parse_config(&path).unwrap();
            assert_eq!(config.protocol(), Protocol::Ftps);
            assert_eq!(config.port(), 2121);
            assert_eq!(config.dir, "/incoming");
            assert!(config.insecure_skip_verify);
            assert_eq!(config.store.namespace, "sources");
            assert_eq!(config.store_init_timeout(), Duration::from_secs(120));
            assert_eq!(config.boundary_tracking, BoundaryTracking::SingleName);
            assert_eq!(config.event_type, "com.example.file");
        });
    }

    #[test]
    #[serial]
    fn test_legacy_secure_flag() {
        let (_dir, path) = write_config(
            r#"{"host":"files","user":"u","secure":false,"sink":"http://s","store":{"name":"n"}}"#,
        );
        temp_env::with_vars_unset([ENV_USER, ENV_PASSWORD], || {
            let config = parse_config(&path).unwrap();
            assert_eq!(config.protocol(), Protocol::Ftp);
            assert_eq!(config.port(), 21);
        });
    }

    #[test]
    #[serial]
    fn test_env_overrides_credentials() {
        let (_dir, path) = write_config(
            r#"{"host":"files","sink":"http://s","store":{"name":"n"}}"#,
        );
        temp_env::with_vars(
            [(ENV_USER, Some("envuser")), (ENV_PASSWORD, Some("envpass"))],
            || {
                let config = parse_config(&path).unwrap();
                assert_eq!(config.user, "envuser");
                assert_eq!(config.password.expose_secret(), "envpass");
                assert_eq!(config.credentials().user, "envuser");
            },
        );
    }

    #[test]
    #[serial]
    fn test_missing_user_is_rejected() {
        let (_dir, path) = write_config(
            r#"{"host":"files","sink":"http://s","store":{"name":"n"}}"#,
        );
        temp_env::with_vars_unset([ENV_USER, ENV_PASSWORD], || {
            assert!(matches!(parse_config(&path), Err(ConfigError::Invalid(_))));
        });
    }

    #[test]
    #[serial]
    fn test_invalid_values_are_rejected() {
        let cases = [
            r#"{"host":"files","user":"u","sink":"http://s","store":{"name":"n"},"poll_interval_secs":0}"#,
            r#"{"host":"","user":"u","sink":"http://s","store":{"name":"n"}}"#,
            r#"{"host":"files","user":"u","sink":"http://s","store":{"name":" "}}"#,
            r#"{"host":"files","user":"u","protocol":"ftp","keyfile":"/k","sink":"http://s","store":{"name":"n"}}"#,
        ];
        temp_env::with_vars_unset([ENV_USER, ENV_PASSWORD], || {
            for case in cases {
                let (_dir, path) = write_config(case);
                assert!(
                    matches!(parse_config(&path), Err(ConfigError::Invalid(_))),
                    "accepted: {}",
                    case
                );
            }
        });
    }

    #[test]
    #[serial]
    fn test_oversized_durations_are_rejected() {
        let fields = [
            r#""poll_interval_secs":18446744073709551615"#,
            r#""connect_timeout_secs":18446744073709551615"#,
            r#""store":{"name":"n","init_interval_secs":18446744073709551615}"#,
            r#""store":{"name":"n","init_timeout_secs":604801}"#,
        ];
        temp_env::with_vars_unset([ENV_USER, ENV_PASSWORD], || {
            for field in fields {
                let store = if field.contains("\"store\"") { "" } else { r#","store":{"name":"n"}"# };
                let case = format!(
                    r#"{{"host":"files","user":"u","sink":"http://s"{},{}}}"#,
                    store, field
                );
                let (_dir, path) = write_config(&case);
                match parse_config(&path) {
                    Err(ConfigError::Invalid(message)) => {
                        assert!(message.contains("must not exceed"), "{}", message)
                    }
                    other => panic!("accepted {}: {:?}", case, other.map(|_| ())),
                }
            }

            // The bound itself is allowed
            let (_dir, path) = write_config(
                r#"{"host":"files","user":"u","sink":"http://s","store":{"name":"n"},"poll_interval_secs":604800}"#,
            );
            assert_eq!(
                parse_config(&path).unwrap().poll_interval(),
                Duration::from_secs(MAX_DURATION_SECS)
            );
        });
    }

    #[test]
    #[serial]
    fn test_malformed_and_missing_files() {
        let (_dir, path) = write_config(r#"{"host":"files","#);
        assert!(matches!(parse_config(&path), Err(ConfigError::Parse { .. })));

        let (_dir, path) = write_config(r#"{"host":"files","user":"u","sink":"http://s"}"#);
        assert!(matches!(parse_config(&path), Err(ConfigError::Parse { .. })));

        assert!(matches!(
            parse_config("/nonexistent/ftpsource.json"),
            Err(ConfigError::Read { .. })
        ));
    }
}

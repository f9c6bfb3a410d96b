//! Transport resolution: plaintext in development, mutual TLS in secured deployments

use crate::{BusError, BusResult};
use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;

/// Deployment environment the process runs in
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum DeploymentEnv {
    #[default]
    Development,
    Test,
    Staging,
    Production,
}

impl DeploymentEnv {
    /// Staging and production require mutual TLS to the broker
    pub fn is_secured(self) -> bool {
        matches!(self, Self::Staging | Self::Production)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Development => "development",
            Self::Test => "test",
            Self::Staging => "staging",
            Self::Production => "production",
        }
    }
}

impl FromStr for DeploymentEnv {
    type Err = BusError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "development" | "dev" => Ok(Self::Development),
            "test" => Ok(Self::Test),
            "staging" => Ok(Self::Staging),
            "production" | "prod" => Ok(Self::Production),
            other => Err(BusError::configuration(
                "APP_ENV",
                format!("unknown deployment environment '{other}'"),
            )),
        }
    }
}

impl fmt::Display for DeploymentEnv {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Where the TLS material lives and which broker credentials to present
#[derive(Debug, Clone)]
pub struct TransportSettings {
    pub environment: DeploymentEnv,
    pub cert_path: PathBuf,
    pub key_path: PathBuf,
    pub ca_path: PathBuf,
    pub username: Option<String>,
    pub password: Option<String>,
}

impl Default for TransportSettings {
    fn default() -> Self {
        Self {
            environment: DeploymentEnv::Development,
            cert_path: PathBuf::from("tls.crt"),
            key_path: PathBuf::from("tls.key"),
            ca_path: PathBuf::from("ca.crt"),
            username: None,
            password: None,
        }
    }
}

/// Broker username/password pair
#[derive(Clone, PartialEq, Eq)]
pub struct Credentials {
    pub username: String,
    pub password: String,
}

impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credentials")
            .field("username", &self.username)
            .field("password", &"<redacted>")
            .finish()
    }
}

/// PEM material for one mutual-TLS connection attempt
///
/// Built per connect call and moved into the broker; nothing keeps it
/// around once the connection is open.
#[derive(Clone)]
pub struct TlsMaterial {
    pub certificate: Vec<u8>,
    pub private_key: Vec<u8>,
    pub ca_bundle: Vec<u8>,
    pub verify_peer: bool,
    pub credentials: Credentials,
}

impl fmt::Debug for TlsMaterial {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TlsMaterial")
            .field("certificate_len", &self.certificate.len())
            .field("private_key", &"<redacted>")
            .field("ca_bundle_len", &self.ca_bundle.len())
            .field("verify_peer", &self.verify_peer)
            .field("credentials", &self.credentials)
            .finish()
    }
}

/// Byte source for TLS artifacts
pub trait MaterialSource: Send + Sync {
    fn read(&self, location: &std::path::Path) -> std::io::Result<Vec<u8>>;
}

/// Reads TLS artifacts from the local filesystem
#[derive(Debug, Clone, Copy, Default)]
pub struct FileSource;

impl MaterialSource for FileSource {
    fn read(&self, location: &std::path::Path) -> std::io::Result<Vec<u8>> {
        std::fs::read(location)
    }
}

/// Decide the transport for the next connection attempt
///
/// Returns `Ok(None)` for plaintext environments. In secured environments
/// every artifact must be readable and non-empty, and broker credentials
/// must be set; anything missing is a [`BusError::Configuration`].
pub fn resolve_transport(
    settings: &TransportSettings,
    source: &dyn MaterialSource,
) -> BusResult<Option<TlsMaterial>> {
    if !settings.environment.is_secured() {
        return Ok(None);
    }

    let certificate = read_artifact(source, "certificate", &settings.cert_path)?;
    let private_key = read_artifact(source, "private key", &settings.key_path)?;
    let ca_bundle = read_artifact(source, "CA bundle", &settings.ca_path)?;

    let username = required_credential("RABBITMQ_USER", settings.username.as_deref())?;
    let password = required_credential("RABBITMQ_PASSWORD", settings.password.as_deref())?;

    Ok(Some(TlsMaterial {
        certificate,
        private_key,
        ca_bundle,
        verify_peer: true,
        credentials: Credentials { username, password },
    }))
}

fn read_artifact(
    source: &dyn MaterialSource,
    artifact: &str,
    location: &std::path::Path,
) -> BusResult<Vec<u8>> {
    let bytes = source.read(location).map_err(|e| {
        BusError::configuration(
            artifact,
            format!("failed to read {}: {e}", location.display()),
        )
    })?;

    if bytes.is_empty() {
        return Err(BusError::configuration(
            artifact,
            format!("{} is empty", location.display()),
        ));
    }

    Ok(bytes)
}

fn required_credential(name: &str, value: Option<&str>) -> BusResult<String> {
    match value {
        Some(v) if !v.is_empty() => Ok(v.to_string()),
        _ => Err(BusError::configuration(
            name,
            "broker credentials are required in secured environments",
        )),
    }
}

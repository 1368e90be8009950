//! Runtime configuration for the glyph server and client.

use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

use serde::Deserialize;

/// Default bind host for the server and target host for clients.
pub const DEFAULT_HOST: &str = "localhost";
/// Default TCP port.
pub const DEFAULT_PORT: u16 = 8888;
/// Client-side socket timeout (connect, read, write).
pub const CLIENT_TIMEOUT: Duration = Duration::from_secs(300);
/// Server-side per-connection read timeout. Connections idle longer
/// than this are dropped.
pub const CONNECTION_READ_TIMEOUT: Duration = Duration::from_secs(1800);

/// Which vision backend the server loads at startup.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum BackendKind {
    /// Pick whatever backend this build carries.
    #[default]
    Auto,
    /// Deterministic stub backend. Loads real weights, returns canned text.
    Mock,
}

impl BackendKind {
    /// String representation for CLI argument forwarding.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Auto => "auto",
            Self::Mock => "mock",
        }
    }
}

impl FromStr for BackendKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "auto" => Ok(Self::Auto),
            "mock" => Ok(Self::Mock),
            other => Err(format!("unknown backend `{other}` (expected auto|mock)")),
        }
    }
}

/// Runtime configuration shared by the server, client, and CLI.
#[derive(Debug, Clone)]
pub struct Config {
    pub host: String,
    pub port: u16,
    /// Directory scanned for `.safetensors` weight archives.
    pub model_dir: PathBuf,
    pub backend: BackendKind,
    /// Client socket timeout.
    pub client_timeout: Duration,
    /// Server per-connection read timeout.
    pub read_timeout: Duration,
}

impl Config {
    /// `host:port` string for logging and client connections.
    #[must_use]
    pub fn endpoint(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    /// Load configuration from a TOML file layered over the defaults.
    ///
    /// With `path = None` the default location (`~/.config/glyph/config.toml`)
    /// is used if it exists; a missing default file is not an error. An
    /// explicitly given path must exist.
    ///
    /// # Errors
    ///
    /// Returns an error if an explicit path is missing or if the file
    /// fails to parse.
    pub fn load(path: Option<&Path>) -> crate::Result<Self> {
        let mut config = Self::default();

        let (path, required) = match path {
            Some(p) => (p.to_path_buf(), true),
            None => {
                let Some(p) = default_config_path() else {
                    return Ok(config);
                };
                (p, false)
            }
        };

        if !path.exists() {
            if required {
                return Err(eyre::eyre!("config file not found: {}", path.display()));
            }
            return Ok(config);
        }

        let content = std::fs::read_to_string(&path)
            .map_err(|e| eyre::eyre!("failed to read {}: {e}", path.display()))?;
        let file: ConfigFile = toml::from_str(&content)
            .map_err(|e| eyre::eyre!("failed to parse {}: {e}", path.display()))?;
        file.apply(&mut config)?;

        Ok(config)
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            host: DEFAULT_HOST.to_string(),
            port: DEFAULT_PORT,
            model_dir: default_model_dir(),
            backend: BackendKind::default(),
            client_timeout: CLIENT_TIMEOUT,
            read_timeout: CONNECTION_READ_TIMEOUT,
        }
    }
}

/// TOML override file. Every field optional; absent fields keep defaults.
#[derive(Debug, Deserialize)]
struct ConfigFile {
    host: Option<String>,
    port: Option<u16>,
    model_dir: Option<PathBuf>,
    backend: Option<String>,
    client_timeout_secs: Option<u64>,
    read_timeout_secs: Option<u64>,
}

impl ConfigFile {
    fn apply(self, config: &mut Config) -> crate::Result<()> {
        if let Some(host) = self.host {
            config.host = host;
        }
        if let Some(port) = self.port {
            config.port = port;
        }
        if let Some(model_dir) = self.model_dir {
            config.model_dir = model_dir;
        }
        if let Some(backend) = self.backend {
            config.backend = backend.parse().map_err(|e: String| eyre::eyre!(e))?;
        }
        if let Some(secs) = self.client_timeout_secs {
            config.client_timeout = Duration::from_secs(secs);
        }
        if let Some(secs) = self.read_timeout_secs {
            config.read_timeout = Duration::from_secs(secs);
        }
        Ok(())
    }
}

fn default_config_path() -> Option<PathBuf> {
    dirs::home_dir().map(|p| p.join(".config").join("glyph").join("config.toml"))
}

fn default_model_dir() -> PathBuf {
    dirs::home_dir()
        .map_or_else(|| PathBuf::from("models"), |p| p.join(".glyph").join("models"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_wire_contract() {
        let config = Config::default();
        assert_eq!(config.host, "localhost");
        assert_eq!(config.port, 8888);
        assert_eq!(config.client_timeout, Duration::from_secs(300));
        assert_eq!(config.read_timeout, Duration::from_secs(1800));
        assert_eq!(config.backend, BackendKind::Auto);
    }

    #[test]
    fn endpoint_formats_host_port() {
        let config = Config::default();
        assert_eq!(config.endpoint(), "localhost:8888");
    }

    #[test]
    fn backend_kind_round_trips() {
        for kind in [BackendKind::Auto, BackendKind::Mock] {
            assert_eq!(kind.as_str().parse::<BackendKind>().unwrap(), kind);
        }
        assert!("gpu".parse::<BackendKind>().is_err());
    }

    #[test]
    fn load_layers_file_over_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");
        std::fs::write(
            &path,
            "host = \"0.0.0.0\"\nport = 9100\nbackend = \"mock\"\nclient_timeout_secs = 5\n",
        )
        .unwrap();

        let config = Config::load(Some(&path)).unwrap();
        assert_eq!(config.host, "0.0.0.0");
        assert_eq!(config.port, 9100);
        assert_eq!(config.backend, BackendKind::Mock);
        assert_eq!(config.client_timeout, Duration::from_secs(5));
        // untouched fields keep defaults
        assert_eq!(config.read_timeout, Duration::from_secs(1800));
    }

    #[test]
    fn load_rejects_missing_explicit_path() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nope.toml");
        assert!(Config::load(Some(&path)).is_err());
    }

    #[test]
    fn load_rejects_unknown_backend() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");
        std::fs::write(&path, "backend = \"tpu\"\n").unwrap();
        assert!(Config::load(Some(&path)).is_err());
    }
}

//! CLI argument parsing.

use std::path::PathBuf;
use std::time::Duration;

use clap::{Parser, Subcommand};

use glyph_core::{BackendKind, Config};

#[derive(Parser)]
#[command(name = "glyph", version, about = "Persistent OCR inference server and client")]
pub struct Cli {
    /// Server host
    #[arg(long, global = true, env = "GLYPH_HOST")]
    pub host: Option<String>,

    /// Server port
    #[arg(long, global = true, env = "GLYPH_PORT")]
    pub port: Option<u16>,

    /// Configuration file (default: ~/.config/glyph/config.toml)
    #[arg(long, global = true, value_name = "PATH")]
    pub config: Option<PathBuf>,

    /// Socket timeout in seconds for ocr and batch requests
    #[arg(long, global = true, value_name = "SECS")]
    pub timeout: Option<u64>,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand)]
pub enum Command {
    /// Run the inference server (blocks until shutdown)
    Serve {
        /// Directory containing .safetensors weight archives
        #[arg(long, env = "GLYPH_MODEL_DIR", value_name = "DIR")]
        model_dir: Option<PathBuf>,

        /// Vision backend: auto | mock
        #[arg(long)]
        backend: Option<BackendKind>,

        /// Drop connections idle longer than this many seconds
        #[arg(long, value_name = "SECS")]
        read_timeout: Option<u64>,
    },
    /// Recognize text in one image via a running server
    Ocr {
        /// Image file to recognize
        image: PathBuf,

        /// Directory results are written under
        #[arg(long, short = 'o', default_value = "output")]
        output: PathBuf,
    },
    /// Recognize every supported image in a directory
    Batch {
        /// Directory scanned for images
        #[arg(default_value = "images")]
        dir: PathBuf,

        /// Directory results are written under
        #[arg(long, short = 'o', default_value = "output")]
        output: PathBuf,
    },
    /// Query server and model state
    Status,
    /// Stop a running server
    Shutdown,
    /// Widen BF16 weight archives to F32 in place, keeping .bak backups
    Convert {
        /// Directory containing .safetensors weight archives
        #[arg(long, env = "GLYPH_MODEL_DIR", value_name = "DIR")]
        model_dir: Option<PathBuf>,
    },
}

impl Cli {
    /// Fold flags over the config file over the defaults. Flags win.
    ///
    /// # Errors
    ///
    /// Propagates config file loading errors.
    pub fn resolve_config(&self) -> glyph_core::Result<Config> {
        let mut config = Config::load(self.config.as_deref())?;

        if let Some(ref host) = self.host {
            config.host = host.clone();
        }
        if let Some(port) = self.port {
            config.port = port;
        }
        if let Some(secs) = self.timeout {
            config.client_timeout = Duration::from_secs(secs);
        }

        match &self.command {
            Command::Serve {
                model_dir,
                backend,
                read_timeout,
            } => {
                if let Some(dir) = model_dir {
                    config.model_dir = dir.clone();
                }
                if let Some(backend) = backend {
                    config.backend = *backend;
                }
                if let Some(secs) = read_timeout {
                    config.read_timeout = Duration::from_secs(*secs);
                }
            }
            Command::Convert { model_dir } => {
                if let Some(dir) = model_dir {
                    config.model_dir = dir.clone();
                }
            }
            Command::Ocr { .. } | Command::Batch { .. } | Command::Status | Command::Shutdown => {}
        }

        Ok(config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn flags_override_config_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");
        std::fs::write(&path, "host = \"10.0.0.1\"\nport = 9000\n").unwrap();

        let cli = Cli::try_parse_from([
            "glyph",
            "status",
            "--config",
            path.to_str().unwrap(),
            "--port",
            "9001",
        ])
        .unwrap();
        let config = cli.resolve_config().unwrap();
        assert_eq!(config.host, "10.0.0.1");
        assert_eq!(config.port, 9001);
    }

    #[test]
    fn serve_args_feed_model_settings() {
        let cli = Cli::try_parse_from([
            "glyph",
            "serve",
            "--model-dir",
            "/opt/weights",
            "--backend",
            "mock",
            "--read-timeout",
            "60",
        ])
        .unwrap();
        let config = cli.resolve_config().unwrap();
        assert_eq!(config.model_dir, PathBuf::from("/opt/weights"));
        assert_eq!(config.backend, BackendKind::Mock);
        assert_eq!(config.read_timeout, Duration::from_secs(60));
    }

    #[test]
    fn unknown_backend_is_a_parse_error() {
        assert!(Cli::try_parse_from(["glyph", "serve", "--backend", "tpu"]).is_err());
    }

    #[test]
    fn ocr_output_defaults() {
        let cli = Cli::try_parse_from(["glyph", "ocr", "scan.png"]).unwrap();
        match cli.command {
            Command::Ocr { image, output } => {
                assert_eq!(image, PathBuf::from("scan.png"));
                assert_eq!(output, PathBuf::from("output"));
            }
            _ => panic!("expected ocr command"),
        }
    }

    #[test]
    fn bare_batch_scans_the_default_directory() {
        let cli = Cli::try_parse_from(["glyph", "batch"]).unwrap();
        match cli.command {
            Command::Batch { dir, output } => {
                assert_eq!(dir, PathBuf::from("images"));
                assert_eq!(output, PathBuf::from("output"));
            }
            _ => panic!("expected batch command"),
        }
    }
}

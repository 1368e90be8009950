//! Blocking client for the request server.
//!
//! One connection per call; the server tolerates long-lived
//! connections, but the client has no need for them.

use std::io;
use std::net::{TcpStream, ToSocketAddrs};
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::de::DeserializeOwned;
use tracing::debug;

use glyph_core::Config;
use glyph_core::config::CLIENT_TIMEOUT;

use crate::protocol::{OcrReply, Request, ShutdownReply, StatusReply, read_frame, write_frame};

/// Why a client call failed.
#[derive(Debug, thiserror::Error)]
pub enum ClientError {
    #[error("cannot resolve {0}")]
    Resolve(String),
    #[error("image file not found: {0}")]
    ImageNotFound(PathBuf),
    #[error("malformed reply: {0}")]
    Malformed(#[from] serde_json::Error),
    #[error("server rejected request: {error}")]
    Rejected {
        error: String,
        details: Option<String>,
    },
    #[error(transparent)]
    Io(#[from] io::Error),
}

/// Synchronous client speaking the framed JSON protocol.
#[derive(Debug, Clone)]
pub struct Client {
    host: String,
    port: u16,
    timeout: Duration,
}

impl Client {
    #[must_use]
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
            timeout: CLIENT_TIMEOUT,
        }
    }

    #[must_use]
    pub fn from_config(config: &Config) -> Self {
        Self {
            host: config.host.clone(),
            port: config.port,
            timeout: config.client_timeout,
        }
    }

    /// Override the connect/read/write timeout. The default covers a
    /// full model call; liveness probes want something much shorter.
    #[must_use]
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Run recognition on one image.
    ///
    /// The image path is resolved to an absolute path before sending,
    /// since the server may run with a different working directory.
    ///
    /// # Errors
    ///
    /// Fails when the image does not exist locally, the server is
    /// unreachable, or the server rejects the request.
    pub fn ocr(&self, image: &Path, output_dir: &Path) -> Result<OcrReply, ClientError> {
        let image_path = image
            .canonicalize()
            .map_err(|_| ClientError::ImageNotFound(image.to_path_buf()))?;
        self.call(&Request::Ocr {
            image_path,
            output_dir: output_dir.to_path_buf(),
        })
    }

    /// Query server and model state.
    ///
    /// # Errors
    ///
    /// Fails when the server is unreachable or replies with an error.
    pub fn status(&self) -> Result<StatusReply, ClientError> {
        self.call(&Request::Status)
    }

    /// Ask the server to stop.
    ///
    /// # Errors
    ///
    /// Fails when the server is unreachable or replies with an error.
    pub fn shutdown(&self) -> Result<ShutdownReply, ClientError> {
        self.call(&Request::Shutdown)
    }

    /// Whether a server answers status probes at this endpoint.
    #[must_use]
    pub fn is_server_running(&self) -> bool {
        self.status().is_ok_and(|reply| reply.server_running)
    }

    fn call<T: DeserializeOwned>(&self, request: &Request) -> Result<T, ClientError> {
        let mut stream = self.connect()?;
        let payload = serde_json::to_vec(&request.to_json())?;
        write_frame(&mut stream, &payload)?;
        let reply = read_frame(&mut stream)?;
        parse_reply(&reply)
    }

    fn connect(&self) -> Result<TcpStream, ClientError> {
        let endpoint = format!("{}:{}", self.host, self.port);
        let addrs = endpoint
            .to_socket_addrs()
            .map_err(|_| ClientError::Resolve(endpoint.clone()))?;

        let mut last_err = None;
        for addr in addrs {
            match TcpStream::connect_timeout(&addr, self.timeout) {
                Ok(stream) => {
                    stream.set_read_timeout(Some(self.timeout))?;
                    stream.set_write_timeout(Some(self.timeout))?;
                    debug!(%addr, "connected");
                    return Ok(stream);
                }
                Err(e) => last_err = Some(e),
            }
        }

        Err(match last_err {
            Some(e) => ClientError::Io(e),
            None => ClientError::Resolve(endpoint),
        })
    }
}

/// Interpret a reply payload: `success: false` becomes
/// [`ClientError::Rejected`], anything else must deserialize as the
/// expected reply type.
fn parse_reply<T: DeserializeOwned>(payload: &[u8]) -> Result<T, ClientError> {
    let value: serde_json::Value = serde_json::from_slice(payload)?;
    if value.get("success").and_then(serde_json::Value::as_bool) == Some(false) {
        let error = value
            .get("error")
            .and_then(serde_json::Value::as_str)
            .unwrap_or("unknown error")
            .to_string();
        let details = value
            .get("details")
            .and_then(serde_json::Value::as_str)
            .map(str::to_string);
        return Err(ClientError::Rejected { error, details });
    }
    Ok(serde_json::from_value(value)?)
}

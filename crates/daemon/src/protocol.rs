//! Wire protocol for client/server requests.
//!
//! Wire format, both directions:
//! - `[4B payload_len_le][payload...]` where the payload is one JSON
//!   document.
//!
//! Requests carry a `type` field (`ocr`, `status`, `shutdown`);
//! responses are distinguished by shape and always carry `success`.

use std::io::{self, Read, Write};
use std::path::PathBuf;

use bytes::{Buf, BufMut, BytesMut};
use serde::{Deserialize, Serialize};
use tokio_util::codec::{Decoder, Encoder};

/// Maximum JSON payload: 16 MB.
pub const MAX_PAYLOAD_LEN: u32 = 16 * 1024 * 1024;

/// Length prefix size.
const PREFIX_LEN: usize = 4;

/// Output directory used when an `ocr` request omits one.
pub const DEFAULT_OUTPUT_DIR: &str = "output";

/// A parsed client request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Request {
    Ocr {
        image_path: PathBuf,
        output_dir: PathBuf,
    },
    Status,
    Shutdown,
}

impl Request {
    /// Parse a request payload.
    ///
    /// # Errors
    ///
    /// Fails for invalid JSON, an unknown or missing `type`, and an
    /// `ocr` request without `image_path`. All of these get an error
    /// reply rather than a dropped connection.
    pub fn from_json(payload: &[u8]) -> Result<Self, RequestError> {
        let value: serde_json::Value = serde_json::from_slice(payload)?;
        let kind = value
            .get("type")
            .and_then(serde_json::Value::as_str)
            .ok_or(RequestError::MissingType)?;
        match kind {
            "ocr" => {
                let image_path = value
                    .get("image_path")
                    .and_then(serde_json::Value::as_str)
                    .ok_or(RequestError::MissingField("image_path"))?;
                let output_dir = value
                    .get("output_dir")
                    .and_then(serde_json::Value::as_str)
                    .unwrap_or(DEFAULT_OUTPUT_DIR);
                Ok(Self::Ocr {
                    image_path: PathBuf::from(image_path),
                    output_dir: PathBuf::from(output_dir),
                })
            }
            "status" => Ok(Self::Status),
            "shutdown" => Ok(Self::Shutdown),
            other => Err(RequestError::UnknownType(other.to_string())),
        }
    }

    /// Wire form of this request. Client side of [`Request::from_json`].
    #[must_use]
    pub fn to_json(&self) -> serde_json::Value {
        match self {
            Self::Ocr {
                image_path,
                output_dir,
            } => serde_json::json!({
                "type": "ocr",
                "image_path": image_path.to_string_lossy(),
                "output_dir": output_dir.to_string_lossy(),
            }),
            Self::Status => serde_json::json!({ "type": "status" }),
            Self::Shutdown => serde_json::json!({ "type": "shutdown" }),
        }
    }
}

/// Why a request payload was rejected.
#[derive(Debug, thiserror::Error)]
pub enum RequestError {
    #[error("request is not valid JSON: {0}")]
    Json(#[from] serde_json::Error),
    #[error("request has no `type` field")]
    MissingType,
    #[error("missing required field `{0}`")]
    MissingField(&'static str),
    #[error("unknown request type: {0}")]
    UnknownType(String),
}

/// Artifact paths for one recognized page. Page numbers are 1-based.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PageArtifact {
    pub page_idx: usize,
    pub json_path: String,
    pub md_path: String,
}

/// Successful `ocr` reply.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OcrReply {
    pub success: bool,
    /// Seconds spent inside the model, excluding result persistence.
    pub processing_time: f64,
    pub results: Vec<PageArtifact>,
    pub save_path: String,
}

/// `status` reply.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatusReply {
    pub success: bool,
    pub server_running: bool,
    pub model_loaded: bool,
    pub host: String,
    pub port: u16,
}

/// `shutdown` acknowledgement.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ShutdownReply {
    pub success: bool,
    pub message: String,
}

/// Any failed request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FailureReply {
    pub success: bool,
    pub error: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub details: Option<String>,
}

/// Server reply. Serialized untagged; the payload shape alone tells
/// clients which case they got.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum Response {
    Ocr(OcrReply),
    Status(StatusReply),
    Shutdown(ShutdownReply),
    Failure(FailureReply),
}

impl Response {
    #[must_use]
    pub fn failure(error: impl Into<String>) -> Self {
        Self::Failure(FailureReply {
            success: false,
            error: error.into(),
            details: None,
        })
    }
}

// ─── Tokio codec (async server) ─────────────────────────────────────────────

/// Frames length-prefixed JSON payloads.
///
/// Decoding yields raw payload bytes rather than parsed requests, so a
/// bad payload still gets an error reply on a live connection. Only
/// framing violations (an oversized length prefix) are connection
/// errors.
pub struct WireCodec;

impl Decoder for WireCodec {
    type Item = BytesMut;
    type Error = io::Error;

    fn decode(&mut self, src: &mut BytesMut) -> io::Result<Option<BytesMut>> {
        if src.len() < PREFIX_LEN {
            return Ok(None);
        }

        let payload_len = u32::from_le_bytes([src[0], src[1], src[2], src[3]]);
        if payload_len > MAX_PAYLOAD_LEN {
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                "payload exceeds 16MB limit",
            ));
        }

        let total = PREFIX_LEN + payload_len as usize;
        if src.len() < total {
            src.reserve(total - src.len());
            return Ok(None);
        }

        src.advance(PREFIX_LEN);
        Ok(Some(src.split_to(payload_len as usize)))
    }
}

impl Encoder<Response> for WireCodec {
    type Error = io::Error;

    fn encode(&mut self, item: Response, dst: &mut BytesMut) -> io::Result<()> {
        let payload = serde_json::to_vec(&item)?;
        let len = frame_len(payload.len())?;
        dst.put_u32_le(len);
        dst.put_slice(&payload);
        Ok(())
    }
}

// ─── Sync helpers (client) ──────────────────────────────────────────────────

/// Write one framed payload to a sync writer.
///
/// # Errors
///
/// Returns an error if writing fails or the payload exceeds the size
/// limit.
pub fn write_frame<W: Write>(w: &mut W, payload: &[u8]) -> io::Result<()> {
    let len = frame_len(payload.len())?;
    w.write_all(&len.to_le_bytes())?;
    w.write_all(payload)?;
    w.flush()
}

/// Read one framed payload from a sync reader.
///
/// # Errors
///
/// Returns an error if reading fails or the length prefix exceeds the
/// size limit.
pub fn read_frame<R: Read>(r: &mut R) -> io::Result<Vec<u8>> {
    let mut prefix = [0u8; PREFIX_LEN];
    r.read_exact(&mut prefix)?;
    let len = u32::from_le_bytes(prefix);
    if len > MAX_PAYLOAD_LEN {
        return Err(io::Error::new(
            io::ErrorKind::InvalidData,
            "payload exceeds 16MB limit",
        ));
    }
    let mut payload = vec![0u8; len as usize];
    r.read_exact(&mut payload)?;
    Ok(payload)
}

fn frame_len(payload_len: usize) -> io::Result<u32> {
    u32::try_from(payload_len)
        .ok()
        .filter(|&len| len <= MAX_PAYLOAD_LEN)
        .ok_or_else(|| io::Error::new(io::ErrorKind::InvalidData, "payload exceeds 16MB limit"))
}

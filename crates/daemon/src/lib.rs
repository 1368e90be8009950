//! Persistent OCR inference server.
//!
//! Keeps the vision engine loaded in memory and serves recognition
//! requests over TCP, avoiding per-image model startup. Every message
//! is one length-prefixed JSON document; see [`protocol`] for the wire
//! format.

pub mod client;
pub mod protocol;
pub mod server;
pub mod sink;

pub use client::{Client, ClientError};
pub use protocol::{OcrReply, PageArtifact, Request, Response, ShutdownReply, StatusReply};
pub use server::{RequestServer, run};
pub use sink::{FileSink, ResultSink};

//! Capture files: one JSON record per line
//!
//! ```text
//! {"uuid":"…","sequenceNumber":1,"sender":"127.0.0.1:50312","receiver":"api.test:443",
//!  "timestamp":"2024-05-01T12:00:00Z","rawMessageContent":"R0VUIC8gSFRUUC8xLjEN…"}
//! ```
//!
//! Only raw bytes and metadata are stored; reading re-runs the decode
//! pipeline to rebuild each element tree.

use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fs::{File, OpenOptions};
use std::io::{self, BufRead, BufReader, BufWriter, Write};
use std::path::Path;
use thiserror::Error;
use tracing::{debug, info};
use uuid::Uuid;

use super::element::{CapturedMessage, Endpoints, HttpFacet};
use super::pipeline::{DecodeContext, Pipeline};

#[derive(Debug, Error)]
pub enum CaptureFileError {
    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    #[error("Line {line}: invalid record: {source}")]
    InvalidRecord {
        line: usize,
        #[source]
        source: serde_json::Error,
    },

    #[error("Line {line}: invalid base64 content: {source}")]
    InvalidContent {
        line: usize,
        #[source]
        source: base64::DecodeError,
    },

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct CaptureRecord {
    uuid: Uuid,
    sequence_number: u64,
    sender: String,
    receiver: String,
    timestamp: DateTime<Utc>,
    raw_message_content: String,
}

impl From<&CapturedMessage> for CaptureRecord {
    fn from(message: &CapturedMessage) -> Self {
        Self {
            uuid: message.uuid,
            sequence_number: message.sequence_number,
            sender: message.endpoints.sender.clone(),
            receiver: message.endpoints.receiver.clone(),
            timestamp: message.timestamp,
            raw_message_content: STANDARD.encode(&message.element.raw),
        }
    }
}

pub struct CaptureFileWriter {
    out: BufWriter<File>,
    written: usize,
}

impl CaptureFileWriter {
    /// Create or truncate `path`
    pub fn create(path: impl AsRef<Path>) -> Result<Self, CaptureFileError> {
        let file = File::create(path.as_ref())?;
        Ok(Self {
            out: BufWriter::new(file),
            written: 0,
        })
    }

    /// Open `path` for appending, creating it if needed
    pub fn append_to(path: impl AsRef<Path>) -> Result<Self, CaptureFileError> {
        let file = OpenOptions::new().create(true).append(true).open(path.as_ref())?;
        Ok(Self {
            out: BufWriter::new(file),
            written: 0,
        })
    }

    pub fn append(&mut self, message: &CapturedMessage) -> Result<(), CaptureFileError> {
        serde_json::to_writer(&mut self.out, &CaptureRecord::from(message))?;
        self.out.write_all(b"\n")?;
        self.written += 1;
        Ok(())
    }

    pub fn written(&self) -> usize {
        self.written
    }

    pub fn finish(mut self) -> Result<usize, CaptureFileError> {
        self.out.flush()?;
        Ok(self.written)
    }
}

pub struct CaptureFileReader<R> {
    input: R,
}

impl CaptureFileReader<BufReader<File>> {
    pub fn open(path: impl AsRef<Path>) -> Result<Self, CaptureFileError> {
        Ok(Self {
            input: BufReader::new(File::open(path.as_ref())?),
        })
    }
}

impl<R: BufRead> CaptureFileReader<R> {
    pub fn new(input: R) -> Self {
        Self { input }
    }

    /// Read every record and decode it with `pipeline`
    ///
    /// A response following a request is decoded with that request's method
    /// so `HEAD` replies keep their empty bodies.
    pub fn read_all(self, pipeline: &Pipeline) -> Result<Vec<CapturedMessage>, CaptureFileError> {
        let mut messages = Vec::new();
        let mut last_request_method: Option<String> = None;

        for (idx, line) in self.input.lines().enumerate() {
            let line = line?;
            if line.trim().is_empty() {
                continue;
            }
            let line_no = idx + 1;
            let record: CaptureRecord =
                serde_json::from_str(&line).map_err(|source| CaptureFileError::InvalidRecord { line: line_no, source })?;
            let raw = STANDARD
                .decode(record.raw_message_content.as_bytes())
                .map_err(|source| CaptureFileError::InvalidContent { line: line_no, source })?;

            let endpoints = Endpoints {
                sender: record.sender,
                receiver: record.receiver,
            };
            let mut ctx = DecodeContext::new(&endpoints);
            if let Some(method) = last_request_method.as_deref() {
                ctx = ctx.with_request_method(method);
            }
            let element = pipeline.decode_message(Bytes::from(raw), &ctx);

            last_request_method = match element.find::<HttpFacet>() {
                Some(HttpFacet::Request(request)) => Some(request.method.clone()),
                _ => None,
            };

            messages.push(CapturedMessage {
                sequence_number: record.sequence_number,
                uuid: record.uuid,
                endpoints,
                timestamp: record.timestamp,
                element,
            });
        }

        debug!(count = messages.len(), "Capture file decoded");
        Ok(messages)
    }
}

/// Write `messages` to a fresh file at `path`
pub fn save(path: impl AsRef<Path>, messages: &[std::sync::Arc<CapturedMessage>]) -> Result<usize, CaptureFileError> {
    let mut writer = CaptureFileWriter::create(path.as_ref())?;
    for message in messages {
        writer.append(message)?;
    }
    let written = writer.finish()?;
    info!(path = %path.as_ref().display(), written, "Capture saved");
    Ok(written)
}

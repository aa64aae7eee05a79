//! Capture/decode pipeline
//!
//! Raw traffic goes through phased protocol plugins and comes out as a tree
//! of [`CapturedElement`]s. Decoded messages are retained in a
//! [`CaptureStore`] under a byte budget and can be saved to / loaded from
//! capture files.

pub mod element;
pub mod file;
pub mod pipeline;
pub mod plugins;
pub mod store;

use thiserror::Error;

pub use element::{
    BinaryFacet, BinaryReason, CapturedElement, CapturedMessage, CetpFrame, Endpoints, Facet, FacetKind, HttpFacet,
    JsonFacet, Pop3Facet, SicctEnvelope, SicctMessageType, SmtpFacet, TlsFacet, X509Facet,
};
pub use file::{CaptureFileError, CaptureFileReader, CaptureFileWriter};
pub use pipeline::{Claim, Consumed, DecodeContext, DecodePlugin, Payload, Phase, Pipeline, StreamDecoder};
pub use store::CaptureStore;

#[derive(Debug, Error)]
pub enum DecodeError {
    #[error("Facet '{0}' absent")]
    FacetAbsent(&'static str),
}

//! Length-prefixed binary protocols
//!
//! Both read a fixed marker and a big-endian length, and claim nothing until
//! the declared length is fully buffered.

use bytes::Bytes;

use crate::capture::element::{CetpFrame, SicctEnvelope, SicctMessageType};
use crate::capture::pipeline::{Claim, DecodeContext, DecodePlugin, Phase};

/// type(1) address(2) sequence(2) rfu(1) length(4)
pub const SICCT_HEADER_LEN: usize = 10;
const SICCT_RFU_OFFSET: usize = 5;
const SICCT_MAX_BODY: u32 = 1024 * 1024;

pub const CETP_HEADER_LEN: usize = 8;
const CETP_MARKER: &[u8] = b"CETP";

/// SICCT card terminal envelope around a command/response APDU
#[derive(Debug, Default)]
pub struct SicctPlugin;

impl DecodePlugin for SicctPlugin {
    fn name(&self) -> &'static str {
        "sicct"
    }

    fn phase(&self) -> Phase {
        Phase::Framing
    }

    fn inspect(&self, buf: &Bytes, _ctx: &DecodeContext<'_>) -> Claim {
        let Some(message_type) = buf.first().copied().and_then(SicctMessageType::from_byte) else {
            return Claim::Decline;
        };
        if buf.len() > SICCT_RFU_OFFSET && buf[SICCT_RFU_OFFSET] != 0x00 {
            return Claim::Decline;
        }
        if buf.len() < SICCT_HEADER_LEN {
            return Claim::NeedMore;
        }

        let length = u32::from_be_bytes([buf[6], buf[7], buf[8], buf[9]]);
        if length > SICCT_MAX_BODY {
            return Claim::Decline;
        }
        let total = SICCT_HEADER_LEN + length as usize;
        if buf.len() < total {
            return Claim::NeedMore;
        }

        let envelope = SicctEnvelope {
            message_type,
            address: u16::from_be_bytes([buf[1], buf[2]]),
            sequence: u16::from_be_bytes([buf[3], buf[4]]),
            length,
        };
        Claim::claimed(total, envelope).with_payload(SICCT_HEADER_LEN, buf.slice(SICCT_HEADER_LEN..total))
    }
}

/// `CETP` marker, u32 length, body
#[derive(Debug, Default)]
pub struct CetpPlugin;

impl DecodePlugin for CetpPlugin {
    fn name(&self) -> &'static str {
        "cetp"
    }

    fn phase(&self) -> Phase {
        Phase::Framing
    }

    fn inspect(&self, buf: &Bytes, _ctx: &DecodeContext<'_>) -> Claim {
        let marker_len = buf.len().min(CETP_MARKER.len());
        if buf.is_empty() || !CETP_MARKER.starts_with(&buf[..marker_len]) {
            return Claim::Decline;
        }
        if buf.len() < CETP_HEADER_LEN {
            return Claim::NeedMore;
        }

        let length = u32::from_be_bytes([buf[4], buf[5], buf[6], buf[7]]);
        let total = CETP_HEADER_LEN.saturating_add(length as usize);
        if buf.len() < total {
            return Claim::NeedMore;
        }

        Claim::claimed(total, CetpFrame { length }).with_payload(CETP_HEADER_LEN, buf.slice(CETP_HEADER_LEN..total))
    }
}

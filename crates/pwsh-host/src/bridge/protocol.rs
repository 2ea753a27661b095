//! Wire protocol types for manager-host communication.
//!
//! Client to server: one opcode byte (`0x00` exit, `0x01` execute), then for
//! execute only a single length-prefixed frame of host source text.
//!
//! Server to client: one length-prefixed frame whose payload is a flat
//! sequence of alternating length-prefixed key/value UTF-8 strings. A
//! zero-length value frame denotes a null value; a zero-length outer frame
//! denotes "no response body".

use std::io;

use tokio_util::bytes::{Buf, Bytes};

pub const OPCODE_EXIT: u8 = 0x00;
pub const OPCODE_EXECUTE: u8 = 0x01;

/// Requests the manager can put on the channel.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HostRequest {
    Exit,
    Execute(String),
}

impl HostRequest {
    pub fn opcode(&self) -> u8 {
        match self {
            Self::Exit => OPCODE_EXIT,
            Self::Execute(_) => OPCODE_EXECUTE,
        }
    }
}

/// Consume one length-prefixed string from `buf`.
///
/// Reads exactly 4 bytes (u32 LE) as the length. A zero length yields
/// `Ok(None)` without consuming further bytes; otherwise exactly `len` bytes
/// are consumed and decoded as UTF-8. A short buffer or invalid UTF-8 is an
/// `InvalidData` error — the channel can no longer be trusted past that point.
pub fn read_frame_string(buf: &mut Bytes) -> io::Result<Option<String>> {
    if buf.remaining() < 4 {
        return Err(io::Error::new(
            io::ErrorKind::InvalidData,
            "truncated length prefix in response frame",
        ));
    }
    let len = buf.get_u32_le() as usize;
    if len == 0 {
        return Ok(None);
    }
    if buf.remaining() < len {
        return Err(io::Error::new(
            io::ErrorKind::InvalidData,
            format!(
                "response frame declares {len} bytes but only {} remain",
                buf.remaining()
            ),
        ));
    }
    let bytes = buf.split_to(len);
    match String::from_utf8(bytes.to_vec()) {
        Ok(s) => Ok(Some(s)),
        Err(e) => Err(io::Error::new(io::ErrorKind::InvalidData, e)),
    }
}

/// Decoded response body: ordered key/value pairs.
///
/// Keys are unique by construction of the sender, so a `Vec` keeps the
/// original order without a dedup pass.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ResponseMap {
    entries: Vec<(String, Option<String>)>,
}

impl ResponseMap {
    /// Decode alternating key/value frames until the buffer is exhausted.
    pub fn decode(mut buf: Bytes) -> io::Result<Self> {
        let mut entries = Vec::new();
        while buf.has_remaining() {
            let key = read_frame_string(&mut buf)?.ok_or_else(|| {
                io::Error::new(io::ErrorKind::InvalidData, "null key in response map")
            })?;
            let value = read_frame_string(&mut buf)?;
            entries.push((key, value));
        }
        Ok(Self { entries })
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.entries
            .iter()
            .find(|(k, _)| k == key)
            .and_then(|(_, v)| v.as_deref())
    }

    /// The host's reported exit code; missing or unparseable maps to 0.
    pub fn exitcode(&self) -> i32 {
        self.get("exitcode")
            .and_then(|v| v.trim().parse().ok())
            .unwrap_or(0)
    }

    pub fn entries(&self) -> &[(String, Option<String>)] {
        &self.entries
    }

    #[cfg(test)]
    pub(crate) fn from_entries(entries: Vec<(String, Option<String>)>) -> Self {
        Self { entries }
    }
}

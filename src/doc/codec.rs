//! Binary framing for deltas and snapshots.
//!
//! ```text
//! [MAGIC: u8 = 0xC7] [kind: u8] [CBOR body...]
//! kind 0x01 = Delta    body = { ops: [...] }
//! kind 0x02 = Snapshot body = { version: u32, ops: [...] }
//! ```
//!
//! Both travel as binary WebSocket frames; the kind byte tells them apart.

use serde::{Deserialize, Serialize};

use super::ops::{Delta, Op};
use super::DocError;

pub const MAGIC: u8 = 0xC7;
pub const SNAPSHOT_VERSION: u32 = 1;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum FrameKind {
    Delta = 0x01,
    Snapshot = 0x02,
}

impl FrameKind {
    pub fn from_u8(b: u8) -> Option<Self> {
        match b {
            0x01 => Some(FrameKind::Delta),
            0x02 => Some(FrameKind::Snapshot),
            _ => None,
        }
    }

    pub fn as_u8(self) -> u8 {
        self as u8
    }
}

/// A decoded binary frame.
#[derive(Debug, Clone, PartialEq)]
pub enum BinaryFrame {
    Delta(Delta),
    Snapshot(Vec<Op>),
}

#[derive(Serialize, Deserialize)]
struct SnapshotBody {
    version: u32,
    ops: Vec<Op>,
}

fn encode<T: Serialize>(kind: FrameKind, body: &T) -> Result<Vec<u8>, DocError> {
    let mut out = vec![MAGIC, kind.as_u8()];
    serde_cbor::to_writer(&mut out, body).map_err(|e| DocError::Encode(e.to_string()))?;
    Ok(out)
}

/// Returns the frame kind after checking the header.
pub fn frame_kind(bytes: &[u8]) -> Result<FrameKind, DocError> {
    match bytes {
        [MAGIC, kind, ..] => FrameKind::from_u8(*kind).ok_or(DocError::UnexpectedKind(*kind)),
        [_, _, ..] => Err(DocError::Malformed("bad magic byte".to_string())),
        _ => Err(DocError::Malformed("frame shorter than header".to_string())),
    }
}

pub fn encode_delta(delta: &Delta) -> Result<Vec<u8>, DocError> {
    encode(FrameKind::Delta, delta)
}

pub fn decode_delta(bytes: &[u8]) -> Result<Delta, DocError> {
    match decode_frame(bytes)? {
        BinaryFrame::Delta(delta) => Ok(delta),
        BinaryFrame::Snapshot(_) => Err(DocError::UnexpectedKind(FrameKind::Snapshot.as_u8())),
    }
}

pub fn encode_snapshot(ops: &[Op]) -> Result<Vec<u8>, DocError> {
    #[derive(Serialize)]
    struct Borrowed<'a> {
        version: u32,
        ops: &'a [Op],
    }
    encode(
        FrameKind::Snapshot,
        &Borrowed {
            version: SNAPSHOT_VERSION,
            ops,
        },
    )
}

pub fn decode_snapshot(bytes: &[u8]) -> Result<Vec<Op>, DocError> {
    match decode_frame(bytes)? {
        BinaryFrame::Snapshot(ops) => Ok(ops),
        BinaryFrame::Delta(_) => Err(DocError::UnexpectedKind(FrameKind::Delta.as_u8())),
    }
}

pub fn decode_frame(bytes: &[u8]) -> Result<BinaryFrame, DocError> {
    let kind = frame_kind(bytes)?;
    let body = &bytes[2..];
    match kind {
        FrameKind::Delta => serde_cbor::from_slice::<Delta>(body)
            .map(BinaryFrame::Delta)
            .map_err(|e| DocError::Malformed(e.to_string())),
        FrameKind::Snapshot => {
            let snapshot: SnapshotBody =
                serde_cbor::from_slice(body).map_err(|e| DocError::Malformed(e.to_string()))?;
            if snapshot.version != SNAPSHOT_VERSION {
                return Err(DocError::Malformed(format!(
                    "unsupported snapshot version {}",
                    snapshot.version
                )));
            }
            Ok(BinaryFrame::Snapshot(snapshot.ops))
        }
    }
}

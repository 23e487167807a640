//! The scheduler <-> worker message taxonomy, plus the binary framing used
//! when a message has to cross a subprocess boundary (PROCESS worker mode).
//!
//! In-process (THREAD worker mode) mailboxes pass `Message` values directly;
//! nothing needs to be packed. Subprocess workers only ever see the framed
//! bytes, produced by `Header::pack` + a JSON payload, read back off a pipe.

use byteorder::{BigEndian, ReadBytesExt, WriteBytesExt};
use serde::{Deserialize, Serialize};
use std::io::Cursor;

use crate::error::{ProtocolError, Result};
use jobforge_ids::JobId;
use serde_json::Value;

/// Wire protocol version. Bumped whenever `Header`'s layout changes.
pub const PROTOCOL_VERSION: u8 = 0x01;

/// Header size in bytes: `[VER:1][OP:1][RES:2][LEN:4]`.
pub const HEADER_SIZE: usize = 8;

/// OpCodes used only for the subprocess IPC framing. The in-process mailbox
/// bus carries full `Message` values and has no use for these.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum OpCode {
    Start = 0,
    Progress = 1,
    Result = 2,
    Error = 3,
    Cancel = 4,
}

impl OpCode {
    pub fn from_u8(value: u8) -> Result<Self> {
        match value {
            0 => Ok(OpCode::Start),
            1 => Ok(OpCode::Progress),
            2 => Ok(OpCode::Result),
            3 => Ok(OpCode::Error),
            4 => Ok(OpCode::Cancel),
            other => Err(ProtocolError::InvalidOpCode(other)),
        }
    }

    pub fn as_u8(self) -> u8 {
        self as u8
    }
}

/// Fixed-size frame header preceding every subprocess IPC payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Header {
    pub version: u8,
    pub opcode: OpCode,
    pub reserved: u16,
    pub payload_len: u32,
}

impl Header {
    pub fn new(opcode: OpCode, payload_len: u32) -> Self {
        Self {
            version: PROTOCOL_VERSION,
            opcode,
            reserved: 0,
            payload_len,
        }
    }

    /// Pack into an 8-byte big-endian buffer: `[VER][OP][RES:u16][LEN:u32]`.
    pub fn pack(&self) -> Result<[u8; HEADER_SIZE]> {
        let mut buf = [0u8; HEADER_SIZE];
        let mut cursor = Cursor::new(&mut buf[..]);
        cursor.write_u8(self.version)?;
        cursor.write_u8(self.opcode.as_u8())?;
        cursor.write_u16::<BigEndian>(self.reserved)?;
        cursor.write_u32::<BigEndian>(self.payload_len)?;
        Ok(buf)
    }

    pub fn unpack(data: &[u8]) -> Result<Self> {
        if data.len() < HEADER_SIZE {
            return Err(ProtocolError::HeaderTooShort {
                expected: HEADER_SIZE,
                got: data.len(),
            });
        }
        let mut cursor = Cursor::new(&data[..HEADER_SIZE]);
        let version = cursor.read_u8()?;
        let op_raw = cursor.read_u8()?;
        let reserved = cursor.read_u16::<BigEndian>()?;
        let payload_len = cursor.read_u32::<BigEndian>()?;

        if version != PROTOCOL_VERSION {
            return Err(ProtocolError::VersionMismatch {
                expected: PROTOCOL_VERSION,
                got: version,
            });
        }

        Ok(Self {
            version,
            opcode: OpCode::from_u8(op_raw)?,
            reserved,
            payload_len,
        })
    }
}

/// Pack a framed message: an 8-byte header followed by the JSON payload.
pub fn pack_frame<T: Serialize>(opcode: OpCode, payload: &T) -> Result<Vec<u8>> {
    let body = serde_json::to_vec(payload)?;
    let header = Header::new(opcode, body.len() as u32);
    let mut out = Vec::with_capacity(HEADER_SIZE + body.len());
    out.extend_from_slice(&header.pack()?);
    out.extend_from_slice(&body);
    Ok(out)
}

/// Unpack a framed message previously produced by [`pack_frame`].
pub fn unpack_frame<T: for<'de> Deserialize<'de>>(data: &[u8]) -> Result<(OpCode, T)> {
    let header = Header::unpack(data)?;
    let body_end = HEADER_SIZE + header.payload_len as usize;
    if data.len() < body_end {
        return Err(ProtocolError::HeaderTooShort {
            expected: body_end,
            got: data.len(),
        });
    }
    let payload = serde_json::from_slice(&data[HEADER_SIZE..body_end])?;
    Ok((header.opcode, payload))
}

/// The scheduler <-> worker message bus vocabulary. This is a closed,
/// tagged enum rather than a stringly-typed `{type, payload}`
/// envelope: an "unknown message type" can then only arise from a
/// deserialization bug, which is a programmer error by construction.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", content = "message", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Message {
    StartJob {
        job_id: JobId,
        handler: String,
        args: Value,
        kwargs: Value,
        track_progress: bool,
        cancellable: bool,
    },
    CancelJob {
        job_id: JobId,
    },
    JobStarted {
        job_id: JobId,
    },
    JobUpdated {
        job_id: JobId,
        progress: f64,
        total_progress: f64,
        stage: String,
    },
    JobCompleted {
        job_id: JobId,
        result: Value,
    },
    JobFailed {
        job_id: JobId,
        exception: String,
        traceback: String,
    },
}

impl Message {
    /// Every variant carries a `job_id`; useful for routing and correlation.
    pub fn job_id(&self) -> &JobId {
        match self {
            Message::StartJob { job_id, .. }
            | Message::CancelJob { job_id }
            | Message::JobStarted { job_id }
            | Message::JobUpdated { job_id, .. }
            | Message::JobCompleted { job_id, .. }
            | Message::JobFailed { job_id, .. } => job_id,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn header_round_trips() {
        let header = Header::new(OpCode::Progress, 42);
        let packed = header.pack().unwrap();
        let unpacked = Header::unpack(&packed).unwrap();
        assert_eq!(header, unpacked);
    }

    #[test]
    fn rejects_truncated_header() {
        let err = Header::unpack(&[1, 2, 3]).unwrap_err();
        assert!(matches!(err, ProtocolError::HeaderTooShort { .. }));
    }

    #[test]
    fn rejects_version_mismatch() {
        let mut packed = Header::new(OpCode::Result, 0).pack().unwrap();
        packed[0] = 0xFF;
        let err = Header::unpack(&packed).unwrap_err();
        assert!(matches!(err, ProtocolError::VersionMismatch { .. }));
    }

    #[test]
    fn frame_round_trips_payload() {
        let payload = serde_json::json!({"rows": 12});
        let framed = pack_frame(OpCode::Result, &payload).unwrap();
        let (opcode, decoded): (OpCode, Value) = unpack_frame(&framed).unwrap();
        assert_eq!(opcode, OpCode::Result);
        assert_eq!(decoded, payload);
    }

    #[test]
    fn message_serializes_as_tagged_envelope() {
        let msg = Message::JobStarted { job_id: JobId::new() };
        let json = serde_json::to_value(&msg).unwrap();
        assert_eq!(json["type"], "JOB_STARTED");
    }

    #[test]
    fn job_id_accessor_covers_every_variant() {
        let id = JobId::new();
        let started = Message::JobStarted { job_id: id.clone() };
        assert_eq!(started.job_id(), &id);
    }
}

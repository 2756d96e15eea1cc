//! Log row header and body codec.
//!
//! A row is one statement of a transaction. The same fixed little-endian
//! encoding is used inside segment frames and on the replication wire.

use bytes::Bytes;
use thiserror::Error;

use super::vclock::{InstanceId, VClock};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum RowType {
    /// Administrative payload: vclock handshakes, acks and heartbeats.
    Ok = 0,
    Insert = 1,
    Replace = 2,
    Update = 3,
    Delete = 4,
    Upsert = 5,
    /// No-op that still advances the follower's vclock.
    Nop = 6,
}

impl RowType {
    pub fn is_dml(self) -> bool {
        matches!(
            self,
            RowType::Insert
                | RowType::Replace
                | RowType::Update
                | RowType::Delete
                | RowType::Upsert
                | RowType::Nop
        )
    }

    fn from_u8(raw: u8) -> Result<Self, RowCodecError> {
        Ok(match raw {
            0 => RowType::Ok,
            1 => RowType::Insert,
            2 => RowType::Replace,
            3 => RowType::Update,
            4 => RowType::Delete,
            5 => RowType::Upsert,
            6 => RowType::Nop,
            other => return Err(RowCodecError::UnknownRowType { got: other }),
        })
    }
}

/// Replication group of a row. `Local` rows describe replica-local effects
/// and must not be replayed verbatim on followers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[repr(u8)]
pub enum GroupId {
    #[default]
    Default = 0,
    Local = 1,
}

impl GroupId {
    fn from_u8(raw: u8) -> Result<Self, RowCodecError> {
        Ok(match raw {
            0 => GroupId::Default,
            1 => GroupId::Local,
            other => return Err(RowCodecError::UnknownGroup { got: other }),
        })
    }
}

#[derive(Debug, Error)]
pub enum RowCodecError {
    #[error("unknown row type {got}")]
    UnknownRowType { got: u8 },
    #[error("unknown replication group {got}")]
    UnknownGroup { got: u8 },
    #[error("row truncated: need {need} bytes, have {have}")]
    Truncated { need: usize, have: usize },
    #[error("vclock payload truncated")]
    VclockTruncated,
    #[error("vclock payload is not monotone")]
    VclockMalformed,
}

const FLAG_COMMIT: u8 = 0x01;
/// Fixed part of an encoded row, before the body.
pub const ROW_HEADER_LEN: usize = 3 + 4 + 8 + 8 + 8 + 8 + 4;

#[derive(Debug, Clone, PartialEq)]
pub struct Row {
    pub row_type: RowType,
    pub group_id: GroupId,
    /// Set on the last row of a transaction.
    pub is_commit: bool,
    /// Originating instance; `INSTANCE_ID_NIL` until LSN assignment.
    pub replica_id: InstanceId,
    pub lsn: i64,
    /// LSN of the first row of the owning transaction.
    pub tsn: i64,
    /// Session correlator echoed on every reply frame.
    pub sync: u64,
    /// Wall-clock seconds, stamped at write time.
    pub timestamp: f64,
    pub body: Bytes,
}

impl Row {
    /// A local DML row awaiting LSN assignment.
    pub fn new_dml(row_type: RowType, body: Bytes) -> Self {
        Self {
            row_type,
            group_id: GroupId::Default,
            is_commit: false,
            replica_id: 0,
            lsn: 0,
            tsn: 0,
            sync: 0,
            timestamp: 0.0,
            body,
        }
    }

    /// Rewrite of a replica-local row into a vclock-advancing no-op.
    /// LSN accounting fields are preserved.
    pub fn nop_of(row: &Row) -> Self {
        Self {
            row_type: RowType::Nop,
            group_id: GroupId::Default,
            is_commit: row.is_commit,
            replica_id: row.replica_id,
            lsn: row.lsn,
            tsn: row.tsn,
            sync: row.sync,
            timestamp: row.timestamp,
            body: Bytes::new(),
        }
    }

    /// Heartbeat: a timestamp row that carries no LSN advance.
    pub fn heartbeat(instance: InstanceId, timestamp: f64) -> Self {
        Self {
            row_type: RowType::Ok,
            group_id: GroupId::Default,
            is_commit: false,
            replica_id: instance,
            lsn: 0,
            tsn: 0,
            sync: 0,
            timestamp,
            body: Bytes::new(),
        }
    }

    /// Vclock payload row, used for the subscribe handshake and for
    /// follower acknowledgements.
    pub fn vclock_row(vclock: &VClock, sync: u64) -> Self {
        let mut body = Vec::with_capacity(4 + vclock.len() * 12);
        body.extend_from_slice(&(vclock.len() as u32).to_le_bytes());
        for (instance, lsn) in vclock.iter() {
            body.extend_from_slice(&instance.to_le_bytes());
            body.extend_from_slice(&lsn.to_le_bytes());
        }
        Self {
            row_type: RowType::Ok,
            group_id: GroupId::Default,
            is_commit: false,
            replica_id: 0,
            lsn: 0,
            tsn: 0,
            sync,
            timestamp: 0.0,
            body: Bytes::from(body),
        }
    }

    /// Decode the vclock payload of an `Ok` row.
    pub fn decode_vclock(&self) -> Result<VClock, RowCodecError> {
        let body = &self.body[..];
        if body.len() < 4 {
            return Err(RowCodecError::VclockTruncated);
        }
        let count = u32::from_le_bytes([body[0], body[1], body[2], body[3]]) as usize;
        if body.len() < 4 + count * 12 {
            return Err(RowCodecError::VclockTruncated);
        }
        let mut vclock = VClock::new();
        for i in 0..count {
            let at = 4 + i * 12;
            let instance = u32::from_le_bytes(body[at..at + 4].try_into().expect("4 bytes"));
            let lsn = i64::from_le_bytes(body[at + 4..at + 12].try_into().expect("8 bytes"));
            if lsn > 0 {
                vclock
                    .follow(instance, lsn)
                    .map_err(|_| RowCodecError::VclockMalformed)?;
            }
        }
        Ok(vclock)
    }

    /// True for heartbeat rows: no LSN, no payload.
    pub fn is_heartbeat(&self) -> bool {
        self.row_type == RowType::Ok && self.lsn == 0 && self.body.is_empty()
    }

    pub fn encoded_len(&self) -> usize {
        ROW_HEADER_LEN + self.body.len()
    }

    pub fn encode_into(&self, buf: &mut Vec<u8>) {
        let mut flags = 0u8;
        if self.is_commit {
            flags |= FLAG_COMMIT;
        }
        buf.push(self.row_type as u8);
        buf.push(self.group_id as u8);
        buf.push(flags);
        buf.extend_from_slice(&self.replica_id.to_le_bytes());
        buf.extend_from_slice(&self.lsn.to_le_bytes());
        buf.extend_from_slice(&self.tsn.to_le_bytes());
        buf.extend_from_slice(&self.sync.to_le_bytes());
        buf.extend_from_slice(&self.timestamp.to_bits().to_le_bytes());
        buf.extend_from_slice(&(self.body.len() as u32).to_le_bytes());
        buf.extend_from_slice(&self.body);
    }

    pub fn decode(buf: &[u8]) -> Result<(Row, usize), RowCodecError> {
        if buf.len() < ROW_HEADER_LEN {
            return Err(RowCodecError::Truncated {
                need: ROW_HEADER_LEN,
                have: buf.len(),
            });
        }
        let row_type = RowType::from_u8(buf[0])?;
        let group_id = GroupId::from_u8(buf[1])?;
        let flags = buf[2];
        let replica_id = u32::from_le_bytes(buf[3..7].try_into().expect("4 bytes"));
        let lsn = i64::from_le_bytes(buf[7..15].try_into().expect("8 bytes"));
        let tsn = i64::from_le_bytes(buf[15..23].try_into().expect("8 bytes"));
        let sync = u64::from_le_bytes(buf[23..31].try_into().expect("8 bytes"));
        let timestamp = f64::from_bits(u64::from_le_bytes(
            buf[31..39].try_into().expect("8 bytes"),
        ));
        let body_len = u32::from_le_bytes(buf[39..43].try_into().expect("4 bytes")) as usize;
        let total = ROW_HEADER_LEN + body_len;
        if buf.len() < total {
            return Err(RowCodecError::Truncated {
                need: total,
                have: buf.len(),
            });
        }
        let body = Bytes::copy_from_slice(&buf[ROW_HEADER_LEN..total]);
        Ok((
            Row {
                row_type,
                group_id,
                is_commit: flags & FLAG_COMMIT != 0,
                replica_id,
                lsn,
                tsn,
                sync,
                timestamp,
                body,
            },
            total,
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_row() -> Row {
        Row {
            row_type: RowType::Replace,
            group_id: GroupId::Default,
            is_commit: true,
            replica_id: 3,
            lsn: 42,
            tsn: 41,
            sync: 7,
            timestamp: 1234.5,
            body: Bytes::from_static(b"payload"),
        }
    }

    #[test]
    fn codec_round_trip() {
        let row = sample_row();
        let mut buf = Vec::new();
        row.encode_into(&mut buf);
        assert_eq!(buf.len(), row.encoded_len());
        let (decoded, consumed) = Row::decode(&buf).unwrap();
        assert_eq!(consumed, buf.len());
        assert_eq!(decoded, row);
    }

    #[test]
    fn decode_rejects_truncation() {
        let row = sample_row();
        let mut buf = Vec::new();
        row.encode_into(&mut buf);
        assert!(matches!(
            Row::decode(&buf[..buf.len() - 1]),
            Err(RowCodecError::Truncated { .. })
        ));
    }

    #[test]
    fn nop_rewrite_preserves_lsn_accounting() {
        let mut row = sample_row();
        row.group_id = GroupId::Local;
        let nop = Row::nop_of(&row);
        assert_eq!(nop.row_type, RowType::Nop);
        assert_eq!(nop.group_id, GroupId::Default);
        assert_eq!(nop.replica_id, row.replica_id);
        assert_eq!(nop.lsn, row.lsn);
        assert_eq!(nop.tsn, row.tsn);
        assert!(nop.body.is_empty());
    }

    #[test]
    fn vclock_row_round_trip() {
        let mut vclock = VClock::new();
        vclock.follow(1, 8).unwrap();
        vclock.follow(4, 2).unwrap();
        let row = Row::vclock_row(&vclock, 99);
        assert_eq!(row.sync, 99);
        assert_eq!(row.decode_vclock().unwrap(), vclock);
    }

    #[test]
    fn heartbeat_has_no_lsn() {
        let hb = Row::heartbeat(1, 10.0);
        assert!(hb.is_heartbeat());
        assert_eq!(hb.lsn, 0);
    }
}

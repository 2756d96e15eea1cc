//! Row-group framing (magic + length + crc32c), shared by segment files
//! and the replication wire.

use std::io::{Read, Write};

use thiserror::Error;

use crc32c::crc32c;

use super::row::{Row, RowCodecError};

const FRAME_MAGIC: u32 = 0x5752_4C31; // "WRL1"
const FRAME_HEADER_LEN: usize = 12;

/// Upper bound on one frame's payload. A frame holds one transaction's
/// rows, so this doubles as the transaction size limit.
pub const FRAME_MAX_BYTES: usize = 64 * 1024 * 1024;

#[derive(Debug, Error)]
pub enum FrameError {
    #[error("frame io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("frame magic mismatch: got {got:#x}")]
    MagicMismatch { got: u32 },
    #[error("frame length invalid: {got} (max {max})")]
    LengthInvalid { got: usize, max: usize },
    #[error("frame crc32c mismatch: expected {expected:#x}, got {got:#x}")]
    CrcMismatch { expected: u32, got: u32 },
    #[error("frame row codec error: {0}")]
    Row(#[from] RowCodecError),
}

/// Encode a group of rows into one frame appended to `buf`.
pub fn encode_frame(rows: &[Row], buf: &mut Vec<u8>) {
    let mut payload = Vec::with_capacity(rows.iter().map(Row::encoded_len).sum::<usize>() + 4);
    payload.extend_from_slice(&(rows.len() as u32).to_le_bytes());
    for row in rows {
        row.encode_into(&mut payload);
    }
    buf.extend_from_slice(&FRAME_MAGIC.to_le_bytes());
    buf.extend_from_slice(&(payload.len() as u32).to_le_bytes());
    buf.extend_from_slice(&crc32c(&payload).to_le_bytes());
    buf.extend_from_slice(&payload);
}

pub fn decode_payload(payload: &[u8]) -> Result<Vec<Row>, FrameError> {
    if payload.len() < 4 {
        return Err(FrameError::LengthInvalid {
            got: payload.len(),
            max: FRAME_MAX_BYTES,
        });
    }
    let count = u32::from_le_bytes(payload[0..4].try_into().expect("4 bytes")) as usize;
    let mut rows = Vec::with_capacity(count);
    let mut at = 4;
    for _ in 0..count {
        let (row, consumed) = Row::decode(&payload[at..])?;
        at += consumed;
        rows.push(row);
    }
    Ok(rows)
}

pub struct FrameWriter<W> {
    writer: W,
}

impl<W: Write> FrameWriter<W> {
    pub fn new(writer: W) -> Self {
        Self { writer }
    }

    /// Write one frame, returning its on-wire length.
    pub fn write_frame(&mut self, rows: &[Row]) -> Result<usize, FrameError> {
        let mut buf = Vec::new();
        encode_frame(rows, &mut buf);
        self.writer.write_all(&buf)?;
        Ok(buf.len())
    }

    pub fn get_mut(&mut self) -> &mut W {
        &mut self.writer
    }
}

pub struct FrameReader<R> {
    reader: R,
    consumed: u64,
}

impl<R: Read> FrameReader<R> {
    pub fn new(reader: R) -> Self {
        Self {
            reader,
            consumed: 0,
        }
    }

    /// Bytes consumed by fully decoded frames. A zeroed or truncated tail
    /// is not counted, so this is the valid end of the stream.
    pub fn consumed(&self) -> u64 {
        self.consumed
    }

    /// Read the next frame. `Ok(None)` on clean EOF, which includes a
    /// zeroed preallocated tail of a hot segment.
    pub fn read_frame(&mut self) -> Result<Option<Vec<Row>>, FrameError> {
        let mut header = [0u8; FRAME_HEADER_LEN];
        let mut read = 0usize;
        while read < header.len() {
            let n = self.reader.read(&mut header[read..])?;
            if n == 0 {
                return Ok(None);
            }
            read += n;
        }

        let magic = u32::from_le_bytes(header[0..4].try_into().expect("4 bytes"));
        if magic == 0 {
            // preallocated, never-written tail
            return Ok(None);
        }
        if magic != FRAME_MAGIC {
            return Err(FrameError::MagicMismatch { got: magic });
        }
        let length = u32::from_le_bytes(header[4..8].try_into().expect("4 bytes")) as usize;
        if length == 0 || length > FRAME_MAX_BYTES {
            return Err(FrameError::LengthInvalid {
                got: length,
                max: FRAME_MAX_BYTES,
            });
        }
        let expected_crc = u32::from_le_bytes(header[8..12].try_into().expect("4 bytes"));

        let mut payload = vec![0u8; length];
        let mut read_body = 0usize;
        while read_body < length {
            let n = self.reader.read(&mut payload[read_body..])?;
            if n == 0 {
                return Ok(None);
            }
            read_body += n;
        }
        let actual_crc = crc32c(&payload);
        if actual_crc != expected_crc {
            return Err(FrameError::CrcMismatch {
                expected: expected_crc,
                got: actual_crc,
            });
        }
        let rows = decode_payload(&payload)?;
        self.consumed += (FRAME_HEADER_LEN + length) as u64;
        Ok(Some(rows))
    }

    pub fn get_mut(&mut self) -> &mut R {
        &mut self.reader
    }
}

#[cfg(test)]
mod tests {
    use bytes::Bytes;

    use super::*;
    use crate::core::row::RowType;

    fn rows() -> Vec<Row> {
        vec![
            Row::new_dml(RowType::Insert, Bytes::from_static(b"a")),
            Row::new_dml(RowType::Delete, Bytes::from_static(b"bb")),
        ]
    }

    #[test]
    fn frame_round_trip() {
        let mut buf = Vec::new();
        let written = FrameWriter::new(&mut buf).write_frame(&rows()).unwrap();
        assert_eq!(written, buf.len());
        let mut reader = FrameReader::new(&buf[..]);
        let decoded = reader.read_frame().unwrap().unwrap();
        assert_eq!(decoded, rows());
        assert!(reader.read_frame().unwrap().is_none());
    }

    #[test]
    fn zeroed_tail_reads_as_eof() {
        let mut buf = Vec::new();
        FrameWriter::new(&mut buf).write_frame(&rows()).unwrap();
        buf.extend_from_slice(&[0u8; 64]);
        let mut reader = FrameReader::new(&buf[..]);
        assert!(reader.read_frame().unwrap().is_some());
        assert!(reader.read_frame().unwrap().is_none());
    }

    #[test]
    fn corrupt_payload_fails_crc() {
        let mut buf = Vec::new();
        FrameWriter::new(&mut buf).write_frame(&rows()).unwrap();
        let last = buf.len() - 1;
        buf[last] ^= 0xff;
        let mut reader = FrameReader::new(&buf[..]);
        assert!(matches!(
            reader.read_frame(),
            Err(FrameError::CrcMismatch { .. })
        ));
    }
}

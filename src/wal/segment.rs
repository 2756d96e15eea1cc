//! On-disk log segments: header codec, append path, recovery open.
//!
//! A segment file is named by the signature of the vector clock at its
//! creation instant and starts with a checksummed meta header recording
//! that clock together with the instance and replicaset identity. The
//! body is a sequence of row-group frames, one per transaction.

use std::fs::{self, File, OpenOptions};
use std::io::{BufReader, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

use crc32c::crc32c;
use thiserror::Error;
use uuid::Uuid;

use crate::core::frame::{FrameError, FrameReader};
use crate::core::{Row, VClock, encode_frame};

pub(crate) const SEGMENT_MAGIC: &[u8; 5] = b"WRLOG";
pub(crate) const SEGMENT_FORMAT_VERSION: u32 = 1;
pub const SEGMENT_SUFFIX: &str = "xlog";
pub const CORRUPTED_SUFFIX: &str = "corrupted";

const HEADER_PREFIX_LEN: usize = SEGMENT_MAGIC.len() + 8;

pub type SegmentResult<T> = Result<T, SegmentError>;

#[derive(Debug, Error)]
pub enum SegmentError {
    #[error("io error at {path:?}: {source}")]
    Io {
        path: Option<PathBuf>,
        #[source]
        source: std::io::Error,
    },
    #[error("segment header invalid: {reason}")]
    HeaderInvalid { reason: String },
    #[error("segment header magic mismatch")]
    HeaderMagicMismatch,
    #[error("segment format unsupported: got {got}, supported {supported}")]
    UnsupportedVersion { got: u32, supported: u32 },
    #[error("segment header crc32c mismatch: expected {expected:#x}, got {got:#x}")]
    HeaderCrcMismatch { expected: u32, got: u32 },
    #[error("segment frame error in {path:?}: {source}")]
    Frame {
        path: PathBuf,
        #[source]
        source: FrameError,
    },
    #[error("row out of order: instance {instance}, lsn {lsn}")]
    RowOutOfOrder { instance: u32, lsn: i64 },
}

impl SegmentError {
    fn io(path: &Path, source: std::io::Error) -> Self {
        SegmentError::Io {
            path: Some(path.to_path_buf()),
            source,
        }
    }

    /// True when the error means a damaged file rather than a failing
    /// filesystem; damaged files are renamed aside and skipped.
    pub fn is_corruption(&self) -> bool {
        matches!(
            self,
            SegmentError::HeaderInvalid { .. }
                | SegmentError::HeaderMagicMismatch
                | SegmentError::UnsupportedVersion { .. }
                | SegmentError::HeaderCrcMismatch { .. }
                | SegmentError::Frame { .. }
        )
    }
}

/// A header cut short by EOF is file damage, not an I/O failure.
fn read_header_err(source: std::io::Error) -> SegmentError {
    if source.kind() == std::io::ErrorKind::UnexpectedEof {
        SegmentError::HeaderInvalid {
            reason: "truncated header".to_string(),
        }
    } else {
        SegmentError::Io { path: None, source }
    }
}

pub fn segment_file_name(signature: i64) -> String {
    format!("{signature:020}.{SEGMENT_SUFFIX}")
}

pub fn parse_segment_file_name(name: &str) -> Option<i64> {
    let stem = name.strip_suffix(&format!(".{SEGMENT_SUFFIX}"))?;
    if stem.len() != 20 {
        return None;
    }
    stem.parse::<i64>().ok()
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SegmentHeader {
    pub instance_uuid: Uuid,
    pub replicaset_uuid: Uuid,
    pub start_vclock: VClock,
    pub flags: u32,
}

impl SegmentHeader {
    pub fn new(instance_uuid: Uuid, replicaset_uuid: Uuid, start_vclock: VClock) -> Self {
        Self {
            instance_uuid,
            replicaset_uuid,
            start_vclock,
            flags: 0,
        }
    }

    pub fn encode(&self) -> Vec<u8> {
        let clock_len = self.start_vclock.len();
        let total = HEADER_PREFIX_LEN + 16 + 16 + 4 + 4 + clock_len * 12 + 4;
        let mut buf = Vec::with_capacity(total);
        buf.extend_from_slice(SEGMENT_MAGIC);
        buf.extend_from_slice(&SEGMENT_FORMAT_VERSION.to_le_bytes());
        buf.extend_from_slice(&(total as u32).to_le_bytes());
        buf.extend_from_slice(self.instance_uuid.as_bytes());
        buf.extend_from_slice(self.replicaset_uuid.as_bytes());
        buf.extend_from_slice(&self.flags.to_le_bytes());
        buf.extend_from_slice(&(clock_len as u32).to_le_bytes());
        for (instance, lsn) in self.start_vclock.iter() {
            buf.extend_from_slice(&instance.to_le_bytes());
            buf.extend_from_slice(&lsn.to_le_bytes());
        }
        let crc = crc32c(&buf);
        buf.extend_from_slice(&crc.to_le_bytes());
        buf
    }

    /// Read and validate a header from the start of `reader`. Returns the
    /// header and its encoded length.
    pub fn read_from<R: Read>(reader: &mut R) -> SegmentResult<(Self, u64)> {
        let mut prefix = [0u8; HEADER_PREFIX_LEN];
        reader.read_exact(&mut prefix).map_err(read_header_err)?;
        if &prefix[..SEGMENT_MAGIC.len()] != SEGMENT_MAGIC {
            return Err(SegmentError::HeaderMagicMismatch);
        }
        let version = u32::from_le_bytes(prefix[5..9].try_into().expect("4 bytes"));
        if version != SEGMENT_FORMAT_VERSION {
            return Err(SegmentError::UnsupportedVersion {
                got: version,
                supported: SEGMENT_FORMAT_VERSION,
            });
        }
        let total = u32::from_le_bytes(prefix[9..13].try_into().expect("4 bytes")) as usize;
        if total < HEADER_PREFIX_LEN + 16 + 16 + 4 + 4 + 4 || total > 64 * 1024 {
            return Err(SegmentError::HeaderInvalid {
                reason: format!("implausible header length {total}"),
            });
        }
        let mut rest = vec![0u8; total - HEADER_PREFIX_LEN];
        reader.read_exact(&mut rest).map_err(read_header_err)?;

        let crc_at = rest.len() - 4;
        let expected = u32::from_le_bytes(rest[crc_at..].try_into().expect("4 bytes"));
        let mut crc_input = Vec::with_capacity(total - 4);
        crc_input.extend_from_slice(&prefix);
        crc_input.extend_from_slice(&rest[..crc_at]);
        let actual = crc32c(&crc_input);
        if actual != expected {
            return Err(SegmentError::HeaderCrcMismatch {
                expected,
                got: actual,
            });
        }

        let instance_uuid = Uuid::from_slice(&rest[0..16]).expect("16 bytes");
        let replicaset_uuid = Uuid::from_slice(&rest[16..32]).expect("16 bytes");
        let flags = u32::from_le_bytes(rest[32..36].try_into().expect("4 bytes"));
        let clock_len = u32::from_le_bytes(rest[36..40].try_into().expect("4 bytes")) as usize;
        if rest.len() != 40 + clock_len * 12 + 4 {
            return Err(SegmentError::HeaderInvalid {
                reason: "vclock length disagrees with header length".to_string(),
            });
        }
        let mut start_vclock = VClock::new();
        for i in 0..clock_len {
            let at = 40 + i * 12;
            let instance = u32::from_le_bytes(rest[at..at + 4].try_into().expect("4 bytes"));
            let lsn = i64::from_le_bytes(rest[at + 4..at + 12].try_into().expect("8 bytes"));
            if lsn > 0 {
                start_vclock
                    .follow(instance, lsn)
                    .map_err(|_| SegmentError::HeaderInvalid {
                        reason: "vclock component is not positive-monotone".to_string(),
                    })?;
            }
        }
        Ok((
            Self {
                instance_uuid,
                replicaset_uuid,
                start_vclock,
                flags,
            },
            total as u64,
        ))
    }
}

/// Append half of a segment, owned by the WAL thread.
pub struct SegmentWriter {
    path: PathBuf,
    file: File,
    start_vclock: VClock,
    /// Valid on-disk size: header plus fully written frames.
    offset: u64,
    /// Bytes reserved past `offset` by the last preallocation.
    allocated: u64,
    sync_on_write: bool,
}

impl SegmentWriter {
    /// Create a fresh segment. The header is staged under a temporary
    /// name, synced and renamed into place so a crash never leaves a
    /// half-written header under a live segment name.
    pub fn create(dir: &Path, header: &SegmentHeader, sync_on_write: bool) -> SegmentResult<Self> {
        let name = segment_file_name(header.start_vclock.sum());
        let final_path = dir.join(&name);
        let tmp_path = dir.join(format!("{name}.inprogress"));

        let mut file = OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(&tmp_path)
            .map_err(|source| SegmentError::io(&tmp_path, source))?;
        let header_bytes = header.encode();
        file.write_all(&header_bytes)
            .map_err(|source| SegmentError::io(&tmp_path, source))?;
        file.sync_all()
            .map_err(|source| SegmentError::io(&tmp_path, source))?;
        fs::rename(&tmp_path, &final_path)
            .map_err(|source| SegmentError::io(&final_path, source))?;
        fsync_dir(dir)?;

        // not append mode: writes must land at the tracked offset, in
        // front of any preallocated tail
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .open(&final_path)
            .map_err(|source| SegmentError::io(&final_path, source))?;
        Ok(Self {
            path: final_path,
            file,
            start_vclock: header.start_vclock.clone(),
            offset: header_bytes.len() as u64,
            allocated: 0,
            sync_on_write,
        })
    }

    /// Re-open an existing segment for appending. Scans the body to find
    /// the last fully written frame; trailing garbage is truncated away.
    /// A damaged header or body surfaces as a corruption error and the
    /// caller renames the file aside.
    pub fn open_for_append(path: &Path, sync_on_write: bool) -> SegmentResult<Self> {
        let file = File::open(path).map_err(|source| SegmentError::io(path, source))?;
        let mut reader = BufReader::new(file);
        let (header, header_len) = SegmentHeader::read_from(&mut reader)?;
        let mut frames = FrameReader::new(reader);
        loop {
            match frames.read_frame() {
                Ok(Some(_)) => {}
                Ok(None) => break,
                Err(err) => {
                    // a torn frame after a crash; everything before it
                    // flushed fully and survives
                    tracing::warn!(path = %path.display(), "truncating torn segment tail: {err}");
                    break;
                }
            }
        }
        let valid_end = header_len + frames.consumed();

        let mut file = OpenOptions::new()
            .read(true)
            .write(true)
            .open(path)
            .map_err(|source| SegmentError::io(path, source))?;
        file.set_len(valid_end)
            .map_err(|source| SegmentError::io(path, source))?;
        file.seek(SeekFrom::End(0))
            .map_err(|source| SegmentError::io(path, source))?;
        Ok(Self {
            path: path.to_path_buf(),
            file,
            start_vclock: header.start_vclock,
            offset: valid_end,
            allocated: 0,
            sync_on_write,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn start_vclock(&self) -> &VClock {
        &self.start_vclock
    }

    /// Valid on-disk size, excluding any preallocated tail.
    pub fn offset(&self) -> u64 {
        self.offset
    }

    /// Make sure `len` bytes can be appended without running the
    /// filesystem dry mid-frame. Grows the file with a zeroed tail that
    /// readers recognize as end-of-stream.
    pub fn reserve(&mut self, len: u64) -> SegmentResult<()> {
        if self.allocated >= len {
            return Ok(());
        }
        self.file
            .set_len(self.offset + len)
            .map_err(|source| SegmentError::io(&self.path, source))?;
        self.allocated = len;
        Ok(())
    }

    /// Append one transaction as a single frame. Returns the frame's
    /// on-disk length.
    pub fn append_tx(&mut self, rows: &[Row]) -> SegmentResult<u64> {
        let mut buf = Vec::new();
        encode_frame(rows, &mut buf);
        self.file
            .seek(SeekFrom::Start(self.offset))
            .map_err(|source| SegmentError::io(&self.path, source))?;
        self.file
            .write_all(&buf)
            .map_err(|source| SegmentError::io(&self.path, source))?;
        let len = buf.len() as u64;
        self.offset += len;
        self.allocated = self.allocated.saturating_sub(len);
        if self.sync_on_write {
            self.file
                .sync_data()
                .map_err(|source| SegmentError::io(&self.path, source))?;
        }
        Ok(len)
    }

    /// Roll the file back to a previously recorded offset, discarding a
    /// partially written batch.
    pub fn truncate_to(&mut self, offset: u64) -> SegmentResult<()> {
        self.file
            .set_len(offset)
            .map_err(|source| SegmentError::io(&self.path, source))?;
        self.file
            .seek(SeekFrom::Start(offset))
            .map_err(|source| SegmentError::io(&self.path, source))?;
        self.offset = offset;
        self.allocated = 0;
        Ok(())
    }

    /// Trim the preallocated tail and close the file.
    pub fn close(self) {
        if let Err(err) = self.file.set_len(self.offset) {
            tracing::warn!(path = %self.path.display(), "failed to trim segment on close: {err}");
        }
        if let Err(err) = self.file.sync_data() {
            tracing::warn!(path = %self.path.display(), "failed to sync segment on close: {err}");
        }
    }
}

/// Sequential reader over one segment's frames.
pub struct SegmentReader {
    path: PathBuf,
    header: SegmentHeader,
    frames: FrameReader<BufReader<File>>,
}

impl SegmentReader {
    pub fn open(path: &Path) -> SegmentResult<Self> {
        let file = File::open(path).map_err(|source| SegmentError::io(path, source))?;
        let mut reader = BufReader::new(file);
        let (header, _) = SegmentHeader::read_from(&mut reader)?;
        Ok(Self {
            path: path.to_path_buf(),
            header,
            frames: FrameReader::new(reader),
        })
    }

    pub fn header(&self) -> &SegmentHeader {
        &self.header
    }

    /// Next transaction's rows, `None` at the end of the valid body.
    pub fn next_tx(&mut self) -> SegmentResult<Option<Vec<Row>>> {
        self.frames
            .read_frame()
            .map_err(|source| SegmentError::Frame {
                path: self.path.clone(),
                source,
            })
    }
}

/// Rename a damaged segment aside so the writer can proceed.
pub fn rename_corrupted(path: &Path) -> SegmentResult<PathBuf> {
    let mut name = path.as_os_str().to_os_string();
    name.push(format!(".{CORRUPTED_SUFFIX}"));
    let new_path = PathBuf::from(name);
    fs::rename(path, &new_path).map_err(|source| SegmentError::io(path, source))?;
    Ok(new_path)
}

pub(crate) fn fsync_dir(dir: &Path) -> SegmentResult<()> {
    let file = File::open(dir).map_err(|source| SegmentError::io(dir, source))?;
    file.sync_all()
        .map_err(|source| SegmentError::io(dir, source))?;
    Ok(())
}

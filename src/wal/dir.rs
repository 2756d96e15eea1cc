//! Segment directory: the on-disk log files indexed by starting vclock.
//!
//! The index is keyed by the signature of each segment's starting clock;
//! the directory invariant is that those signatures grow with creation
//! order. The "first" entry is the oldest retained segment; the "second"
//! marks the earliest point still possibly required by any consumer once
//! the first is collected. Unlinking is offloaded to a background thread
//! so garbage collection never stalls the write path.

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::thread;

use crossbeam::channel::{Sender, unbounded};

use crate::core::{ClockOrder, VClock};

use super::segment::{
    SEGMENT_SUFFIX, SegmentError, SegmentReader, SegmentResult, parse_segment_file_name,
    rename_corrupted, segment_file_name,
};

/// Background unlink worker.
struct GcDeleter {
    tx: Option<Sender<PathBuf>>,
    handle: Option<thread::JoinHandle<()>>,
}

impl GcDeleter {
    fn spawn() -> Self {
        let (tx, rx) = unbounded::<PathBuf>();
        let handle = thread::Builder::new()
            .name("wal_gc_unlink".to_string())
            .spawn(move || {
                for path in rx {
                    match fs::remove_file(&path) {
                        Ok(()) => tracing::info!(path = %path.display(), "removed old segment"),
                        Err(err) => {
                            tracing::warn!(path = %path.display(), "failed to remove segment: {err}");
                        }
                    }
                }
            })
            .expect("spawn wal gc unlink thread");
        Self {
            tx: Some(tx),
            handle: Some(handle),
        }
    }

    fn unlink(&self, path: PathBuf) {
        if let Some(tx) = &self.tx {
            let _ = tx.send(path);
        }
    }
}

impl Drop for GcDeleter {
    fn drop(&mut self) {
        drop(self.tx.take());
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}

pub struct SegmentDirectory {
    dirname: PathBuf,
    index: BTreeMap<i64, VClock>,
    deleter: GcDeleter,
}

impl SegmentDirectory {
    pub fn new(dirname: &Path) -> Self {
        Self {
            dirname: dirname.to_path_buf(),
            index: BTreeMap::new(),
            deleter: GcDeleter::spawn(),
        }
    }

    pub fn dirname(&self) -> &Path {
        &self.dirname
    }

    pub fn path_for(&self, signature: i64) -> PathBuf {
        self.dirname.join(segment_file_name(signature))
    }

    /// Build the index from the files on disk. Segments with a damaged
    /// header are renamed aside and skipped; I/O failures propagate.
    pub fn scan(&mut self) -> SegmentResult<()> {
        self.index.clear();
        let entries = fs::read_dir(&self.dirname).map_err(|source| SegmentError::Io {
            path: Some(self.dirname.clone()),
            source,
        })?;
        for entry in entries {
            let entry = entry.map_err(|source| SegmentError::Io {
                path: Some(self.dirname.clone()),
                source,
            })?;
            let name = entry.file_name();
            let Some(name) = name.to_str() else { continue };
            let Some(signature) = parse_segment_file_name(name) else {
                continue;
            };
            let path = entry.path();
            match SegmentReader::open(&path) {
                Ok(reader) => {
                    self.index
                        .insert(signature, reader.header().start_vclock.clone());
                }
                Err(err) if err.is_corruption() => {
                    tracing::warn!(path = %path.display(), "renaming corrupted segment: {err}");
                    rename_corrupted(&path)?;
                }
                Err(err) => return Err(err),
            }
        }
        Ok(())
    }

    /// Register a segment created by the writer.
    pub fn add(&mut self, start_vclock: VClock) {
        self.index.insert(start_vclock.sum(), start_vclock);
    }

    pub fn is_empty(&self) -> bool {
        self.index.is_empty()
    }

    pub fn len(&self) -> usize {
        self.index.len()
    }

    pub fn first(&self) -> Option<(i64, &VClock)> {
        self.index.iter().next().map(|(&sig, clock)| (sig, clock))
    }

    pub fn next_after(&self, signature: i64) -> Option<(i64, &VClock)> {
        self.index
            .range(signature + 1..)
            .next()
            .map(|(&sig, clock)| (sig, clock))
    }

    pub fn contains(&self, signature: i64) -> bool {
        self.index.contains_key(&signature)
    }

    /// Newest segment whose starting clock does not exceed `target`, i.e.
    /// the segment that contains the row right after `target`. Falls back
    /// to the oldest segment when `target` precedes all of them.
    pub fn match_vclock(&self, target: &VClock) -> Option<(i64, &VClock)> {
        let mut found = None;
        for (&sig, clock) in &self.index {
            match clock.compare(target) {
                ClockOrder::Less | ClockOrder::Equal => found = Some((sig, clock)),
                ClockOrder::Greater | ClockOrder::Incomparable => break,
            }
        }
        found.or_else(|| self.first())
    }

    /// True when ENOSPC recovery has something to reclaim: an old segment
    /// strictly below `gc_signature` that is not the segment at
    /// `current_signature`.
    pub fn has_garbage(&self, gc_signature: i64, current_signature: Option<i64>) -> bool {
        self.oldest_garbage(gc_signature, current_signature).is_some()
    }

    fn oldest_garbage(&self, gc_signature: i64, current_signature: Option<i64>) -> Option<i64> {
        let (first_sig, _) = self.first()?;
        if first_sig >= gc_signature || Some(first_sig) == current_signature {
            return None;
        }
        Some(first_sig)
    }

    /// Delete exactly one oldest reclaimable segment. Returns its
    /// signature and starting clock.
    pub fn remove_oldest_one(
        &mut self,
        gc_signature: i64,
        current_signature: Option<i64>,
    ) -> Option<(i64, VClock)> {
        let victim = self.oldest_garbage(gc_signature, current_signature)?;
        let clock = self.index.remove(&victim).expect("victim is indexed");
        self.deleter.unlink(self.path_for(victim));
        Some((victim, clock))
    }

    /// Drop an entry from the index without unlinking the file; used
    /// when a corrupted segment was renamed aside.
    pub fn forget(&mut self, signature: i64) {
        self.index.remove(&signature);
    }

    /// Delete every segment strictly older than `signature`.
    pub fn remove_older_than(&mut self, signature: i64) -> usize {
        let doomed: Vec<i64> = self.index.range(..signature).map(|(&sig, _)| sig).collect();
        for sig in &doomed {
            self.index.remove(sig);
            self.deleter.unlink(self.path_for(*sig));
        }
        doomed.len()
    }

    /// Names of indexed segments, oldest first. Test and introspection
    /// helper.
    pub fn signatures(&self) -> Vec<i64> {
        self.index.keys().copied().collect()
    }
}

impl std::fmt::Debug for SegmentDirectory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SegmentDirectory")
            .field("dirname", &self.dirname)
            .field("segments", &self.signatures())
            .finish()
    }
}

/// Segment file names currently on disk, oldest first.
pub fn segment_files(dirname: &Path) -> std::io::Result<Vec<String>> {
    let mut names = Vec::new();
    for entry in fs::read_dir(dirname)? {
        let name = entry?.file_name();
        if let Some(name) = name.to_str()
            && name.ends_with(&format!(".{SEGMENT_SUFFIX}"))
        {
            names.push(name.to_string());
        }
    }
    names.sort();
    Ok(names)
}

#[cfg(test)]
mod tests {
    use uuid::Uuid;

    use super::*;
    use crate::wal::segment::{SegmentHeader, SegmentWriter};

    fn clock(lsn: i64) -> VClock {
        let mut v = VClock::new();
        if lsn > 0 {
            v.follow(1, lsn).unwrap();
        }
        v
    }

    fn make_segment(dir: &Path, lsn: i64) -> i64 {
        let header = SegmentHeader::new(Uuid::nil(), Uuid::nil(), clock(lsn));
        let writer = SegmentWriter::create(dir, &header, false).unwrap();
        writer.close();
        clock(lsn).sum()
    }

    #[test]
    fn scan_indexes_by_signature() {
        let tmp = tempfile::tempdir().unwrap();
        for lsn in [5, 1, 9] {
            make_segment(tmp.path(), lsn);
        }
        let mut dir = SegmentDirectory::new(tmp.path());
        dir.scan().unwrap();
        assert_eq!(dir.signatures(), vec![1, 5, 9]);
        assert_eq!(dir.first().unwrap().0, 1);
        assert_eq!(dir.next_after(1).unwrap().0, 5);
        assert!(dir.next_after(9).is_none());
    }

    #[test]
    fn scan_renames_corrupted_segments() {
        let tmp = tempfile::tempdir().unwrap();
        make_segment(tmp.path(), 3);
        let bad = tmp.path().join(segment_file_name(8));
        fs::write(&bad, b"garbage").unwrap();

        let mut dir = SegmentDirectory::new(tmp.path());
        dir.scan().unwrap();
        assert_eq!(dir.signatures(), vec![3]);
        assert!(!bad.exists());
        assert!(bad.with_extension("xlog.corrupted").exists());
    }

    #[test]
    fn match_vclock_picks_newest_not_exceeding() {
        let tmp = tempfile::tempdir().unwrap();
        let mut dir = SegmentDirectory::new(tmp.path());
        dir.add(clock(0));
        dir.add(clock(5));
        dir.add(clock(9));
        assert_eq!(dir.match_vclock(&clock(7)).unwrap().0, 5);
        assert_eq!(dir.match_vclock(&clock(9)).unwrap().0, 9);
        // a target before every segment falls back to the oldest
        assert_eq!(dir.match_vclock(&clock(0)).unwrap().0, 0);
    }

    #[test]
    fn remove_oldest_one_respects_current_and_bound() {
        let tmp = tempfile::tempdir().unwrap();
        let mut dir = SegmentDirectory::new(tmp.path());
        for lsn in [1, 4, 7] {
            make_segment(tmp.path(), lsn);
            dir.add(clock(lsn));
        }
        // bound below the oldest: nothing to reclaim
        assert!(!dir.has_garbage(1, None));
        assert!(dir.remove_oldest_one(1, None).is_none());
        // oldest is the current segment: protected
        assert!(dir.remove_oldest_one(9, Some(1)).is_none());

        let (sig, clock_removed) = dir.remove_oldest_one(5, None).unwrap();
        assert_eq!(sig, 1);
        assert_eq!(clock_removed.sum(), 1);
        assert_eq!(dir.signatures(), vec![4, 7]);
    }

    #[test]
    fn remove_older_than_drops_prefix() {
        let tmp = tempfile::tempdir().unwrap();
        let mut dir = SegmentDirectory::new(tmp.path());
        for lsn in [1, 4, 7] {
            make_segment(tmp.path(), lsn);
            dir.add(clock(lsn));
        }
        assert_eq!(dir.remove_older_than(7), 2);
        assert_eq!(dir.signatures(), vec![7]);
    }
}

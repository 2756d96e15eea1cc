//! Journal entries: the unit of durable work handed to the WAL writer.
//!
//! An entry is an ordered list of rows with a commit marker on the last
//! row. The result slot carries the writer vclock signature after a
//! successful flush, or -1 when the entry was rolled back. The completion
//! hook fires exactly once, on the TX thread, and must not block: it runs
//! inside a priority-pipe handler.

use crossbeam::channel::{Sender, bounded};

use crate::core::Row;

/// Result slot value for an entry that was rolled back.
pub const JOURNAL_ENTRY_ERR: i64 = -1;

pub type CompletionFn = Box<dyn FnOnce(i64) + Send>;

pub struct JournalEntry {
    pub rows: Vec<Row>,
    /// Approximate encoded size, accumulated into the batch for disk
    /// preallocation.
    pub approx_len: usize,
    res: i64,
    complete: Option<CompletionFn>,
}

impl JournalEntry {
    /// Build an entry with a custom completion hook.
    pub fn new(rows: Vec<Row>, on_complete: CompletionFn) -> Self {
        let approx_len = rows.iter().map(Row::encoded_len).sum();
        Self {
            rows,
            approx_len,
            res: 0,
            complete: Some(on_complete),
        }
    }

    /// Build an entry paired with a channel the caller can block on.
    pub fn with_channel(rows: Vec<Row>) -> (Self, crossbeam::channel::Receiver<i64>) {
        let (done_tx, done_rx) = bounded(1);
        let entry = Self::new(rows, completion_sender(done_tx));
        (entry, done_rx)
    }

    pub fn res(&self) -> i64 {
        self.res
    }

    pub(crate) fn set_res(&mut self, res: i64) {
        self.res = res;
    }

    /// Invoke the completion hook. Entries are completed in strict FIFO
    /// order on success and strict LIFO order on rollback.
    pub(crate) fn complete(mut self) {
        if let Some(hook) = self.complete.take() {
            hook(self.res);
        }
    }

    /// Complete with the rollback result without going through the WAL.
    pub(crate) fn complete_err(mut self) {
        self.res = JOURNAL_ENTRY_ERR;
        self.complete();
    }
}

fn completion_sender(done: Sender<i64>) -> CompletionFn {
    Box::new(move |res| {
        let _ = done.send(res);
    })
}

impl std::fmt::Debug for JournalEntry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("JournalEntry")
            .field("rows", &self.rows.len())
            .field("approx_len", &self.approx_len)
            .field("res", &self.res)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use bytes::Bytes;

    use super::*;
    use crate::core::RowType;

    #[test]
    fn approx_len_accumulates_rows() {
        let rows = vec![
            Row::new_dml(RowType::Insert, Bytes::from_static(b"abc")),
            Row::new_dml(RowType::Delete, Bytes::from_static(b"d")),
        ];
        let expected: usize = rows.iter().map(Row::encoded_len).sum();
        let (entry, _rx) = JournalEntry::with_channel(rows);
        assert_eq!(entry.approx_len, expected);
    }

    #[test]
    fn completion_fires_once_with_res() {
        let (mut entry, rx) =
            JournalEntry::with_channel(vec![Row::new_dml(RowType::Nop, Bytes::new())]);
        entry.set_res(17);
        entry.complete();
        assert_eq!(rx.recv().unwrap(), 17);
        assert!(rx.try_recv().is_err());
    }
}

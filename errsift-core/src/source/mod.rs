//! Source readers: find the newest log file and tail it from a byte offset
//!
//! Every source kind implements [`LogReader`]:
//!
//! ```text
//!                ┌──────────────┐
//!                │  LogReader   │  find_latest(dir, glob) -> file id
//!                │              │  tail(file id, offset, filter) -> Tail
//!                └──────┬───────┘
//!             ┌─────────┴─────────┐
//!      ┌──────▼──────┐     ┌──────▼───────┐
//!      │ LocalReader │     │ RemoteReader │
//!      │ (mount)     │     │ (SFTP)       │
//!      └─────────────┘     └──────────────┘
//! ```
//!
//! Both variants hand an open, seekable file to [`Tail`], which does the
//! line splitting, offset accounting and filtering. The file handle (and for
//! remote sources the SFTP session) is owned by the `Tail` and released when
//! it is dropped, whether iteration finished, failed or was abandoned.
//!
//! ## Filtering policy
//!
//! A line is emitted iff (include absent OR include matches) AND
//! (exclude absent OR exclude does not match). Remote sources substitute
//! [`error_level_pattern`] when no include filter is configured; local
//! sources emit every line in that case.

mod filter;
mod local;
mod remote;

pub use filter::{error_level_pattern, LineFilter};
pub use local::LocalReader;
pub use remote::RemoteReader;

use crate::error::Result;
use crate::types::SourceKind;
use std::io::{BufRead, BufReader, Read, Seek, SeekFrom};

/// Capability set shared by all source kinds.
pub trait LogReader: Send + Sync {
    /// Which kind of source this reader serves
    fn kind(&self) -> SourceKind;

    /// Return the file in `base_path` whose name matches `file_glob` with the
    /// greatest modification time.
    ///
    /// Returns `Ok(None)` when the directory does not exist or nothing matches.
    /// Equal modification times are broken by file name.
    fn find_latest(&self, base_path: &str, file_glob: &str) -> Result<Option<String>>;

    /// Open `file_id`, seek to `start_offset` and return a lazy, finite
    /// iterator over the filtered lines that follow.
    fn tail(&self, file_id: &str, start_offset: u64, filter: &LineFilter) -> Result<Tail>;
}

/// A line emitted by [`Tail`], with the offset immediately past it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TailedLine {
    pub text: String,
    pub offset: u64,
}

/// Forward-only, non-restartable reader over the new lines of one file.
pub struct Tail {
    reader: Box<dyn BufRead>,
    filter: LineFilter,
    start_offset: u64,
    offset: u64,
    rewound: bool,
    finished: bool,
    to_eof: bool,
    buf: Vec<u8>,
}

impl Tail {
    /// Wrap an open file of `file_len` bytes, positioned at `start_offset`.
    ///
    /// A stored offset beyond the end of the file means the file was truncated
    /// or rewritten under the same name; reading restarts from the beginning.
    pub fn open<R>(
        mut inner: R,
        file_len: u64,
        start_offset: u64,
        filter: LineFilter,
        file_id: &str,
    ) -> Result<Self>
    where
        R: Read + Seek + 'static,
    {
        let rewound = start_offset > file_len;
        let start = if rewound {
            tracing::warn!(
                file = %file_id,
                stored_offset = start_offset,
                file_len,
                "File shrank below stored offset, reading from the beginning"
            );
            0
        } else {
            start_offset
        };

        inner.seek(SeekFrom::Start(start))?;

        Ok(Self {
            reader: Box::new(BufReader::new(inner)),
            filter,
            start_offset: start,
            offset: start,
            rewound,
            finished: false,
            to_eof: false,
            buf: Vec::with_capacity(256),
        })
    }

    /// Offset reading actually started from (0 after a rewind).
    pub fn start_offset(&self) -> u64 {
        self.start_offset
    }

    /// Offset just past the last complete line consumed, emitted or not.
    pub fn offset(&self) -> u64 {
        self.offset
    }

    /// Whether the stored offset was discarded because the file shrank.
    pub fn rewound(&self) -> bool {
        self.rewound
    }

    /// Also emit a final line that has no newline.
    ///
    /// Used for files that are no longer written to, where an unterminated
    /// tail (e.g. from a writer that died mid-line) will never be completed.
    pub fn to_eof(mut self) -> Self {
        self.to_eof = true;
        self
    }
}

impl Iterator for Tail {
    type Item = Result<TailedLine>;

    fn next(&mut self) -> Option<Self::Item> {
        while !self.finished {
            self.buf.clear();
            match self.reader.read_until(b'\n', &mut self.buf) {
                Ok(0) => self.finished = true,
                Ok(read) => {
                    // A trailing line without newline may still be mid-write;
                    // leave it for the next cycle unless reading to EOF.
                    if self.buf.last() != Some(&b'\n') {
                        self.finished = true;
                        if !self.to_eof {
                            break;
                        }
                    }
                    self.offset += read as u64;

                    let decoded = String::from_utf8_lossy(&self.buf);
                    let line = decoded.trim_end();
                    if self.filter.accepts(line) {
                        return Some(Ok(TailedLine {
                            text: line.to_string(),
                            offset: self.offset,
                        }));
                    }
                }
                Err(e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
                Err(e) => {
                    self.finished = true;
                    return Some(Err(e.into()));
                }
            }
        }
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    fn tail_bytes(bytes: &[u8], start: u64, filter: LineFilter) -> Tail {
        let len = bytes.len() as u64;
        Tail::open(Cursor::new(bytes.to_vec()), len, start, filter, "test.log").unwrap()
    }

    fn texts(tail: Tail) -> Vec<String> {
        tail.map(|r| r.unwrap().text).collect()
    }

    #[test]
    fn test_emits_lines_with_offsets_past_each_line() {
        let tail = tail_bytes(b"one\ntwo\n", 0, LineFilter::default());
        let lines: Vec<_> = tail.map(|r| r.unwrap()).collect();
        assert_eq!(
            lines,
            vec![
                TailedLine { text: "one".to_string(), offset: 4 },
                TailedLine { text: "two".to_string(), offset: 8 },
            ]
        );
    }

    #[test]
    fn test_starts_at_offset() {
        let tail = tail_bytes(b"one\ntwo\n", 4, LineFilter::default());
        assert_eq!(texts(tail), vec!["two"]);
    }

    #[test]
    fn test_trims_trailing_whitespace_and_crlf() {
        let tail = tail_bytes(b"ERROR a  \r\nERROR b\r\n", 0, LineFilter::default());
        assert_eq!(texts(tail), vec!["ERROR a", "ERROR b"]);
    }

    #[test]
    fn test_partial_last_line_is_left_for_later() {
        let mut tail = tail_bytes(b"done\nhalf-writ", 0, LineFilter::default());
        assert_eq!(tail.next().unwrap().unwrap().text, "done");
        assert!(tail.next().is_none());
        assert_eq!(tail.offset(), 5);
    }

    #[test]
    fn test_to_eof_emits_unterminated_line() {
        let mut tail = tail_bytes(b"done\nERROR: final", 5, LineFilter::default()).to_eof();
        assert_eq!(
            tail.next().unwrap().unwrap(),
            TailedLine { text: "ERROR: final".to_string(), offset: 17 }
        );
        assert!(tail.next().is_none());
        assert_eq!(tail.offset(), 17);
    }

    #[test]
    fn test_to_eof_still_filters_fragment() {
        let filter = LineFilter::from_patterns(Some("ERROR"), None).unwrap();
        let mut tail = tail_bytes(b"ERROR a\nINFO half", 0, filter).to_eof();
        assert_eq!(tail.next().unwrap().unwrap().text, "ERROR a");
        assert!(tail.next().is_none());
        assert_eq!(tail.offset(), 17);
    }

    #[test]
    fn test_filtered_lines_still_advance_offset() {
        let filter = LineFilter::from_patterns(Some("ERROR"), None).unwrap();
        let mut tail = tail_bytes(b"ERROR x\nINFO y\n", 0, filter);
        assert_eq!(tail.next().unwrap().unwrap().offset, 8);
        assert!(tail.next().is_none());
        assert_eq!(tail.offset(), 15);
    }

    #[test]
    fn test_offset_past_end_rewinds() {
        let tail = tail_bytes(b"fresh\n", 500, LineFilter::default());
        assert!(tail.rewound());
        assert_eq!(tail.start_offset(), 0);
        assert_eq!(texts(tail), vec!["fresh"]);
    }

    #[test]
    fn test_offset_at_end_yields_nothing() {
        let tail = tail_bytes(b"old\n", 4, LineFilter::default());
        assert!(!tail.rewound());
        assert!(texts(tail).is_empty());
    }

    #[test]
    fn test_invalid_utf8_is_replaced() {
        let tail = tail_bytes(b"ERROR \xff\xfe bad\n", 0, LineFilter::default());
        let lines = texts(tail);
        assert_eq!(lines.len(), 1);
        assert!(lines[0].starts_with("ERROR "));
        assert!(lines[0].contains('\u{FFFD}'));
    }
}

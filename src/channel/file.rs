// On-disk log channels.
//
// File layout: a 64-byte header followed by tightly packed 24-byte messages
// (little-endian, no inter-record padding). The writer rewrites the header in
// place on every flush so a crash or a concurrent reader sees a msg_count
// that is a known-good lower bound; the COMPLETE flag is set only on clean
// close.

use std::fs::{File, OpenOptions};
use std::io::{BufReader, BufWriter, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

use tracing::warn;

use crate::channel::{Channel, WritableChannel};
use crate::error::{ReplayError, Result};
use crate::message::{FileHeader, Msg, SeqNum, FILE_FLAG_COMPLETE, FILE_MAGIC, FILE_VERSION, INVALID_SEQ};

/// Read channel over a recorded log file.
///
/// On open the header is validated: a magic or version mismatch rejects the
/// file outright; a structurally inconsistent header (crash during a header
/// update) degrades the channel: `msg_count` is trusted as-is, the sequence
/// range is cleared and the file is treated as not cleanly closed.
pub struct FileChannel {
    path: PathBuf,
    reader: Option<BufReader<File>>,
    /// Next record index to read, in [0, msg_count].
    current_index: i64,
    msg_count: i64,
    first_seq: SeqNum,
    last_seq: SeqNum,
    cleanly_closed: bool,
}

impl FileChannel {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            reader: None,
            current_index: 0,
            msg_count: 0,
            first_seq: INVALID_SEQ,
            last_seq: INVALID_SEQ,
            cleanly_closed: false,
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Messages available according to the header.
    pub fn message_count(&self) -> i64 {
        self.msg_count
    }

    /// First sequence recorded in the file, `INVALID_SEQ` when unknown.
    pub fn first_seq(&self) -> SeqNum {
        self.first_seq
    }

    /// Last sequence recorded in the file, `INVALID_SEQ` when unknown.
    pub fn last_seq(&self) -> SeqNum {
        self.last_seq
    }

    /// Whether the writer set the COMPLETE flag.
    pub fn was_cleanly_closed(&self) -> bool {
        self.cleanly_closed
    }

    /// Current read position as a record index.
    pub fn current_index(&self) -> i64 {
        self.current_index
    }
}

impl Channel for FileChannel {
    fn open(&mut self) -> Result<()> {
        if self.reader.is_some() {
            return Ok(());
        }

        let file = File::open(&self.path).map_err(|e| ReplayError::io(&self.path, e))?;
        let mut reader = BufReader::new(file);

        let header =
            FileHeader::read_from(&mut reader).map_err(|e| ReplayError::io(&self.path, e))?;
        if header.magic != FILE_MAGIC {
            return Err(ReplayError::BadMagic {
                path: self.path.clone(),
                found: header.magic,
                expected: FILE_MAGIC,
            });
        }
        if header.version != FILE_VERSION {
            return Err(ReplayError::BadVersion {
                path: self.path.clone(),
                found: header.version,
                expected: FILE_VERSION,
            });
        }

        if header.is_consistent() {
            self.msg_count = header.msg_count;
            self.first_seq = header.first_seq;
            self.last_seq = header.last_seq;
            self.cleanly_closed = header.is_complete();
        } else {
            // Header fields disagree with each other: most likely a crash
            // mid-update. msg_count is flushed periodically and is the part
            // we can still trust.
            warn!(
                path = %self.path.display(),
                msg_count = header.msg_count,
                "log header is inconsistent; opening degraded with cleared sequence range"
            );
            self.msg_count = header.msg_count;
            self.first_seq = INVALID_SEQ;
            self.last_seq = INVALID_SEQ;
            self.cleanly_closed = false;
        }

        if !self.cleanly_closed {
            warn!(
                path = %self.path.display(),
                "log file was not cleanly closed; data beyond msg_count may be missing"
            );
        }

        self.current_index = 0;
        self.reader = Some(reader);
        Ok(())
    }

    fn close(&mut self) {
        self.reader = None;
        self.current_index = 0;
    }

    fn is_open(&self) -> bool {
        self.reader.is_some()
    }

    fn read_next(&mut self) -> Option<Msg> {
        if self.current_index >= self.msg_count {
            return None;
        }
        let reader = self.reader.as_mut()?;
        match Msg::read_from(reader) {
            Ok(msg) => {
                self.current_index += 1;
                Some(msg)
            }
            Err(e) => {
                warn!(
                    path = %self.path.display(),
                    index = self.current_index,
                    error = %e,
                    "short read inside recorded range"
                );
                None
            }
        }
    }

    fn peek(&mut self) -> Option<Msg> {
        if self.current_index >= self.msg_count {
            return None;
        }
        let reader = self.reader.as_mut()?;
        let pos = reader.stream_position().ok()?;
        let msg = Msg::read_from(reader).ok();
        reader.seek(SeekFrom::Start(pos)).ok()?;
        msg
    }

    fn name(&self) -> String {
        format!("file:{}", self.path.display())
    }

    fn latest_seq(&self) -> SeqNum {
        if self.msg_count > 0 {
            self.msg_count - 1
        } else {
            INVALID_SEQ
        }
    }

    /// Positions the reader at record index `seq`, bounded by
    /// `[0, msg_count)`.
    ///
    /// The argument is a record index, which coincides with sequence numbers
    /// only when the file starts at sequence 0, the system's normal case.
    fn seek(&mut self, seq: SeqNum) -> bool {
        if seq < 0 || seq >= self.msg_count {
            return false;
        }
        let Some(reader) = self.reader.as_mut() else {
            return false;
        };

        let offset = FileHeader::ENCODED_LEN as u64 + seq as u64 * Msg::ENCODED_LEN as u64;
        if reader.seek(SeekFrom::Start(offset)).is_err() {
            return false;
        }
        self.current_index = seq;
        true
    }
}

/// Write channel maintaining the log's integrity metadata.
///
/// Invariants:
///   - `first_seq` is set by the first write and never changes
///   - `last_seq` follows every write; `msg_count == last_seq - first_seq + 1`
///     when the recorded stream is gapless
///   - the header is rewritten in place on every `flush` (never with
///     COMPLETE) and once more with COMPLETE on `close`
///
/// Dropping the channel without `close` leaves COMPLETE unset, which is
/// exactly what a crashed writer looks like to the reader.
pub struct FileWriteChannel {
    path: PathBuf,
    writer: Option<BufWriter<File>>,
    header: FileHeader,
}

impl FileWriteChannel {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            writer: None,
            header: FileHeader::new(0),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn message_count(&self) -> i64 {
        self.header.msg_count
    }

    /// Flush buffered records, rewrite the header in place with the current
    /// count/range, restore the append position and force the file to disk.
    fn rewrite_header(&mut self) -> std::io::Result<()> {
        let Some(writer) = self.writer.as_mut() else {
            return Ok(());
        };
        writer.flush()?;

        let file = writer.get_mut();
        let append_pos = file.stream_position()?;
        file.seek(SeekFrom::Start(0))?;

        let mut buf = Vec::with_capacity(FileHeader::ENCODED_LEN);
        self.header.write_to(&mut buf)?;
        file.write_all(&buf)?;

        file.seek(SeekFrom::Start(append_pos))?;
        file.sync_data()
    }
}

impl Channel for FileWriteChannel {
    fn open(&mut self) -> Result<()> {
        if self.writer.is_some() {
            return Ok(());
        }

        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent).map_err(|e| ReplayError::io(&self.path, e))?;
            }
        }

        let file = OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(true)
            .open(&self.path)
            .map_err(|e| ReplayError::io(&self.path, e))?;
        let mut writer = BufWriter::new(file);

        self.header = FileHeader::new(local_date_yyyymmdd());
        self.header
            .write_to(&mut writer)
            .map_err(|e| ReplayError::io(&self.path, e))?;

        self.writer = Some(writer);
        Ok(())
    }

    /// Marks the file cleanly closed: sets COMPLETE, rewrites the header and
    /// releases the file. Errors are logged; closing is best-effort.
    fn close(&mut self) {
        if self.writer.is_some() {
            self.header.flags |= FILE_FLAG_COMPLETE;
            if let Err(e) = self.rewrite_header() {
                warn!(
                    path = %self.path.display(),
                    error = %e,
                    "failed to finalise log header on close"
                );
            }
            self.writer = None;
        }
    }

    fn is_open(&self) -> bool {
        self.writer.is_some()
    }

    fn read_next(&mut self) -> Option<Msg> {
        None
    }

    fn peek(&mut self) -> Option<Msg> {
        None
    }

    fn name(&self) -> String {
        format!("file-write:{}", self.path.display())
    }

    fn latest_seq(&self) -> SeqNum {
        if self.header.msg_count > 0 {
            self.header.msg_count - 1
        } else {
            INVALID_SEQ
        }
    }

    fn seek(&mut self, _seq: SeqNum) -> bool {
        false
    }
}

impl WritableChannel for FileWriteChannel {
    fn write(&mut self, msg: &Msg) -> Result<()> {
        let writer = self.writer.as_mut().ok_or_else(|| ReplayError::Channel {
            name: format!("file-write:{}", self.path.display()),
            reason: "write on closed channel".to_string(),
        })?;

        msg.write_to(writer)
            .map_err(|e| ReplayError::io(&self.path, e))?;

        if self.header.first_seq == INVALID_SEQ {
            self.header.first_seq = msg.seq;
        }
        self.header.last_seq = msg.seq;
        self.header.msg_count += 1;
        Ok(())
    }

    fn flush(&mut self) -> Result<()> {
        self.rewrite_header()
            .map_err(|e| ReplayError::io(&self.path, e))
    }
}

fn local_date_yyyymmdd() -> u32 {
    use chrono::Datelike;
    let today = chrono::Local::now().date_naive();
    today.year() as u32 * 10_000 + today.month() * 100 + today.day()
}

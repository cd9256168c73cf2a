// Wire-level records shared by every component: the 24-byte market-data
// message and the 64-byte log-file header.

use std::io::{self, Read, Write};

use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};

/// Sequence number assigned by the ring buffer; contiguous from 0.
pub type SeqNum = i64;

/// Distinguished "no message" sequence value.
pub const INVALID_SEQ: SeqNum = -1;

/// Log file magic number ("MKTD").
pub const FILE_MAGIC: u32 = 0x4D4B_5444;

/// Log format version. Version 2 added the integrity fields
/// (first_seq / last_seq / flags).
pub const FILE_VERSION: u16 = 2;

/// Header flag: the writer closed the file cleanly. Absence means the file
/// may be truncated and `msg_count` is a known-good lower bound.
pub const FILE_FLAG_COMPLETE: u16 = 0x0001;

/// Default in-process ring capacity (1M slots).
pub const DEFAULT_RING_CAPACITY: usize = 1 << 20;

/// Default recorder batch size.
pub const DEFAULT_BATCH_SIZE: usize = 1024;

/// Maximum lag (in sequences) between the replay position and the live head
/// at which the aggregator switches from disk replay to the ring buffer.
pub const CATCHUP_THRESHOLD: i64 = 100;

/// A single market-data message. Value type, 24 bytes, no per-message
/// allocation. All fields are little-endian on disk.
///
/// A valid message has `seq >= 0`; the producer submits messages with
/// `seq == INVALID_SEQ` and the ring buffer stamps the real sequence.
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Msg {
    pub seq: SeqNum,
    pub timestamp_ns: i64,
    pub payload: f64,
}

const _: () = assert!(std::mem::size_of::<Msg>() == 24);

impl Msg {
    /// Encoded size on disk (packed, no padding).
    pub const ENCODED_LEN: usize = 24;

    pub fn new(seq: SeqNum, timestamp_ns: i64, payload: f64) -> Self {
        Self {
            seq,
            timestamp_ns,
            payload,
        }
    }

    pub fn is_valid(&self) -> bool {
        self.seq != INVALID_SEQ
    }

    pub fn write_to<W: Write>(&self, w: &mut W) -> io::Result<()> {
        w.write_i64::<LittleEndian>(self.seq)?;
        w.write_i64::<LittleEndian>(self.timestamp_ns)?;
        w.write_f64::<LittleEndian>(self.payload)
    }

    pub fn read_from<R: Read>(r: &mut R) -> io::Result<Self> {
        Ok(Self {
            seq: r.read_i64::<LittleEndian>()?,
            timestamp_ns: r.read_i64::<LittleEndian>()?,
            payload: r.read_f64::<LittleEndian>()?,
        })
    }
}

impl Default for Msg {
    fn default() -> Self {
        Self {
            seq: INVALID_SEQ,
            timestamp_ns: 0,
            payload: 0.0,
        }
    }
}

/// Log-file header, 64 bytes encoded.
///
/// Invariants maintained by the writer:
///   - `first_seq <= last_seq` when `msg_count > 0`
///   - `last_seq - first_seq + 1 == msg_count` (no gaps in recording)
///   - `FILE_FLAG_COMPLETE` is set only on clean close
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FileHeader {
    pub magic: u32,
    pub version: u16,
    pub flags: u16,
    /// Recording date as YYYYMMDD, or 0 when unknown.
    pub date: u32,
    pub reserved: u32,
    pub msg_count: i64,
    /// First sequence in the file, `INVALID_SEQ` when empty.
    pub first_seq: SeqNum,
    /// Last sequence in the file, `INVALID_SEQ` when empty.
    pub last_seq: SeqNum,
}

impl FileHeader {
    /// Encoded size on disk, including the trailing reserved bytes.
    pub const ENCODED_LEN: usize = 64;

    pub fn new(date: u32) -> Self {
        Self {
            magic: FILE_MAGIC,
            version: FILE_VERSION,
            flags: 0,
            date,
            reserved: 0,
            msg_count: 0,
            first_seq: INVALID_SEQ,
            last_seq: INVALID_SEQ,
        }
    }

    /// Magic and version match the current format.
    pub fn is_valid(&self) -> bool {
        self.magic == FILE_MAGIC && self.version == FILE_VERSION
    }

    /// Structural consistency of the count/range fields.
    pub fn is_consistent(&self) -> bool {
        if !self.is_valid() || self.msg_count < 0 {
            return false;
        }
        if self.msg_count == 0 {
            return self.first_seq == INVALID_SEQ && self.last_seq == INVALID_SEQ;
        }
        self.first_seq >= 0
            && self.last_seq >= self.first_seq
            && self.last_seq - self.first_seq + 1 == self.msg_count
    }

    pub fn is_complete(&self) -> bool {
        self.flags & FILE_FLAG_COMPLETE != 0
    }

    pub fn write_to<W: Write>(&self, w: &mut W) -> io::Result<()> {
        w.write_u32::<LittleEndian>(self.magic)?;
        w.write_u16::<LittleEndian>(self.version)?;
        w.write_u16::<LittleEndian>(self.flags)?;
        w.write_u32::<LittleEndian>(self.date)?;
        w.write_u32::<LittleEndian>(self.reserved)?;
        w.write_i64::<LittleEndian>(self.msg_count)?;
        w.write_i64::<LittleEndian>(self.first_seq)?;
        w.write_i64::<LittleEndian>(self.last_seq)?;
        w.write_all(&[0u8; 24])
    }

    pub fn read_from<R: Read>(r: &mut R) -> io::Result<Self> {
        let header = Self {
            magic: r.read_u32::<LittleEndian>()?,
            version: r.read_u16::<LittleEndian>()?,
            flags: r.read_u16::<LittleEndian>()?,
            date: r.read_u32::<LittleEndian>()?,
            reserved: r.read_u32::<LittleEndian>()?,
            msg_count: r.read_i64::<LittleEndian>()?,
            first_seq: r.read_i64::<LittleEndian>()?,
            last_seq: r.read_i64::<LittleEndian>()?,
        };
        let mut reserved_tail = [0u8; 24];
        r.read_exact(&mut reserved_tail)?;
        Ok(header)
    }
}

/// Current wall-clock time in nanoseconds since the Unix epoch.
pub fn current_timestamp_ns() -> i64 {
    use std::time::{SystemTime, UNIX_EPOCH};
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_nanos() as i64
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn msg_validity() {
        let msg = Msg::new(100, 1_234_567_890, 3.14159);
        assert!(msg.is_valid());
        assert!(!Msg::default().is_valid());
    }

    #[test]
    fn header_encoded_len_is_exact() {
        let mut buf = Vec::new();
        FileHeader::new(20260802).write_to(&mut buf).unwrap();
        assert_eq!(buf.len(), FileHeader::ENCODED_LEN);

        let mut buf = Vec::new();
        Msg::new(1, 2, 3.0).write_to(&mut buf).unwrap();
        assert_eq!(buf.len(), Msg::ENCODED_LEN);
    }

    #[test]
    fn header_roundtrip() {
        let mut header = FileHeader::new(20260802);
        header.msg_count = 42;
        header.first_seq = 0;
        header.last_seq = 41;
        header.flags = FILE_FLAG_COMPLETE;

        let mut buf = Vec::new();
        header.write_to(&mut buf).unwrap();
        let decoded = FileHeader::read_from(&mut buf.as_slice()).unwrap();
        assert_eq!(decoded, header);
        assert!(decoded.is_consistent());
        assert!(decoded.is_complete());
    }

    #[test]
    fn header_consistency_rules() {
        let mut header = FileHeader::new(0);
        assert!(header.is_consistent());

        // Empty file must carry an empty range.
        header.first_seq = 0;
        assert!(!header.is_consistent());

        // Non-empty: range length must match the count.
        header.msg_count = 10;
        header.first_seq = 0;
        header.last_seq = 9;
        assert!(header.is_consistent());
        header.last_seq = 10;
        assert!(!header.is_consistent());

        header.magic = 0xDEAD_BEEF;
        assert!(!header.is_valid());
    }
}

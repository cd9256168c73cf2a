use std::fs::OpenOptions;
use std::io::{Seek, SeekFrom, Write};
use std::path::Path;

use tempfile::tempdir;

use mktreplay::channel::{Channel, FileChannel, FileWriteChannel, WritableChannel};
use mktreplay::message::current_timestamp_ns;
use mktreplay::{FileHeader, Msg, ReplayError, ReplayReader, INVALID_SEQ};

fn write_log(path: &Path, msgs: &[Msg], clean_close: bool) {
    let mut writer = FileWriteChannel::new(path);
    writer.open().unwrap();
    for msg in msgs {
        writer.write(msg).unwrap();
    }
    writer.flush().unwrap();
    if clean_close {
        writer.close();
    }
    // Dropping without close leaves COMPLETE unset, like a crashed writer.
}

fn sequential_msgs(count: i64) -> Vec<Msg> {
    (0..count)
        .map(|i| Msg::new(i, current_timestamp_ns(), i as f64 * 1.5))
        .collect()
}

#[test]
fn roundtrip_preserves_messages_and_order() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("roundtrip.bin");
    let msgs = sequential_msgs(100);
    write_log(&path, &msgs, true);

    let mut reader = FileChannel::new(&path);
    reader.open().unwrap();
    assert_eq!(reader.message_count(), 100);
    assert_eq!(reader.first_seq(), 0);
    assert_eq!(reader.last_seq(), 99);
    assert!(reader.was_cleanly_closed());
    assert_eq!(reader.latest_seq(), 99);

    for expected in &msgs {
        let got = reader.read_next().unwrap();
        assert_eq!(&got, expected);
    }
    assert!(reader.read_next().is_none());
}

#[test]
fn peek_does_not_consume() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("peek.bin");
    write_log(&path, &sequential_msgs(3), true);

    let mut reader = FileChannel::new(&path);
    reader.open().unwrap();

    let peeked = reader.peek().unwrap();
    let read = reader.read_next().unwrap();
    assert_eq!(peeked, read);
    assert_eq!(read.seq, 0);
    assert_eq!(reader.read_next().unwrap().seq, 1);
}

#[test]
fn seek_positions_by_record_index() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("seek.bin");
    write_log(&path, &sequential_msgs(50), true);

    let mut reader = FileChannel::new(&path);
    reader.open().unwrap();

    assert!(reader.seek(40));
    assert_eq!(reader.read_next().unwrap().seq, 40);

    assert!(!reader.seek(-1));
    assert!(!reader.seek(50));
    assert!(reader.seek(0));
    assert_eq!(reader.current_index(), 0);
    assert_eq!(reader.read_next().unwrap().seq, 0);
    assert_eq!(reader.current_index(), 1);
}

#[test]
fn replay_metadata_accessors() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("meta.bin");
    write_log(&path, &sequential_msgs(30), false);

    let mut replay = ReplayReader::from_path(&path);
    replay.open().unwrap();
    assert_eq!(replay.message_count(), 30);
    assert_eq!(replay.file_first_seq(), 0);
    assert_eq!(replay.file_last_seq(), 29);
    assert_eq!(replay.latest_seq(), 29);
    assert!(!replay.was_cleanly_closed());

    let peeked = replay.peek_message().unwrap();
    assert_eq!(peeked.seq, 0);
    assert_eq!(replay.next_message().unwrap().seq, 0);

    replay.reset();
    assert_eq!(replay.next_message().unwrap().seq, 0);
    assert_eq!(replay.seq_violation_count(), 0);
}

// A crash-interrupted file: header flushed but COMPLETE never set. The
// reader must surface the dirty close and still return everything the
// header accounts for.
#[test]
fn crash_interrupted_log_recovers_flushed_records() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("crashed.bin");
    write_log(&path, &sequential_msgs(50), false);

    let mut reader = FileChannel::new(&path);
    reader.open().unwrap();
    assert_eq!(reader.message_count(), 50);
    assert!(!reader.was_cleanly_closed());

    let mut count = 0;
    while let Some(msg) = reader.read_next() {
        assert_eq!(msg.seq, count);
        count += 1;
    }
    assert_eq!(count, 50);
}

#[test]
fn bad_magic_is_rejected() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("badmagic.bin");
    write_log(&path, &sequential_msgs(5), true);

    // Corrupt the magic in place.
    let mut file = OpenOptions::new().write(true).open(&path).unwrap();
    file.seek(SeekFrom::Start(0)).unwrap();
    file.write_all(&0xDEAD_BEEFu32.to_le_bytes()).unwrap();
    drop(file);

    let mut reader = FileChannel::new(&path);
    assert!(matches!(reader.open(), Err(ReplayError::BadMagic { .. })));
}

#[test]
fn bad_version_is_rejected() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("badversion.bin");
    write_log(&path, &sequential_msgs(5), true);

    let mut file = OpenOptions::new().write(true).open(&path).unwrap();
    file.seek(SeekFrom::Start(4)).unwrap();
    file.write_all(&99u16.to_le_bytes()).unwrap();
    drop(file);

    let mut reader = FileChannel::new(&path);
    assert!(matches!(reader.open(), Err(ReplayError::BadVersion { .. })));
}

// An internally inconsistent header (valid magic/version, nonsense range)
// opens in degraded mode: msg_count trusted, range cleared, dirty close.
#[test]
fn inconsistent_header_degrades() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("inconsistent.bin");
    let msgs = sequential_msgs(10);

    let mut header = FileHeader::new(0);
    header.msg_count = 10;
    header.first_seq = 5;
    header.last_seq = 3;

    let mut file = std::fs::File::create(&path).unwrap();
    header.write_to(&mut file).unwrap();
    for msg in &msgs {
        msg.write_to(&mut file).unwrap();
    }
    drop(file);

    let mut reader = FileChannel::new(&path);
    reader.open().unwrap();
    assert_eq!(reader.message_count(), 10);
    assert_eq!(reader.first_seq(), INVALID_SEQ);
    assert_eq!(reader.last_seq(), INVALID_SEQ);
    assert!(!reader.was_cleanly_closed());
    assert_eq!(reader.read_next().unwrap().seq, 0);
}

#[test]
fn writer_header_matches_written_range() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("range.bin");
    write_log(&path, &sequential_msgs(1234), true);

    let mut file = std::fs::File::open(&path).unwrap();
    let header = FileHeader::read_from(&mut file).unwrap();
    assert!(header.is_valid());
    assert!(header.is_consistent());
    assert!(header.is_complete());
    assert_eq!(header.msg_count, 1234);
    assert_eq!(header.last_seq - header.first_seq + 1, header.msg_count);
}

// Replay must return every record of a log whose sequences go backwards,
// while counting the violations for the consumer to judge.
#[test]
fn replay_reports_monotonicity_violations() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("violations.bin");

    let seqs = [0i64, 1, 2, 1, 4];
    let msgs: Vec<Msg> = seqs
        .iter()
        .map(|&s| Msg::new(s, current_timestamp_ns(), s as f64))
        .collect();
    write_log(&path, &msgs, true);

    let mut replay = ReplayReader::from_path(&path);
    replay.open().unwrap();
    assert_eq!(replay.message_count(), 5);

    let mut returned = Vec::new();
    while let Some(msg) = replay.next_message() {
        returned.push(msg.seq);
    }
    assert_eq!(returned, seqs);
    assert!(replay.seq_violation_count() > 0);
}

#[test]
fn replay_seek_resets_validation_baseline() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("seekreset.bin");
    write_log(&path, &sequential_msgs(20), true);

    let mut replay = ReplayReader::from_path(&path);
    replay.open().unwrap();

    for _ in 0..10 {
        replay.next_message().unwrap();
    }
    // Rewinding re-reads lower sequences; the reset baseline must not flag
    // them as violations.
    assert!(replay.seek(0));
    for _ in 0..10 {
        replay.next_message().unwrap();
    }
    assert_eq!(replay.seq_violation_count(), 0);
}

#[test]
fn empty_log_reads_nothing() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("empty.bin");
    write_log(&path, &[], true);

    let mut reader = FileChannel::new(&path);
    reader.open().unwrap();
    assert_eq!(reader.message_count(), 0);
    assert_eq!(reader.first_seq(), INVALID_SEQ);
    assert_eq!(reader.latest_seq(), INVALID_SEQ);
    assert!(reader.read_next().is_none());
    assert!(reader.peek().is_none());
}

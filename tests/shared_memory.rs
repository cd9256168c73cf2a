// Shared-memory ring smoke tests. Linux-only, and serialised because every
// test maps the same named object.

#[cfg(target_os = "linux")]
mod linux_tests {
    use serial_test::serial;

    use mktreplay::message::current_timestamp_ns;
    use mktreplay::ring::shm::{ShmRing, SHM_SLOT_COUNT};
    use mktreplay::ring::ReadStatus;
    use mktreplay::{Msg, INVALID_SEQ};

    fn msg(payload: f64) -> Msg {
        Msg::new(INVALID_SEQ, current_timestamp_ns(), payload)
    }

    #[test]
    #[serial]
    fn create_push_and_read_back() {
        let ring = ShmRing::create().unwrap();
        assert_eq!(ring.capacity(), SHM_SLOT_COUNT);
        assert_eq!(ring.latest_seq(), INVALID_SEQ);
        assert!(ring.server_running());
        assert_eq!(ring.read(0), ReadStatus::NotReady);

        for i in 0..100 {
            let seq = ring.push(msg(i as f64));
            assert_eq!(seq, i);
        }
        assert_eq!(ring.latest_seq(), 99);
        assert_eq!(ring.total_messages(), 100);

        for i in 0..100 {
            match ring.read(i) {
                ReadStatus::Ok(m) => {
                    assert_eq!(m.seq, i);
                    assert_eq!(m.payload, i as f64);
                }
                other => panic!("read({i}) returned {other:?}"),
            }
        }
        assert_eq!(ring.read(100), ReadStatus::NotReady);
    }

    #[test]
    #[serial]
    fn attach_sees_server_writes() {
        let server = ShmRing::create().unwrap();
        let client = ShmRing::attach().unwrap();

        server.push(msg(42.5));
        match client.read(0) {
            ReadStatus::Ok(m) => assert_eq!(m.payload, 42.5),
            other => panic!("client read returned {other:?}"),
        }
        assert_eq!(client.latest_seq(), 0);
        assert!(client.server_running());

        server.set_server_running(false);
        assert!(!client.server_running());
    }

    #[test]
    #[serial]
    fn attach_without_server_fails() {
        // No object exists outside a create/drop pair.
        assert!(ShmRing::attach().is_err());
    }

    #[test]
    #[serial]
    fn creator_reinitialises_stale_object() {
        {
            let ring = ShmRing::create().unwrap();
            for _ in 0..10 {
                ring.push(msg(1.0));
            }
        }
        // A fresh create must not see the previous run's state.
        let ring = ShmRing::create().unwrap();
        assert_eq!(ring.latest_seq(), INVALID_SEQ);
        assert_eq!(ring.total_messages(), 0);
        assert_eq!(ring.read(0), ReadStatus::NotReady);
    }
}

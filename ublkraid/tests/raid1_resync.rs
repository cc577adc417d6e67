mod common;

use std::time::{Duration, Instant};

use common::{desc, flaky_pair, open_mirror, MockQueue};
use ublkraid::buf::IoVec;
use ublkraid::disk::UblkDisk;
use ublkraid::raid::raid1::{Raid1Opts, ReplicaState};
use ublkraid::sub_cmd::SubCmd;
use ublkraid::ublk::{UBLK_IO_OP_READ, UBLK_IO_OP_WRITE};
use ublkraid::KI;

fn resync_opts() -> Raid1Opts {
    Raid1Opts {
        auto_resync: true,
        ..Raid1Opts::default()
    }
}

fn wait_until<F: Fn() -> bool>(what: &str, timeout: Duration, cond: F) {
    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        if cond() {
            return;
        }
        std::thread::sleep(Duration::from_millis(20));
    }
    panic!("timed out waiting for {what}");
}

#[test]
fn degraded_mirror_resyncs_back_to_clean() {
    let (a, b) = flaky_pair();
    let mirror = open_mirror(a.clone(), b.clone(), resync_opts());
    let q = MockQueue::new(0);

    // One failed secondary leaves a single stale chunk on B
    b.fail_next_async(1);
    let mut wbuf = vec![0x66u8; 4096];
    let iovs = [IoVec::new(wbuf.as_mut_ptr(), wbuf.len())];
    let io = desc(5, UBLK_IO_OP_WRITE, 16, 8, std::ptr::null_mut());
    mirror.async_iov(&q, &io, SubCmd::NONE, &iovs, 8 * KI).unwrap();
    assert_ne!(ReplicaState::Clean, mirror.replica_states().device_b);

    // The queue going idle releases the resync task
    mirror.idle_transition(true);
    wait_until("mirror to become clean", Duration::from_secs(30), || {
        mirror.idle_transition(true);
        let state = mirror.replica_states();
        ReplicaState::Clean == state.device_a && ReplicaState::Clean == state.device_b
    });
    assert_eq!(0, mirror.replica_states().bytes_to_sync);

    // The copy actually happened: B holds the write
    let reserved = mirror.reserved_size();
    let mut rbuf = vec![0u8; 4096];
    let riovs = [IoVec::new(rbuf.as_mut_ptr(), rbuf.len())];
    b.mem()
        .sync_iov(UBLK_IO_OP_READ, &riovs, reserved + 8 * KI)
        .unwrap();
    assert_eq!(wbuf, rbuf);
}

#[test]
fn unreachable_replica_reports_error_and_backs_off() {
    let (a, b) = flaky_pair();
    let mirror = open_mirror(a.clone(), b.clone(), resync_opts());
    let q = MockQueue::new(0);

    // B drops off entirely: the failed write degrades, and every resync
    // copy attempt fails too
    b.set_fail_sync_writes(true);
    b.fail_next_async(1);
    let mut wbuf = vec![0u8; 4096];
    let iovs = [IoVec::new(wbuf.as_mut_ptr(), wbuf.len())];
    let io = desc(5, UBLK_IO_OP_WRITE, 16, 8, std::ptr::null_mut());
    mirror.async_iov(&q, &io, SubCmd::NONE, &iovs, 8 * KI).unwrap();

    mirror.idle_transition(true);
    wait_until("replica to report error", Duration::from_secs(10), || {
        mirror.idle_transition(true);
        ReplicaState::Error == mirror.replica_states().device_b
    });
    assert!(0 < mirror.replica_states().bytes_to_sync);
}

#[test]
fn toggling_resync_off_parks_the_task() {
    let (a, b) = flaky_pair();
    let mirror = open_mirror(a.clone(), b.clone(), resync_opts());
    let q = MockQueue::new(0);

    mirror.toggle_resync(false);
    b.fail_next_async(1);
    let mut wbuf = vec![0u8; 4096];
    let iovs = [IoVec::new(wbuf.as_mut_ptr(), wbuf.len())];
    let io = desc(5, UBLK_IO_OP_WRITE, 16, 8, std::ptr::null_mut());
    mirror.async_iov(&q, &io, SubCmd::NONE, &iovs, 8 * KI).unwrap();

    // No background copy while disabled
    mirror.idle_transition(true);
    std::thread::sleep(Duration::from_millis(200));
    assert_eq!(32 * KI, mirror.replica_states().bytes_to_sync);

    // Re-enabling picks the work back up
    mirror.toggle_resync(true);
    mirror.idle_transition(true);
    wait_until("resync to finish", Duration::from_secs(30), || {
        mirror.idle_transition(true);
        0 == mirror.replica_states().bytes_to_sync
    });
}

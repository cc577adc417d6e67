mod common;

use common::{desc, flaky_pair, no_resync_opts, open_mirror, raw_superblock, MockQueue};
use ublkraid::buf::IoVec;
use ublkraid::disk::{DiskError, UblkDisk};
use ublkraid::raid::raid1::ReplicaState;
use ublkraid::sub_cmd::SubCmd;
use ublkraid::ublk::{UBLK_IO_OP_READ, UBLK_IO_OP_WRITE};
use ublkraid::{KI, SECTOR_SHIFT};

#[test]
fn reads_round_robin_between_replicas() {
    let (a, b) = flaky_pair();
    let mirror = open_mirror(a.clone(), b.clone(), no_resync_opts());
    let q = MockQueue::new(0);

    let reads_a = a.mem().read_count();
    let reads_b = b.mem().read_count();

    let mut rbuf = vec![0u8; 4096];
    let iovs = [IoVec::new(rbuf.as_mut_ptr(), rbuf.len())];
    let io = desc(1, UBLK_IO_OP_READ, 0, 8, std::ptr::null_mut());
    for _ in 0..4 {
        assert_eq!(Ok(1), mirror.async_iov(&q, &io, SubCmd::NONE, &iovs, 0));
    }
    assert_eq!(reads_a + 2, a.mem().read_count());
    assert_eq!(reads_b + 2, b.mem().read_count());
}

#[test]
fn sync_read_fails_over_immediately() {
    let (a, b) = flaky_pair();
    let mirror = open_mirror(a.clone(), b.clone(), no_resync_opts());

    // Seed data through the mirror so both replicas agree
    let mut wbuf = vec![0x77u8; 4096];
    let iovs = [IoVec::new(wbuf.as_mut_ptr(), wbuf.len())];
    mirror.sync_iov(UBLK_IO_OP_WRITE, &iovs, 8 * KI).unwrap();

    a.set_fail_sync_reads(true);
    let mut rbuf = vec![0u8; 4096];
    let iovs = [IoVec::new(rbuf.as_mut_ptr(), rbuf.len())];
    // Whichever replica the round-robin picks, the answer arrives
    for _ in 0..4 {
        rbuf.fill(0);
        assert_eq!(Ok(4096), mirror.sync_iov(UBLK_IO_OP_READ, &iovs, 8 * KI));
        assert_eq!(wbuf, rbuf);
    }
    // Read failures never dirty the array
    let state = mirror.replica_states();
    assert_eq!(ReplicaState::Clean, state.device_a);
    assert_eq!(ReplicaState::Clean, state.device_b);
}

#[test]
fn sync_read_double_failure_is_final() {
    let (a, b) = flaky_pair();
    let mirror = open_mirror(a.clone(), b.clone(), no_resync_opts());

    a.set_fail_sync_reads(true);
    b.set_fail_sync_reads(true);
    let mut rbuf = vec![0u8; 4096];
    let iovs = [IoVec::new(rbuf.as_mut_ptr(), rbuf.len())];
    assert!(matches!(
        mirror.sync_iov(UBLK_IO_OP_READ, &iovs, 8 * KI),
        Err(DiskError::IoError(_))
    ));
}

#[test]
fn async_read_retry_goes_to_the_peer_and_stays_clean() {
    let (a, b) = flaky_pair();
    let mirror = open_mirror(a.clone(), b.clone(), no_resync_opts());
    let q = MockQueue::new(0);
    let age_before = raw_superblock(&**a.mem()).unwrap().age;

    let mut wbuf = vec![0x31u8; 4096];
    let iovs = [IoVec::new(wbuf.as_mut_ptr(), wbuf.len())];
    mirror.sync_iov(UBLK_IO_OP_WRITE, &iovs, 8 * KI).unwrap();

    // First async read completes with EIO; the runtime re-submits with
    // RETRIED and the original route
    a.fail_next_async_completion(1);
    let mut rbuf = vec![0u8; 4096];
    let riovs = [IoVec::new(rbuf.as_mut_ptr(), rbuf.len())];
    let io = desc(9, UBLK_IO_OP_READ, 16, 8, std::ptr::null_mut());
    assert_eq!(Ok(1), mirror.async_iov(&q, &io, SubCmd::NONE, &riovs, 8 * KI));

    let mut results = Vec::new();
    mirror.collect_async(&q, &mut results);
    assert_eq!(1, results.len());
    assert!(results[0].result < 0);

    // Replay what the target does: same sub-command, RETRIED added
    let retried = results[0]
        .sub_cmd
        .set_flags(ublkraid::sub_cmd::SubCmdFlags::RETRIED);
    assert_eq!(Ok(1), mirror.async_iov(&q, &io, retried, &riovs, 8 * KI));
    let mut results = Vec::new();
    mirror.collect_async(&q, &mut results);
    assert_eq!(1, results.len());
    assert_eq!(4096, results[0].result);
    assert_eq!(wbuf, rbuf);

    // Still clean, no superblock churn
    let state = mirror.replica_states();
    assert_eq!(ReplicaState::Clean, state.device_a);
    assert_eq!(ReplicaState::Clean, state.device_b);
    assert_eq!(age_before, raw_superblock(&**a.mem()).unwrap().age);
}

#[test]
fn retry_refused_when_only_the_stale_side_remains() {
    let (a, b) = flaky_pair();
    let mirror = open_mirror(a.clone(), b.clone(), no_resync_opts());
    let q = MockQueue::new(0);
    let chunk = 32 * KI;

    // Chunk 2 is stale on B, and B is back in service
    b.fail_next_async(1);
    let mut wbuf = vec![0u8; chunk as usize];
    let iovs = [IoVec::new(wbuf.as_mut_ptr(), wbuf.len())];
    let io = desc(
        5,
        UBLK_IO_OP_WRITE,
        (2 * chunk) >> SECTOR_SHIFT,
        (chunk >> SECTOR_SHIFT) as u32,
        wbuf.as_mut_ptr(),
    );
    mirror
        .async_iov(&q, &io, SubCmd::NONE, &iovs, 2 * chunk)
        .unwrap();
    mirror
        .queue_internal_resp(
            &q,
            &desc(
                6,
                UBLK_IO_OP_WRITE,
                (4 * chunk) >> SECTOR_SHIFT,
                (chunk >> SECTOR_SHIFT) as u32,
                wbuf.as_mut_ptr(),
            ),
            SubCmd::from_raw(0b1),
            0,
        )
        .unwrap();

    // The only good copy of chunk 2 fails its read; the retry would divert
    // to the stale side, which must be refused
    a.fail_next_async_completion(1);
    let mut rbuf = vec![0u8; chunk as usize];
    let riovs = [IoVec::new(rbuf.as_mut_ptr(), rbuf.len())];
    let rio = desc(
        9,
        UBLK_IO_OP_READ,
        (2 * chunk) >> SECTOR_SHIFT,
        (chunk >> SECTOR_SHIFT) as u32,
        std::ptr::null_mut(),
    );
    assert_eq!(Ok(1), mirror.async_iov(&q, &rio, SubCmd::NONE, &riovs, 2 * chunk));
    let mut results = Vec::new();
    mirror.collect_async(&q, &mut results);
    assert!(results[0].result < 0);

    let retried = results[0]
        .sub_cmd
        .set_flags(ublkraid::sub_cmd::SubCmdFlags::RETRIED);
    assert!(matches!(
        mirror.async_iov(&q, &rio, retried, &riovs, 2 * chunk),
        Err(DiskError::IoError(_))
    ));
}

#[test]
fn degraded_reads_avoid_stale_chunks_only() {
    let (a, b) = flaky_pair();
    let mirror = open_mirror(a.clone(), b.clone(), no_resync_opts());
    let q = MockQueue::new(0);
    let chunk = 32 * KI;

    // Chunk 2 diverges through a failed secondary write
    b.fail_next_async(1);
    let mut wbuf = vec![0u8; chunk as usize];
    let iovs = [IoVec::new(wbuf.as_mut_ptr(), wbuf.len())];
    let io = desc(
        5,
        UBLK_IO_OP_WRITE,
        (2 * chunk) >> SECTOR_SHIFT,
        (chunk >> SECTOR_SHIFT) as u32,
        wbuf.as_mut_ptr(),
    );
    mirror
        .async_iov(&q, &io, SubCmd::NONE, &iovs, 2 * chunk)
        .unwrap();

    // Revive the stale side: an optimistic write elsewhere completed
    // cleanly (chunk 4 carried no dirty bits, so nothing is cleared)
    let io4 = desc(
        6,
        UBLK_IO_OP_WRITE,
        (4 * chunk) >> SECTOR_SHIFT,
        (chunk >> SECTOR_SHIFT) as u32,
        wbuf.as_mut_ptr(),
    );
    mirror
        .queue_internal_resp(&q, &io4, SubCmd::from_raw(0b1), 0)
        .unwrap();
    assert_eq!(ReplicaState::Syncing, mirror.replica_states().device_b);

    // Stale-chunk reads always divert to the clean side
    let reads_b = b.mem().read_count();
    let mut rbuf = vec![0u8; chunk as usize];
    let riovs = [IoVec::new(rbuf.as_mut_ptr(), rbuf.len())];
    let rio = desc(
        7,
        UBLK_IO_OP_READ,
        (2 * chunk) >> SECTOR_SHIFT,
        (chunk >> SECTOR_SHIFT) as u32,
        std::ptr::null_mut(),
    );
    for _ in 0..4 {
        mirror
            .async_iov(&q, &rio, SubCmd::NONE, &riovs, 2 * chunk)
            .unwrap();
    }
    assert_eq!(reads_b, b.mem().read_count());

    // Proven-clean chunks still round-robin onto the recovering side
    let rio4 = desc(
        8,
        UBLK_IO_OP_READ,
        (4 * chunk) >> SECTOR_SHIFT,
        (chunk >> SECTOR_SHIFT) as u32,
        std::ptr::null_mut(),
    );
    for _ in 0..4 {
        mirror
            .async_iov(&q, &rio4, SubCmd::NONE, &riovs, 4 * chunk)
            .unwrap();
    }
    assert!(b.mem().read_count() > reads_b);
}

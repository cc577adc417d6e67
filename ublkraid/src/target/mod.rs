//! The target runtime: owns a composition tree and drives a ublk session.
//!
//! Each guest request becomes a small state machine (`IoState`): the first
//! dispatch records how many physical sub-commands were issued, every
//! completion from either source (kernel uring or event-fd drain) decrements
//! the counter and aggregates the result, failed sub-commands are re-issued
//! once with RETRIED and the original route preserved, and the request
//! completes when the counter reaches zero. No allocation happens per
//! resume.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;

use log::{debug, error, trace, warn};

use crate::config::TargetConfig;
use crate::disk::{DiskError, UblkDisk};
use crate::sub_cmd::{
    user_data_to_sub_cmd, user_data_to_tag, SubCmd, SubCmdFlags,
};
use crate::ublk::{IoDesc, QueueEvent, UblkQueue, UblkSession};
use crate::SECTOR_SHIFT;

/// Target descriptor handed to the session library at registration.
#[derive(Debug)]
pub struct TargetParams {
    pub dev_size: u64,
    pub max_io_buf_bytes: u32,
    pub nr_hw_queues: u16,
    pub queue_depth: u16,
    /// FDs to register with each queue's uring, first at slot 1 (slot 0 is
    /// the ublk character device).
    pub uring_fds: Vec<std::os::fd::RawFd>,
    /// The device produces completions outside the kernel uring and needs
    /// the event-fd wired up.
    pub needs_event_fd: bool,
}

#[derive(Debug, Clone, Copy, Default)]
struct IoState {
    desc: Option<IoDesc>,
    remaining: u32,
    result: i32,
}

struct QueueState {
    ios: Vec<IoState>,
}

pub struct Target {
    device: Arc<dyn UblkDisk>,
    cfg: TargetConfig,
    queues: Vec<Mutex<QueueState>>,
    stopping: AtomicBool,
}

impl Target {
    pub fn new(device: Arc<dyn UblkDisk>, cfg: TargetConfig) -> Target {
        let queues = (0..cfg.nr_hw_queues)
            .map(|_| {
                Mutex::new(QueueState {
                    ios: vec![IoState::default(); cfg.queue_depth as usize],
                })
            })
            .collect();
        Target {
            device,
            cfg,
            queues,
            stopping: AtomicBool::new(false),
        }
    }

    pub fn device(&self) -> &Arc<dyn UblkDisk> {
        &self.device
    }

    /// Registration descriptor for the session library.
    pub fn init_target(&self) -> TargetParams {
        // uring FD 0 is reserved for the ublk character device
        let uring_fds = self.device.open_for_uring(1);
        TargetParams {
            dev_size: self.device.params().dev_sectors << SECTOR_SHIFT,
            max_io_buf_bytes: self.cfg.max_io_size,
            nr_hw_queues: self.cfg.nr_hw_queues,
            queue_depth: self.cfg.queue_depth,
            uring_fds,
            needs_event_fd: self.device.params().uses_external_completion,
        }
    }

    /// First entry point for a guest request.
    pub fn handle_io_async(&self, q: &dyn UblkQueue, desc: IoDesc) {
        let mut qs = self.queue_state(q.q_id());
        let io = &mut qs.ios[desc.tag as usize];
        *io = IoState {
            desc: Some(desc),
            remaining: 0,
            result: 0,
        };

        let res = self.device.queue_io(q, &desc, SubCmd::NONE);
        // Submit before yielding so stack-described iovecs are imported
        q.submit();

        match res {
            Err(err) => {
                error!(
                    "IO failed immediately to queue io [tag:{}], err: [{err}]",
                    desc.tag
                );
                io.desc = None;
                q.complete_io(desc.tag, err.to_result());
            }
            Ok(0) => {
                io.desc = None;
                q.complete_io(desc.tag, 0);
            }
            Ok(sub_cmds) => {
                trace!("I/O [tag:{}] [sub_ios:{}]", desc.tag, sub_cmds);
                io.remaining = sub_cmds as u32;
            }
        }
    }

    /// A kernel uring completion for a target-owned sub-command.
    pub fn target_io_done(&self, q: &dyn UblkQueue, user_data: u64, result: i32) {
        let tag = user_data_to_tag(user_data);
        let sub_cmd = user_data_to_sub_cmd(user_data);
        self.process_result(q, tag, sub_cmd, result);
    }

    /// The event-fd fired: drain completions produced outside the uring.
    pub fn handle_event(&self, q: &dyn UblkQueue) {
        let mut completed = Vec::new();
        self.device.collect_async(q, &mut completed);
        for result in completed {
            self.process_result(q, result.tag, result.sub_cmd, result.result);
        }
        q.handled_event();
    }

    fn queue_state(&self, q_id: u16) -> std::sync::MutexGuard<'_, QueueState> {
        self.queues[q_id as usize]
            .lock()
            .expect("queue state poisoned")
    }

    // Resume the request state machine with one sub-command result.
    fn process_result(&self, q: &dyn UblkQueue, tag: u16, sub_cmd: SubCmd, result: i32) {
        let mut qs = self.queue_state(q.q_id());
        let io = &mut qs.ios[tag as usize];
        let Some(desc) = io.desc else {
            error!("Completion for idle tag {tag}, dropped");
            return;
        };
        io.remaining -= 1;
        trace!(
            "I/O result [tag:{tag}] [sub_cmd:{sub_cmd}] [res:{result}] [sub_cmds_remain:{}]",
            io.remaining
        );

        'accounted: {
            // An error already recorded wins regardless of later responses
            if 0 > io.result {
                break 'accounted;
            }

            // Bookkeeping completions loop back to the owning layer and
            // never surface to the guest; the layer may chain more
            // sub-commands
            if sub_cmd.is_internal() {
                match self
                    .device
                    .queue_internal_resp(q, &desc, sub_cmd, result.min(0))
                {
                    Ok(chained) => io.remaining += chained as u32,
                    Err(err) => {
                        debug!("Internal completion failed [tag:{tag}]: {err}");
                    }
                }
                break 'accounted;
            }

            if 0 <= result {
                // Replica writes succeed without doubling the byte count
                if !(0 < result && sub_cmd.test_flags(SubCmdFlags::REPLICATE)) {
                    io.result += result;
                }
                break 'accounted;
            }

            // A retried sub-command that fails again is final
            if sub_cmd.is_retry() {
                io.result = result;
                break 'accounted;
            }

            // Re-queue with the original route so the owning layer can
            // re-select the same leaf and recover
            let retry_sub = sub_cmd.set_flags(SubCmdFlags::RETRIED);
            debug!(
                "Retrying portion of I/O [res:{result}] [tag:{tag}] [sub_cmd:{retry_sub}]"
            );
            let io_res = self.device.queue_io(q, &desc, retry_sub);
            q.submit();
            match io_res {
                Ok(issued) => io.remaining += issued as u32,
                Err(err) => {
                    error!(
                        "Retry failed immediately on I/O [tag:{tag}] [sub_cmd:{retry_sub}] \
                         [err:{err}]"
                    );
                    io.result = result;
                }
            }
        }

        if 0 < io.remaining {
            return;
        }
        if 0 > io.result {
            error!("Returning error for [tag:{tag}] [res:{}]", io.result);
        } else {
            trace!("I/O complete [tag:{tag}] [res:{}]", io.result);
        }
        io.desc = None;
        q.complete_io(tag, io.result);
    }

    /// Drive a session: one thread per hardware queue, each fanning in
    /// guest requests, uring completions and event-fd wake-ups until the
    /// session stops.
    pub fn serve(self: &Arc<Self>, session: Arc<dyn UblkSession>) -> Result<(), DiskError> {
        let mut threads = Vec::new();
        for q_id in 0..self.cfg.nr_hw_queues {
            let target = self.clone();
            let session = session.clone();
            threads.push(
                thread::Builder::new()
                    .name(format!("q_{q_id}"))
                    .spawn(move || target.queue_loop(&*session, q_id))
                    .map_err(|_| DiskError::NotEnoughMemory)?,
            );
        }
        for thread in threads {
            let _ = thread.join();
        }
        Ok(())
    }

    fn queue_loop(&self, session: &dyn UblkSession, q_id: u16) {
        set_queue_thread_affinity(q_id);
        debug!("ublk queue {q_id} started");
        let q = session.queue(q_id);
        loop {
            if self.stopping.load(Ordering::Acquire) {
                break;
            }
            match session.wait_event(q_id) {
                Ok(QueueEvent::Io(desc)) => self.handle_io_async(q, desc),
                Ok(QueueEvent::TgtIoDone { user_data, result }) => {
                    self.target_io_done(q, user_data, result)
                }
                Ok(QueueEvent::EventFd) => self.handle_event(q),
                Ok(QueueEvent::Idle) => self.device.idle_transition(true),
                Ok(QueueEvent::Stop) => break,
                Err(err) => {
                    error!("queue {q_id} failed: {err}");
                    break;
                }
            }
        }
        debug!("ublk queue {q_id} exited");
    }

    /// Begin shutdown: queues stop after their current event, in-flight
    /// I/Os complete or error naturally.
    pub fn stop(&self, session: &dyn UblkSession) {
        self.stopping.store(true, Ordering::Release);
        session.stop();
    }
}

// Pin the queue thread to a single CPU from the allowed set so a request's
// state never migrates mid-flight.
fn set_queue_thread_affinity(q_id: u16) {
    // SAFETY: zeroed cpu_set_t filled by the kernel, then narrowed
    unsafe {
        let mut set: libc::cpu_set_t = std::mem::zeroed();
        if 0 != libc::sched_getaffinity(0, std::mem::size_of::<libc::cpu_set_t>(), &mut set) {
            warn!("sched_getaffinity: {}", std::io::Error::last_os_error());
            return;
        }
        let count = libc::CPU_COUNT(&set);
        if count <= 0 {
            return;
        }
        let wanted = q_id as i32 % count;
        let mut seen = 0;
        for cpu in 0..libc::CPU_SETSIZE as usize {
            if libc::CPU_ISSET(cpu, &set) {
                if seen == wanted {
                    let mut one: libc::cpu_set_t = std::mem::zeroed();
                    libc::CPU_SET(cpu, &mut one);
                    if 0 != libc::sched_setaffinity(
                        0,
                        std::mem::size_of::<libc::cpu_set_t>(),
                        &one,
                    ) {
                        warn!("sched_setaffinity: {}", std::io::Error::last_os_error());
                    }
                    return;
                }
                seen += 1;
            }
        }
    }
}

//! A single-threaded, cooperative multiplexer over readable/writable file
//! descriptors, timers, and child-process exits (spec.md §4.1).
//!
//! Concurrency across hosts in `rsbackup` is OS threads, not tasks; each
//! thread drives its own `EventLoop` to completion for the duration of one
//! engine invocation (spec.md §5, "a thread creates its own event loop and
//! action list for each engine invocation"). There is no task runtime here
//! on purpose — see SPEC_FULL.md §9 "Coroutine-free asynchrony".

use std::cell::RefCell;
use std::collections::BTreeMap;
use std::os::unix::io::RawFd;
use std::rc::Rc;
use std::time::{Duration, Instant};

use nix::poll::{PollFd, PollFlags, PollTimeout};
use nix::sys::wait::{waitpid, WaitPidFlag, WaitStatus};
use nix::unistd::Pid;

/// Capability set a caller registers against the event loop. Every method
/// has a no-op default so a reactor only implements the callbacks it needs,
/// mirroring the original's "five optional callbacks" design.
pub trait Reactor {
    fn on_readable(&mut self, _fd: RawFd, _data: &[u8]) {}
    fn on_read_error(&mut self, _fd: RawFd, _errno: i32) {}
    fn on_writable(&mut self, _fd: RawFd) {}
    fn on_timeout(&mut self, _now: Instant) {}
    fn on_wait(&mut self, _pid: Pid, _status: WaitStatus) {}
}

pub type SharedReactor = Rc<RefCell<dyn Reactor>>;

const READ_CHUNK: usize = 4096;
const MAX_POLL_DEADLINE: Duration = Duration::from_secs(10);
const CHILD_POLL_DEADLINE: Duration = Duration::from_millis(100);

/// A monotonic timer registration key: (deadline, insertion sequence) so
/// that distinct timers sharing a deadline keep a stable order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
struct TimerKey(Instant, u64);

#[derive(Default)]
pub struct EventLoop {
    readable: BTreeMap<RawFd, SharedReactor>,
    writable: BTreeMap<RawFd, SharedReactor>,
    timers: BTreeMap<TimerKey, SharedReactor>,
    children: BTreeMap<libc::pid_t, SharedReactor>,
    next_timer_seq: u64,
}

impl EventLoop {
    pub fn new() -> Self {
        EventLoop::default()
    }

    pub fn register_readable(&mut self, fd: RawFd, reactor: SharedReactor) {
        self.readable.insert(fd, reactor);
    }

    pub fn register_writable(&mut self, fd: RawFd, reactor: SharedReactor) {
        self.writable.insert(fd, reactor);
    }

    pub fn unregister_readable(&mut self, fd: RawFd) {
        self.readable.remove(&fd);
    }

    pub fn unregister_writable(&mut self, fd: RawFd) {
        self.writable.remove(&fd);
    }

    /// Registers a one-shot timeout. Fires exactly once.
    pub fn register_timeout(&mut self, at: Instant, reactor: SharedReactor) {
        let key = TimerKey(at, self.next_timer_seq);
        self.next_timer_seq += 1;
        self.timers.insert(key, reactor);
    }

    pub fn register_child(&mut self, pid: Pid, reactor: SharedReactor) {
        self.children.insert(pid.as_raw(), reactor);
    }

    fn has_registrations(&self, wait_for_timeouts: bool) -> bool {
        !self.readable.is_empty()
            || !self.writable.is_empty()
            || !self.children.is_empty()
            || (wait_for_timeouts && !self.timers.is_empty())
    }

    /// Runs until no registrations remain (or, if `wait_for_timeouts` is
    /// false, until no fd/child registrations remain — pending timers alone
    /// do not keep the loop alive).
    pub fn wait(&mut self, wait_for_timeouts: bool) -> anyhow::Result<()> {
        while self.has_registrations(wait_for_timeouts) {
            self.run_one_iteration(wait_for_timeouts)?;
        }
        Ok(())
    }

    fn run_one_iteration(&mut self, wait_for_timeouts: bool) -> anyhow::Result<()> {
        let now = Instant::now();

        if let Some((&key, _)) = self.timers.iter().next() {
            if key.0 <= now {
                let reactor = self.timers.remove(&key).unwrap();
                reactor.borrow_mut().on_timeout(now);
                return Ok(());
            }
        }

        let mut deadline = MAX_POLL_DEADLINE;
        if let Some((&key, _)) = self.timers.iter().next() {
            let to_timer = key.0.saturating_duration_since(now);
            if to_timer < deadline {
                deadline = to_timer;
            }
        }
        if !self.children.is_empty() && deadline > CHILD_POLL_DEADLINE {
            deadline = CHILD_POLL_DEADLINE;
        }

        self.poll_fds(deadline)?;
        self.reap_children();

        Ok(())
    }

    fn poll_fds(&mut self, deadline: Duration) -> anyhow::Result<()> {
        if self.readable.is_empty() && self.writable.is_empty() {
            if !self.children.is_empty() {
                std::thread::sleep(deadline.min(CHILD_POLL_DEADLINE));
            } else if deadline > Duration::ZERO {
                std::thread::sleep(deadline);
            }
            return Ok(());
        }

        let mut fds: Vec<PollFd> = Vec::with_capacity(self.readable.len() + self.writable.len());
        let mut order: Vec<(RawFd, bool)> = Vec::with_capacity(fds.capacity());

        // SAFETY: raw fds are owned by the callers who registered them and
        // remain valid for the duration of this poll call.
        for &fd in self.readable.keys() {
            let borrowed = unsafe { std::os::fd::BorrowedFd::borrow_raw(fd) };
            fds.push(PollFd::new(borrowed, PollFlags::POLLIN));
            order.push((fd, true));
        }
        for &fd in self.writable.keys() {
            let borrowed = unsafe { std::os::fd::BorrowedFd::borrow_raw(fd) };
            fds.push(PollFd::new(borrowed, PollFlags::POLLOUT));
            order.push((fd, false));
        }

        let timeout = PollTimeout::try_from(deadline).unwrap_or(PollTimeout::MAX);
        nix::poll::poll(&mut fds, timeout)?;

        let mut ready_readable = Vec::new();
        let mut ready_writable = Vec::new();
        for (poll_fd, (fd, is_read)) in fds.iter().zip(order.iter()) {
            let revents = poll_fd.revents().unwrap_or_else(PollFlags::empty);
            if revents.is_empty() {
                continue;
            }
            if *is_read {
                ready_readable.push(*fd);
            } else {
                ready_writable.push(*fd);
            }
        }

        for fd in ready_readable {
            self.service_readable(fd);
        }
        for fd in ready_writable {
            if let Some(reactor) = self.writable.get(&fd).cloned() {
                reactor.borrow_mut().on_writable(fd);
            }
        }

        Ok(())
    }

    fn service_readable(&mut self, fd: RawFd) {
        let reactor = match self.readable.get(&fd).cloned() {
            Some(r) => r,
            None => return,
        };

        let mut buf = [0u8; READ_CHUNK];
        // SAFETY: fd is a valid, open file descriptor registered by the caller.
        let n = unsafe { libc::read(fd, buf.as_mut_ptr() as *mut libc::c_void, buf.len()) };
        if n < 0 {
            let errno = std::io::Error::last_os_error().raw_os_error().unwrap_or(0);
            reactor.borrow_mut().on_read_error(fd, errno);
            self.readable.remove(&fd);
        } else if n == 0 {
            // EOF: deregister, matching the spec's "zero bytes signals EOF".
            self.readable.remove(&fd);
            reactor.borrow_mut().on_readable(fd, &[]);
        } else {
            reactor.borrow_mut().on_readable(fd, &buf[..n as usize]);
        }
    }

    fn reap_children(&mut self) {
        let pids: Vec<libc::pid_t> = self.children.keys().copied().collect();
        for pid in pids {
            match waitpid(Pid::from_raw(pid), Some(WaitPidFlag::WNOHANG)) {
                Ok(WaitStatus::StillAlive) => continue,
                Ok(status) => {
                    if let Some(reactor) = self.children.remove(&pid) {
                        reactor.borrow_mut().on_wait(Pid::from_raw(pid), status);
                    }
                }
                Err(_) => {
                    // Already reaped by someone else; drop the registration.
                    self.children.remove(&pid);
                }
            }
        }
    }
}

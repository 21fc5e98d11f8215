//! Glue between the [`crate::scheduler::ActionList`] and
//! [`rsbackup_tools::EventLoop`] (spec.md §5: "A thread creates its own
//! event loop and action list for each engine invocation").
//!
//! An action's `go` callback that spawns a subprocess must not call
//! [`crate::scheduler::ActionHandle::completed`] from inside the
//! subprocess's own completion reactor: that reactor fires while the
//! `EventLoop` is under an active `RefCell` borrow (via [`drive`]'s call
//! into `EventLoop::wait`), and `completed` may itself trigger the next
//! action's `go`, which needs to borrow the same `EventLoop` again to
//! register its own subprocess. Two nested `RefCell` borrows on the same
//! cell panic. Subprocess-backed `go` callbacks therefore push
//! `(handle, succeeded)` onto a [`CompletionQueue`] instead of calling
//! `completed` directly; [`drive`] drains that queue between `EventLoop`
//! borrows, where it is always safe to call back into the scheduler.

use std::cell::RefCell;
use std::collections::VecDeque;
use std::rc::Rc;

use anyhow::Result;

use rsbackup_tools::EventLoop;

use crate::scheduler::{ActionHandle, ActionList};

pub type CompletionQueue = Rc<RefCell<VecDeque<(ActionHandle, bool)>>>;

pub fn new_completion_queue() -> CompletionQueue {
    Rc::new(RefCell::new(VecDeque::new()))
}

/// Runs `list` to exhaustion against `event_loop`. `go` callbacks that
/// complete synchronously (no subprocess involved) may call
/// `handle.completed` directly; callbacks that spawn a subprocess must
/// push onto `queue` from their completion reactor instead.
pub fn drive(
    list: &ActionList,
    event_loop: &Rc<RefCell<EventLoop>>,
    queue: &CompletionQueue,
) -> Result<()> {
    list.trigger();
    loop {
        loop {
            let next = queue.borrow_mut().pop_front();
            match next {
                Some((handle, succeeded)) => handle.completed(succeeded),
                None => break,
            }
        }
        if !list.has_pending_or_running() {
            return Ok(());
        }
        event_loop.borrow_mut().wait(true)?;
    }
}

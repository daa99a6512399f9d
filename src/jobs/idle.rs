use std::cmp::Ordering as CmpOrdering;
use std::collections::BinaryHeap;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::Arc;
use std::sync::atomic::{AtomicU8, AtomicU64, Ordering};
use std::time::{Duration, Instant};
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TryRecvError;
use tracing::{debug, error};

use super::StopToken;

const PENDING: u8 = 0;
const RUNNING: u8 = 1;
const COMPLETED: u8 = 2;
const UNSCHEDULED: u8 = 3;

/// Handle to a call scheduled on the control loop.
///
/// Once the call has run, or has been unscheduled, the handle is inert:
/// `unschedule()` becomes a no-op.
#[derive(Debug, Clone)]
pub struct IdleHandle {
    state: Arc<AtomicU8>,
}

impl IdleHandle {
    fn pending() -> Self {
        Self {
            state: Arc::new(AtomicU8::new(PENDING)),
        }
    }

    /// A handle that is already completed and can't be unscheduled.
    pub fn completed() -> Self {
        Self {
            state: Arc::new(AtomicU8::new(COMPLETED)),
        }
    }

    /// Prevents the call from running if it has not started yet.
    pub fn unschedule(&self) {
        let _ = self
            .state
            .compare_exchange(PENDING, UNSCHEDULED, Ordering::AcqRel, Ordering::Acquire);
    }

    /// True while the call can still be unscheduled.
    pub fn is_connected(&self) -> bool {
        self.state.load(Ordering::Acquire) == PENDING
    }

    /// True once the call has run.
    pub fn is_completed(&self) -> bool {
        self.state.load(Ordering::Acquire) == COMPLETED
    }

    fn claim(&self) -> bool {
        self.state
            .compare_exchange(PENDING, RUNNING, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    fn mark_completed(&self) {
        self.state.store(COMPLETED, Ordering::Release);
    }
}

struct ScheduledCall {
    due: Instant,
    seq: u64,
    handle: IdleHandle,
    call: Box<dyn FnOnce() + Send>,
}

// BinaryHeap is a max-heap; invert so the earliest (due, seq) pops first.
impl Ord for ScheduledCall {
    fn cmp(&self, other: &Self) -> CmpOrdering {
        other
            .due
            .cmp(&self.due)
            .then_with(|| other.seq.cmp(&self.seq))
    }
}

impl PartialOrd for ScheduledCall {
    fn partial_cmp(&self, other: &Self) -> Option<CmpOrdering> {
        Some(self.cmp(other))
    }
}

impl PartialEq for ScheduledCall {
    fn eq(&self, other: &Self) -> bool {
        self.due == other.due && self.seq == other.seq
    }
}

impl Eq for ScheduledCall {}

/// Cloneable, thread-safe way to schedule calls on the control loop.
#[derive(Debug, Clone)]
pub struct ControlHandle {
    sender: mpsc::UnboundedSender<ScheduledCall>,
    seq: Arc<AtomicU64>,
}

impl std::fmt::Debug for ScheduledCall {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ScheduledCall")
            .field("due", &self.due)
            .field("seq", &self.seq)
            .finish()
    }
}

impl ControlHandle {
    /// Runs `call` once on the control loop, as soon as it gets to it.
    pub fn schedule<F>(&self, call: F) -> IdleHandle
    where
        F: FnOnce() + Send + 'static,
    {
        self.schedule_after(Duration::ZERO, call)
    }

    /// Runs `call` once on the control loop, no earlier than `delay` from now.
    pub fn schedule_after<F>(&self, delay: Duration, call: F) -> IdleHandle
    where
        F: FnOnce() + Send + 'static,
    {
        let handle = IdleHandle::pending();
        let scheduled = ScheduledCall {
            due: Instant::now() + delay,
            seq: self.seq.fetch_add(1, Ordering::Relaxed),
            handle: handle.clone(),
            call: Box::new(call),
        };

        if self.sender.send(scheduled).is_err() {
            debug!("Control loop is gone, dropping scheduled call");
            handle.unschedule();
        }
        handle
    }

    /// Like [`schedule`](Self::schedule), but the call is skipped if `token`
    /// is set by the time the control loop reaches it.
    pub fn schedule_unless_stopped<F>(&self, token: &StopToken, call: F) -> IdleHandle
    where
        F: FnOnce() + Send + 'static,
    {
        let token = token.clone();
        self.schedule(move || {
            if !token.is_set() {
                call();
            }
        })
    }

    pub fn is_closed(&self) -> bool {
        self.sender.is_closed()
    }
}

/// The single consumer of scheduled calls.
///
/// Whoever drives this loop is the control thread: every call scheduled
/// through a [`ControlHandle`] runs here, one at a time.
pub struct ControlLoop {
    receiver: mpsc::UnboundedReceiver<ScheduledCall>,
    queue: BinaryHeap<ScheduledCall>,
    closed: bool,
}

impl ControlLoop {
    pub fn new() -> (ControlHandle, ControlLoop) {
        let (sender, receiver) = mpsc::unbounded_channel();
        let handle = ControlHandle {
            sender,
            seq: Arc::new(AtomicU64::new(0)),
        };
        let control = ControlLoop {
            receiver,
            queue: BinaryHeap::new(),
            closed: false,
        };
        (handle, control)
    }

    /// Number of calls waiting, including the ones not yet due.
    pub fn pending(&mut self) -> usize {
        self.drain_incoming();
        self.queue
            .iter()
            .filter(|call| call.handle.is_connected())
            .count()
    }

    /// Runs every call that is due right now, including calls scheduled by
    /// the calls being run. Returns how many ran.
    pub fn run_pending(&mut self) -> usize {
        let mut ran = 0;
        loop {
            self.drain_incoming();
            let now = Instant::now();
            let due = matches!(self.queue.peek(), Some(call) if call.due <= now);
            if !due {
                break;
            }
            if let Some(call) = self.queue.pop() {
                if Self::dispatch(call) {
                    ran += 1;
                }
            }
        }
        ran
    }

    /// Drives the loop for `duration`, returning how many calls ran.
    pub async fn run_for(&mut self, duration: Duration) -> usize {
        let deadline = Instant::now() + duration;
        let mut ran = 0;
        loop {
            ran += self.run_pending();
            if Instant::now() >= deadline {
                break;
            }
            if !self.wait_next(Some(deadline)).await {
                break;
            }
        }
        ran
    }

    /// Drives the loop until `done` returns true or `timeout` elapses.
    pub async fn run_until<F>(&mut self, timeout: Duration, mut done: F) -> bool
    where
        F: FnMut() -> bool,
    {
        let deadline = Instant::now() + timeout;
        loop {
            self.run_pending();
            if done() {
                return true;
            }
            if Instant::now() >= deadline {
                return false;
            }
            if !self.wait_next(Some(deadline)).await {
                self.run_pending();
                return done();
            }
        }
    }

    /// Drives the loop until every handle is dropped and nothing is left to run.
    pub async fn run(mut self) {
        loop {
            self.run_pending();
            if !self.wait_next(None).await {
                break;
            }
        }
        debug!("Control loop finished");
    }

    fn drain_incoming(&mut self) {
        if self.closed {
            return;
        }
        loop {
            match self.receiver.try_recv() {
                Ok(call) => self.queue.push(call),
                Err(TryRecvError::Empty) => break,
                Err(TryRecvError::Disconnected) => {
                    self.closed = true;
                    break;
                }
            }
        }
    }

    /// Waits for a new call, the next due call, or `deadline`.
    /// Returns false when nothing can ever arrive again.
    async fn wait_next(&mut self, deadline: Option<Instant>) -> bool {
        let next_due = self.queue.peek().map(|call| call.due);
        let wake_at = match (next_due, deadline) {
            (Some(due), Some(deadline)) => Some(due.min(deadline)),
            (due, deadline) => due.or(deadline),
        };

        if self.closed {
            return match wake_at {
                Some(at) if !self.queue.is_empty() || deadline.is_some() => {
                    tokio::time::sleep_until(at.into()).await;
                    !self.queue.is_empty()
                }
                _ => false,
            };
        }

        let received = match wake_at {
            Some(at) => tokio::select! {
                msg = self.receiver.recv() => Some(msg),
                _ = tokio::time::sleep_until(at.into()) => None,
            },
            None => Some(self.receiver.recv().await),
        };

        match received {
            Some(Some(call)) => {
                self.queue.push(call);
                true
            }
            Some(None) => {
                self.closed = true;
                !self.queue.is_empty()
            }
            None => true,
        }
    }

    fn dispatch(scheduled: ScheduledCall) -> bool {
        if !scheduled.handle.claim() {
            return false;
        }
        let outcome = catch_unwind(AssertUnwindSafe(scheduled.call));
        scheduled.handle.mark_completed();
        if let Err(panic) = outcome {
            error!(
                "Scheduled call panicked on the control loop: {}",
                panic_message(panic.as_ref())
            );
        }
        true
    }
}

pub(crate) fn panic_message(panic: &(dyn std::any::Any + Send)) -> String {
    if let Some(message) = panic.downcast_ref::<&str>() {
        message.to_string()
    } else if let Some(message) = panic.downcast_ref::<String>() {
        message.clone()
    } else {
        "unknown panic".to_string()
    }
}

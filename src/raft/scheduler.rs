use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

/// A timer event delivered to the node's serial executor.
#[derive(Clone, Copy, Debug, PartialEq)]
pub enum TimerEvent {
    /// A follower's or candidate's election timeout elapsed.
    ElectionTimeout,
    /// The leader's replication interval elapsed.
    ReplicateLog,
}

/// Schedules the node's timers. Timers fire by delivering events to the
/// node's serial executor, never by calling into the node directly, so all
/// state transitions remain serialized. Cancellation is best-effort: a timer
/// may still fire after its handle is cancelled, and the node treats stale
/// events (e.g. an election timeout while leader) as no-ops.
pub trait Scheduler: Send {
    /// Schedules a one-shot election timeout after the given delay.
    fn schedule_election_timeout(&mut self, delay: Duration) -> Timer;

    /// Schedules a periodic replication tick at the given interval.
    fn schedule_log_replication(&mut self, interval: Duration) -> Timer;
}

/// A cancellable timer handle. Dropping the handle cancels the timer, which
/// makes role transitions cancel the outgoing role's timer automatically.
pub struct Timer {
    cancelled: Option<Arc<AtomicBool>>,
}

impl Timer {
    /// An inert timer that never fires, e.g. from the null scheduler or for
    /// roles that must not campaign.
    pub fn none() -> Self {
        Self { cancelled: None }
    }

    fn armed() -> (Self, Arc<AtomicBool>) {
        let flag = Arc::new(AtomicBool::new(false));
        (Self { cancelled: Some(flag.clone()) }, flag)
    }

    pub fn cancel(&self) {
        if let Some(flag) = &self.cancelled {
            flag.store(true, Ordering::Relaxed);
        }
    }
}

impl Drop for Timer {
    fn drop(&mut self) {
        self.cancel()
    }
}

/// A scheduler that never schedules anything, for deterministic tests that
/// drive timeouts by hand.
pub struct NullScheduler;

impl Scheduler for NullScheduler {
    fn schedule_election_timeout(&mut self, _delay: Duration) -> Timer {
        Timer::none()
    }

    fn schedule_log_replication(&mut self, _interval: Duration) -> Timer {
        Timer::none()
    }
}

/// A thread-based scheduler that sleeps and then delivers timer events into
/// a channel, typically the node server's event channel.
pub struct ThreadScheduler {
    tx: crossbeam::channel::Sender<TimerEvent>,
}

impl ThreadScheduler {
    pub fn new(tx: crossbeam::channel::Sender<TimerEvent>) -> Self {
        Self { tx }
    }
}

impl Scheduler for ThreadScheduler {
    fn schedule_election_timeout(&mut self, delay: Duration) -> Timer {
        let (timer, cancelled) = Timer::armed();
        let tx = self.tx.clone();
        std::thread::spawn(move || {
            std::thread::sleep(delay);
            if !cancelled.load(Ordering::Relaxed) {
                let _ = tx.send(TimerEvent::ElectionTimeout);
            }
        });
        timer
    }

    fn schedule_log_replication(&mut self, interval: Duration) -> Timer {
        let (timer, cancelled) = Timer::armed();
        let tx = self.tx.clone();
        std::thread::spawn(move || loop {
            std::thread::sleep(interval);
            if cancelled.load(Ordering::Relaxed) {
                return;
            }
            if tx.send(TimerEvent::ReplicateLog).is_err() {
                return;
            }
        });
        timer
    }
}

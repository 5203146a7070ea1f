//! Per-direction run queue.
//!
//! Each direction is served by one worker task. Triggers increment a pending
//! counter (capped, so bursts coalesce) and wake the worker; the worker takes
//! one pending run at a time, so passes of a direction never overlap.

use forkdb_sync_protocol::Direction;
use tokio::sync::{watch, Notify};

/// Observable state of a run queue.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct QueueStatus {
    /// Runs waiting behind the current one.
    pub queued: usize,
    /// Whether a pass is running.
    pub running: bool,
    /// Number of passes started so far.
    pub started: u64,
}

impl QueueStatus {
    /// Returns true if nothing is running or waiting.
    pub fn is_drained(&self) -> bool {
        self.queued == 0 && !self.running
    }
}

pub(crate) struct RunQueue {
    direction: Direction,
    max_pending: usize,
    status: watch::Sender<QueueStatus>,
    active: watch::Sender<bool>,
    wakeup: Notify,
}

impl RunQueue {
    pub(crate) fn new(direction: Direction, max_pending: usize) -> Self {
        Self {
            direction,
            max_pending: max_pending.max(1),
            status: watch::Sender::new(QueueStatus::default()),
            active: watch::Sender::new(false),
            wakeup: Notify::new(),
        }
    }

    pub(crate) fn direction(&self) -> Direction {
        self.direction
    }

    /// Requests a pass. Returns false if the request was coalesced.
    pub(crate) fn schedule(&self) -> bool {
        let max = self.max_pending;
        let scheduled = self.status.send_if_modified(|s| {
            if s.queued < max {
                s.queued += 1;
                true
            } else {
                false
            }
        });
        if scheduled {
            self.wakeup.notify_one();
        }
        scheduled
    }

    /// Takes one pending run, marking the queue as running.
    fn begin(&self) -> bool {
        let started = self.status.send_if_modified(|s| {
            if s.queued > 0 {
                s.queued -= 1;
                s.running = true;
                s.started += 1;
                true
            } else {
                false
            }
        });
        if started {
            self.active.send_replace(true);
        }
        started
    }

    /// Waits for the next pending run.
    ///
    /// Returns false once `cancel` turns true or its sender is gone.
    pub(crate) async fn next(&self, cancel: &mut watch::Receiver<bool>) -> bool {
        loop {
            if *cancel.borrow_and_update() {
                return false;
            }
            if self.begin() {
                return true;
            }
            tokio::select! {
                _ = self.wakeup.notified() => {}
                changed = cancel.changed() => {
                    if changed.is_err() {
                        return false;
                    }
                }
            }
        }
    }

    /// Marks the running pass as finished.
    pub(crate) fn finish(&self) {
        self.status.send_modify(|s| s.running = false);
        self.active.send_replace(false);
    }

    pub(crate) fn status(&self) -> QueueStatus {
        *self.status.borrow()
    }

    pub(crate) fn subscribe(&self) -> watch::Receiver<QueueStatus> {
        self.status.subscribe()
    }

    pub(crate) fn subscribe_active(&self) -> watch::Receiver<bool> {
        self.active.subscribe()
    }

    /// Waits until nothing is running or queued.
    pub(crate) async fn wait_drained(&self) {
        let mut rx = self.status.subscribe();
        // The sender lives as long as `self`, so this cannot fail.
        let _ = rx.wait_for(QueueStatus::is_drained).await;
    }
}

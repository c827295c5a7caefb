//! Progress-thread plumbing: cross-thread wakeups into the event loop and
//! deadline timers driven off the poll timeout.

use std::cmp::Reverse;
use std::collections::BinaryHeap;
use std::sync::mpsc::{channel, Receiver, Sender};
use std::time::{Duration, Instant};

use hashbrown::HashSet;
use mio::{Poll, PollOpt, Ready, Registration, SetReadiness, Token};

use crate::status::{PmixResult, Status};

/// Cloneable submission handle. Posting enqueues the op and flags the
/// loop's registration readable, so the work executes on the progress
/// thread rather than the caller's.
pub struct Waker<T> {
    tx: Sender<T>,
    ready: SetReadiness,
}

impl<T> Clone for Waker<T> {
    fn clone(&self) -> Self {
        Waker {
            tx: self.tx.clone(),
            ready: self.ready.clone(),
        }
    }
}

impl<T> Waker<T> {
    /// Hands an op to the progress thread. Fails with `Unreach` once the
    /// loop has shut down.
    pub fn post(&self, op: T) -> PmixResult<()> {
        self.tx.send(op).map_err(|_| Status::Unreach)?;
        self.ready
            .set_readiness(Ready::readable())
            .map_err(|_| Status::Error)
    }
}

/// Loop-side end of the wake channel.
pub struct WakeQueue<T> {
    rx: Receiver<T>,
    registration: Registration,
    ready: SetReadiness,
}

impl<T> WakeQueue<T> {
    pub fn register(&self, poll: &Poll, token: Token) -> PmixResult<()> {
        poll.register(&self.registration, token, Ready::readable(), PollOpt::edge())
            .map_err(|_| Status::Error)
    }

    /// Drains every queued op. Readiness is cleared before the drain so a
    /// post racing with the drain still produces a fresh wakeup.
    pub fn drain(&self) -> Vec<T> {
        let _ = self.ready.set_readiness(Ready::empty());
        self.rx.try_iter().collect()
    }
}

/// Builds a connected waker/queue pair.
pub fn wake_pair<T>() -> (Waker<T>, WakeQueue<T>) {
    let (registration, ready) = Registration::new2();
    let (tx, rx) = channel();
    (
        Waker {
            tx,
            ready: ready.clone(),
        },
        WakeQueue {
            rx,
            registration,
            ready,
        },
    )
}

/// Deadline bookkeeping for the progress loop. The loop polls with
/// `next_timeout` and collects `expired` ids after each wakeup.
pub struct Timers {
    heap: BinaryHeap<Reverse<(Instant, u64)>>,
    cancelled: HashSet<u64>,
    next_id: u64,
}

impl Timers {
    pub fn new() -> Timers {
        Timers {
            heap: BinaryHeap::new(),
            cancelled: HashSet::new(),
            next_id: 0,
        }
    }

    pub fn schedule(&mut self, at: Instant) -> u64 {
        let id = self.next_id;
        self.next_id += 1;
        self.heap.push(Reverse((at, id)));
        id
    }

    pub fn cancel(&mut self, id: u64) {
        self.cancelled.insert(id);
    }

    /// Time until the earliest live deadline, zero if it already passed,
    /// `None` when nothing is scheduled.
    pub fn next_timeout(&mut self, now: Instant) -> Option<Duration> {
        loop {
            match self.heap.peek() {
                None => return None,
                Some(Reverse((at, id))) => {
                    if self.cancelled.remove(id) {
                        self.heap.pop();
                        continue;
                    }
                    if *at <= now {
                        return Some(Duration::from_millis(0));
                    }
                    return Some(*at - now);
                }
            }
        }
    }

    /// Pops every deadline at or before `now`, skipping cancelled entries.
    pub fn expired(&mut self, now: Instant) -> Vec<u64> {
        let mut out = Vec::new();
        while let Some(Reverse((at, id))) = self.heap.peek().cloned() {
            if at > now {
                break;
            }
            self.heap.pop();
            if !self.cancelled.remove(&id) {
                out.push(id);
            }
        }
        out
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.heap.is_empty()
    }
}

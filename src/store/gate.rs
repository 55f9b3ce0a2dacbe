use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::{Condvar, Mutex};

use crate::deadline::Deadline;

/// How often a waiter with a deadline re-checks it for cancellation.
const CANCEL_POLL: Duration = Duration::from_millis(20);

/// Admits one writer at a time, in arrival order.
///
/// Each caller draws a ticket and waits until the gate serves it. A waiter
/// whose deadline runs out gives its ticket back; the gate skips abandoned
/// tickets when it advances.
#[derive(Debug, Default)]
pub(crate) struct WriteGate {
    state: Mutex<GateState>,
    turn: Condvar,
}

#[derive(Debug, Default)]
struct GateState {
    next_ticket: u64,
    serving: u64,
    abandoned: BTreeSet<u64>,
}

impl GateState {
    fn advance(&mut self) {
        self.serving += 1;
        while self.abandoned.remove(&self.serving) {
            self.serving += 1;
        }
    }
}

/// Exclusive right to write. The gate moves to the next ticket when the permit
/// is dropped.
#[derive(Debug)]
pub(crate) struct WritePermit {
    gate: Arc<WriteGate>,
    ticket: u64,
}

impl WritePermit {
    #[cfg(test)]
    pub(crate) fn ticket(&self) -> u64 {
        self.ticket
    }
}

impl WriteGate {
    pub(crate) fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Blocks until every earlier ticket has been served.
    pub(crate) fn acquire(self: &Arc<Self>) -> WritePermit {
        let mut state = self.state.lock();
        let ticket = state.next_ticket;
        state.next_ticket += 1;

        while state.serving != ticket {
            self.turn.wait(&mut state);
        }

        WritePermit {
            gate: Arc::clone(self),
            ticket,
        }
    }

    /// Like [`acquire`](Self::acquire), but gives up once `deadline` expires.
    ///
    /// Returns `None` on expiry; the ticket is abandoned and later waiters are
    /// not held up by it.
    pub(crate) fn acquire_until(self: &Arc<Self>, deadline: &Deadline) -> Option<WritePermit> {
        let mut state = self.state.lock();
        let ticket = state.next_ticket;
        state.next_ticket += 1;

        while state.serving != ticket {
            if deadline.is_expired() {
                state.abandoned.insert(ticket);
                return None;
            }
            let wait = deadline
                .remaining()
                .map_or(CANCEL_POLL, |left| left.min(CANCEL_POLL));
            self.turn.wait_for(&mut state, wait);
        }

        Some(WritePermit {
            gate: Arc::clone(self),
            ticket,
        })
    }

    /// True when no writer holds the gate and none is waiting.
    #[cfg(test)]
    pub(crate) fn is_idle(&self) -> bool {
        let state = self.state.lock();
        state.serving == state.next_ticket
    }

    fn release(&self, ticket: u64) {
        let mut state = self.state.lock();
        debug_assert_eq!(state.serving, ticket, "released a permit out of turn");
        state.advance();
        self.turn.notify_all();
    }
}

impl Drop for WritePermit {
    fn drop(&mut self) {
        self.gate.release(self.ticket);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::mpsc;
    use std::thread;

    #[test]
    fn test_permits_are_exclusive() {
        let gate = WriteGate::new();
        let first = gate.acquire();
        assert!(!gate.is_idle());

        let short = Deadline::after(Duration::from_millis(30));
        assert!(gate.acquire_until(&short).is_none());

        drop(first);
        assert!(gate.is_idle());
        let second = gate.acquire_until(&Deadline::none()).unwrap();
        assert_eq!(second.ticket(), 2);
    }

    #[test]
    fn test_fifo_order() {
        let gate = WriteGate::new();
        let held = gate.acquire();
        let (tx, rx) = mpsc::channel();

        let mut handles = Vec::new();
        for i in 0..4 {
            let thread_gate = Arc::clone(&gate);
            let tx = tx.clone();
            handles.push(thread::spawn(move || {
                let permit = thread_gate.acquire();
                tx.send((i, permit.ticket())).unwrap();
            }));
            // Let each thread draw its ticket before the next one starts
            while gate.state.lock().next_ticket != i + 2 {
                thread::yield_now();
            }
        }

        drop(held);
        for handle in handles {
            handle.join().unwrap();
        }
        drop(tx);

        let order: Vec<_> = rx.iter().collect();
        assert_eq!(order, [(0, 1), (1, 2), (2, 3), (3, 4)]);
    }

    #[test]
    fn test_abandoned_ticket_is_skipped() {
        let gate = WriteGate::new();
        let held = gate.acquire();

        let deadline = Deadline::after(Duration::from_millis(20));
        assert!(gate.acquire_until(&deadline).is_none());

        let waiter = {
            let gate = Arc::clone(&gate);
            thread::spawn(move || gate.acquire().ticket())
        };
        while gate.state.lock().next_ticket != 3 {
            thread::yield_now();
        }

        drop(held);
        assert_eq!(waiter.join().unwrap(), 2);
        assert!(gate.is_idle());
    }

    #[test]
    fn test_cancel_wakes_waiter() {
        let gate = WriteGate::new();
        let _held = gate.acquire();

        let deadline = Deadline::none();
        let canceller = deadline.clone();
        let waiter = {
            let gate = Arc::clone(&gate);
            thread::spawn(move || gate.acquire_until(&deadline).is_none())
        };

        thread::sleep(Duration::from_millis(30));
        canceller.cancel();
        assert!(waiter.join().unwrap());
    }
}

// Unless explicitly stated otherwise all files in this repository are licensed
// under the MIT/Apache-2.0 License, at your convenience
//
// This product includes software developed at Datadog (https://www.datadoghq.com/). Copyright 2020 Datadog, Inc.
//
//! The two-party rendezvous deciding who resumes a suspended task.
//!
//! Every asynchronous call creates one [`PendingOp`]: a [`Rendezvous`]
//! counter plus the slots the operation's outcome is delivered into. Two
//! arrivals race: the completing side (from any thread, any time) and the
//! task side (performed by the resuming side once the task's stack pointer
//! is safely published). Whichever arrival drives the counter to zero owns
//! the resume; the other must not touch the task again.

use std::cell::UnsafeCell;
use std::io;
use std::sync::atomic::{AtomicU8, Ordering};

/// Counter for one suspension's rendezvous. Starts at 2: one arrival for
/// "the result is in the slots", one for "the task is parked and resumable".
#[derive(Debug)]
pub(crate) struct Rendezvous {
    remaining: AtomicU8,
}

impl Rendezvous {
    pub(crate) fn new() -> Self {
        Self {
            remaining: AtomicU8::new(2),
        }
    }

    /// Records one party's arrival. Returns `true` iff this call drove the
    /// counter to zero; that caller, and only that caller, performs the
    /// resume. The AcqRel ordering makes everything written before the
    /// losing arrival visible after the winning one.
    pub(crate) fn arrive(&self) -> bool {
        self.remaining.fetch_sub(1, Ordering::AcqRel) == 1
    }

    /// Whether the completing side has already arrived while the task side
    /// has not. Used by the task to skip the stack switch entirely when the
    /// operation finished before it reached its suspension point.
    pub(crate) fn completed(&self) -> bool {
        self.remaining.load(Ordering::Acquire) == 1
    }
}

/// Arrival half of a [`PendingOp`], type-erased so the resuming side can
/// perform the task's arrival without knowing the operation's value type.
pub(crate) trait Arrive: Send + Sync {
    fn arrive(&self) -> bool;
}

/// State of one in-flight asynchronous call: the rendezvous counter and the
/// slots its outcome is delivered into. Allocated once per call and shared
/// between the task side and the completion token; the second `Arc` drop
/// frees it deterministically.
pub(crate) struct PendingOp<T> {
    gate: Rendezvous,
    // Both slots are written by the completing side strictly before its
    // arrival and read by the task side strictly after the winning arrival,
    // so at no point do two parties touch them concurrently.
    error: UnsafeCell<Option<io::Error>>,
    value: UnsafeCell<Option<T>>,
}

// SAFETY: slot access is serialized by the gate as described above; the
// counter itself is atomic.
unsafe impl<T: Send> Send for PendingOp<T> {}
unsafe impl<T: Send> Sync for PendingOp<T> {}

impl<T: Send> PendingOp<T> {
    pub(crate) fn new() -> Self {
        Self {
            gate: Rendezvous::new(),
            error: UnsafeCell::new(None),
            value: UnsafeCell::new(None),
        }
    }

    pub(crate) fn completed(&self) -> bool {
        self.gate.completed()
    }

    /// The completing side's arrival. See [`Rendezvous::arrive`].
    pub(crate) fn gate_arrive(&self) -> bool {
        self.gate.arrive()
    }

    /// Writes the delivered outcome into the slots. Success leaves the error
    /// slot holding the "no error" sentinel (`None`).
    ///
    /// Called exactly once, by the completing side, before its arrival.
    pub(crate) fn fulfill(&self, outcome: io::Result<T>) {
        match outcome {
            Ok(value) => unsafe { *self.value.get() = Some(value) },
            Err(e) => unsafe { *self.error.get() = Some(e) },
        }
    }

    /// Consumes the slots after the rendezvous has handed control back to
    /// the task.
    ///
    /// Called exactly once, by the task side, after either a winning
    /// completion probe or its resume.
    pub(crate) fn take(&self) -> io::Result<T> {
        if let Some(e) = unsafe { (*self.error.get()).take() } {
            return Err(e);
        }
        let value = unsafe { (*self.value.get()).take() };
        Ok(value.expect("completed operation delivered neither value nor error"))
    }
}

impl<T: Send> Arrive for PendingOp<T> {
    fn arrive(&self) -> bool {
        self.gate.arrive()
    }
}

impl<T> std::fmt::Debug for PendingOp<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PendingOp").field("gate", &self.gate).finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;
    use std::sync::Arc;
    use std::thread;

    #[test]
    fn second_arrival_wins() {
        let gate = Rendezvous::new();
        assert!(!gate.completed());
        assert!(!gate.arrive());
        assert!(gate.completed());
        assert!(gate.arrive());
    }

    #[test]
    fn exactly_one_winner_under_contention() {
        for _ in 0..1000 {
            let gate = Arc::new(Rendezvous::new());
            let wins = Arc::new(AtomicUsize::new(0));

            let handles: Vec<_> = (0..2)
                .map(|_| {
                    let gate = gate.clone();
                    let wins = wins.clone();
                    thread::spawn(move || {
                        if gate.arrive() {
                            wins.fetch_add(1, Ordering::SeqCst);
                        }
                    })
                })
                .collect();
            for h in handles {
                h.join().unwrap();
            }
            assert_eq!(wins.load(Ordering::SeqCst), 1);
        }
    }

    #[test]
    fn slots_deliver_value_or_error() {
        let op = PendingOp::new();
        op.fulfill(Ok(42u32));
        assert_eq!(op.take().unwrap(), 42);

        let op = PendingOp::<u32>::new();
        op.fulfill(Err(io::Error::from(io::ErrorKind::ConnectionReset)));
        assert_eq!(
            op.take().unwrap_err().kind(),
            io::ErrorKind::ConnectionReset
        );
    }

    #[test]
    fn winner_observes_fulfilled_slots() {
        // The loser writes the slots before arriving; the winner must see
        // them fully written, whichever thread it runs on.
        for _ in 0..500 {
            let op = Arc::new(PendingOp::<u64>::new());
            let completer = {
                let op = op.clone();
                thread::spawn(move || {
                    op.fulfill(Ok(0xfeed));
                    op.arrive()
                })
            };
            let won_here = op.arrive();
            let won_there = completer.join().unwrap();
            assert!(won_here ^ won_there);
            if won_here {
                // Completion arrived first; its writes must be visible.
                assert_eq!(op.take().unwrap(), 0xfeed);
            }
        }
    }
}

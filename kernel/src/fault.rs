// SPDX-FileCopyrightText: 2020 Sean Cross <sean@xobs.io>
// SPDX-License-Identifier: Apache-2.0

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};

use crate::error::Result;
use crate::ids::{Page, Pid};
use crate::mmu::FaultCause;
use crate::substrate::{Semaphore, Substrate};

/// One pending page fault, handed from the ISR to a pager worker.
///
/// `wait_sem` is the substrate semaphore the faulting process blocks on
/// (`SPEC_FULL.md` §6); `result` is filled in by the worker before it calls
/// `wait_sem.v()`.
pub struct Fault<S: Substrate> {
    pub pid: Pid,
    pub page: Page,
    pub cause: FaultCause,
    pub wait_sem: S::Semaphore,
    pub result: Mutex<Option<Result<()>>>,
}

/// The shared queue pager workers drain. `pending` is a counting semaphore:
/// one `v()` per enqueued fault, so `pop` blocks a worker until a fault is
/// actually available instead of spinning.
pub struct FaultQueue<S: Substrate> {
    queue: Mutex<VecDeque<Arc<Fault<S>>>>,
    pending: S::Semaphore,
}

impl<S: Substrate> FaultQueue<S> {
    pub fn new(substrate: &S) -> FaultQueue<S> {
        FaultQueue { queue: Mutex::new(VecDeque::new()), pending: substrate.sem_create(0) }
    }

    /// Enqueues `fault` and returns the caller's own handle to it, so the
    /// ISR-side caller can block on `fault.wait_sem` after a worker picks it
    /// up from `pop`.
    pub fn push(&self, fault: Arc<Fault<S>>) {
        self.queue.lock().unwrap().push_back(fault);
        self.pending.v();
    }

    /// Blocks until a fault is enqueued, then returns it.
    pub fn pop(&self) -> Arc<Fault<S>> {
        self.pending.p();
        self.queue
            .lock()
            .unwrap()
            .pop_front()
            .expect("fault queue signaled nonempty but pop found it empty")
    }

    /// Removes every fault currently queued, without blocking. Used by
    /// `PagerService::shutdown` to resolve faults a worker will never get to
    /// service, rather than leaving their faulters parked on `wait_sem`
    /// forever.
    pub fn drain(&self) -> Vec<Arc<Fault<S>>> {
        let mut queue = self.queue.lock().unwrap();
        let drained: Vec<_> = queue.drain(..).collect();
        for _ in 0..drained.len() {
            self.pending.p();
        }
        drained
    }
}

// SPDX-FileCopyrightText: 2020 Sean Cross <sean@xobs.io>
// SPDX-License-Identifier: Apache-2.0

use std::sync::{Arc, Mutex};

use log::{debug, info, warn};

use crate::error::{Error, Result};
use crate::fault::{Fault, FaultQueue};
use crate::frame::FrameManager;
use crate::ids::{Frame, Page, Pid};
use crate::mmu::{AccessFlags, FaultCause, Pte};
use crate::stats::Stats;
use crate::substrate::{Semaphore, Substrate};
use crate::swap::SwapManager;
use crate::MAX_PAGERS;

/// The pager worker pool: owns the fault queue and drives the ten-step
/// fault-servicing sequence of `SPEC_FULL.md` §4.3, dispatching to the
/// frame manager and swap manager it was built with.
pub struct PagerService<S: Substrate> {
    substrate: Arc<S>,
    frames: Arc<FrameManager<S>>,
    swap: Arc<SwapManager<S>>,
    stats: Arc<Stats>,
    queue: Arc<FaultQueue<S>>,
    /// `Some(num_pagers)` once `init` has spawned the worker pool; guards
    /// against a double `init` and tells `shutdown` how many shutdown
    /// sentinels to push.
    state: Mutex<Option<usize>>,
}

impl<S: Substrate> PagerService<S> {
    pub fn new(
        substrate: Arc<S>,
        frames: Arc<FrameManager<S>>,
        swap: Arc<SwapManager<S>>,
        stats: Arc<Stats>,
    ) -> Arc<PagerService<S>> {
        let queue = Arc::new(FaultQueue::new(&*substrate));
        Arc::new(PagerService { substrate, frames, swap, stats, queue, state: Mutex::new(None) })
    }

    /// `PagerInit`: spawns `num_pagers` worker processes and installs the
    /// fault-vector handler. Each worker runs `Self::worker_loop` until it
    /// sees a shutdown sentinel.
    ///
    /// Takes `service: &Arc<Self>` rather than `&self` because every worker
    /// and the fault handler closure need their own owning `Arc` clone to
    /// outlive this call.
    pub fn init(service: &Arc<Self>, num_pagers: usize) -> Result<()> {
        let mut guard = service.state.lock().unwrap();
        if guard.is_some() {
            warn!("PagerInit: already initialized");
            return Err(Error::AlreadyInitialized);
        }
        if num_pagers == 0 || num_pagers > MAX_PAGERS {
            warn!("PagerInit: invalid pager count {}", num_pagers);
            return Err(Error::InvalidNumPagers);
        }

        for index in 0..num_pagers {
            let worker = Arc::clone(service);
            let name = format!("pager-{}", index);
            service.substrate.fork_pager(&name, Box::new(move || worker.worker_loop()));
        }

        let handler_service = Arc::clone(service);
        service.substrate.install_fault_handler(Box::new(move |cause, offset| {
            handler_service.handle_fault(cause, offset);
        }));

        *guard = Some(num_pagers);
        info!("PagerInit: {} pager workers", num_pagers);
        Ok(())
    }

    /// `PagerShutdown`: drains any faults still queued (resolving their
    /// faulters with `NotInitialized` rather than leaving them parked
    /// forever), then pushes one shutdown sentinel per worker so each
    /// `worker_loop` exits `pop` and returns. Once every worker has been sent
    /// its sentinel, the queue and its semaphore are dropped along with this
    /// `PagerService`'s last `Arc`, which is this crate's equivalent of the
    /// substrate-level semaphore teardown in `SPEC_FULL.md` §4.3 — there is
    /// no `sem_destroy` in `Substrate`, only `Drop`.
    pub fn shutdown(&self) -> Result<()> {
        let mut guard = self.state.lock().unwrap();
        let num_pagers = match guard.take() {
            Some(n) => n,
            None => {
                warn!("PagerShutdown: not initialized");
                return Err(Error::NotInitialized);
            }
        };

        let stranded = self.queue.drain();
        for fault in &stranded {
            *fault.result.lock().unwrap() = Some(Err(Error::NotInitialized));
            fault.wait_sem.v();
        }
        if !stranded.is_empty() {
            warn!("PagerShutdown: released {} stranded fault(s)", stranded.len());
        }

        for _ in 0..num_pagers {
            let sentinel = Arc::new(Fault {
                pid: self.substrate.current_pid(),
                page: Page(0),
                cause: FaultCause::Shutdown,
                wait_sem: self.substrate.sem_create(0),
                result: std::sync::Mutex::new(None),
            });
            self.queue.push(sentinel);
        }

        info!("PagerShutdown: {} pager workers signaled", num_pagers);
        Ok(())
    }

    /// Invoked by the substrate, in the faulting process's own context, on
    /// every MMU fault. Enqueues the fault and blocks the process on its
    /// private semaphore until a worker has serviced it (`SPEC_FULL.md` §6).
    /// On an unrecoverable outcome the faulting process is terminated rather
    /// than returned to, matching the substrate's `Terminate` contract.
    fn handle_fault(&self, cause: FaultCause, offset: usize) {
        let pid = self.substrate.current_pid();
        let page_size = self.substrate.page_size();
        let page = Page(offset / page_size);
        let wait_sem = self.substrate.sem_create(0);

        let fault = Arc::new(Fault { pid, page, cause, wait_sem, result: std::sync::Mutex::new(None) });
        self.queue.push(Arc::clone(&fault));

        fault.wait_sem.p();
        let result = fault.result.lock().unwrap().take().expect("pager must set result before v()");
        if let Err(err) = result {
            warn!("handle_fault: pid {} page {} failed: {}", pid.get(), page.0, err);
            self.substrate.terminate(1);
        }
    }

    fn worker_loop(&self) {
        loop {
            let fault = self.queue.pop();
            if fault.cause == FaultCause::Shutdown {
                *fault.result.lock().unwrap() = Some(Ok(()));
                fault.wait_sem.v();
                return;
            }
            let result = self.service_fault(fault.pid, fault.page, fault.cause);
            *fault.result.lock().unwrap() = Some(result);
            fault.wait_sem.v();
        }
    }

    /// Steps 1-10 of `SPEC_FULL.md` §4.3, minus fault validation (handled by
    /// the caller before enqueueing) and the wakeup (handled by the caller
    /// after this returns).
    fn service_fault(&self, pid: Pid, page: Page, cause: FaultCause) -> Result<()> {
        self.stats.with_mut(|s| s.faults += 1);

        if cause == FaultCause::AccessViolation {
            warn!("service_fault: access violation pid {} page {}", pid.get(), page.0);
            return Err(Error::AccessViolation);
        }

        let frame = match self.frames.claim_free((pid, page), &self.stats) {
            Some(frame) => frame,
            None => self.swap.swap_out()?,
        };

        match self.swap.swap_in(pid, page, frame) {
            Ok(()) => {}
            Err(Error::EmptyPage) => {
                if let Err(err) = self.zero_fill(frame) {
                    self.frames.release_busy(frame, &self.stats);
                    return Err(err);
                }
            }
            Err(Error::OutOfSwap) => {
                self.frames.release_busy(frame, &self.stats);
                warn!("service_fault: out of swap for pid {} page {}", pid.get(), page.0);
                return Err(Error::OutOfSwap);
            }
            Err(other) => {
                self.frames.release_busy(frame, &self.stats);
                return Err(other);
            }
        }

        if let Err(err) = self.install_mapping(pid, page, frame) {
            self.frames.release_busy(frame, &self.stats);
            return Err(err);
        }

        // Only now does the frame stop being `busy`: the PTE is installed
        // and its contents are settled, so it's safe for a concurrent
        // `SwapOut` to consider it as a victim.
        self.frames.finalize(frame, (pid, page));
        debug!("service_fault: pid {} page {} -> frame {}", pid.get(), page.0, frame.0);
        Ok(())
    }

    /// Zeroes a freshly allocated frame via the frame manager's scratch
    /// mapping, for pages that have never been written to disk.
    fn zero_fill(&self, frame: Frame) -> Result<()> {
        let caller = self.substrate.current_pid();
        let addr = self.frames.map(caller, frame)?;
        let page_size = self.substrate.page_size();
        // SAFETY: `addr` was just mapped by `self.frames.map` for exactly
        // `page_size` bytes under this caller's exclusive scratch slot.
        unsafe { std::ptr::write_bytes(addr as *mut u8, 0, page_size) };
        self.frames.unmap(caller, frame)
    }

    /// Installs the resident PTE for `(pid, page)` pointing at `frame`, and
    /// marks the frame referenced so the clock algorithm gives it a fair
    /// first pass.
    fn install_mapping(&self, pid: Pid, page: Page, frame: Frame) -> Result<()> {
        let page_table = self.substrate.page_table(pid);
        page_table.set(page, Pte::resident(frame));
        self.substrate.install_page_table(pid, &page_table);
        self.substrate.mmu_set_access(frame, AccessFlags::REF);
        Ok(())
    }
}

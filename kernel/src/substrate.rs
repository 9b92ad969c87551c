// SPDX-FileCopyrightText: 2020 Sean Cross <sean@xobs.io>
// SPDX-License-Identifier: Apache-2.0

//! The substrate boundary: everything §1 of `SPEC_FULL.md` calls out as
//! "assumed correct" and out of scope for this crate. A real embedder
//! implements `Substrate` against its MMU driver, disk driver, and process
//! scheduler; the `mock` module implements it against `std::sync` and an
//! in-memory disk for testing.

use crate::disk::{BlockLocation, DiskGeometry};
use crate::ids::{Frame, Pid};
use crate::mmu::{AccessFlags, FaultCause, PageTableOps};

/// A substrate-provided counting (or binary) semaphore. `p`/`v` name the
/// classic Dijkstra operations, matching the reference kernel's own
/// `P1_P`/`P1_V` naming.
pub trait Semaphore: Send + Sync {
    fn p(&self);
    fn v(&self);
}

/// Everything the frame manager, swap manager, and pager service need from
/// the host kernel. Consumed generically (`<S: Substrate>`) rather than
/// through a trait object, per the "dynamic dispatch is not needed" design
/// note in `SPEC_FULL.md` §9.
pub trait Substrate: Send + Sync + 'static {
    type Semaphore: Semaphore + 'static;
    type PageTable: PageTableOps + Send + Sync + 'static;

    /// `MmuPageSize`.
    fn page_size(&self) -> usize;

    /// `MmuRegion`: base virtual address and page count of the scratch
    /// region `FrameMap` hands pages out of, in the calling process.
    fn mmu_region(&self) -> (usize, usize);

    /// `MmuGetCause`, read for the process currently blocked in the fault
    /// handler's context.
    fn mmu_get_cause(&self) -> FaultCause;

    /// `MmuGetAccess`.
    fn mmu_get_access(&self, frame: Frame) -> AccessFlags;

    /// `MmuSetAccess`.
    fn mmu_set_access(&self, frame: Frame, flags: AccessFlags);

    /// A handle to `pid`'s page table. Cheap; may be cloned/shared freely.
    fn page_table(&self, pid: Pid) -> Self::PageTable;

    /// `MmuSetPageTable`: installs `table` as the *current* process's page
    /// table. The substrate is responsible for knowing which process is
    /// current; this crate only calls it while that process is the caller.
    fn install_page_table(&self, pid: Pid, table: &Self::PageTable);

    /// `DiskSize`.
    fn disk_geometry(&self) -> DiskGeometry;

    /// `DiskRead`, synchronous.
    fn disk_read(&self, location: BlockLocation, buf: &mut [u8]);

    /// `DiskWrite`, synchronous.
    fn disk_write(&self, location: BlockLocation, buf: &[u8]);

    /// `SemCreate`.
    fn sem_create(&self, initial: isize) -> Self::Semaphore;

    /// `GetPid` for the calling context.
    fn current_pid(&self) -> Pid;

    /// `Terminate`: ends the calling process. Never returns.
    fn terminate(&self, code: i32) -> !;

    /// Installs `handler` on the MMU interrupt vector. `handler` receives the
    /// fault cause and the faulting byte offset, and is invoked in the
    /// faulting process's context (see `SPEC_FULL.md` §6).
    fn install_fault_handler(&self, handler: Box<dyn Fn(FaultCause, usize) + Send + Sync>);

    /// `Fork`: creates one pager worker process running `entry`, at pager
    /// priority. Returns once the worker has been scheduled; does not wait
    /// for it to finish.
    fn fork_pager(&self, name: &str, entry: Box<dyn FnOnce() + Send>) -> Pid;
}

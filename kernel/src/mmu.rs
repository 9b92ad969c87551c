// SPDX-FileCopyrightText: 2020 Sean Cross <sean@xobs.io>
// SPDX-License-Identifier: Apache-2.0

use bitflags::bitflags;

use crate::ids::Frame;

bitflags! {
    /// Access bits the MMU maintains per frame. `REF` is set by hardware on
    /// any access and cleared only by the clock algorithm under the
    /// clock-hand mutex (see `swap::SwapManager::swap_out`). `DIRTY` is set
    /// by hardware on a write and cleared only after a successful page-out.
    pub struct AccessFlags: u8 {
        const REF   = 0b01;
        const DIRTY = 0b10;
    }
}

/// The reason the MMU raised a page-fault interrupt.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum FaultCause {
    /// The page is simply not resident; the pager should service it normally.
    NotPresent,
    /// The process touched a page it does not have permission for (e.g. a
    /// write to a read-only mapping). Fatal to the faulter.
    AccessViolation,
    /// Not a real MMU fault: a sentinel `PagerService::shutdown` pushes onto
    /// the fault queue to unblock a worker parked in `pop` so it can exit
    /// `worker_loop` instead of servicing it.
    Shutdown,
}

/// One page-table entry, as owned by the substrate's per-process page table
/// but mutated by this crate under the rules in `SPEC_FULL.md` §4-§5.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Default)]
pub struct Pte {
    pub read: bool,
    pub write: bool,
    pub incore: bool,
    pub frame: Option<Frame>,
}

impl Pte {
    pub const fn empty() -> Pte { Pte { read: false, write: false, incore: false, frame: None } }

    pub fn resident(frame: Frame) -> Pte {
        Pte { read: true, write: true, incore: true, frame: Some(frame) }
    }
}

/// Read/write access to one process's page table. Implementations are
/// expected to be cheap, shareable handles (the reference kernel keeps one
/// page table per process behind its `SystemServices` singleton); this crate
/// never assumes exclusive ownership, only that reads and writes to distinct
/// pages don't tear.
pub trait PageTableOps {
    fn get(&self, page: crate::ids::Page) -> Pte;
    fn set(&self, page: crate::ids::Page, pte: Pte);
    /// Number of pages addressable by this table.
    fn len(&self) -> usize;
    fn is_empty(&self) -> bool { self.len() == 0 }
}

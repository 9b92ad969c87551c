// SPDX-FileCopyrightText: 2020 Sean Cross <sean@xobs.io>
// SPDX-License-Identifier: Apache-2.0

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use log::{debug, info, warn};

use crate::error::{Error, Result};
use crate::ids::{BlockIndex, Frame, Page, Pid};
use crate::mmu::{Pte, PageTableOps};
use crate::stats::Stats;
use crate::substrate::Substrate;

#[derive(Debug, Copy, Clone)]
struct FrameEntry {
    owner: Option<(Pid, Page)>,
    busy: bool,
    /// The swap block backing this frame's page, if any. Cached here (rather
    /// than looked up by owner in the swap table) so `SwapManager::swap_out`
    /// can read it while holding only the clock-hand and frame-table
    /// mutexes, without acquiring the swap-table mutex out of order.
    block: Option<BlockIndex>,
}

impl FrameEntry {
    const fn unowned() -> FrameEntry { FrameEntry { owner: None, busy: false, block: None } }
}

struct FrameTable {
    entries: Vec<FrameEntry>,
    /// Scratch mappings created by `FrameMap`, keyed by the mapping caller's
    /// pid and the frame, so `FrameUnmap` can reject a caller that never
    /// held this particular mapping (`Error::FrameNotMapped`).
    scratch: HashMap<(Pid, Frame), Page>,
}

/// Owns the fixed pool of physical frames and the transient scratch-map
/// primitives pagers use to touch frame contents during swap I/O.
///
/// See `SPEC_FULL.md` §4.1. The frame-table lock here is the "frame-table"
/// mutex named throughout §5's lock-ordering discussion.
pub struct FrameManager<S: Substrate> {
    substrate: Arc<S>,
    table: Mutex<Option<FrameTable>>,
}

impl<S: Substrate> FrameManager<S> {
    pub fn new(substrate: Arc<S>) -> Arc<FrameManager<S>> {
        Arc::new(FrameManager { substrate, table: Mutex::new(None) })
    }

    /// `FrameInit`.
    pub fn init(&self, frames: usize, stats: &Stats) -> Result<()> {
        let mut guard = self.table.lock().unwrap();
        if guard.is_some() {
            warn!("FrameInit: already initialized");
            return Err(Error::AlreadyInitialized);
        }
        *guard = Some(FrameTable { entries: vec![FrameEntry::unowned(); frames], scratch: HashMap::new() });
        stats.with_mut(|s| {
            s.frames = frames;
            s.free_frames = frames;
        });
        info!("FrameInit: {} frames", frames);
        Ok(())
    }

    /// `FrameShutdown`.
    pub fn shutdown(&self) -> Result<()> {
        let mut guard = self.table.lock().unwrap();
        if guard.take().is_none() {
            warn!("FrameShutdown: not initialized");
            return Err(Error::NotInitialized);
        }
        info!("FrameShutdown");
        Ok(())
    }

    fn locked(guard: &mut Option<FrameTable>) -> Result<&mut FrameTable> {
        guard.as_mut().ok_or(Error::NotInitialized)
    }

    /// `FrameFreeAll`: releases every frame owned by `pid`, clearing the
    /// corresponding PTEs in its page table.
    pub fn free_all(&self, pid: Pid, stats: &Stats) -> Result<()> {
        let mut guard = self.table.lock().unwrap();
        if guard.is_none() {
            warn!("FrameFreeAll: not initialized");
            return Err(Error::NotInitialized);
        }
        let table = guard.as_mut().unwrap();
        let page_table = self.substrate.page_table(pid);
        let mut released = 0usize;
        for entry in table.entries.iter_mut() {
            if let Some((owner_pid, page)) = entry.owner {
                if owner_pid == pid {
                    let mut pte = page_table.get(page);
                    pte.incore = false;
                    pte.frame = None;
                    page_table.set(page, pte);
                    entry.owner = None;
                    entry.busy = false;
                    entry.block = None;
                    released += 1;
                }
            }
        }
        table.scratch.retain(|(owner, _), _| *owner != pid);
        stats.with_mut(|s| s.free_frames += released);
        debug!("FrameFreeAll: pid {} released {} frames", pid.get(), released);
        Ok(())
    }

    /// `FrameMap`: temporarily maps `frame` into the calling process's
    /// address space at the lowest-indexed page whose PTE is not `incore`.
    pub fn map(&self, caller: Pid, frame: Frame) -> Result<usize> {
        let mut guard = self.table.lock().unwrap();
        let table = Self::locked(&mut guard)?;
        if frame.0 >= table.entries.len() {
            return Err(Error::InvalidFrame);
        }

        let page_table = self.substrate.page_table(caller);
        let slot = (0..page_table.len())
            .map(Page)
            .find(|page| !page_table.get(*page).incore)
            .ok_or(Error::OutOfPages)?;

        page_table.set(slot, Pte::resident(frame));
        self.substrate.install_page_table(caller, &page_table);
        table.scratch.insert((caller, frame), slot);

        let (base, _npages) = self.substrate.mmu_region();
        let addr = base + slot.0 * self.substrate.page_size();
        Ok(addr)
    }

    /// `FrameUnmap`: reverses a prior `FrameMap` by the same caller.
    pub fn unmap(&self, caller: Pid, frame: Frame) -> Result<()> {
        let mut guard = self.table.lock().unwrap();
        let table = Self::locked(&mut guard)?;
        if frame.0 >= table.entries.len() {
            return Err(Error::InvalidFrame);
        }
        let slot = table.scratch.remove(&(caller, frame)).ok_or(Error::FrameNotMapped)?;

        let page_table = self.substrate.page_table(caller);
        page_table.set(slot, Pte::empty());
        self.substrate.install_page_table(caller, &page_table);
        Ok(())
    }

    /// Claims the first unowned, non-busy frame without going through the
    /// clock algorithm. Used by the pager when `free_frames > 0`
    /// (`SPEC_FULL.md` §4.3 step 4). Returns `None` if no such frame exists.
    pub(crate) fn claim_free(&self, owner: (Pid, Page), stats: &Stats) -> Option<Frame> {
        let mut guard = self.table.lock().unwrap();
        let table = guard.as_mut()?;
        let index = table.entries.iter().position(|e| e.owner.is_none() && !e.busy)?;
        table.entries[index] = FrameEntry { owner: Some(owner), busy: true, block: None };
        stats.with_mut(|s| s.free_frames -= 1);
        Some(Frame(index))
    }

    /// Finalizes a frame after swap-in: records its new owner and clears
    /// `busy` (`SPEC_FULL.md` §4.3 step 9). Leaves `block` as-is: `swap_in`
    /// already cached it via `set_block` before this is called.
    pub(crate) fn finalize(&self, frame: Frame, owner: (Pid, Page)) {
        let mut guard = self.table.lock().unwrap();
        if let Some(table) = guard.as_mut() {
            if let Some(entry) = table.entries.get_mut(frame.0) {
                entry.owner = Some(owner);
                entry.busy = false;
            }
        }
    }

    /// Caches the swap block backing this frame's current page, so
    /// `SwapManager::swap_out`'s page-out step can find it without consulting
    /// the swap table.
    pub(crate) fn set_block(&self, frame: Frame, block: BlockIndex) {
        let mut guard = self.table.lock().unwrap();
        if let Some(table) = guard.as_mut() {
            if let Some(entry) = table.entries.get_mut(frame.0) {
                entry.block = Some(block);
            }
        }
    }

    /// Reads the swap block cached by `set_block`, if any.
    pub(crate) fn get_block(&self, frame: Frame) -> Option<BlockIndex> {
        let guard = self.table.lock().unwrap();
        guard.as_ref()?.entries.get(frame.0)?.block
    }

    /// Releases a busy frame back to the free pool without finalizing an
    /// owner (`SPEC_FULL.md` §4.3 step 7, the `OutOfSwap` path).
    pub(crate) fn release_busy(&self, frame: Frame, stats: &Stats) {
        let mut guard = self.table.lock().unwrap();
        if let Some(table) = guard.as_mut() {
            if let Some(entry) = table.entries.get_mut(frame.0) {
                *entry = FrameEntry::unowned();
            }
        }
        stats.with_mut(|s| s.free_frames += 1);
    }

    /// Clears `busy` on a frame claimed by `try_claim_victim` without
    /// changing its owner. Used by the clock algorithm's second-chance case,
    /// where a referenced frame is put back into rotation untouched.
    pub(crate) fn release_busy_keep_owner(&self, index: usize) {
        let mut guard = self.table.lock().unwrap();
        if let Some(table) = guard.as_mut() {
            if let Some(entry) = table.entries.get_mut(index) {
                entry.busy = false;
            }
        }
    }

    /// Number of frames, for `SwapManager`'s clock algorithm.
    pub(crate) fn len(&self) -> Result<usize> {
        let guard = self.table.lock().unwrap();
        Ok(guard.as_ref().ok_or(Error::NotInitialized)?.entries.len())
    }

    /// Atomically claims frame `index` as a victim if it is not already
    /// `busy`: marks it busy and returns its owner. Returns `None` if it was
    /// already busy (the clock algorithm's "skip" case) or out of range.
    /// Called under the clock-hand mutex held by the caller.
    pub(crate) fn try_claim_victim(&self, index: usize) -> Option<Option<(Pid, Page)>> {
        let mut guard = self.table.lock().unwrap();
        let table = guard.as_mut()?;
        let entry = table.entries.get_mut(index)?;
        if entry.busy {
            return None;
        }
        entry.busy = true;
        Some(entry.owner)
    }
}

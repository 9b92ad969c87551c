// SPDX-FileCopyrightText: 2020 Sean Cross <sean@xobs.io>
// SPDX-License-Identifier: Apache-2.0

use std::sync::{Arc, Mutex};

use log::{debug, info, warn};

use crate::disk::block_location;
use crate::error::{Error, Result};
use crate::frame::FrameManager;
use crate::ids::{BlockIndex, Frame, Page, Pid};
use crate::mmu::{AccessFlags, PageTableOps};
use crate::stats::Stats;
use crate::substrate::Substrate;

#[derive(Debug, Copy, Clone)]
struct SwapEntry {
    owner: Option<(Pid, Page)>,
}

impl SwapEntry {
    const fn unowned() -> SwapEntry { SwapEntry { owner: None } }
}

struct SwapState {
    table: Vec<SwapEntry>,
    sectors_per_page: usize,
}

/// Clock-hand replacement, swap-block allocation, and the disk I/O that
/// moves one page's contents between a frame and its swap block.
///
/// See `SPEC_FULL.md` §4.2. `state` is the "swap-table" mutex and
/// `clock_hand` is the "clock-hand" mutex from §5's lock-ordering table;
/// `frames` gives access to the frame-table mutex owned by `FrameManager`,
/// and `stats` the shared vm-stats mutex. Acquisition always follows
/// swap-table → clock-hand → frame-table → vm-stats.
///
/// `allocated` tracks, per block, whether it has ever actually been written
/// (vs. merely reserved). It is deliberately a narrow, leaf-only lock outside
/// that ordering: §5 has `SwapOut` hold clock-hand through the victim's
/// page-out without ever acquiring swap-table, so the "has this block been
/// written" bit a page-out needs to update can't live behind the swap-table
/// mutex. `allocated` is acquired and released immediately, never itself
/// while holding another lock, so it can't participate in a cycle.
pub struct SwapManager<S: Substrate> {
    substrate: Arc<S>,
    frames: Arc<FrameManager<S>>,
    stats: Arc<Stats>,
    state: Mutex<Option<SwapState>>,
    clock_hand: Mutex<i64>,
    allocated: Mutex<Vec<bool>>,
}

impl<S: Substrate> SwapManager<S> {
    pub fn new(substrate: Arc<S>, frames: Arc<FrameManager<S>>, stats: Arc<Stats>) -> Arc<SwapManager<S>> {
        Arc::new(SwapManager {
            substrate,
            frames,
            stats,
            state: Mutex::new(None),
            clock_hand: Mutex::new(-1),
            allocated: Mutex::new(Vec::new()),
        })
    }

    /// `SwapInit`.
    pub fn init(&self) -> Result<()> {
        let mut guard = self.state.lock().unwrap();
        if guard.is_some() {
            warn!("SwapInit: already initialized");
            return Err(Error::AlreadyInitialized);
        }
        let geometry = self.substrate.disk_geometry();
        let page_size = self.substrate.page_size();
        let sectors_per_page = page_size / geometry.sector_bytes;
        let block_count = geometry.total_bytes() / page_size;

        *guard = Some(SwapState { table: vec![SwapEntry::unowned(); block_count], sectors_per_page });
        *self.clock_hand.lock().unwrap() = -1;
        *self.allocated.lock().unwrap() = vec![false; block_count];
        self.stats.with_mut(|s| {
            s.blocks = block_count;
            s.free_blocks = block_count;
        });
        info!("SwapInit: {} blocks ({} sectors/page)", block_count, sectors_per_page);
        Ok(())
    }

    /// `SwapShutdown`.
    pub fn shutdown(&self) -> Result<()> {
        let mut guard = self.state.lock().unwrap();
        if guard.take().is_none() {
            warn!("SwapShutdown: not initialized");
            return Err(Error::NotInitialized);
        }
        self.allocated.lock().unwrap().clear();
        info!("SwapShutdown");
        Ok(())
    }

    /// `SwapFreeAll`.
    pub fn free_all(&self, pid: Pid) -> Result<()> {
        let mut guard = self.state.lock().unwrap();
        if guard.is_none() {
            warn!("SwapFreeAll: not initialized");
            return Err(Error::NotInitialized);
        }
        let state = guard.as_mut().unwrap();
        let mut allocated = self.allocated.lock().unwrap();
        let mut released = 0usize;
        for (index, entry) in state.table.iter_mut().enumerate() {
            if entry.owner.map(|(p, _)| p) == Some(pid) {
                *entry = SwapEntry::unowned();
                allocated[index] = false;
                released += 1;
            }
        }
        drop(allocated);
        self.stats.with_mut(|s| s.free_blocks += released);
        debug!("SwapFreeAll: pid {} released {} blocks", pid.get(), released);
        Ok(())
    }

    /// `SwapOut`: runs the second-chance clock algorithm to pick a victim
    /// frame, pages it out if dirty, invalidates its PTE, and returns it
    /// `busy`. Holds the clock-hand mutex for the entire search *and* the
    /// subsequent page-out/PTE-invalidation, per `SPEC_FULL.md` §4.2/§5 —
    /// `page_out` below never touches the swap-table mutex, precisely so
    /// this can hold clock-hand throughout without acquiring a lock to its
    /// left.
    pub fn swap_out(&self) -> Result<Frame> {
        let frame_count = self.frames.len()?;
        if frame_count == 0 {
            return Err(Error::NotInitialized);
        }

        let mut hand_guard = self.clock_hand.lock().unwrap();
        let (victim, owner) = loop {
            *hand_guard = (*hand_guard + 1).rem_euclid(frame_count as i64);
            let index = *hand_guard as usize;

            match self.frames.try_claim_victim(index) {
                None => {
                    // frame busy; skip, yielding so a genuinely stuck search
                    // (all frames transiently busy) doesn't spin a core hot.
                    std::thread::yield_now();
                    continue;
                }
                Some(owner) => {
                    let frame = Frame(index);
                    if owner.is_none() {
                        break (frame, owner);
                    }
                    if !self.substrate.mmu_get_access(frame).contains(AccessFlags::REF) {
                        break (frame, owner);
                    }
                    // Give this frame a second chance: clear REF and put it
                    // back in rotation.
                    let access = self.substrate.mmu_get_access(frame);
                    self.substrate.mmu_set_access(frame, access & !AccessFlags::REF);
                    self.frames.release_busy_keep_owner(index);
                }
            }
        };

        if let Some((owner_pid, owner_page)) = owner {
            self.stats.with_mut(|s| s.replaced += 1);
            let access = self.substrate.mmu_get_access(victim);
            if access.contains(AccessFlags::DIRTY) {
                self.page_out(owner_pid, owner_page, victim)?;
                self.substrate.mmu_set_access(victim, access & !AccessFlags::DIRTY);
            }
            let page_table = self.substrate.page_table(owner_pid);
            let mut pte = page_table.get(owner_page);
            pte.incore = false;
            pte.frame = None;
            page_table.set(owner_page, pte);
            self.substrate.install_page_table(owner_pid, &page_table);
        }

        drop(hand_guard);
        debug!("SwapOut: victim frame {}", victim.0);
        Ok(victim)
    }

    /// Writes the resident page in `frame` out to its already-reserved swap
    /// block. The block index comes from the frame table's cached copy, set
    /// by `swap_in`'s first touch of `(pid, page)`, not from a fresh
    /// swap-table lookup: called from `swap_out` while clock-hand is held,
    /// this must not acquire the swap-table mutex.
    fn page_out(&self, pid: Pid, page: Page, frame: Frame) -> Result<()> {
        let block = self.frames.get_block(frame).unwrap_or_else(|| {
            // A dirty frame whose page has been touched before must already
            // have a cached swap block (SPEC_FULL.md §4.2); this is a
            // bookkeeping invariant violation, not a recoverable error.
            panic!("page-out of ({}, {:?}) with no cached swap block", pid.get(), page)
        });
        let sectors_per_page = {
            let guard = self.state.lock().unwrap();
            guard.as_ref().ok_or(Error::NotInitialized)?.sectors_per_page
        };
        let location = block_location(&self.substrate.disk_geometry(), sectors_per_page, block);
        let page_size = self.substrate.page_size();

        let current = self.substrate.current_pid();
        let addr = self.frames.map(current, frame)?;
        let mut buf = vec![0u8; page_size];
        // SAFETY: `addr` was just mapped by `self.frames.map` for exactly
        // `page_size` bytes, and no other thread may touch this caller's
        // scratch slot while it is held (per-caller keyed in the frame
        // table).
        unsafe { std::ptr::copy_nonoverlapping(addr as *const u8, buf.as_mut_ptr(), page_size) };
        self.substrate.disk_write(location, &buf);
        self.frames.unmap(current, frame)?;

        self.allocated.lock().unwrap()[block.0] = true;
        self.stats.with_mut(|s| s.page_outs += 1);
        Ok(())
    }

    /// `SwapIn`: populates `frame` with the contents of `(pid, page)`,
    /// per the five-way dispatch in `SPEC_FULL.md` §4.2.
    ///
    /// Does not finalize `frame` in the frame table: the frame stays `busy`
    /// until the caller has fully installed the page (zero-filled it on
    /// `EmptyPage`, then written the PTE), so a concurrent `SwapOut` on
    /// another pager can never pick it mid-transfer.
    pub fn swap_in(&self, pid: Pid, page: Page, frame: Frame) -> Result<()> {
        if page.0 >= self.substrate.page_table(pid).len() {
            return Err(Error::InvalidPage);
        }
        if frame.0 >= self.frames.len()? {
            return Err(Error::InvalidFrame);
        }

        let mut guard = self.state.lock().unwrap();
        let state = guard.as_mut().ok_or(Error::NotInitialized)?;

        match state.table.iter().position(|e| e.owner == Some((pid, page))) {
            Some(i) => {
                self.frames.set_block(frame, BlockIndex(i));
                if !self.allocated.lock().unwrap()[i] {
                    return Err(Error::EmptyPage);
                }
                let sectors_per_page = state.sectors_per_page;
                let location =
                    block_location(&self.substrate.disk_geometry(), sectors_per_page, BlockIndex(i));
                let page_size = self.substrate.page_size();

                let current = self.substrate.current_pid();
                let addr = self.frames.map(current, frame)?;
                let mut buf = vec![0u8; page_size];
                self.substrate.disk_read(location, &mut buf);
                // SAFETY: see `page_out`; symmetric scratch mapping.
                unsafe { std::ptr::copy_nonoverlapping(buf.as_ptr(), addr as *mut u8, page_size) };
                self.frames.unmap(current, frame)?;

                self.stats.with_mut(|s| s.page_ins += 1);
                Ok(())
            }
            None => {
                if let Some(i) = state.table.iter().position(|e| e.owner.is_none()) {
                    state.table[i] = SwapEntry { owner: Some((pid, page)) };
                    self.allocated.lock().unwrap()[i] = false;
                    self.frames.set_block(frame, BlockIndex(i));
                    self.stats.with_mut(|s| s.free_blocks -= 1);
                    Err(Error::EmptyPage)
                } else {
                    Err(Error::OutOfSwap)
                }
            }
        }
    }
}

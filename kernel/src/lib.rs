// SPDX-FileCopyrightText: 2020 Sean Cross <sean@xobs.io>
// SPDX-License-Identifier: Apache-2.0

//! Demand-paged virtual memory core: a frame manager, a swap manager running
//! a second-chance clock algorithm, and a pager service that drives both from
//! a worker pool servicing page faults.
//!
//! This crate implements none of the MMU, disk, or scheduling primitives
//! itself; it is generic over a host-provided [`substrate::Substrate`] that
//! supplies them. An embedder wires the three managers together with
//! [`Vm::new`] and drives the usual init/shutdown lifecycle from there.

pub mod disk;
pub mod error;
pub mod fault;
pub mod frame;
pub mod ids;
pub mod mmu;
pub mod pager;
pub mod stats;
pub mod substrate;
pub mod swap;

#[cfg(any(test, feature = "mock"))]
pub mod mock;

#[cfg(test)]
mod vm_tests;

use std::sync::Arc;

pub use error::{Error, Result};
pub use ids::{BlockIndex, Frame, Page, Pid};
pub use stats::VmStats;
pub use substrate::Substrate;

use frame::FrameManager;
use pager::PagerService;
use stats::Stats;
use swap::SwapManager;

/// Maximum number of processes any embedder's substrate may name. Bounds
/// [`ids::Pid`] validation; matches the reference kernel's fixed process
/// table size.
pub const MAX_PROC: usize = 50;

/// Maximum number of pager worker processes [`pager::PagerService::init`]
/// will spawn.
pub const MAX_PAGERS: usize = 8;

/// Ties the frame manager, swap manager, and pager service to one shared
/// [`Stats`] block, mirroring how the reference kernel's boot sequence wires
/// its memory-management singletons together before starting user processes.
pub struct Vm<S: Substrate> {
    pub frames: Arc<FrameManager<S>>,
    pub swap: Arc<SwapManager<S>>,
    pub pager: Arc<PagerService<S>>,
    pub stats: Arc<Stats>,
}

impl<S: Substrate> Vm<S> {
    pub fn new(substrate: Arc<S>) -> Vm<S> {
        let stats = Arc::new(Stats::new());
        let frames = FrameManager::new(Arc::clone(&substrate));
        let swap = SwapManager::new(Arc::clone(&substrate), Arc::clone(&frames), Arc::clone(&stats));
        let pager = PagerService::new(substrate, Arc::clone(&frames), Arc::clone(&swap), Arc::clone(&stats));
        Vm { frames, swap, pager, stats }
    }

    /// Brings up all three subsystems in the lock-ordering-safe sequence:
    /// frames before swap (swap's clock algorithm calls into the frame
    /// table) before the pager (which drives both).
    pub fn init(&self, num_frames: usize, num_pagers: usize) -> Result<()> {
        self.frames.init(num_frames, &self.stats)?;
        self.swap.init()?;
        PagerService::init(&self.pager, num_pagers)?;
        Ok(())
    }

    /// Reports a live snapshot of [`VmStats`].
    pub fn stats(&self) -> VmStats { self.stats.snapshot() }

    /// Reclaims every frame and swap block owned by `pid`, e.g. on process
    /// exit.
    pub fn free_all(&self, pid: Pid) -> Result<()> {
        self.frames.free_all(pid, &self.stats)?;
        self.swap.free_all(pid)?;
        Ok(())
    }
}

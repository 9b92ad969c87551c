// SPDX-FileCopyrightText: 2020 Sean Cross <sean@xobs.io>
// SPDX-License-Identifier: Apache-2.0

use std::sync::Mutex;

/// Shared counters, guarded by a dedicated mutex per `SPEC_FULL.md` §3. This
/// is the "vm-stats" lock in the §5 acquisition order: always taken last.
#[derive(Debug, Default, Copy, Clone)]
pub struct VmStats {
    pub frames: usize,
    pub free_frames: usize,
    pub blocks: usize,
    pub free_blocks: usize,
    pub page_ins: u64,
    pub page_outs: u64,
    pub replaced: u64,
    pub faults: u64,
}

pub struct Stats {
    inner: Mutex<VmStats>,
}

impl Stats {
    pub fn new() -> Stats { Stats { inner: Mutex::new(VmStats::default()) } }

    pub fn snapshot(&self) -> VmStats { *self.inner.lock().unwrap() }

    pub fn with_mut<F, R>(&self, f: F) -> R
    where
        F: FnOnce(&mut VmStats) -> R,
    {
        f(&mut self.inner.lock().unwrap())
    }
}

impl Default for Stats {
    fn default() -> Self { Self::new() }
}

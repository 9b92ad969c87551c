// SPDX-FileCopyrightText: 2020 Sean Cross <sean@xobs.io>
// SPDX-License-Identifier: Apache-2.0

use core::num::NonZeroU32;

use crate::error::{Error, Result};
use crate::MAX_PROC;

/// A process identifier. `Pid` is 1-indexed, mirroring the substrate's own
/// process table, so that `0` is never a valid value and can be used as a
/// sentinel by embedders that still speak in raw integers.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Pid(NonZeroU32);

impl Pid {
    pub fn new(raw: u32) -> Result<Pid> {
        if raw == 0 || raw as usize >= MAX_PROC {
            return Err(Error::InvalidPid);
        }
        Ok(Pid(NonZeroU32::new(raw).unwrap()))
    }

    pub fn get(self) -> u32 { self.0.get() }
}

/// A virtual page number within a process's address space.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub struct Page(pub usize);

/// A physical frame index within the frame pool.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub struct Frame(pub usize);

/// An index into the swap table; also the block's disk identity (see
/// `swap::block_location`).
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub struct BlockIndex(pub usize);

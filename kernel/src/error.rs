// SPDX-FileCopyrightText: 2020 Sean Cross <sean@xobs.io>
// SPDX-License-Identifier: Apache-2.0

use core::fmt;

/// Stable error codes returned by the frame manager, swap manager, and pager
/// service. `Success` has no variant here: it is the `Ok(())` arm of the
/// `Result` alias below.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum Error {
    /// `*Init` called a second time without an intervening `*Shutdown`.
    AlreadyInitialized,
    /// An operation was attempted before `*Init` or after `*Shutdown`.
    NotInitialized,
    /// `PagerInit` was given a `num_pagers` outside `1..=MAX_PAGERS`.
    InvalidNumPagers,
    /// A `Pid` outside `1..=MAX_PROC` was supplied.
    InvalidPid,
    /// A page index outside the process's page-table range was supplied.
    InvalidPage,
    /// A frame index outside `0..frames` was supplied.
    InvalidFrame,
    /// The caller's page table has no free slot for a scratch mapping.
    OutOfPages,
    /// Every swap block is allocated; the faulting process cannot be serviced.
    OutOfSwap,
    /// Non-fatal: the page was reserved but never written. Caller must zero it.
    EmptyPage,
    /// `FrameUnmap` was called on a frame the caller never mapped.
    FrameNotMapped,
    /// The MMU reported `FaultCause::AccessViolation`; the faulter is terminated.
    AccessViolation,
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let msg = match self {
            Error::AlreadyInitialized => "subsystem already initialized",
            Error::NotInitialized => "subsystem not initialized",
            Error::InvalidNumPagers => "invalid number of pagers",
            Error::InvalidPid => "invalid pid",
            Error::InvalidPage => "invalid page",
            Error::InvalidFrame => "invalid frame",
            Error::OutOfPages => "caller has no free page-table slot",
            Error::OutOfSwap => "no free swap blocks remain",
            Error::EmptyPage => "page reserved but never written",
            Error::FrameNotMapped => "frame was not mapped by this caller",
            Error::AccessViolation => "access violation",
        };
        f.write_str(msg)
    }
}

impl std::error::Error for Error {}

pub type Result<T> = core::result::Result<T, Error>;

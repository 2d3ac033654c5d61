//! # Page-Fault Resolution
//!
//! The supervisor trap path lands here with a faulting virtual address and
//! the kind of access that caused it. Two classes of fault are repaired in
//! place, invisibly to the process:
//!
//! - **Copy-on-write**: a store hit a page shared by a fork (valid, tagged
//!   [`PteFlags::COW`](lark_vmem::PteFlags::COW), write-protected). The
//!   resolver gives the faulting side a private writable copy, or, when it
//!   holds the last reference anyway, simply restores write permission.
//! - **Lazy allocation**: an access hit a page inside the process image
//!   that was promised by `sbrk` but never materialized (no entry at all).
//!   The resolver maps a zero frame there.
//!
//! Everything else (out of range, below the stack guard, a genuine
//! permission violation) terminates the process.

#![cfg_attr(not(any(test, doctest)), no_std)]
#![allow(unsafe_code)]

mod access;
mod vm;

pub use access::AccessKind;
pub use vm::{FaultResolution, ProcessVm};

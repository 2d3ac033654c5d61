//! # Sv39 Page Tables
//!
//! Per-process virtual address spaces on the RISC-V Sv39 translation
//! scheme.
//!
//! ## Sv39 Virtual Address → Physical Address Walk
//!
//! Each 39-bit virtual address is divided into four fields:
//!
//! ```text
//! | 38‒30 | 29‒21 | 20‒12 | 11‒0   |
//! | VPN2  | VPN1  | VPN0  | Offset |
//! ```
//!
//! The MMU uses the three VPN fields as **indices** into three levels of
//! page tables, each a 4 KiB frame of 512 eight-byte entries:
//!
//! ```text
//!  root (VPN2) → mid (VPN1) → leaf (VPN0) → physical frame + offset
//! ```
//!
//! A valid entry with any of R/W/X set is a **leaf** and terminates the
//! walk; a valid entry with none of them points at the next table. Only
//! 4 KiB leaves at the last level are used here; no superpages.
//!
//! Bit 38 is kept clear, so the usable space is the low 256 GiB
//! ([`MAX_VA`](lark_info::memory::MAX_VA)) and the sign-extension rule for
//! canonical Sv39 addresses never comes into play.
//!
//! ## Copy-on-write
//!
//! [`AddressSpace::copy_into`] clones a space for fork without copying page
//! contents: both sides end up with read-only leaves tagged
//! [`PteFlags::COW`] pointing at the same frames, each frame's reference
//! count raised by one. The store-fault path undoes the tag one page at a
//! time.
//!
//! All frames are reached through the
//! [`PhysMapper`](lark_addr::PhysMapper) seam, so the whole crate runs
//! against simulated RAM in the test suite.

#![cfg_attr(not(any(test, doctest)), no_std)]
#![allow(unsafe_code)]

mod address_space;
mod page_table;
mod pte;

pub use address_space::AddressSpace;
pub use page_table::{PageTable, VpnIndex};
pub use pte::{Pte, PteFlags};

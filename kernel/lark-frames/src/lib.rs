//! # Physical Frame Allocator
//!
//! Owns every 4 KiB frame between the end of the kernel image and the
//! physical memory ceiling, and hands them out whole. Two pieces of state:
//!
//! - one free pool per CPU, each a singly-linked list threaded through the
//!   free frames themselves and protected by its own spinlock, and
//! - one dense reference-count table covering all of RAM, behind a single
//!   separate lock.
//!
//! A frame is on exactly one pool's list when its count is 0, and on no
//! list while its count is ≥ 1; [`FrameAllocator::alloc`] hands frames out
//! at count 1, COW setup raises the count with [`FrameAllocator::share`],
//! and [`FrameAllocator::release`] drops one reference, recycling the frame
//! when the last one goes.
//!
//! Per-CPU pools exist so that the common allocation path (process
//! creation, page faults) never contends on a global lock. A core whose
//! pool runs dry probes the other pools in fixed index order and takes the
//! first frame it finds directly (the frame is not re-homed). Interrupts
//! stay disabled for the whole of every allocate/release sequence, which is
//! also what makes it safe to probe the other pools without holding the
//! local (empty) one.

#![cfg_attr(not(any(test, doctest)), no_std)]
#![allow(unsafe_code)]

mod allocator;
mod free_pool;
mod refcount;

pub use allocator::{ALLOC_FILL, CpuFrames, FREE_FILL, FrameAllocError, FrameAllocator, FrameRegion};

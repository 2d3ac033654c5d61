//! # Boot-time layout and platform constants
//!
//! Everything here is statically known before the first allocation: the
//! physical memory range, the page geometry of the Sv39 translation scheme,
//! and the number of cores. The linker/bootstrap supplies the real kernel
//! image end on hardware; [`memory::KERNEL_IMAGE_END`] is the value baked
//! into the default linker script.

#![cfg_attr(not(any(test, doctest)), no_std)]

pub mod cpu;
pub mod memory;

pub use cpu::CpuId;

//! Kestrel Kernel
//!
//! A small SMP kernel core for x86_64: page allocation, a preemptive thread
//! pool spread over every core, interrupt dispatch and secondary core bring-up.
//!
//! # Architecture
//!
//! The kernel is structured into the following modules:
//! - `arch`: Platform-specific code (serial, descriptor tables, APIC, paging)
//! - `memory`: The page allocator and generational reclamation
//! - `sched`: The thread pool and the pause-the-world lock
//! - `interrupts`: Vectors, device IRQ table and exception reports
//! - `smp`: The bring-up mailbox and the INIT/STARTUP handshake
//! - `kernel`: The [`kernel::Kernel`] context tying the above together
//! - `boot`: The boot sequence (bare metal only)
//!
//! Everything above the `arch` glue is plain `no_std` code and is unit tested
//! on the host against a simulated local APIC (see `testutil::sim`).
//!
//! # Safety
//!
//! This is a `#![no_std]` kernel. All unsafe code is documented with safety
//! invariants explaining why the usage is correct.

#![cfg_attr(not(test), no_std)]
#![warn(missing_docs)]

extern crate alloc;

pub mod arch;
pub mod config;
pub mod interrupts;
pub mod kernel;
pub mod keyboard;
pub mod memory;
pub mod sched;
pub mod smp;
pub mod sync;
pub mod testutil;
pub mod timer;

#[cfg(target_os = "none")]
pub mod allocator;
#[cfg(target_os = "none")]
pub mod boot;
#[cfg(target_os = "none")]
pub mod logger;

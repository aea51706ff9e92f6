//! Architecture-specific implementations.
//!
//! Currently supported: x86_64. Hardware glue only builds for the bare-metal
//! target; the CPU primitives below fall back to plain spinning on a host so
//! the kernel core can be unit-tested.

#[cfg(target_arch = "x86_64")]
pub mod x86_64;

#[cfg(target_arch = "x86_64")]
pub use self::x86_64::*;

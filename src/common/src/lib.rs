//! Types shared between the Kestrel kernel and its tooling.

#![cfg_attr(not(test), no_std)]
#![warn(missing_docs)]

pub mod error;
pub mod page;

pub use error::{AllocError, KernelError, SchedError, SmpError, SpinTimeout};
pub use page::PageFlags;

//! Thread scheduling.
//!
//! Threads are switched only at the end of a timer interrupt: the interrupted
//! register image is saved into the running thread's slot and replaced by the
//! image of the next eligible thread on the same core.
//!
//! - `frame`: the register image layout shared with the entry stubs
//! - `thread`: thread construction and per-thread state
//! - `pool`: the shared run-queue and the pause-the-world lock

pub mod frame;
pub mod pool;
pub mod thread;

pub use frame::InterruptFrame;
pub use pool::{PauseGuard, ThreadPool, Tick};
pub use thread::{Stack, Thread};

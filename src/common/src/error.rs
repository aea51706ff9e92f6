//! System-wide error types for Kestrel.
//!
//! Almost every one of these is fatal: the kernel facade turns them into a
//! panic, which halts every core. They exist as values so the components stay
//! testable and so the panic message says exactly what went wrong.

use core::fmt;

/// Page allocator error types.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum AllocError {
    /// No run of free pages is long enough.
    OutOfMemory {
        /// Requested size in bytes.
        requested: usize,
    },
    /// The address is inside the region but is not the start of a live run.
    NotAllocated {
        /// The offending address.
        address: usize,
    },
    /// The address is outside the managed region.
    OutOfRange {
        /// The offending address.
        address: usize,
    },
    /// The allocator was used before `initialize`.
    Uninitialized,
}

impl fmt::Display for AllocError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AllocError::OutOfMemory { requested } => {
                write!(f, "out of memory allocating {} bytes", requested)
            }
            AllocError::NotAllocated { address } => {
                write!(f, "address {:#x} is not the start of an allocation", address)
            }
            AllocError::OutOfRange { address } => {
                write!(f, "address {:#x} is outside the page region", address)
            }
            AllocError::Uninitialized => write!(f, "page allocator not initialized"),
        }
    }
}

/// Scheduler invariant violations.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum SchedError {
    /// The round-robin scan found nothing to run on this core.
    NoEligibleThread {
        /// Logical core id.
        core: u32,
    },
    /// The core id is beyond the cores the pool was sized for.
    CoreOutOfRange {
        /// Logical core id.
        core: u32,
    },
    /// A thread tried to terminate a thread other than itself.
    ForeignTermination {
        /// Index of the targeted thread.
        thread: usize,
        /// Core that issued the request.
        core: u32,
    },
    /// Control came back to a thread after it terminated.
    TerminationReturned,
    /// A core's idle thread was asked to sleep or terminate.
    IdleThread {
        /// Index of the idle thread.
        thread: usize,
    },
    /// `unlock` was called by a core that does not hold the pool lock.
    NotLockHolder {
        /// Logical core id.
        core: u32,
    },
    /// The pool was used before the boot core initialized it.
    NotInitialized,
    /// The thread index does not exist.
    NoSuchThread {
        /// Index into the thread list.
        thread: usize,
    },
    /// The pool lock was not released within the spin bound.
    LockTimeout {
        /// Core that was waiting.
        core: u32,
    },
}

impl fmt::Display for SchedError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SchedError::NoEligibleThread { core } => {
                write!(f, "no eligible thread on core {}", core)
            }
            SchedError::CoreOutOfRange { core } => write!(f, "core {} out of range", core),
            SchedError::ForeignTermination { thread, core } => write!(
                f,
                "core {} tried to terminate thread {} it is not running",
                core, thread
            ),
            SchedError::TerminationReturned => {
                write!(f, "terminated thread resumed execution")
            }
            SchedError::IdleThread { thread } => {
                write!(f, "thread {} is an idle thread and must stay runnable", thread)
            }
            SchedError::NotLockHolder { core } => {
                write!(f, "core {} released a pool lock it does not hold", core)
            }
            SchedError::NotInitialized => write!(f, "thread pool not initialized"),
            SchedError::NoSuchThread { thread } => write!(f, "no thread at index {}", thread),
            SchedError::LockTimeout { core } => {
                write!(f, "core {} timed out waiting for the pool lock", core)
            }
        }
    }
}

/// Multiprocessor bring-up failures.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum SmpError {
    /// Bring-up was started on a core other than logical core 0.
    BootstrapNotCoreZero {
        /// Hardware id of the calling core.
        core: u32,
    },
    /// A secondary core never reported in.
    HandshakeTimeout {
        /// Hardware id of the silent core.
        core: u32,
    },
}

impl fmt::Display for SmpError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SmpError::BootstrapNotCoreZero { core } => {
                write!(f, "bootstrap core is {}, expected 0", core)
            }
            SmpError::HandshakeTimeout { core } => {
                write!(f, "core {} did not answer the startup handshake", core)
            }
        }
    }
}

/// A bounded busy-wait ran out of iterations.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SpinTimeout {
    /// What was being waited for.
    pub what: &'static str,
    /// The bound that was exceeded.
    pub iterations: u64,
}

impl fmt::Display for SpinTimeout {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "gave up waiting for {} after {} iterations",
            self.what, self.iterations
        )
    }
}

/// Any kernel core error.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum KernelError {
    /// Page allocator failure.
    Alloc(AllocError),
    /// Scheduler invariant violation.
    Sched(SchedError),
    /// Bring-up failure.
    Smp(SmpError),
    /// Bounded spin exceeded.
    Spin(SpinTimeout),
}

impl fmt::Display for KernelError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            KernelError::Alloc(e) => write!(f, "allocator: {}", e),
            KernelError::Sched(e) => write!(f, "scheduler: {}", e),
            KernelError::Smp(e) => write!(f, "smp: {}", e),
            KernelError::Spin(e) => write!(f, "spin: {}", e),
        }
    }
}

impl From<AllocError> for KernelError {
    fn from(e: AllocError) -> Self {
        KernelError::Alloc(e)
    }
}

impl From<SchedError> for KernelError {
    fn from(e: SchedError) -> Self {
        KernelError::Sched(e)
    }
}

impl From<SmpError> for KernelError {
    fn from(e: SmpError) -> Self {
        KernelError::Smp(e)
    }
}

impl From<SpinTimeout> for KernelError {
    fn from(e: SpinTimeout) -> Self {
        KernelError::Spin(e)
    }
}

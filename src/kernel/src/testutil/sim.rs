//! Simulated local interrupt controller for host tests.
//!
//! Each OS thread plays one core; [`SimLapic::run_as`] and
//! [`SimLapic::enter_core`] choose which. Every IPI is recorded, and a STARTUP
//! can be wired to a hook that brings the target core to life.

use kestrel_hal::LocalInterruptController;
use std::boxed::Box;
use std::cell::Cell;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;
use std::vec::Vec;

thread_local! {
    static CURRENT_CORE: Cell<u32> = const { Cell::new(0) };
}

/// One recorded inter-processor interrupt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Ipi {
    /// Directed fixed interrupt.
    Fixed {
        /// Sending core.
        from: u32,
        /// Target core.
        to: u32,
        /// Vector.
        vector: u8,
    },
    /// Broadcast to everyone but the sender.
    AllExcludingSelf {
        /// Sending core.
        from: u32,
        /// Vector.
        vector: u8,
    },
    /// Broadcast to everyone.
    AllIncludingSelf {
        /// Sending core.
        from: u32,
        /// Vector.
        vector: u8,
    },
    /// INIT.
    Init {
        /// Target core.
        to: u32,
    },
    /// STARTUP.
    Startup {
        /// Target core.
        to: u32,
        /// Trampoline page.
        page: u8,
    },
}

type StartupHook = Box<dyn Fn(u32) + Send + Sync>;

/// A recording local interrupt controller shared by simulated cores.
pub struct SimLapic {
    cores: u32,
    sent: Mutex<Vec<Ipi>>,
    eois: AtomicUsize,
    timers: Mutex<Vec<(u32, u32, u8)>>,
    startup_hook: Mutex<Option<StartupHook>>,
}

impl SimLapic {
    /// Creates a controller for `cores` cores.
    pub fn new(cores: u32) -> Self {
        Self {
            cores,
            sent: Mutex::new(Vec::new()),
            eois: AtomicUsize::new(0),
            timers: Mutex::new(Vec::new()),
            startup_hook: Mutex::new(None),
        }
    }

    /// Number of simulated cores.
    pub fn cores(&self) -> u32 {
        self.cores
    }

    /// Makes the calling OS thread act as `core` from now on.
    pub fn enter_core(core: u32) {
        CURRENT_CORE.with(|c| c.set(core));
    }

    /// Runs `f` as `core`.
    pub fn run_as<R>(&self, core: u32, f: impl FnOnce() -> R) -> R {
        let previous = CURRENT_CORE.with(|c| c.replace(core));
        let result = f();
        CURRENT_CORE.with(|c| c.set(previous));
        result
    }

    /// Calls `hook(target)` on every STARTUP.
    pub fn on_startup(&self, hook: impl Fn(u32) + Send + Sync + 'static) {
        *self.startup_hook.lock().unwrap() = Some(Box::new(hook));
    }

    /// Everything sent so far.
    pub fn sent(&self) -> Vec<Ipi> {
        self.sent.lock().unwrap().clone()
    }

    /// Vectors broadcast including the sender.
    pub fn broadcasts_including_self(&self) -> Vec<u8> {
        self.sent()
            .into_iter()
            .filter_map(|ipi| match ipi {
                Ipi::AllIncludingSelf { vector, .. } => Some(vector),
                _ => None,
            })
            .collect()
    }

    /// `(sender, vector)` of broadcasts excluding the sender.
    pub fn broadcasts_excluding_self(&self) -> Vec<(u32, u8)> {
        self.sent()
            .into_iter()
            .filter_map(|ipi| match ipi {
                Ipi::AllExcludingSelf { from, vector } => Some((from, vector)),
                _ => None,
            })
            .collect()
    }

    /// Targets of INIT IPIs, in order.
    pub fn inits(&self) -> Vec<u32> {
        self.sent()
            .into_iter()
            .filter_map(|ipi| match ipi {
                Ipi::Init { to } => Some(to),
                _ => None,
            })
            .collect()
    }

    /// `(target, page)` of STARTUP IPIs, in order.
    pub fn startups(&self) -> Vec<(u32, u8)> {
        self.sent()
            .into_iter()
            .filter_map(|ipi| match ipi {
                Ipi::Startup { to, page } => Some((to, page)),
                _ => None,
            })
            .collect()
    }

    /// Number of acknowledged interrupts.
    pub fn eois(&self) -> usize {
        self.eois.load(Ordering::SeqCst)
    }

    /// `(core, initial_count, vector)` of every timer start.
    pub fn timers(&self) -> Vec<(u32, u32, u8)> {
        self.timers.lock().unwrap().clone()
    }

    fn record(&self, ipi: Ipi) {
        self.sent.lock().unwrap().push(ipi);
    }
}

impl LocalInterruptController for SimLapic {
    fn id(&self) -> u32 {
        CURRENT_CORE.with(|c| c.get())
    }

    fn send_interrupt(&self, target: u32, vector: u8) {
        self.record(Ipi::Fixed {
            from: self.id(),
            to: target,
            vector,
        });
    }

    fn send_all_excluding_self(&self, vector: u8) {
        self.record(Ipi::AllExcludingSelf {
            from: self.id(),
            vector,
        });
    }

    fn send_all_including_self(&self, vector: u8) {
        self.record(Ipi::AllIncludingSelf {
            from: self.id(),
            vector,
        });
    }

    fn send_init(&self, target: u32) {
        self.record(Ipi::Init { to: target });
    }

    fn send_startup(&self, target: u32, page: u8) {
        self.record(Ipi::Startup { to: target, page });
        if let Some(hook) = self.startup_hook.lock().unwrap().as_ref() {
            hook(target);
        }
    }

    fn end_of_interrupt(&self) {
        self.eois.fetch_add(1, Ordering::SeqCst);
    }

    fn start_timer(&self, initial_count: u32, vector: u8) {
        let core = self.id();
        self.timers.lock().unwrap().push((core, initial_count, vector));
    }

    fn stop_timer(&self) {
        let core = self.id();
        self.timers.lock().unwrap().retain(|(c, _, _)| *c != core);
    }
}

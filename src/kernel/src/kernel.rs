//! The kernel context.
//!
//! [`Kernel`] owns one instance of every core component: page allocator,
//! thread pool, IRQ table, tick counter and the local interrupt controller.
//! It is created once at boot and lives forever. Component errors that the
//! design treats as fatal are turned into a panic here, which halts every core.

use crate::arch;
use crate::config::{KernelConfig, BOOT_CORE, REGION_PAGES};
use crate::interrupts::{
    Disposition, ExceptionReport, IrqTable, FIRST_IRQ, HALT_VECTOR, SPURIOUS_VECTOR, TIMER_VECTOR,
};
use crate::memory::{PageAllocator, Reclaimed};
use crate::sched::{InterruptFrame, PauseGuard, Stack, Thread, ThreadPool};
use crate::smp::{self, BootData, Mailbox};
use crate::timer::TickCounter;
use core::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use kestrel_common::{KernelError, SchedError, SmpError};
use kestrel_hal::{BlockDevice, LocalInterruptController, NetworkDevice, Timer};
use spin::Mutex;

/// Timer periods a terminated thread waits to be switched away before the
/// termination is declared failed.
const TERMINATION_GRACE_TICKS: usize = 1000;

/// Per-boot kernel state.
pub struct Kernel<L: LocalInterruptController + 'static, const PAGES: usize = REGION_PAGES> {
    config: KernelConfig,
    memory: &'static Mutex<PageAllocator<PAGES>>,
    scheduler: ThreadPool,
    irqs: Mutex<IrqTable>,
    ticks: TickCounter,
    lapic: L,
    thread_start: usize,
    timer_count: AtomicU32,
    halted: AtomicBool,
}

impl<L: LocalInterruptController + 'static, const PAGES: usize> Kernel<L, PAGES> {
    /// Creates the kernel context.
    ///
    /// `memory` must already be initialized. `thread_start` is the address
    /// new threads resume at (see [`Thread::new`]).
    pub fn new(
        config: KernelConfig,
        memory: &'static Mutex<PageAllocator<PAGES>>,
        lapic: L,
        thread_start: usize,
    ) -> Self {
        Self {
            config,
            memory,
            scheduler: ThreadPool::new(config.spin_limit),
            irqs: Mutex::new(IrqTable::new()),
            ticks: TickCounter::new(),
            lapic,
            thread_start,
            timer_count: AtomicU32::new(0),
            halted: AtomicBool::new(false),
        }
    }

    /// Active configuration.
    pub fn config(&self) -> &KernelConfig {
        &self.config
    }

    /// The thread pool.
    pub fn scheduler(&self) -> &ThreadPool {
        &self.scheduler
    }

    /// The local interrupt controller.
    pub fn lapic(&self) -> &L {
        &self.lapic
    }

    /// Ticks counted on the boot core.
    pub fn ticks(&self) -> &TickCounter {
        &self.ticks
    }

    /// Id of the calling core.
    pub fn core_id(&self) -> u32 {
        self.lapic.id()
    }

    // --- memory -----------------------------------------------------------

    /// Allocates `size` bytes of page-granular memory.
    pub fn try_allocate(&self, size: usize) -> Result<usize, KernelError> {
        Ok(arch::without_interrupts(|| self.memory.lock().allocate(size))?)
    }

    /// Allocates `size` bytes. Running out of memory is fatal.
    pub fn allocate(&self, size: usize) -> usize {
        match self.try_allocate(size) {
            Ok(address) => address,
            Err(e) => panic!("{}", e),
        }
    }

    /// Allocates `size` zeroed bytes. Running out of memory is fatal.
    ///
    /// # Safety
    ///
    /// The page region must be mapped at its physical address.
    pub unsafe fn allocate_zeroed(&self, size: usize) -> usize {
        // SAFETY: upheld by the caller.
        let result = arch::without_interrupts(|| unsafe { self.memory.lock().allocate_zeroed(size) });
        match result {
            Ok(address) => address,
            Err(e) => panic!("{}", KernelError::from(e)),
        }
    }

    /// Releases the allocation at `address` and returns the bytes freed.
    ///
    /// Freeing an address that is not a live allocation is fatal in debug
    /// builds and ignored with a warning otherwise.
    pub fn free(&self, address: usize) -> usize {
        match arch::without_interrupts(|| self.memory.lock().free(address)) {
            Ok(bytes) => bytes,
            Err(e) if cfg!(debug_assertions) => panic!("{}", KernelError::from(e)),
            Err(e) => {
                log::warn!("memory: ignored bad free: {}", e);
                0
            }
        }
    }

    /// Moves an allocation into a run of `size` bytes. Fatal on failure.
    ///
    /// # Safety
    ///
    /// The page region must be mapped and nothing may use `address` afterwards.
    pub unsafe fn reallocate(&self, address: usize, size: usize) -> usize {
        // SAFETY: upheld by the caller.
        let result =
            arch::without_interrupts(|| unsafe { self.memory.lock().reallocate(address, size) });
        match result {
            Ok(address) => address,
            Err(e) => panic!("{}", KernelError::from(e)),
        }
    }

    /// Pins the allocation at `address` against reclamation.
    pub fn set_fixed(&self, address: usize) -> Result<(), KernelError> {
        Ok(arch::without_interrupts(|| self.memory.lock().set_fixed(address))?)
    }

    /// Free pages left in the region.
    pub fn free_pages(&self) -> usize {
        arch::without_interrupts(|| self.memory.lock().free_pages())
    }

    /// Frees unpinned runs that went untouched for too many scans, with every
    /// other core paused.
    ///
    /// `accessed(address, pages)` reports and clears whether a run was used
    /// since the previous scan.
    pub fn reclaim(&self, accessed: impl FnMut(usize, usize) -> bool) -> Reclaimed {
        let _paused = self.pause();
        let reclaimed = arch::without_interrupts(|| self.memory.lock().reclaim(accessed));
        if reclaimed.runs != 0 {
            log::info!(
                "memory: reclaimed {} runs, {} KiB",
                reclaimed.runs,
                reclaimed.bytes / 1024
            );
        }
        reclaimed
    }

    /// Reads `count` sectors into a freshly allocated buffer and returns its
    /// address, or `None` if the device reported failure.
    ///
    /// # Safety
    ///
    /// The page region must be mapped at its physical address.
    pub unsafe fn read_sectors<D: BlockDevice>(
        &self,
        device: &mut D,
        sector: u64,
        count: u32,
    ) -> Option<usize> {
        let len = count as usize * D::SECTOR_SIZE;
        let address = self.allocate(len);
        // SAFETY: the run was just allocated, is at least `len` bytes, and
        // the caller guarantees it is mapped.
        let buffer = unsafe { core::slice::from_raw_parts_mut(address as *mut u8, len) };
        if device.read(sector, count, buffer) {
            Some(address)
        } else {
            self.free(address);
            None
        }
    }

    // --- scheduling -------------------------------------------------------

    /// Starts the scheduler on the boot core for the cores in `cores`.
    ///
    /// The calling context becomes core 0's idle thread.
    pub fn start_scheduler(&self, cores: &[u32]) -> Result<usize, KernelError> {
        let core = self.lapic.id();
        if core != BOOT_CORE {
            return Err(SmpError::BootstrapNotCoreZero { core }.into());
        }
        let count = cores.iter().copied().max().map_or(1, |id| id + 1);
        Ok(self.scheduler.initialize_boot(count)?)
    }

    /// Starts the calling core's periodic timer.
    pub fn start_timer(&self, initial_count: u32) {
        self.timer_count.store(initial_count, Ordering::Relaxed);
        self.lapic.start_timer(initial_count, TIMER_VECTOR);
    }

    /// Starts a thread running `entry` on `core`, with a fresh stack.
    pub fn spawn(&self, entry: fn(), core: u32) -> Result<usize, KernelError> {
        let size = self.config.thread_stack_size;
        let base = self.try_allocate(size)?;
        self.set_fixed(base)?;
        let thread = Thread::new(entry, Stack { base, size }, self.thread_start);
        self.scheduler.spawn(thread, core).map_err(|e| {
            arch::without_interrupts(|| {
                let _ = self.memory.lock().free(base);
            });
            KernelError::from(e)
        })
    }

    /// Puts the calling thread to sleep for at least `ms` milliseconds worth of
    /// ticks and returns once it has been scheduled again.
    ///
    /// A core's idle context never sleeps; there this busy-waits like
    /// [`Kernel::wait`].
    pub fn sleep(&self, ms: u64) {
        let core = self.lapic.id();
        let ticks = self.config.ms_to_ticks(ms);
        let thread = match self.scheduler.sleep_current(core, ticks) {
            Ok(thread) => thread,
            Err(SchedError::IdleThread { .. }) => return self.wait(ms),
            Err(e) => panic!("{}", KernelError::from(e)),
        };
        while self.scheduler.sleep_ticks(thread).is_ok_and(|t| t > 0) {
            arch::hlt();
        }
    }

    /// Puts thread `index` to sleep for `ms` milliseconds worth of ticks.
    pub fn sleep_thread(&self, index: usize, ms: u64) -> Result<(), KernelError> {
        Ok(self.scheduler.sleep(index, self.config.ms_to_ticks(ms))?)
    }

    /// Ends the calling thread.
    pub fn terminate_current(&self) -> ! {
        let core = self.lapic.id();
        let thread = self.fatal(self.scheduler.terminate_current(core));
        log::trace!("sched: thread {} terminated on core {}", thread, core);

        self.lapic.send_interrupt(core, TIMER_VECTOR);
        for _ in 0..TERMINATION_GRACE_TICKS {
            arch::hlt();
        }
        panic!("{}", KernelError::from(SchedError::TerminationReturned))
    }

    /// Pauses thread switching on every core until the guard is dropped.
    pub fn pause(&self) -> PauseGuard<'_> {
        let core = self.lapic.id();
        self.fatal(self.scheduler.pause(core, &self.lapic))
    }

    /// Busy-waits on ticks for at least `ms` milliseconds.
    pub fn wait(&self, ms: u64) {
        let target = self
            .ticks
            .current_ticks()
            .saturating_add(self.config.ms_to_ticks(ms));
        while self.ticks.current_ticks() < target {
            arch::hlt();
        }
    }

    // --- interrupts -------------------------------------------------------

    /// Installs a handler for a legacy IRQ line, serviced on the boot core.
    pub fn register_irq(&self, line: u8, handler: fn()) {
        arch::without_interrupts(|| {
            self.irqs.lock().register(line, handler);
        });
    }

    /// Adds a network device serviced on its IRQ line.
    pub fn register_nic(&self, nic: &'static Mutex<dyn NetworkDevice>) {
        arch::without_interrupts(|| self.irqs.lock().register_nic(nic));
    }

    /// Handles interrupt `frame.vector` on `core`.
    ///
    /// `cr2` is the faulting address for page faults. The frame may be
    /// replaced by another thread's before returning [`Disposition::Resume`].
    pub fn handle_interrupt(&self, core: u32, frame: &mut InterruptFrame, cr2: u64) -> Disposition {
        let vector = frame.vector as u8;
        if vector == HALT_VECTOR || self.is_halted() {
            return Disposition::Halt;
        }

        if vector < FIRST_IRQ {
            let report = ExceptionReport::new(core, frame, cr2);
            self.halt_system();
            return Disposition::Fatal(report);
        }

        if vector == SPURIOUS_VECTOR {
            return Disposition::Resume;
        }

        if core == BOOT_CORE {
            if vector == TIMER_VECTOR {
                self.ticks.tick();
            }
            self.irqs.lock().dispatch(vector);
        }

        if vector == TIMER_VECTOR {
            if let Err(e) = self.scheduler.schedule(core, frame) {
                panic!("{}", KernelError::from(e));
            }
        }

        self.lapic.end_of_interrupt();
        Disposition::Resume
    }

    /// Tells every other core to stop. Returns `false` if the system was
    /// already halting.
    pub fn halt_system(&self) -> bool {
        if self.halted.swap(true, Ordering::AcqRel) {
            return false;
        }
        self.lapic.send_all_excluding_self(HALT_VECTOR);
        true
    }

    /// Whether a fatal error has stopped the system.
    pub fn is_halted(&self) -> bool {
        self.halted.load(Ordering::Acquire)
    }

    // --- multiprocessor ---------------------------------------------------

    /// Wakes every secondary core listed in `cores`.
    ///
    /// Allocates the shared stack region, fills the mailbox and runs the
    /// INIT/STARTUP handshake for each core in turn. `boot` supplies the entry
    /// point and descriptor tables; its stack fields are filled in here.
    pub fn bring_up_secondaries(
        &self,
        mailbox: &Mailbox,
        boot: BootData,
        cores: &[u32],
        trampoline_page: u8,
    ) -> Result<usize, KernelError> {
        let stack_size = self.config.secondary_stack_size;
        let stacks = self.try_allocate(smp::stack_region_size(cores, stack_size))?;
        self.set_fixed(stacks)?;

        let boot = BootData {
            stacks: stacks as u64,
            stack_size: stack_size as u64,
            ..boot
        };
        let started = smp::start_secondary_cores(
            &self.lapic,
            mailbox,
            &boot,
            cores,
            trampoline_page,
            self.config.spin_limit,
        )?;
        log::info!("smp: {} cores online", mailbox.activated());
        Ok(started)
    }

    /// First Rust code of a secondary core: report in, join the scheduler and
    /// start the local timer. The caller then idles forever and becomes the
    /// core's idle thread.
    pub fn enter_secondary(&self, mailbox: &Mailbox) -> Result<u32, KernelError> {
        mailbox.mark_active();
        let core = self.lapic.id();
        self.scheduler.initialize_secondary(core)?;
        self.lapic
            .start_timer(self.timer_count.load(Ordering::Relaxed), TIMER_VECTOR);
        Ok(core)
    }

    fn fatal<T>(&self, result: Result<T, SchedError>) -> T {
        match result {
            Ok(value) => value,
            Err(e) => panic!("{}", KernelError::from(e)),
        }
    }
}

#[cfg(target_os = "none")]
mod global {
    use super::Kernel;
    use crate::arch::x86_64::lapic::LocalApic;
    use spin::Once;

    static KERNEL: Once<Kernel<LocalApic>> = Once::new();

    /// Installs the kernel context. Only the first call has an effect.
    pub fn install(kernel: impl FnOnce() -> Kernel<LocalApic>) -> &'static Kernel<LocalApic> {
        KERNEL.call_once(kernel)
    }

    /// The kernel context, once installed.
    pub fn kernel() -> Option<&'static Kernel<LocalApic>> {
        KERNEL.get()
    }

    /// Where every spawned thread starts: runs `entry`, then ends the thread.
    pub extern "C" fn thread_start(entry: fn()) -> ! {
        entry();
        match kernel() {
            Some(kernel) => kernel.terminate_current(),
            None => crate::arch::halt_forever(),
        }
    }
}

#[cfg(target_os = "none")]
pub use global::{install, kernel, thread_start};

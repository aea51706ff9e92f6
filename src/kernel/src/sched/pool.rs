//! The thread pool: per-core round-robin over one shared thread list.
//!
//! Every core runs [`ThreadPool::schedule`] from its timer interrupt. The pool
//! also provides the pause-the-world lock: while one core holds it, every
//! other core that takes a tick spins until it is released and no thread
//! switches anywhere.
//!
//! The shared state sits behind a spin mutex. Interrupt handlers take it
//! directly; thread-context callers take it with interrupts disabled so a
//! tick on the same core can never find it already held.

use super::frame::InterruptFrame;
use super::thread::Thread;
use crate::arch;
use crate::config::BOOT_CORE;
use crate::interrupts::TIMER_VECTOR;
use crate::sync::spin_until;
use alloc::vec;
use alloc::vec::Vec;
use core::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use kestrel_common::SchedError;
use kestrel_hal::LocalInterruptController;
use spin::Mutex;

/// `holder` value while nobody holds the pool lock.
pub const NO_HOLDER: u32 = u32::MAX;

/// What one scheduler tick did.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Tick {
    /// The pool, or this core's part of it, is not running yet.
    NotReady,
    /// This core holds the pool lock; nothing changed.
    HolderReentry,
    /// Another core held the pool lock; this core waited and did not switch.
    WaitedForUnlock,
    /// A thread was selected. `from == to` when the same thread keeps running.
    Switched {
        /// Index of the interrupted thread.
        from: usize,
        /// Index of the thread that resumes.
        to: usize,
    },
}

impl Tick {
    /// Whether a different thread resumes after this tick.
    pub fn is_switch(&self) -> bool {
        matches!(self, Tick::Switched { from, to } if from != to)
    }
}

struct PoolState {
    threads: Vec<Thread>,
    /// Index of the thread each core is running, `None` until the core joins.
    run_index: Vec<Option<usize>>,
}

/// Cooperative round-robin scheduler shared by every core.
pub struct ThreadPool {
    state: Mutex<PoolState>,
    initialized: AtomicBool,
    locked: AtomicBool,
    holder: AtomicU32,
    switches: AtomicU64,
    spin_limit: u64,
}

impl ThreadPool {
    /// Creates an empty, uninitialized pool. `spin_limit` bounds every wait
    /// on the pool lock.
    pub const fn new(spin_limit: u64) -> Self {
        Self {
            state: Mutex::new(PoolState {
                threads: Vec::new(),
                run_index: Vec::new(),
            }),
            initialized: AtomicBool::new(false),
            locked: AtomicBool::new(false),
            holder: AtomicU32::new(NO_HOLDER),
            switches: AtomicU64::new(0),
            spin_limit,
        }
    }

    /// Sets the pool up on the boot core for cores `0..core_count`.
    ///
    /// The calling context becomes core 0's idle thread and must halt forever
    /// once it has finished booting. Returns the idle thread's index.
    pub fn initialize_boot(&self, core_count: u32) -> Result<usize, SchedError> {
        let index = arch::without_interrupts(|| {
            let mut state = self.state.lock();
            state.threads.clear();
            state.run_index = vec![None; core_count.max(1) as usize];
            state.threads.push(Thread::adopted_idle(BOOT_CORE));
            let index = state.threads.len() - 1;
            state.run_index[BOOT_CORE as usize] = Some(index);
            index
        });
        self.locked.store(false, Ordering::Release);
        self.holder.store(NO_HOLDER, Ordering::Release);
        self.initialized.store(true, Ordering::Release);
        log::debug!("sched: pool ready for {} cores", core_count);
        Ok(index)
    }

    /// Joins `core` to the pool. The calling context becomes the core's idle
    /// thread. Returns the idle thread's index.
    pub fn initialize_secondary(&self, core: u32) -> Result<usize, SchedError> {
        if !self.is_initialized() {
            return Err(SchedError::NotInitialized);
        }
        arch::without_interrupts(|| {
            let mut state = self.state.lock();
            let slot = state
                .run_index
                .get(core as usize)
                .copied()
                .ok_or(SchedError::CoreOutOfRange { core })?;
            if let Some(index) = slot {
                return Ok(index);
            }
            state.threads.push(Thread::adopted_idle(core));
            let index = state.threads.len() - 1;
            state.run_index[core as usize] = Some(index);
            Ok(index)
        })
    }

    /// Appends `thread` to the list, pinned to `core`. It first runs when the
    /// round-robin scan on that core reaches it. Returns the thread's index.
    pub fn spawn(&self, mut thread: Thread, core: u32) -> Result<usize, SchedError> {
        if !self.is_initialized() {
            return Err(SchedError::NotInitialized);
        }
        thread.affinity = core;
        arch::without_interrupts(|| {
            let mut state = self.state.lock();
            if core as usize >= state.run_index.len() {
                return Err(SchedError::CoreOutOfRange { core });
            }
            state.threads.push(thread);
            Ok(state.threads.len() - 1)
        })
    }

    /// Runs one scheduler tick for `core`.
    ///
    /// `frame` is the interrupted context. On return it holds the context to
    /// resume, which may belong to a different thread.
    pub fn schedule(&self, core: u32, frame: &mut InterruptFrame) -> Result<Tick, SchedError> {
        if !self.is_initialized() {
            return Ok(Tick::NotReady);
        }

        let mut state = loop {
            if let Some(tick) = self.wait_if_locked(core)? {
                return Ok(tick);
            }
            let state = self.state.lock();
            // the lock flag only goes up while the state mutex is held, so a
            // clear flag here stays clear until this tick is done
            if !self.locked.load(Ordering::Acquire) {
                break state;
            }
        };

        let PoolState {
            threads,
            run_index,
        } = &mut *state;

        let current = match run_index.get(core as usize) {
            None => return Err(SchedError::CoreOutOfRange { core }),
            Some(None) => return Ok(Tick::NotReady),
            Some(Some(index)) => *index,
        };

        // A thread that terminated itself leaves its frame behind.
        if !threads[current].terminated {
            threads[current].frame = *frame;
        }

        let count = threads.len();
        let next = (1..=count)
            .map(|step| (current + step) % count)
            .find(|&index| threads[index].is_eligible(core))
            .ok_or(SchedError::NoEligibleThread { core })?;

        *frame = threads[next].frame;
        run_index[core as usize] = Some(next);

        if core == BOOT_CORE {
            for thread in threads.iter_mut() {
                thread.sleep_ticks = thread.sleep_ticks.saturating_sub(1);
            }
        }

        if next != current {
            self.switches.fetch_add(1, Ordering::Relaxed);
        }
        Ok(Tick::Switched {
            from: current,
            to: next,
        })
    }

    /// Takes the pause-the-world lock for `core` and kicks every core into its
    /// scheduler tick so the others start waiting right away.
    ///
    /// Returns once no other core is inside a tick. The lock is not reentrant.
    pub fn lock(&self, core: u32, lapic: &dyn LocalInterruptController) -> Result<(), SchedError> {
        spin_until(self.spin_limit, "pool lock", || {
            arch::without_interrupts(|| {
                let _state = self.state.lock();
                let acquired = self
                    .locked
                    .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
                    .is_ok();
                if acquired {
                    self.holder.store(core, Ordering::Release);
                }
                acquired
            })
        })
        .map_err(|_| SchedError::LockTimeout { core })?;

        lapic.send_all_including_self(TIMER_VECTOR);
        Ok(())
    }

    /// Releases the pause-the-world lock held by `core`.
    pub fn unlock(&self, core: u32) -> Result<(), SchedError> {
        if !self.is_locked() || self.holder.load(Ordering::Acquire) != core {
            return Err(SchedError::NotLockHolder { core });
        }
        self.holder.store(NO_HOLDER, Ordering::Release);
        self.locked.store(false, Ordering::Release);
        Ok(())
    }

    /// Takes the lock and releases it when the guard is dropped.
    pub fn pause<'a>(
        &'a self,
        core: u32,
        lapic: &dyn LocalInterruptController,
    ) -> Result<PauseGuard<'a>, SchedError> {
        self.lock(core, lapic)?;
        Ok(PauseGuard { pool: self, core })
    }

    /// Marks `thread` terminated. Only the thread currently running on `core`
    /// may be terminated, and only by itself. Idle threads never terminate.
    ///
    /// The caller must force a reschedule afterwards; the thread is never
    /// selected again.
    pub fn terminate(&self, core: u32, thread: usize) -> Result<(), SchedError> {
        arch::without_interrupts(|| {
            let mut state = self.state.lock();
            let current = state
                .run_index
                .get(core as usize)
                .copied()
                .ok_or(SchedError::CoreOutOfRange { core })?;
            if current != Some(thread) {
                return Err(SchedError::ForeignTermination { thread, core });
            }
            let slot = &mut state.threads[thread];
            if slot.is_idle() {
                return Err(SchedError::IdleThread { thread });
            }
            slot.terminated = true;
            Ok(())
        })
    }

    /// Terminates the thread running on `core` and returns its index.
    pub fn terminate_current(&self, core: u32) -> Result<usize, SchedError> {
        let thread = self.current(core)?;
        self.terminate(core, thread)?;
        Ok(thread)
    }

    /// Makes `thread` ineligible for the next `ticks` ticks.
    ///
    /// Idle threads keep their core runnable and refuse to sleep.
    pub fn sleep(&self, thread: usize, ticks: u64) -> Result<(), SchedError> {
        arch::without_interrupts(|| {
            let mut state = self.state.lock();
            let slot = state
                .threads
                .get_mut(thread)
                .ok_or(SchedError::NoSuchThread { thread })?;
            if slot.is_idle() {
                return Err(SchedError::IdleThread { thread });
            }
            slot.sleep_ticks = ticks;
            Ok(())
        })
    }

    /// Puts the thread running on `core` to sleep for `ticks` ticks and
    /// returns its index.
    pub fn sleep_current(&self, core: u32, ticks: u64) -> Result<usize, SchedError> {
        let thread = self.current(core)?;
        self.sleep(thread, ticks)?;
        Ok(thread)
    }

    /// Index of the thread running on `core`.
    pub fn current(&self, core: u32) -> Result<usize, SchedError> {
        if !self.is_initialized() {
            return Err(SchedError::NotInitialized);
        }
        arch::without_interrupts(|| {
            self.state
                .lock()
                .run_index
                .get(core as usize)
                .copied()
                .flatten()
                .ok_or(SchedError::CoreOutOfRange { core })
        })
    }

    /// Remaining sleep ticks of `thread`.
    pub fn sleep_ticks(&self, thread: usize) -> Result<u64, SchedError> {
        self.with_thread(thread, Thread::sleep_ticks)
    }

    /// Whether `thread` has terminated.
    pub fn is_terminated(&self, thread: usize) -> Result<bool, SchedError> {
        self.with_thread(thread, Thread::is_terminated)
    }

    /// Runs `f` on a snapshot of the thread list.
    pub fn inspect<R>(&self, f: impl FnOnce(&[Thread]) -> R) -> R {
        arch::without_interrupts(|| f(&self.state.lock().threads))
    }

    /// Number of threads ever started, terminated ones included.
    pub fn thread_count(&self) -> usize {
        self.inspect(|threads| threads.len())
    }

    /// Number of live threads pinned to `core`.
    pub fn threads_on(&self, core: u32) -> usize {
        self.inspect(|threads| {
            threads
                .iter()
                .filter(|t| t.affinity == core && !t.terminated)
                .count()
        })
    }

    /// Thread switches performed since boot.
    pub fn switches(&self) -> u64 {
        self.switches.load(Ordering::Relaxed)
    }

    /// Whether the boot core has initialized the pool.
    pub fn is_initialized(&self) -> bool {
        self.initialized.load(Ordering::Acquire)
    }

    /// Whether the pause-the-world lock is held.
    pub fn is_locked(&self) -> bool {
        self.locked.load(Ordering::Acquire)
    }

    /// Core holding the pause-the-world lock, if any.
    pub fn holder(&self) -> Option<u32> {
        match self.holder.load(Ordering::Acquire) {
            NO_HOLDER => None,
            core => Some(core),
        }
    }

    fn with_thread<R>(&self, thread: usize, f: impl FnOnce(&Thread) -> R) -> Result<R, SchedError> {
        self.inspect(|threads| threads.get(thread).map(f))
            .ok_or(SchedError::NoSuchThread { thread })
    }

    fn wait_if_locked(&self, core: u32) -> Result<Option<Tick>, SchedError> {
        if !self.is_locked() {
            return Ok(None);
        }
        if self.holder.load(Ordering::Acquire) == core {
            return Ok(Some(Tick::HolderReentry));
        }
        spin_until(self.spin_limit, "pool unlock", || !self.is_locked())
            .map_err(|_| SchedError::LockTimeout { core })?;
        Ok(Some(Tick::WaitedForUnlock))
    }
}

/// Holds the pause-the-world lock until dropped.
pub struct PauseGuard<'a> {
    pool: &'a ThreadPool,
    core: u32,
}

impl PauseGuard<'_> {
    /// Core holding the lock.
    pub fn core(&self) -> u32 {
        self.core
    }
}

impl Drop for PauseGuard<'_> {
    fn drop(&mut self) {
        if let Err(e) = self.pool.unlock(self.core) {
            log::error!("sched: {}", e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sched::thread::Stack;
    use crate::testutil::sim::SimLapic;
    use core::sync::atomic::AtomicUsize;
    use std::sync::Arc;

    fn entry() {}

    fn thread() -> Thread {
        Thread::new(
            entry,
            Stack {
                base: 0x2000_0000,
                size: 0x4000,
            },
            0x1000,
        )
    }

    fn tick(pool: &ThreadPool, core: u32) -> Tick {
        let mut frame = InterruptFrame::for_vector(TIMER_VECTOR);
        pool.schedule(core, &mut frame).unwrap()
    }

    fn resumed(pool: &ThreadPool, core: u32) -> usize {
        match tick(pool, core) {
            Tick::Switched { to, .. } => to,
            other => panic!("unexpected tick {:?}", other),
        }
    }

    #[test]
    fn test_not_ready_before_initialize() {
        let pool = ThreadPool::new(1000);
        assert_eq!(tick(&pool, 0), Tick::NotReady);
        assert_eq!(pool.spawn(thread(), 0), Err(SchedError::NotInitialized));
    }

    #[test]
    fn test_round_robin_within_core() {
        let pool = ThreadPool::new(1000);
        pool.initialize_boot(2).unwrap();
        pool.initialize_secondary(1).unwrap();
        let a = pool.spawn(thread(), 0).unwrap();
        let b = pool.spawn(thread(), 1).unwrap();
        let c = pool.spawn(thread(), 0).unwrap();

        let order: Vec<usize> = (0..6).map(|_| resumed(&pool, 0)).collect();
        assert_eq!(order, vec![a, c, 0, a, c, 0]);
        assert_eq!(resumed(&pool, 1), b);
        assert_eq!(resumed(&pool, 1), 1);
    }

    #[test]
    fn test_every_eligible_thread_runs_within_thread_count_ticks() {
        let pool = ThreadPool::new(1000);
        pool.initialize_boot(2).unwrap();
        pool.initialize_secondary(1).unwrap();
        for core in [0, 1, 0, 0, 1, 0] {
            pool.spawn(thread(), core).unwrap();
        }
        let count = pool.thread_count();
        let on_core_0: Vec<usize> = pool.inspect(|threads| {
            (0..threads.len())
                .filter(|&i| threads[i].affinity() == 0)
                .collect()
        });

        let seen: Vec<usize> = (0..count).map(|_| resumed(&pool, 0)).collect();
        for index in on_core_0 {
            assert!(seen.contains(&index), "thread {} starved", index);
        }
    }

    #[test]
    fn test_frames_are_saved_and_restored() {
        let pool = ThreadPool::new(1000);
        pool.initialize_boot(1).unwrap();
        let worker = pool.spawn(thread(), 0).unwrap();

        // the boot context is adopted as the idle thread
        let mut frame = InterruptFrame::for_vector(TIMER_VECTOR);
        frame.rip = 0xB007;
        pool.schedule(0, &mut frame).unwrap();
        assert_eq!(frame.rip, 0x1000);
        assert_eq!(frame.rdi, entry as usize as u64);

        frame.rip = 0x1234;
        assert_eq!(
            pool.schedule(0, &mut frame).unwrap(),
            Tick::Switched {
                from: worker,
                to: 0
            }
        );
        assert_eq!(frame.rip, 0xB007);

        pool.schedule(0, &mut frame).unwrap();
        assert_eq!(frame.rip, 0x1234);
        assert_eq!(pool.switches(), 3);
    }

    #[test]
    fn test_sleep_excludes_exactly_k_ticks() {
        let pool = ThreadPool::new(1000);
        pool.initialize_boot(1).unwrap();
        let sleeper = pool.spawn(thread(), 0).unwrap();
        assert_eq!(sleeper, 1);

        // tick T
        tick(&pool, 0);
        pool.sleep(sleeper, 50).unwrap();

        for offset in 1..=50 {
            assert_eq!(resumed(&pool, 0), 0, "ran at T+{}", offset);
        }
        assert_eq!(pool.sleep_ticks(sleeper), Ok(0));
        assert_eq!(resumed(&pool, 0), sleeper);
    }

    #[test]
    fn test_sleep_counts_down_only_on_boot_core() {
        let pool = ThreadPool::new(1000);
        pool.initialize_boot(2).unwrap();
        pool.initialize_secondary(1).unwrap();
        let t = pool.spawn(thread(), 1).unwrap();
        pool.sleep(t, 3).unwrap();

        for _ in 0..5 {
            assert_eq!(resumed(&pool, 1), 1);
        }
        assert_eq!(pool.sleep_ticks(t), Ok(3));

        for _ in 0..3 {
            tick(&pool, 0);
        }
        assert_eq!(resumed(&pool, 1), t);
    }

    #[test]
    fn test_self_termination() {
        let pool = ThreadPool::new(1000);
        pool.initialize_boot(1).unwrap();
        let worker = pool.spawn(thread(), 0).unwrap();
        let other = pool.spawn(thread(), 0).unwrap();
        assert_eq!(resumed(&pool, 0), worker);

        assert_eq!(
            pool.terminate(0, other),
            Err(SchedError::ForeignTermination {
                thread: other,
                core: 0
            })
        );

        assert_eq!(pool.terminate_current(0), Ok(worker));
        let mut frame = InterruptFrame::for_vector(TIMER_VECTOR);
        frame.rip = 0xDEAD;
        pool.schedule(0, &mut frame).unwrap();
        assert_eq!(frame.rip, 0x1000);

        // the terminated frame was not saved anywhere
        pool.inspect(|threads| assert!(threads.iter().all(|t| t.frame().rip != 0xDEAD)));
        for _ in 0..4 {
            assert_ne!(resumed(&pool, 0), worker);
        }
        assert_eq!(pool.threads_on(0), 2);
    }

    #[test]
    fn test_idle_thread_cannot_sleep_or_terminate() {
        let pool = ThreadPool::new(1000);
        let idle = pool.initialize_boot(1).unwrap();
        assert_eq!(pool.sleep(idle, 5), Err(SchedError::IdleThread { thread: idle }));
        assert_eq!(
            pool.terminate_current(0),
            Err(SchedError::IdleThread { thread: idle })
        );
        assert_eq!(resumed(&pool, 0), idle);

        // with the only worker asleep the idle thread still has to run
        let worker = pool.spawn(thread(), 0).unwrap();
        pool.sleep(worker, 10).unwrap();
        assert_eq!(
            pool.sleep_current(0, 3),
            Err(SchedError::IdleThread { thread: idle })
        );
        assert_eq!(pool.sleep_ticks(idle), Ok(0));
        for _ in 0..3 {
            assert_eq!(resumed(&pool, 0), idle);
        }
        assert!(!pool.inspect(|threads| threads[idle].is_terminated()));
    }

    #[test]
    fn test_holder_reentry_does_not_switch() {
        let pool = ThreadPool::new(1000);
        let lapic = SimLapic::new(2);
        pool.initialize_boot(2).unwrap();
        pool.spawn(thread(), 0).unwrap();

        pool.lock(0, &lapic).unwrap();
        assert_eq!(lapic.broadcasts_including_self(), vec![TIMER_VECTOR]);
        assert_eq!(pool.holder(), Some(0));
        assert_eq!(tick(&pool, 0), Tick::HolderReentry);

        assert_eq!(pool.unlock(1), Err(SchedError::NotLockHolder { core: 1 }));
        pool.unlock(0).unwrap();
        assert_eq!(pool.holder(), None);
        assert!(tick(&pool, 0).is_switch());
    }

    #[test]
    fn test_waiting_core_times_out_on_stuck_holder() {
        let pool = ThreadPool::new(100);
        let lapic = SimLapic::new(2);
        pool.initialize_boot(2).unwrap();
        pool.initialize_secondary(1).unwrap();
        pool.lock(0, &lapic).unwrap();

        let mut frame = InterruptFrame::default();
        assert_eq!(
            pool.schedule(1, &mut frame),
            Err(SchedError::LockTimeout { core: 1 })
        );
    }

    #[test]
    fn test_pause_guard_releases() {
        let pool = ThreadPool::new(1000);
        let lapic = SimLapic::new(1);
        pool.initialize_boot(1).unwrap();
        {
            let guard = pool.pause(0, &lapic).unwrap();
            assert_eq!(guard.core(), 0);
            assert!(pool.is_locked());
        }
        assert!(!pool.is_locked());
    }

    #[test]
    fn test_no_switch_on_other_cores_while_locked() {
        const CORES: u32 = 4;
        const WINDOWS: usize = 50;
        let pool = Arc::new(ThreadPool::new(u64::MAX));
        let lapic = SimLapic::new(CORES);
        pool.initialize_boot(CORES).unwrap();
        for core in 1..CORES {
            pool.initialize_secondary(core).unwrap();
        }
        for core in 0..CORES {
            pool.spawn(thread(), core).unwrap();
            pool.spawn(thread(), core).unwrap();
        }

        let stop = Arc::new(AtomicBool::new(false));
        let ready = Arc::new(AtomicUsize::new(0));
        let in_tick: Arc<Vec<AtomicBool>> =
            Arc::new((0..CORES).map(|_| AtomicBool::new(false)).collect());
        let mut workers = Vec::new();
        for core in 1..CORES {
            let pool = pool.clone();
            let stop = stop.clone();
            let ready = ready.clone();
            let in_tick = in_tick.clone();
            workers.push(std::thread::spawn(move || {
                let mut waited = 0usize;
                let mut first = true;
                while !stop.load(Ordering::SeqCst) {
                    let mut frame = InterruptFrame::for_vector(TIMER_VECTOR);
                    in_tick[core as usize].store(true, Ordering::SeqCst);
                    let tick = pool.schedule(core, &mut frame).unwrap();
                    in_tick[core as usize].store(false, Ordering::SeqCst);
                    if tick == Tick::WaitedForUnlock {
                        waited += 1;
                    }
                    if first {
                        ready.fetch_add(1, Ordering::SeqCst);
                        first = false;
                    }
                }
                waited
            }));
        }

        // every other core has finished at least one tick
        while ready.load(Ordering::SeqCst) < (CORES - 1) as usize {
            std::hint::spin_loop();
        }
        let switched_before_locking = pool.switches();
        assert!(switched_before_locking > 0);

        for _ in 0..WINDOWS {
            pool.lock(0, &lapic).unwrap();
            let before = pool.switches();
            // a tick that starts while the lock is up cannot finish, so every
            // worker ends up held inside `schedule`
            while !(1..CORES).all(|core| in_tick[core as usize].load(Ordering::SeqCst)) {
                std::hint::spin_loop();
            }
            for _ in 0..10_000 {
                std::hint::spin_loop();
            }
            assert_eq!(pool.switches(), before);
            pool.unlock(0).unwrap();
        }

        // switching resumes once the lock is gone
        let after_locking = pool.switches();
        while pool.switches() == after_locking {
            std::hint::spin_loop();
        }
        stop.store(true, Ordering::SeqCst);
        let waited: usize = workers.into_iter().map(|w| w.join().unwrap()).sum();
        assert!(waited > 0);
    }
}

//! Grace-period tracking for deferred reclamation.
//!
//! A writer that unlinks something reachable by a concurrent reader enqueues
//! its destructor instead of running it immediately. The destructor runs once
//! every CPU has passed a quiescent point after the enqueue, guaranteeing no
//! reader still holds a reference.

use core::sync::atomic::{AtomicU64, AtomicUsize, Ordering};

use spin::Mutex;

/// Function invoked once an enqueued node's grace period has elapsed.
///
/// `chained` is true when the next node in the callback list has the same
/// function pointer, letting a handler that frees a whole list of pages
/// amortize work instead of being called once per page.
pub type RcuFunc = fn(payload: *mut (), chained: bool);

/// Intrusive header embedded in whatever is being freed. The RCU subsystem
/// never allocates; callers own the memory and link it in via this header.
pub struct RcuHead {
    next: *mut RcuHead,
    func: Option<RcuFunc>,
}

impl RcuHead {
    pub const fn new() -> Self {
        RcuHead {
            next: core::ptr::null_mut(),
            func: None,
        }
    }
}

impl Default for RcuHead {
    fn default() -> Self {
        Self::new()
    }
}

// SAFETY: callers that push an `RcuHead` onto a CPU's queue guarantee the
// enclosing object is not mutated again until its callback runs.
unsafe impl Send for RcuHead {}

const MAX_CPUS: usize = 256;
const BITMAP_WORDS: usize = MAX_CPUS / 64;

/// Global grace-period state: which CPUs still owe a quiescent point for the
/// generation currently being waited on.
pub struct Rcu {
    inner: Mutex<RcuInner>,
    num_cpus: AtomicUsize,
}

struct RcuInner {
    bitmap: [u64; BITMAP_WORDS],
    generation: u64,
    highest_generation: u64,
}

impl Rcu {
    pub const fn new() -> Self {
        Rcu {
            inner: Mutex::new(RcuInner {
                bitmap: [0; BITMAP_WORDS],
                generation: 0,
                highest_generation: 0,
            }),
            num_cpus: AtomicUsize::new(0),
        }
    }

    /// Must be called once, after the number of online CPUs is known and
    /// before any `quiet` call.
    pub fn init(&self, num_cpus: usize) {
        assert!(num_cpus <= MAX_CPUS);
        self.num_cpus.store(num_cpus, Ordering::SeqCst);
        let mut inner = self.inner.lock();
        inner.generation = 0;
        inner.highest_generation = 0;
        Self::start_generation_locked(&mut inner, num_cpus);
    }

    fn start_generation_locked(inner: &mut RcuInner, num_cpus: usize) {
        for word in inner.bitmap.iter_mut() {
            *word = 0;
        }
        for cpu in 0..num_cpus {
            inner.bitmap[cpu / 64] |= 1 << (cpu % 64);
        }
    }

    fn cpu_bit_set(inner: &RcuInner, cpu_id: usize) -> bool {
        inner.bitmap[cpu_id / 64] & (1 << (cpu_id % 64)) != 0
    }

    fn silence_cpu(inner: &mut RcuInner, cpu_id: usize) {
        inner.bitmap[cpu_id / 64] &= !(1 << (cpu_id % 64));
    }

    fn generation_complete(inner: &RcuInner) -> bool {
        inner.bitmap.iter().all(|&word| word == 0)
    }

    /// The generation currently being waited on. A callback enqueued before
    /// this call becomes eligible to run once this value advances again.
    pub fn current_generation(&self) -> u64 {
        self.inner.lock().generation
    }

    /// Request a new grace period; returns the generation a callback
    /// enqueued right now must wait for.
    fn note_activity(&self) -> u64 {
        let mut inner = self.inner.lock();
        inner.highest_generation = inner.highest_generation.max(inner.generation + 1);
        inner.generation
    }
}

/// Per-CPU RCU bookkeeping: the two pending callback lists and this CPU's
/// view of the generation counter.
pub struct RcuCpu {
    current_callbacks: *mut RcuHead,
    next_callbacks: *mut RcuHead,
    last_seen_generation: AtomicU64,
}

unsafe impl Send for RcuCpu {}

impl RcuCpu {
    pub const fn new() -> Self {
        RcuCpu {
            current_callbacks: core::ptr::null_mut(),
            next_callbacks: core::ptr::null_mut(),
            last_seen_generation: AtomicU64::new(0),
        }
    }

    /// Enqueue `head` to run after the next grace period. `head` must not be
    /// freed or mutated by the caller until its callback has run.
    pub fn push(&mut self, head: *mut RcuHead, rcu: &Rcu) {
        // SAFETY: `head` points to a live `RcuHead` the caller owns and will
        // not touch again until the callback fires.
        unsafe {
            (*head).next = self.next_callbacks;
        }
        self.next_callbacks = head;
        rcu.note_activity();
    }

    /// Called at a quiescent point (context switch, explicit `quiet()`).
    /// Drains any callbacks whose grace period has elapsed.
    pub fn quiet(&mut self, rcu: &Rcu, my_cpu_id: usize) {
        {
            let mut inner = rcu.inner.lock();
            if Rcu::cpu_bit_set(&inner, my_cpu_id) {
                Rcu::silence_cpu(&mut inner, my_cpu_id);
                if Rcu::generation_complete(&inner) {
                    inner.generation += 1;
                    if inner.highest_generation > inner.generation {
                        let num_cpus = rcu.num_cpus.load(Ordering::SeqCst);
                        Rcu::start_generation_locked(&mut inner, num_cpus);
                    }
                }
            }
        }

        let generation = rcu.current_generation();
        if self.last_seen_generation.load(Ordering::SeqCst) == generation {
            return;
        }
        self.last_seen_generation.store(generation, Ordering::SeqCst);

        // Everything queued while waiting for a prior generation is now safe
        // to run: move `current_callbacks` in front of whatever is left over
        // from an even earlier round, then swap in the freshly-closed batch.
        let mut ready = self.current_callbacks;
        self.current_callbacks = self.next_callbacks;
        self.next_callbacks = core::ptr::null_mut();

        // SAFETY: each node was pushed with a valid `func` and is not touched
        // again until we call it here, exactly once.
        unsafe {
            while !ready.is_null() {
                let node = ready;
                ready = (*node).next;
                let chained = !ready.is_null() && (*ready).func == (*node).func;
                if let Some(func) = (*node).func {
                    func(node as *mut (), chained);
                }
            }
        }
    }
}

impl Default for RcuCpu {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use core::sync::atomic::AtomicUsize;

    static FREED: AtomicUsize = AtomicUsize::new(0);

    fn bump_freed(_payload: *mut (), _chained: bool) {
        FREED.fetch_add(1, Ordering::SeqCst);
    }

    #[test]
    fn single_cpu_grace_period_runs_callback_after_quiet() {
        FREED.store(0, Ordering::SeqCst);
        let rcu = Rcu::new();
        rcu.init(1);
        let mut cpu = RcuCpu::new();

        let mut head = RcuHead::new();
        head.func = Some(bump_freed);
        cpu.push(&mut head as *mut _, &rcu);

        assert_eq!(FREED.load(Ordering::SeqCst), 0);
        cpu.quiet(&rcu, 0);
        assert_eq!(FREED.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn two_cpus_must_both_quiet_before_callback_runs() {
        FREED.store(0, Ordering::SeqCst);
        let rcu = Rcu::new();
        rcu.init(2);
        let mut cpu0 = RcuCpu::new();
        let cpu1 = RcuCpu::new();

        let mut head = RcuHead::new();
        head.func = Some(bump_freed);
        cpu0.push(&mut head as *mut _, &rcu);

        cpu0.quiet(&rcu, 0);
        assert_eq!(FREED.load(Ordering::SeqCst), 0, "cpu1 hasn't quiesced yet");

        let mut cpu1 = cpu1;
        cpu1.quiet(&rcu, 1);
        cpu0.quiet(&rcu, 0);
        assert_eq!(FREED.load(Ordering::SeqCst), 1);
    }
}

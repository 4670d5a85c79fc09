//! TLB shootdown: the cross-CPU protocol a page table uses to invalidate
//! stale translations on every CPU currently running with it, not just the
//! one that made the change.
//!
//! Each page table (and the kernel's own root) keeps two "active CPU" lists,
//! selected by a one-bit generation. A context switch onto a table adds the
//! new CPU to the list for the table's *current* generation; switching away
//! removes it. A shootdown flips the generation and signals every CPU still
//! listed under the old one — each of those CPUs is guaranteed to still be
//! running with the stale mapping, since joining the new generation's list
//! only happens after acknowledging a pending shootdown.

use alloc::vec::Vec;
use core::sync::atomic::{AtomicBool, AtomicU8, AtomicUsize, Ordering};

use shared::memory::addr::{Length, VirtAddress};
use spin::Mutex;

pub const MAX_PAGES: usize = 16;
pub const MAX_RANGES: usize = 4;

/// What a finalized shootdown invalidates on every victim CPU.
#[derive(Clone)]
pub struct ShootdownDescriptor {
    pages: Vec<VirtAddress>,
    ranges: Vec<(VirtAddress, Length)>,
    flush_all: bool,
}

impl ShootdownDescriptor {
    fn apply(&self, backend: &dyn ShootdownBackend) {
        if self.flush_all {
            backend.invalidate_local_all();
            return;
        }
        for &page in &self.pages {
            backend.invalidate_local_page(page);
        }
        for &(base, size) in &self.ranges {
            backend.invalidate_local_range(base, size);
        }
    }
}

/// Scoped, accumulate-then-finalize record of what a single shootdown needs
/// to invalidate. Built while holding the target's region-tree lock;
/// `finalize` is called once, at the end of that critical section.
pub struct TlbShootdownContext {
    pages: Vec<VirtAddress>,
    ranges: Vec<(VirtAddress, Length)>,
    flush_all: bool,
}

impl TlbShootdownContext {
    pub fn new() -> Self {
        TlbShootdownContext {
            pages: Vec::new(),
            ranges: Vec::new(),
            flush_all: false,
        }
    }

    pub fn record_page(&mut self, virt: VirtAddress) {
        if self.flush_all {
            return;
        }
        if self.pages.len() >= MAX_PAGES {
            self.flush_all = true;
            self.pages.clear();
            return;
        }
        self.pages.push(virt);
    }

    pub fn record_range(&mut self, base: VirtAddress, size: Length) {
        if self.flush_all {
            return;
        }
        if self.ranges.len() >= MAX_RANGES {
            self.flush_all = true;
            self.pages.clear();
            self.ranges.clear();
            return;
        }
        self.ranges.push((base, size));
    }

    fn into_descriptor(self) -> ShootdownDescriptor {
        ShootdownDescriptor {
            pages: self.pages,
            ranges: self.ranges,
            flush_all: self.flush_all,
        }
    }
}

impl Default for TlbShootdownContext {
    fn default() -> Self {
        Self::new()
    }
}

/// Collaborator supplying the actual interrupt and invalidation primitives,
/// which are architecture- and scheduler-specific and live outside this
/// subsystem.
pub trait ShootdownBackend: Send + Sync {
    fn send_shootdown_ipi(&self, cpu_id: usize);
    fn invalidate_local_page(&self, virt: VirtAddress);
    fn invalidate_local_range(&self, virt: VirtAddress, size: Length);
    fn invalidate_local_all(&self);
    /// How many CPUs are online right now. While this is `<= 1`, shootdowns
    /// never need to leave the issuing CPU.
    fn online_cpu_count(&self) -> usize;
}

/// The two generation-indexed active-CPU lists one page table (or the kernel
/// root) owns, plus the published descriptor a victim CPU consults on
/// receiving the IPI.
pub struct ActiveCpus {
    lists: [Mutex<Vec<usize>>; 2],
    counts: [AtomicUsize; 2],
    generation: AtomicU8,
    descriptor: Mutex<Option<ShootdownDescriptor>>,
    finalizing: AtomicBool,
}

impl ActiveCpus {
    pub const fn new() -> Self {
        ActiveCpus {
            lists: [Mutex::new(Vec::new()), Mutex::new(Vec::new())],
            counts: [AtomicUsize::new(0), AtomicUsize::new(0)],
            generation: AtomicU8::new(0),
            descriptor: Mutex::new(None),
            finalizing: AtomicBool::new(false),
        }
    }

    fn generation(&self) -> usize {
        self.generation.load(Ordering::Acquire) as usize
    }

    /// Adds `cpu_id` to the list for the table's current generation. Called
    /// on a context switch onto this table.
    pub fn apply_cpu(&self, cpu_id: usize) {
        let gen = self.generation();
        let mut list = self.lists[gen].lock();
        if !list.contains(&cpu_id) {
            list.push(cpu_id);
            self.counts[gen].fetch_add(1, Ordering::AcqRel);
        }
    }

    /// Removes `cpu_id` from the list for the table's current generation.
    /// Called on a context switch away from this table.
    pub fn unapply_cpu(&self, cpu_id: usize) {
        let gen = self.generation();
        let mut list = self.lists[gen].lock();
        if let Some(pos) = list.iter().position(|&c| c == cpu_id) {
            list.swap_remove(pos);
            self.counts[gen].fetch_sub(1, Ordering::AcqRel);
        }
    }

    /// Runs the shootdown protocol for `ctx` against this table. `self_cpu`
    /// is never signaled; the caller is expected to have already applied (or
    /// to apply) the invalidation to its own TLB if it also holds a stale
    /// mapping.
    pub fn finalize(&self, ctx: TlbShootdownContext, backend: &dyn ShootdownBackend, self_cpu: usize) {
        if backend.online_cpu_count() <= 1 {
            // No other CPU can be running with the stale mapping; finalize
            // degenerates to a direct local invalidate.
            ctx.into_descriptor().apply(backend);
            return;
        }

        // Only one shootdown against this table may be in flight, since
        // flipping the generation while another is still waiting on the old
        // one would let active CPUs escape both lists.
        while self
            .finalizing
            .compare_exchange_weak(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            core::hint::spin_loop();
        }

        let old_gen = self.generation();
        let new_gen = old_gen ^ 1;
        let descriptor = ctx.into_descriptor();
        *self.descriptor.lock() = Some(descriptor.clone());

        // A full barrier separates publishing the descriptor and flipping
        // the generation from a victim's eventual counter decrement: no CPU
        // may observe the new generation before the invalidations it
        // implies are visible to it.
        core::sync::atomic::fence(Ordering::SeqCst);
        self.generation.store(new_gen as u8, Ordering::Release);

        let targets: Vec<usize> = self.lists[old_gen]
            .lock()
            .iter()
            .copied()
            .filter(|&cpu| cpu != self_cpu)
            .collect();
        for cpu in targets {
            backend.send_shootdown_ipi(cpu);
        }

        // `self_cpu` itself may still be listed under `old_gen` (it applied
        // this table before the shootdown started); move it over directly
        // since it isn't going to receive its own IPI.
        {
            let mut old_list = self.lists[old_gen].lock();
            if let Some(pos) = old_list.iter().position(|&c| c == self_cpu) {
                old_list.swap_remove(pos);
                self.counts[old_gen].fetch_sub(1, Ordering::AcqRel);
                drop(old_list);
                descriptor.apply(backend);
                let mut new_list = self.lists[new_gen].lock();
                if !new_list.contains(&self_cpu) {
                    new_list.push(self_cpu);
                    self.counts[new_gen].fetch_add(1, Ordering::AcqRel);
                }
            }
        }

        while self.counts[old_gen].load(Ordering::Acquire) != 0 {
            core::hint::spin_loop();
        }

        *self.descriptor.lock() = None;
        self.finalizing.store(false, Ordering::Release);
    }

    /// Called by a CPU on receiving a shootdown IPI for this table: applies
    /// the published invalidation, then moves itself from the old
    /// generation's list to the new one and acknowledges.
    pub fn trigger_shootdown(&self, backend: &dyn ShootdownBackend, my_cpu: usize) {
        let descriptor = self.descriptor.lock().clone();
        let Some(descriptor) = descriptor else {
            return;
        };
        descriptor.apply(backend);

        let new_gen = self.generation();
        let old_gen = new_gen ^ 1;

        let mut old_list = self.lists[old_gen].lock();
        if let Some(pos) = old_list.iter().position(|&c| c == my_cpu) {
            old_list.swap_remove(pos);
            self.counts[old_gen].fetch_sub(1, Ordering::AcqRel);
        }
        drop(old_list);

        let mut new_list = self.lists[new_gen].lock();
        if !new_list.contains(&my_cpu) {
            new_list.push(my_cpu);
            self.counts[new_gen].fetch_add(1, Ordering::AcqRel);
        }
    }
}

impl Default for ActiveCpus {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex as StdMutex;

    struct RecordingBackend {
        online: usize,
        sent_ipis: StdMutex<Vec<usize>>,
        invalidated: StdMutex<Vec<VirtAddress>>,
        flushed_all: StdMutex<usize>,
    }

    impl ShootdownBackend for RecordingBackend {
        fn send_shootdown_ipi(&self, cpu_id: usize) {
            self.sent_ipis.lock().unwrap().push(cpu_id);
        }
        fn invalidate_local_page(&self, virt: VirtAddress) {
            self.invalidated.lock().unwrap().push(virt);
        }
        fn invalidate_local_range(&self, _virt: VirtAddress, _size: Length) {}
        fn invalidate_local_all(&self) {
            *self.flushed_all.lock().unwrap() += 1;
        }
        fn online_cpu_count(&self) -> usize {
            self.online
        }
    }

    #[test]
    fn single_cpu_finalize_invalidates_directly_without_ipis() {
        let backend = RecordingBackend {
            online: 1,
            sent_ipis: StdMutex::new(Vec::new()),
            invalidated: StdMutex::new(Vec::new()),
            flushed_all: StdMutex::new(0),
        };
        let active = ActiveCpus::new();
        let mut ctx = TlbShootdownContext::new();
        ctx.record_page(VirtAddress::from_raw(0x1000));
        active.finalize(ctx, &backend, 0);

        assert!(backend.sent_ipis.lock().unwrap().is_empty());
        assert_eq!(backend.invalidated.lock().unwrap().len(), 1);
    }

    #[test]
    fn overflow_beyond_max_pages_sets_flush_all() {
        let mut ctx = TlbShootdownContext::new();
        for i in 0..(MAX_PAGES + 1) {
            ctx.record_page(VirtAddress::from_raw(0x1000 * i as u64));
        }
        assert!(ctx.flush_all);
        assert!(ctx.pages.is_empty());
    }

    #[test]
    fn finalize_signals_every_other_active_cpu_and_waits_for_ack() {
        use std::sync::Arc;
        use std::thread;

        let backend = Arc::new(RecordingBackend {
            online: 2,
            sent_ipis: StdMutex::new(Vec::new()),
            invalidated: StdMutex::new(Vec::new()),
            flushed_all: StdMutex::new(0),
        });
        let active = Arc::new(ActiveCpus::new());
        active.apply_cpu(0);
        active.apply_cpu(1);

        // Victim CPU: waits for its IPI, then acknowledges. Runs on its own
        // thread since `finalize` busy-waits for exactly this to happen.
        let active_victim = active.clone();
        let backend_victim = backend.clone();
        let victim = thread::spawn(move || loop {
            if backend_victim.sent_ipis.lock().unwrap().contains(&1) {
                active_victim.trigger_shootdown(&*backend_victim, 1);
                break;
            }
            thread::yield_now();
        });

        let ctx = TlbShootdownContext::new();
        active.finalize(ctx, &*backend, 0);
        victim.join().unwrap();

        assert_eq!(active.counts[0].load(Ordering::SeqCst), 0);
    }
}

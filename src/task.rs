//! Fixed-pool task system driving both pipeline phases.
//!
//! The submitting thread is thread index 0, workers are 1..=W. Work is
//! submitted through a frame-scoped [`TaskSystem::scope`]: each
//! [`TaskScope::run`] call splits its partition range into packets of at
//! most `granularity` items, and the scope does not return until every
//! packet has executed. While waiting, the submitter pops and runs packets
//! itself, so it never idles as long as work exists.
//!
//! Every thread owns a cache-line-padded linear scratch arena; allocation
//! is a watermark bump with no atomics and the watermarks rewind together
//! at the start of each frame.

use std::any::Any;
use std::cell::Cell;
use std::collections::VecDeque;
use std::marker::PhantomData;
use std::panic::{self, AssertUnwindSafe};
use std::ptr::NonNull;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;

use parking_lot::{Condvar, Mutex};

/// Packet queue capacity; overflow is a hard error, the queue is sized to
/// the workload rather than applying back-pressure.
pub const MAX_TASK_PACKETS: usize = 1 << 16;

struct Job {
    run: Box<dyn Fn(u32, u32, u32) + Send + Sync + 'static>,
    counter: Arc<AtomicU32>,
}

#[derive(Clone)]
struct Packet {
    job: Arc<Job>,
    begin: u32,
    end: u32,
}

struct Shared {
    queue: Mutex<VecDeque<Packet>>,
    ready: Condvar,
    running: AtomicBool,
    /// First panic payload raised inside a packet; re-raised on the
    /// submitter when the owning scope finishes.
    panic: Mutex<Option<Box<dyn Any + Send + 'static>>>,
    arenas: Box<[PaddedArena]>,
}

impl Shared {
    fn execute(&self, packet: Packet, thread_idx: u32) {
        let result = panic::catch_unwind(AssertUnwindSafe(|| {
            (packet.job.run)(thread_idx, packet.begin, packet.end)
        }));
        if let Err(payload) = result {
            let mut slot = self.panic.lock();
            if slot.is_none() {
                *slot = Some(payload);
            }
        }
        packet.job.counter.fetch_sub(1, Ordering::AcqRel);
    }
}

pub struct TaskSystem {
    shared: Arc<Shared>,
    workers: Vec<JoinHandle<()>>,
}

impl TaskSystem {
    /// Spawn `num_workers` worker threads; the calling thread participates
    /// as thread index 0. `scratch_capacity` is the per-thread arena size
    /// in bytes.
    pub fn new(num_workers: usize, scratch_capacity: usize) -> Self {
        let arenas = (0..num_workers + 1)
            .map(|_| PaddedArena(ScratchArena::with_capacity(scratch_capacity)))
            .collect::<Vec<_>>()
            .into_boxed_slice();

        let shared = Arc::new(Shared {
            queue: Mutex::new(VecDeque::new()),
            ready: Condvar::new(),
            running: AtomicBool::new(true),
            panic: Mutex::new(None),
            arenas,
        });

        let workers = (0..num_workers)
            .map(|i| {
                let shared = Arc::clone(&shared);
                let thread_idx = (i + 1) as u32;
                std::thread::Builder::new()
                    .name(format!("tilerast-worker-{thread_idx}"))
                    .spawn(move || worker_loop(shared, thread_idx))
                    .expect("failed to spawn worker thread")
            })
            .collect();

        log::debug!("task system up: {} workers + submitter", num_workers);
        TaskSystem { shared, workers }
    }

    /// Total threads including the submitter.
    pub fn total_threads(&self) -> usize {
        self.workers.len() + 1
    }

    /// The scratch arena owned by `thread_idx`. Only that thread may
    /// allocate from it.
    pub fn arena(&self, thread_idx: u32) -> &ScratchArena {
        &self.shared.arenas[thread_idx as usize].0
    }

    /// Rewind every thread arena. Must only be called while no tasks are
    /// in flight (between frames).
    pub fn reset_allocators(&self) {
        for arena in self.shared.arenas.iter() {
            arena.0.reset();
        }
    }

    /// Run `f` with a scope that accepts task submissions borrowing from
    /// the caller. The scope waits for every submitted packet to finish
    /// before `scope` returns; a panic from any packet is re-raised here
    /// on the submitting thread.
    pub fn scope<'env, F, R>(&'env self, f: F) -> R
    where
        F: FnOnce(&TaskScope<'env>) -> R,
    {
        let scope = TaskScope {
            sys: self,
            counter: Arc::new(AtomicU32::new(0)),
            _env: PhantomData,
        };
        let result = f(&scope);
        scope.wait();
        result
    }

    fn shutdown_impl(&mut self) {
        self.shared.running.store(false, Ordering::Release);
        {
            let _guard = self.shared.queue.lock();
            self.shared.ready.notify_all();
        }
        for handle in self.workers.drain(..) {
            let _ = handle.join();
        }
        log::debug!("task system shut down");
    }
}

impl Drop for TaskSystem {
    fn drop(&mut self) {
        if !self.workers.is_empty() {
            self.shutdown_impl();
        }
    }
}

fn worker_loop(shared: Arc<Shared>, thread_idx: u32) {
    log::trace!("worker {thread_idx} started");
    loop {
        let packet = {
            let mut queue = shared.queue.lock();
            loop {
                if let Some(packet) = queue.pop_front() {
                    break Some(packet);
                }
                if !shared.running.load(Ordering::Acquire) {
                    break None;
                }
                shared.ready.wait(&mut queue);
            }
        };
        match packet {
            Some(packet) => shared.execute(packet, thread_idx),
            None => break,
        }
    }
    log::trace!("worker {thread_idx} exiting");
}

/// Submission handle passed to the closure of [`TaskSystem::scope`].
pub struct TaskScope<'env> {
    sys: &'env TaskSystem,
    counter: Arc<AtomicU32>,
    _env: PhantomData<&'env mut &'env ()>,
}

impl<'env> TaskScope<'env> {
    /// Enqueue `f` over the partition range `[0, total)`, split into
    /// packets of at most `granularity` items. `f` receives
    /// `(thread_idx, start, end)` and may run on any thread, including the
    /// submitter.
    pub fn run<F>(&self, total: u32, granularity: u32, f: F)
    where
        F: Fn(u32, u32, u32) + Send + Sync + 'env,
    {
        if total == 0 {
            return;
        }
        let granularity = granularity.max(1);

        let run: Box<dyn Fn(u32, u32, u32) + Send + Sync + 'env> = Box::new(f);
        // SAFETY: the closure only has to live until the scope's counter
        // hits zero; both the normal path and the scope's Drop drain the
        // queue and wait for that before the 'env borrow can end.
        let run: Box<dyn Fn(u32, u32, u32) + Send + Sync + 'static> =
            unsafe { std::mem::transmute(run) };
        let job = Arc::new(Job {
            run,
            counter: Arc::clone(&self.counter),
        });

        let num_packets = (total + granularity - 1) / granularity;
        self.counter.fetch_add(num_packets, Ordering::AcqRel);

        let mut queue = self.sys.shared.queue.lock();
        for p in 0..num_packets {
            let begin = p * granularity;
            let end = total.min(begin + granularity);
            assert!(
                queue.len() < MAX_TASK_PACKETS,
                "task queue overflow ({MAX_TASK_PACKETS} packets)"
            );
            queue.push_back(Packet {
                job: Arc::clone(&job),
                begin,
                end,
            });
            self.sys.shared.ready.notify_one();
        }
    }

    /// Drain packets cooperatively until everything submitted through this
    /// scope has completed.
    fn drain(&self) {
        while self.counter.load(Ordering::Acquire) != 0 {
            let packet = self.sys.shared.queue.lock().pop_front();
            match packet {
                Some(packet) => self.sys.shared.execute(packet, 0),
                None => std::thread::yield_now(),
            }
        }
    }

    fn wait(&self) {
        self.drain();
        if let Some(payload) = self.sys.shared.panic.lock().take() {
            panic::resume_unwind(payload);
        }
    }
}

impl Drop for TaskScope<'_> {
    fn drop(&mut self) {
        // Keeps borrowed closures alive until quiescence even when the
        // scope body unwinds; panics are re-raised by the next wait.
        self.drain();
    }
}

#[repr(align(64))]
struct PaddedArena(ScratchArena);

/// Per-thread linear allocator. Allocation bumps a watermark; `reset`
/// rewinds it, recycling the whole block for the next frame.
///
/// The backing block is zero-initialized once, so recycled allocations
/// hand out defined (if stale) bytes.
pub struct ScratchArena {
    base: NonNull<u8>,
    capacity: usize,
    watermark: Cell<usize>,
}

// SAFETY: arenas are stored in the shared task-system state but the
// contract is single-threaded: only the owning thread allocates, and
// `reset` runs only at the frame boundary with no tasks in flight.
unsafe impl Send for ScratchArena {}
unsafe impl Sync for ScratchArena {}

impl ScratchArena {
    pub fn with_capacity(capacity: usize) -> Self {
        assert!(capacity > 0, "scratch arena capacity must be non-zero");
        let layout = std::alloc::Layout::from_size_align(capacity, 64).unwrap();
        let ptr = unsafe { std::alloc::alloc_zeroed(layout) };
        let base = match NonNull::new(ptr) {
            Some(base) => base,
            None => std::alloc::handle_alloc_error(layout),
        };
        ScratchArena {
            base,
            capacity,
            watermark: Cell::new(0),
        }
    }

    pub fn alloc_raw(&self, size: usize, align: usize) -> NonNull<u8> {
        debug_assert!(align.is_power_of_two() && align <= 64);
        let at = (self.watermark.get() + align - 1) & !(align - 1);
        let end = at.checked_add(size).expect("scratch allocation overflow");
        assert!(
            end <= self.capacity,
            "thread scratch arena exhausted ({size} bytes requested, {} of {} used)",
            self.watermark.get(),
            self.capacity
        );
        self.watermark.set(end);
        unsafe { NonNull::new_unchecked(self.base.as_ptr().add(at)) }
    }

    /// Allocate room for a `T`. The memory holds defined bytes but no
    /// particular value; the caller initializes whatever fields it reads.
    pub fn alloc<T>(&self) -> NonNull<T> {
        self.alloc_raw(std::mem::size_of::<T>(), std::mem::align_of::<T>())
            .cast()
    }

    pub fn used(&self) -> usize {
        self.watermark.get()
    }

    pub fn reset(&self) {
        self.watermark.set(0);
    }
}

impl Drop for ScratchArena {
    fn drop(&mut self) {
        let layout = std::alloc::Layout::from_size_align(self.capacity, 64).unwrap();
        unsafe { std::alloc::dealloc(self.base.as_ptr(), layout) };
    }
}

use crate::catalog::JobCatalog;
use crate::handle::JobHandle;
use crate::worker::{run_job, Job, Worker};
use crossbeam_channel::Sender;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

// Spawns N worker threads that all drain one shared FIFO queue, and kills the threads
// when the pool is dropped
struct WorkerPool {
    workers: Vec<Worker>,
    request_tx: Sender<Job>,
    // Jobs queued or currently running. Incremented at enqueue, decremented by the
    // worker after the job's completion cell is written.
    active_job_count: Arc<AtomicUsize>,
}

impl WorkerPool {
    fn new(worker_count: usize) -> Self {
        let (request_tx, request_rx) = crossbeam_channel::unbounded::<Job>();
        let active_job_count = Arc::new(AtomicUsize::new(0));

        let mut workers = Vec::with_capacity(worker_count);
        for thread_index in 0..worker_count {
            let worker = Worker::new(
                request_rx.clone(),
                active_job_count.clone(),
                thread_index,
            );
            workers.push(worker);
        }

        WorkerPool {
            workers,
            request_tx,
            active_job_count,
        }
    }

    fn finish(self) {
        for worker in self.workers {
            worker.finish();
        }
    }
}

/// Fixed-size thread pool executing arbitrary `FnOnce` tasks, returning a
/// waitable/pollable [`JobHandle`] per task.
///
/// The system is an explicit, caller-owned object: components that enqueue work receive
/// it by reference, there is no process-wide instance. [`JobSystem::synchronous`] is the
/// degraded-but-correct mode in which every task runs inline on the calling thread and
/// handles come back already completed.
///
/// Dropping the system joins every worker. Jobs still sitting in the queue at that point
/// are dropped, never run (their handles complete with an error); callers that need
/// guaranteed completion must [`JobSystem::wait_all`] first.
pub struct JobSystem {
    pool: Option<WorkerPool>,
    worker_count: usize,
    next_job_id: AtomicU64,
    catalogs: Vec<JobCatalog>,
}

impl JobSystem {
    /// Pooled mode. `worker_count` is clamped to the number of hardware threads
    /// available, with a floor of one worker.
    pub fn new(worker_count: usize) -> Self {
        let hardware_threads = std::thread::available_parallelism()
            .map(|count| count.get())
            .unwrap_or(1);
        let worker_count = worker_count.min(hardware_threads).max(1);

        log::debug!("starting job system with {} workers", worker_count);

        JobSystem {
            pool: Some(WorkerPool::new(worker_count)),
            worker_count,
            next_job_id: AtomicU64::new(0),
            catalogs: Vec::default(),
        }
    }

    /// Inline mode: no worker threads, `enqueue` runs the task on the calling thread
    /// before returning.
    pub fn synchronous() -> Self {
        JobSystem {
            pool: None,
            worker_count: 0,
            next_job_id: AtomicU64::new(0),
            catalogs: Vec::default(),
        }
    }

    pub fn worker_count(&self) -> usize {
        self.worker_count
    }

    /// Append a job to the back of the shared queue and return immediately. Job ids are
    /// unique and monotonically increasing within one system, never reused.
    pub fn enqueue<F: FnOnce() + Send + 'static>(
        &self,
        task: F,
        name: &str,
        silent: bool,
    ) -> JobHandle {
        let id = self.next_job_id.fetch_add(1, Ordering::Relaxed);
        let (handle, completion) = JobHandle::new_pending(id);
        let job = Job {
            id,
            name: name.to_string(),
            silent,
            task: Box::new(task),
            completion,
        };

        match &self.pool {
            Some(pool) => {
                pool.active_job_count.fetch_add(1, Ordering::Release);
                pool.request_tx.send(job).unwrap();
            }
            None => {
                // Run now, same thread. The handle is already completed when returned.
                run_job(job);
            }
        }

        handle
    }

    /// Synchronous parallel-for: partitions `[start_idx, iteration_count)` into
    /// contiguous buckets of `iterations_per_job` indices (the last bucket may be
    /// shorter), runs one job per bucket, and blocks until every index has been visited.
    pub fn for_each<F: Fn(usize) + Send + Sync + 'static>(
        &self,
        indexed_task: F,
        iteration_count: usize,
        iterations_per_job: usize,
        start_idx: usize,
    ) {
        assert!(iterations_per_job > 0);

        let indexed_task = Arc::new(indexed_task);
        let mut handles = Vec::default();
        let mut begin = start_idx;
        loop {
            let end = (begin + iterations_per_job).min(iteration_count);
            let indexed_task = indexed_task.clone();
            handles.push(self.enqueue(
                move || {
                    for i in begin..end {
                        indexed_task(i);
                    }
                },
                "for_each bucket",
                true,
            ));

            // A range smaller than one bucket still gets exactly one (partial) bucket
            if end >= iteration_count {
                break;
            }
            begin = end;
        }

        self.wait_all(&handles);
    }

    /// Block until every handle in the slice has completed.
    pub fn wait_all(
        &self,
        handles: &[JobHandle],
    ) {
        for handle in handles {
            handle.wait();
        }
    }

    /// True iff the queue is empty and no worker is running a job.
    pub fn are_workers_idle(&self) -> bool {
        match &self.pool {
            Some(pool) => pool.active_job_count.load(Ordering::Acquire) == 0,
            None => true,
        }
    }

    /// Poll until [`JobSystem::are_workers_idle`] reports true. Used by teardown and
    /// pipeline-abort paths that must not discard state while jobs still reference it.
    pub fn wait_until_idle(&self) {
        while !self.are_workers_idle() {
            std::thread::sleep(Duration::from_millis(1));
        }
    }

    /// Construct an empty catalog. Populate it with [`JobCatalog::add_job`] and hand it
    /// back via [`JobSystem::start_catalog`].
    pub fn create_catalog(
        &self,
        name: &str,
        silent: bool,
    ) -> JobCatalog {
        JobCatalog::new(name, silent)
    }

    /// Enqueue every sub-job of the catalog and retain it. [`JobSystem::update`] fires
    /// its completion callback once all sub-jobs have finished.
    pub fn start_catalog(
        &mut self,
        mut catalog: JobCatalog,
    ) {
        let catalog_name = catalog.name().to_string();
        for (job_name, task) in catalog.take_sub_jobs() {
            let name = format!("{}/{}", catalog_name, job_name);
            let handle = self.enqueue(task, &name, true);
            catalog.track_handle(handle);
        }
        self.catalogs.push(catalog);
    }

    /// Per-frame poll of retained catalogs. Each finished catalog fires its callback
    /// exactly once and is dropped.
    pub fn update(&mut self) {
        self.catalogs.retain_mut(|catalog| !catalog.poll());
    }
}

impl Drop for JobSystem {
    fn drop(&mut self) {
        if let Some(pool) = self.pool.take() {
            pool.finish();
        }
    }
}

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Condvar, Mutex};

// What the worker records when a job ends. A contained panic leaves its message here,
// it is never rethrown on another thread.
#[derive(Debug)]
struct JobOutcome {
    error: Option<String>,
}

struct CompletionCell {
    // Fast path for has_completed() so pollers don't take the lock
    completed: AtomicBool,
    outcome: Mutex<Option<JobOutcome>>,
    condvar: Condvar,
}

/// Waitable/pollable token for a job's eventual completion. Cheap to clone, all clones
/// observe the same write-once completion cell.
#[derive(Clone)]
pub struct JobHandle {
    id: u64,
    cell: Arc<CompletionCell>,
}

impl JobHandle {
    pub(crate) fn new_pending(id: u64) -> (JobHandle, JobCompletion) {
        let cell = Arc::new(CompletionCell {
            completed: AtomicBool::new(false),
            outcome: Mutex::new(None),
            condvar: Condvar::new(),
        });

        let handle = JobHandle {
            id,
            cell: cell.clone(),
        };

        (handle, JobCompletion { cell: Some(cell) })
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn has_completed(&self) -> bool {
        self.cell.completed.load(Ordering::Acquire)
    }

    /// Block the calling thread until the job has run.
    pub fn wait(&self) {
        let mut guard = self.cell.outcome.lock().unwrap();
        while guard.is_none() {
            guard = self.cell.condvar.wait(guard).unwrap();
        }
    }

    /// Message of a panic contained while the job ran, if any. Only meaningful once
    /// `has_completed()` is true.
    pub fn error(&self) -> Option<String> {
        let guard = self.cell.outcome.lock().unwrap();
        guard.as_ref().and_then(|outcome| outcome.error.clone())
    }
}

impl std::fmt::Debug for JobHandle {
    fn fmt(
        &self,
        f: &mut std::fmt::Formatter<'_>,
    ) -> std::fmt::Result {
        f.debug_struct("JobHandle")
            .field("id", &self.id)
            .field("completed", &self.has_completed())
            .finish()
    }
}

// Write half of the completion cell. Owned by exactly one worker (or by enqueue itself
// in inline mode) and consumed when the job ends.
pub(crate) struct JobCompletion {
    cell: Option<Arc<CompletionCell>>,
}

impl JobCompletion {
    pub fn fulfill(
        mut self,
        error: Option<String>,
    ) {
        self.write(error);
    }

    fn write(
        &mut self,
        error: Option<String>,
    ) {
        if let Some(cell) = self.cell.take() {
            let mut guard = cell.outcome.lock().unwrap();
            *guard = Some(JobOutcome { error });
            cell.completed.store(true, Ordering::Release);
            cell.condvar.notify_all();
        }
    }
}

impl Drop for JobCompletion {
    fn drop(&mut self) {
        // A job discarded at shutdown without running still resolves its handle so that
        // waiters cannot hang forever
        self.write(Some("job dropped without running".to_string()));
    }
}

use crate::JobHandle;
use std::time::Instant;

type CatalogTask = Box<dyn FnOnce() + Send + 'static>;

/// A named group of jobs submitted together, with a single callback fired when the whole
/// group has finished. Built detached, then handed to `JobSystem::start_catalog`, which
/// enqueues every sub-job and retains the catalog until `JobSystem::update` observes it
/// complete.
pub struct JobCatalog {
    name: String,
    silent: bool,
    sub_jobs: Vec<(String, CatalogTask)>,
    pending_jobs: Vec<JobHandle>,
    completed_jobs: usize,
    on_complete: Option<Box<dyn FnOnce() + Send + 'static>>,
    start_time: Option<Instant>,
}

impl JobCatalog {
    pub(crate) fn new(
        name: &str,
        silent: bool,
    ) -> Self {
        JobCatalog {
            name: name.to_string(),
            silent,
            sub_jobs: Vec::default(),
            pending_jobs: Vec::default(),
            completed_jobs: 0,
            on_complete: None,
            start_time: None,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Add one sub-job. Only valid before the catalog is started.
    pub fn add_job<F: FnOnce() + Send + 'static>(
        &mut self,
        name: &str,
        task: F,
    ) {
        assert!(
            self.start_time.is_none(),
            "add_job called on a started catalog"
        );
        self.sub_jobs.push((name.to_string(), Box::new(task)));
    }

    pub fn on_complete<F: FnOnce() + Send + 'static>(
        &mut self,
        callback: F,
    ) {
        self.on_complete = Some(Box::new(callback));
    }

    pub fn job_count(&self) -> usize {
        self.sub_jobs.len() + self.pending_jobs.len() + self.completed_jobs
    }

    pub(crate) fn take_sub_jobs(&mut self) -> Vec<(String, CatalogTask)> {
        self.start_time = Some(Instant::now());
        std::mem::take(&mut self.sub_jobs)
    }

    pub(crate) fn track_handle(
        &mut self,
        handle: JobHandle,
    ) {
        self.pending_jobs.push(handle);
    }

    // Record newly-completed sub-jobs. Returns true once everything has finished and the
    // completion callback (if any) has fired.
    pub(crate) fn poll(&mut self) -> bool {
        let completed_jobs = &mut self.completed_jobs;
        self.pending_jobs.retain(|handle| {
            if handle.has_completed() {
                *completed_jobs += 1;
                false
            } else {
                true
            }
        });

        if !self.pending_jobs.is_empty() {
            return false;
        }

        if let Some(callback) = self.on_complete.take() {
            callback();
        }

        if !self.silent {
            let elapsed = self
                .start_time
                .map(|start| start.elapsed())
                .unwrap_or_default();
            log::debug!(
                "catalog {} finished {} jobs in {:?}",
                self.name,
                self.completed_jobs,
                elapsed
            );
        }

        true
    }
}

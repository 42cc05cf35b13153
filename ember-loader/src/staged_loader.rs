use crate::gfx::GfxContext;
use ember_jobs::{JobHandle, JobSystem};
use std::collections::VecDeque;

#[derive(Copy, Clone, Debug, Default)]
pub struct StageFlags {
    /// Suppress per-stage progress logging.
    pub silent: bool,
    /// Submit every task of the stage to the job system the moment the stage becomes
    /// active. Without it, tasks run inline on the calling thread, throttled by the
    /// stage's `main_thread_update_count`.
    pub use_jobs: bool,
}

struct StagedTask {
    // Taken when the task runs inline or is submitted as a job
    task: Option<Box<dyn FnOnce() + Send + 'static>>,
    name: String,
    handle: Option<JobHandle>,
    id: u64,
}

struct Stage {
    name: String,
    index: u32,
    main_thread_update_count: usize,
    flags: StageFlags,
    tasks: VecDeque<StagedTask>,
}

/// Strictly ordered sequence of named stages. Stage N+1 never starts before stage N's
/// task queue has fully drained; job stages run all their tasks on the worker pool,
/// main-thread stages run tasks inline with a per-`update` throughput cap.
///
/// The only cancellation path is the graphics context dying: the next `update` then
/// waits for idle workers, discards every remaining stage, and reports the pipeline
/// done.
pub struct StagedLoader {
    name: String,
    // Dense, sorted by index. The cursor advances over drained stages; no map iterator
    // is ever held across mutation.
    stages: Vec<Stage>,
    active_stage: usize,
    started: bool,
    done: bool,
    next_task_id: u64,
    total_task_count: u64,
    done_task_count: u64,
}

impl StagedLoader {
    pub fn new(name: &str) -> Self {
        StagedLoader {
            name: name.to_string(),
            stages: Vec::default(),
            active_stage: 0,
            started: false,
            done: false,
            next_task_id: 0,
            total_task_count: 0,
            done_task_count: 0,
        }
    }

    /// Register an empty stage. Registering two stages at the same index is a logic
    /// error.
    pub fn add_stage(
        &mut self,
        name: &str,
        index: u32,
        main_thread_update_count: usize,
        flags: StageFlags,
    ) {
        assert!(!self.started, "add_stage called on a started pipeline");
        let position = self
            .stages
            .binary_search_by_key(&index, |stage| stage.index);
        match position {
            Ok(_) => panic!("stage index {} registered twice", index),
            Err(position) => self.stages.insert(
                position,
                Stage {
                    name: name.to_string(),
                    index,
                    main_thread_update_count,
                    flags,
                    tasks: VecDeque::default(),
                },
            ),
        }
    }

    /// Append one task to a stage that has not yet drained.
    pub fn enqueue<F: FnOnce() + Send + 'static>(
        &mut self,
        stage_index: u32,
        task: F,
        name: &str,
    ) {
        let position = self
            .stages
            .binary_search_by_key(&stage_index, |stage| stage.index)
            .unwrap_or_else(|_| panic!("no stage registered at index {}", stage_index));
        assert!(
            !self.started || position >= self.active_stage,
            "enqueue into a drained stage"
        );

        let id = self.next_task_id;
        self.next_task_id += 1;
        self.total_task_count += 1;

        self.stages[position].tasks.push_back(StagedTask {
            task: Some(Box::new(task)),
            name: name.to_string(),
            handle: None,
            id,
        });
    }

    /// Point the cursor at the first stage and begin draining it.
    pub fn start(
        &mut self,
        jobs: &JobSystem,
    ) {
        assert!(!self.started, "start called twice");
        self.started = true;
        self.active_stage = 0;
        if self.stages.is_empty() {
            self.done = true;
            return;
        }
        self.begin_active_stage(jobs);
    }

    // A job stage submits everything at once, unthrottled; main-thread stages run
    // lazily inside update()
    fn begin_active_stage(
        &mut self,
        jobs: &JobSystem,
    ) {
        let stage = &mut self.stages[self.active_stage];
        if !stage.flags.silent {
            log::debug!(
                "{}: stage {} ({}) starting, {} tasks",
                self.name,
                stage.index,
                stage.name,
                stage.tasks.len()
            );
        }

        if stage.flags.use_jobs {
            Self::submit_stage_jobs(stage, jobs);
        }
    }

    // Hands every not-yet-submitted task of a job stage to the job system. Also run
    // during update() so a task enqueued into the already-active stage still gets a
    // handle instead of waiting forever.
    fn submit_stage_jobs(
        stage: &mut Stage,
        jobs: &JobSystem,
    ) {
        for staged_task in stage.tasks.iter_mut() {
            if staged_task.handle.is_none() {
                let task = staged_task.task.take().unwrap();
                let job_name = format!("{}/{}", stage.name, staged_task.name);
                staged_task.handle = Some(jobs.enqueue(task, &job_name, true));
            }
        }
    }

    /// Per-frame drain. Returns true once the whole pipeline is done. Multiple trivial
    /// stages can complete within a single call.
    pub fn update(
        &mut self,
        jobs: &JobSystem,
        context: &dyn GfxContext,
    ) -> bool {
        debug_assert!(self.started, "update called before start");

        if self.done {
            return true;
        }

        if !context.is_alive() {
            self.abort(jobs);
            return true;
        }

        profiling::scope!("StagedLoader::update");

        loop {
            if self.active_stage >= self.stages.len() {
                log::debug!("{}: all stages finished", self.name);
                self.done = true;
                return true;
            }

            let stage = &mut self.stages[self.active_stage];
            if stage.flags.use_jobs {
                // Tasks enqueued after the stage went active have no handle yet
                Self::submit_stage_jobs(stage, jobs);

                // Record every handle observed complete this call, exactly once each
                let done_task_count = &mut self.done_task_count;
                stage.tasks.retain(|staged_task| {
                    let completed = staged_task
                        .handle
                        .as_ref()
                        .map_or(false, |handle| handle.has_completed());
                    if completed {
                        *done_task_count += 1;
                    }
                    !completed
                });
            } else {
                let cap = stage.main_thread_update_count;
                let mut ran = 0;
                // cap == 0 means unlimited
                while cap == 0 || ran < cap {
                    let Some(mut staged_task) = stage.tasks.pop_front() else {
                        break;
                    };
                    profiling::scope!("staged task", staged_task.name.as_str());
                    log::trace!(
                        "{}: running task {} ({})",
                        self.name,
                        staged_task.id,
                        staged_task.name
                    );
                    (staged_task.task.take().unwrap())();
                    self.done_task_count += 1;
                    ran += 1;
                }
            }

            let stage = &self.stages[self.active_stage];
            if !stage.tasks.is_empty() {
                return false;
            }

            if !stage.flags.silent {
                log::debug!("{}: stage {} ({}) finished", self.name, stage.index, stage.name);
            }

            // Stage drained; advance and re-enter the drain logic in this same call
            self.active_stage += 1;
            if self.active_stage < self.stages.len() {
                self.begin_active_stage(jobs);
            }
        }
    }

    // Forced shutdown: the context is gone, so none of the remaining work can be
    // applied. Wait for the workers so no discarded state is still referenced by a
    // running job, then drop everything.
    fn abort(
        &mut self,
        jobs: &JobSystem,
    ) {
        log::warn!("{}: graphics context lost, discarding remaining stages", self.name);
        jobs.wait_until_idle();
        self.stages.clear();
        self.active_stage = 0;
        self.done = true;
    }

    pub fn is_done(&self) -> bool {
        self.done
    }

    /// Absolute `(done, total)` task counts accumulated over the pipeline's lifetime.
    pub fn progress(&self) -> (u64, u64) {
        (self.done_task_count, self.total_task_count)
    }
}

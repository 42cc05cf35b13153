use crate::io::IoReader;
use crate::LoaderResult;
use ember_jobs::{JobHandle, JobSystem};
use std::sync::{Arc, Mutex};

/// Phase of a [`ResourceLoader`] batch. Transitions are linear:
/// `RunningJobs → LoadingRequests → Idle`, with no cycles and no cancellation path other
/// than destruction.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum LoadPhase {
    /// Background decode jobs are in flight.
    RunningJobs,
    /// All jobs finished; main-thread apply steps are being drained frame by frame.
    LoadingRequests,
    /// Everything loaded and published. Safe to drop the loader or read results.
    Idle,
}

/// Outcome of one main-thread apply step for one request.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum ApplyStatus {
    /// The engine object was created; the request is done.
    Loaded,
    /// Work happened but the request needs more apply calls.
    Loading,
    /// The hook had nothing it could do with this request. Treated as
    /// loaded-with-failure so one bad resource cannot stall the batch.
    Idle,
}

/// Strategy driving one resource class through the two-phase load.
///
/// `decode` runs on worker threads; `apply` runs on the calling (graphics) thread, one
/// invocation per budget slot per frame; `publish` is the completion hook, fired exactly
/// once with every request's input and its decoded payload (`None` for failures).
pub trait ResourcePipeline: Send + Sync + 'static {
    type Input: Clone + Send + 'static;
    type Output: Send + 'static;

    fn decode(
        &self,
        input: &Self::Input,
        reader: &dyn IoReader,
    ) -> LoaderResult<Self::Output>;

    fn apply(
        &self,
        input: &Self::Input,
        output: &mut Self::Output,
    ) -> ApplyStatus;

    fn publish(
        &self,
        results: Vec<(Self::Input, Option<Self::Output>)>,
    );
}

// Decoded payloads live in this stable Arc-owned arena; each background job captures
// only its slot index plus clones of the Arcs, never a reference into the loader.
enum SlotState<Out> {
    Pending,
    Decoded(Out),
    Failed,
}

struct RequestSlots<Out> {
    slots: Vec<Mutex<SlotState<Out>>>,
}

// Main-thread bookkeeping for one resource in the batch
struct LoadRequest<In> {
    input: In,
    handle: Option<JobHandle>,
    loaded: bool,
}

/// Construction parameters for a [`ResourceLoader`] batch.
pub struct LoadBatch<P: ResourcePipeline> {
    pub name: String,
    /// Prefix for the job names of this batch, e.g. "textures".
    pub id_prefix: String,
    pub resources: Vec<P::Input>,
    pub reader: Arc<dyn IoReader>,
    pub pipeline: Arc<P>,
}

/// Generic two-phase asynchronous resource loader: background-thread decode, then
/// bounded per-frame main-thread object creation.
///
/// Drive it by calling [`ResourceLoader::load_next`] once per frame until it returns
/// [`LoadPhase::Idle`]. Progress is reported as two sequential 0→1 ramps, one per phase;
/// the visible reset at the phase boundary is intentional.
pub struct ResourceLoader<P: ResourcePipeline> {
    name: String,
    requests: Vec<LoadRequest<P::Input>>,
    slots: Arc<RequestSlots<P::Output>>,
    pipeline: Arc<P>,
    phase: LoadPhase,
    progress: f32,
}

impl<P: ResourcePipeline> ResourceLoader<P> {
    /// Builds the loader and immediately enqueues one decode job per resource.
    pub fn new(
        batch: LoadBatch<P>,
        jobs: &JobSystem,
    ) -> Self {
        let slots = Arc::new(RequestSlots {
            slots: batch
                .resources
                .iter()
                .map(|_| Mutex::new(SlotState::Pending))
                .collect(),
        });

        let mut requests = Vec::with_capacity(batch.resources.len());
        for (slot_index, input) in batch.resources.into_iter().enumerate() {
            let job_input = input.clone();
            let job_slots = slots.clone();
            let job_pipeline = batch.pipeline.clone();
            let job_reader = batch.reader.clone();
            let handle = jobs.enqueue(
                move || {
                    profiling::scope!("resource decode");
                    let state = match job_pipeline.decode(&job_input, &*job_reader) {
                        Ok(output) => SlotState::Decoded(output),
                        Err(e) => {
                            log::warn!("resource decode failed: {}", e);
                            SlotState::Failed
                        }
                    };
                    *job_slots.slots[slot_index].lock().unwrap() = state;
                },
                &format!("{}:{}", batch.id_prefix, slot_index),
                true,
            );

            requests.push(LoadRequest {
                input,
                handle: Some(handle),
                loaded: false,
            });
        }

        log::debug!(
            "loader {} started {} decode jobs",
            batch.name,
            requests.len()
        );

        ResourceLoader {
            name: batch.name,
            requests,
            slots,
            pipeline: batch.pipeline,
            phase: LoadPhase::RunningJobs,
            progress: 0.0,
        }
    }

    pub fn phase(&self) -> LoadPhase {
        self.phase
    }

    /// Fraction of the *current phase* that has completed, in [0,1]. Resets to 0 at the
    /// RunningJobs→LoadingRequests boundary.
    pub fn progress(&self) -> f32 {
        self.progress
    }

    /// Scan the in-flight decode jobs. The phase advances only once every job in the
    /// batch has completed; partial completion never triggers an early transition.
    pub fn update_jobs(&mut self) -> LoadPhase {
        if self.phase != LoadPhase::RunningJobs {
            return self.phase;
        }

        let total = self.requests.len();
        // A request with no associated job counts as immediately done
        let done = self
            .requests
            .iter()
            .filter(|request| {
                request
                    .handle
                    .as_ref()
                    .map_or(true, |handle| handle.has_completed())
            })
            .count();

        if done == total {
            log::debug!("loader {} jobs finished, loading requests", self.name);
            self.phase = LoadPhase::LoadingRequests;
            // Progress now tracks the second phase, restarting from zero
            self.progress = 0.0;
        } else {
            self.progress = done as f32 / total as f32;
        }

        self.phase
    }

    /// Main-thread entry point, called once per frame. Performs at most `count`
    /// budget-consuming apply steps, so a single frame never stalls on creating an
    /// entire batch of engine objects at once.
    pub fn load_next(
        &mut self,
        count: usize,
    ) -> LoadPhase {
        debug_assert!(count > 0);

        // A single call can observe a same-frame phase transition
        if self.phase == LoadPhase::RunningJobs {
            self.update_jobs();
        }

        if self.phase != LoadPhase::LoadingRequests {
            return self.phase;
        }

        profiling::scope!("ResourceLoader::load_next");

        let mut budget = count;
        for (slot_index, request) in self.requests.iter_mut().enumerate() {
            if budget == 0 {
                break;
            }
            if request.loaded {
                continue;
            }

            let mut slot = self.slots.slots[slot_index].lock().unwrap();
            match &mut *slot {
                SlotState::Decoded(output) => match self.pipeline.apply(&request.input, output) {
                    ApplyStatus::Loaded => {
                        request.loaded = true;
                        budget -= 1;
                    }
                    ApplyStatus::Loading => {
                        budget -= 1;
                    }
                    ApplyStatus::Idle => {
                        log::warn!(
                            "loader {} request {} returned idle, marking loaded with failure",
                            self.name,
                            slot_index
                        );
                        request.loaded = true;
                    }
                },
                // Decode failed (or its job panicked and left the slot pending); marked
                // loaded so the batch cannot block forever, publish will see None
                SlotState::Failed | SlotState::Pending => {
                    log::warn!(
                        "loader {} request {} has no decoded payload, marking loaded with failure",
                        self.name,
                        slot_index
                    );
                    request.loaded = true;
                }
            }
        }

        let total = self.requests.len();
        let loaded = self.requests.iter().filter(|r| r.loaded).count();
        self.progress = if total == 0 {
            1.0
        } else {
            loaded as f32 / total as f32
        };

        if loaded == total {
            self.finish();
        }

        self.phase
    }

    // Fires publish exactly once, clears the batch, and goes Idle.
    fn finish(&mut self) {
        let mut results = Vec::with_capacity(self.requests.len());
        for (slot_index, request) in self.requests.drain(..).enumerate() {
            let mut slot = self.slots.slots[slot_index].lock().unwrap();
            let output = match std::mem::replace(&mut *slot, SlotState::Pending) {
                SlotState::Decoded(output) => Some(output),
                SlotState::Failed | SlotState::Pending => None,
            };
            results.push((request.input, output));
        }

        log::debug!("loader {} done, publishing {} results", self.name, results.len());
        self.pipeline.publish(results);
        self.progress = 1.0;
        self.phase = LoadPhase::Idle;
    }

    /// Block on every outstanding decode job. Only meaningful while jobs are running;
    /// the destructor relies on this so no background job outlives the loader.
    pub fn wait_all(&self) {
        for request in &self.requests {
            if let Some(handle) = &request.handle {
                handle.wait();
            }
        }
    }
}

impl<P: ResourcePipeline> Drop for ResourceLoader<P> {
    fn drop(&mut self) {
        self.wait_all();
    }
}

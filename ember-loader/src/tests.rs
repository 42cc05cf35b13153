use crate::gfx::{FlagContext, GfxStore};
use crate::io::{IoReader, MemoryReader};
use crate::manifest::{Manifest, ManifestLoader};
use crate::pipelines::parse_obj;
use crate::resource_loader::{
    ApplyStatus, LoadBatch, LoadPhase, ResourceLoader, ResourcePipeline,
};
use crate::staged_loader::{StageFlags, StagedLoader};
use crate::LoaderResult;
use ember_jobs::JobSystem;
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

fn spin_until<F: FnMut() -> bool>(
    mut condition: F,
    what: &str,
) {
    for _ in 0..5000 {
        if condition() {
            return;
        }
        std::thread::sleep(Duration::from_millis(1));
    }
    panic!("timed out waiting for {}", what);
}

fn empty_reader() -> Arc<dyn IoReader> {
    Arc::new(MemoryReader::new())
}

// Pipeline used to observe loader behavior: decode doubles the input, apply counts
// calls and can demand several calls per resource, publish records what it saw.
struct CountingPipeline {
    applies_needed: usize,
    fail_input: Option<u32>,
    apply_calls: AtomicUsize,
    per_input_applies: Mutex<HashMap<u32, usize>>,
    publish_calls: AtomicUsize,
    published: Mutex<Vec<(u32, Option<u32>)>>,
}

impl CountingPipeline {
    fn new(applies_needed: usize) -> Self {
        CountingPipeline {
            applies_needed,
            fail_input: None,
            apply_calls: AtomicUsize::new(0),
            per_input_applies: Mutex::new(HashMap::default()),
            publish_calls: AtomicUsize::new(0),
            published: Mutex::new(Vec::default()),
        }
    }

    fn failing_on(
        applies_needed: usize,
        fail_input: u32,
    ) -> Self {
        let mut pipeline = Self::new(applies_needed);
        pipeline.fail_input = Some(fail_input);
        pipeline
    }
}

impl ResourcePipeline for CountingPipeline {
    type Input = u32;
    type Output = u32;

    fn decode(
        &self,
        input: &u32,
        _reader: &dyn IoReader,
    ) -> LoaderResult<u32> {
        if self.fail_input == Some(*input) {
            return Err("forced decode failure".into());
        }
        Ok(*input * 2)
    }

    fn apply(
        &self,
        input: &u32,
        _output: &mut u32,
    ) -> ApplyStatus {
        self.apply_calls.fetch_add(1, Ordering::Relaxed);
        let mut per_input = self.per_input_applies.lock().unwrap();
        let calls = per_input.entry(*input).or_insert(0);
        *calls += 1;
        if *calls >= self.applies_needed {
            ApplyStatus::Loaded
        } else {
            ApplyStatus::Loading
        }
    }

    fn publish(
        &self,
        results: Vec<(u32, Option<u32>)>,
    ) {
        self.publish_calls.fetch_add(1, Ordering::Relaxed);
        self.published.lock().unwrap().extend(results);
    }
}

// Decode blocks until the test feeds the gate, so partial job completion can be
// observed deterministically
struct GatedPipeline {
    gate: crossbeam_channel::Receiver<()>,
    publish_calls: AtomicUsize,
}

impl ResourcePipeline for GatedPipeline {
    type Input = u32;
    type Output = u32;

    fn decode(
        &self,
        input: &u32,
        _reader: &dyn IoReader,
    ) -> LoaderResult<u32> {
        self.gate.recv().unwrap();
        Ok(*input)
    }

    fn apply(
        &self,
        _input: &u32,
        _output: &mut u32,
    ) -> ApplyStatus {
        ApplyStatus::Loaded
    }

    fn publish(
        &self,
        _results: Vec<(u32, Option<u32>)>,
    ) {
        self.publish_calls.fetch_add(1, Ordering::Relaxed);
    }
}

fn counting_loader(
    jobs: &JobSystem,
    pipeline: Arc<CountingPipeline>,
    resources: Vec<u32>,
) -> ResourceLoader<CountingPipeline> {
    ResourceLoader::new(
        LoadBatch {
            name: "counting".to_string(),
            id_prefix: "counting".to_string(),
            resources,
            reader: empty_reader(),
            pipeline,
        },
        jobs,
    )
}

#[test]
fn loader_gates_phase_on_all_jobs_complete() {
    let jobs = JobSystem::new(2);
    let (gate_tx, gate_rx) = crossbeam_channel::unbounded();
    let pipeline = Arc::new(GatedPipeline {
        gate: gate_rx,
        publish_calls: AtomicUsize::new(0),
    });

    let mut loader = ResourceLoader::new(
        LoadBatch {
            name: "gated".to_string(),
            id_prefix: "gated".to_string(),
            resources: vec![1, 2, 3, 4],
            reader: empty_reader(),
            pipeline: pipeline.clone(),
        },
        &jobs,
    );

    assert_eq!(loader.phase(), LoadPhase::RunningJobs);

    // Let exactly half the decode jobs finish
    gate_tx.send(()).unwrap();
    gate_tx.send(()).unwrap();
    spin_until(
        || {
            loader.update_jobs();
            loader.progress() >= 0.5
        },
        "half the jobs",
    );

    // Partial completion must never advance the phase
    assert_eq!(loader.phase(), LoadPhase::RunningJobs);
    assert_eq!(loader.progress(), 0.5);

    gate_tx.send(()).unwrap();
    gate_tx.send(()).unwrap();
    spin_until(
        || loader.update_jobs() == LoadPhase::LoadingRequests,
        "all jobs",
    );

    // Progress tracks the second phase now, restarting from zero
    assert_eq!(loader.progress(), 0.0);

    let phase = loader.load_next(1);
    assert_eq!(phase, LoadPhase::LoadingRequests);
    assert_eq!(loader.progress(), 0.25);

    while loader.load_next(1) != LoadPhase::Idle {}
    assert_eq!(pipeline.publish_calls.load(Ordering::Relaxed), 1);
}

#[test]
fn loader_budget_bounds_apply_calls_per_frame() {
    // Inline jobs, so every decode handle is complete before the first load_next
    let jobs = JobSystem::synchronous();
    let pipeline = Arc::new(CountingPipeline::new(1));
    let mut loader = counting_loader(&jobs, pipeline.clone(), vec![1, 2, 3, 4, 5, 6]);

    // First call observes the same-frame transition and applies at most 3 requests
    let phase = loader.load_next(3);
    assert_eq!(phase, LoadPhase::LoadingRequests);
    assert_eq!(pipeline.apply_calls.load(Ordering::Relaxed), 3);
    assert_eq!(loader.progress(), 0.5);

    // Second call finishes the rest and fires publish with all six payloads
    let phase = loader.load_next(3);
    assert_eq!(phase, LoadPhase::Idle);
    assert_eq!(pipeline.apply_calls.load(Ordering::Relaxed), 6);
    assert_eq!(pipeline.publish_calls.load(Ordering::Relaxed), 1);

    let published = pipeline.published.lock().unwrap();
    assert_eq!(published.len(), 6);
    for (input, output) in published.iter() {
        assert_eq!(*output, Some(input * 2));
    }
}

#[test]
fn loader_idle_is_terminal_and_publish_fires_once() {
    let jobs = JobSystem::synchronous();
    let pipeline = Arc::new(CountingPipeline::new(1));
    let mut loader = counting_loader(&jobs, pipeline.clone(), vec![10, 20]);

    while loader.load_next(1) != LoadPhase::Idle {}

    for _ in 0..5 {
        assert_eq!(loader.load_next(1), LoadPhase::Idle);
    }
    assert_eq!(pipeline.publish_calls.load(Ordering::Relaxed), 1);
    assert_eq!(loader.progress(), 1.0);
}

#[test]
fn loader_in_progress_requests_span_frames() {
    let jobs = JobSystem::synchronous();
    // Each resource needs two apply calls before it reports Loaded
    let pipeline = Arc::new(CountingPipeline::new(2));
    let mut loader = counting_loader(&jobs, pipeline.clone(), vec![7]);

    assert_eq!(loader.load_next(1), LoadPhase::LoadingRequests);
    assert_eq!(loader.load_next(1), LoadPhase::Idle);
    assert_eq!(pipeline.apply_calls.load(Ordering::Relaxed), 2);
}

#[test]
fn loader_failed_decode_does_not_block_batch() {
    let jobs = JobSystem::synchronous();
    let pipeline = Arc::new(CountingPipeline::failing_on(1, 2));
    let mut loader = counting_loader(&jobs, pipeline.clone(), vec![1, 2, 3]);

    while loader.load_next(10) != LoadPhase::Idle {}

    let published = pipeline.published.lock().unwrap();
    assert_eq!(published.len(), 3);
    assert_eq!(published[0], (1, Some(2)));
    // The failed resource is published as a failure, not retried
    assert_eq!(published[1], (2, None));
    assert_eq!(published[2], (3, Some(6)));
}

#[test]
fn loader_empty_batch_goes_straight_to_idle() {
    let jobs = JobSystem::synchronous();
    let pipeline = Arc::new(CountingPipeline::new(1));
    let mut loader = counting_loader(&jobs, pipeline.clone(), Vec::default());

    assert_eq!(loader.load_next(1), LoadPhase::Idle);
    assert_eq!(pipeline.publish_calls.load(Ordering::Relaxed), 1);
    assert!(pipeline.published.lock().unwrap().is_empty());
}

fn record_task(
    order: &Arc<Mutex<Vec<(u32, usize)>>>,
    stage: u32,
    task: usize,
) -> impl FnOnce() + Send + 'static {
    let order = order.clone();
    move || {
        order.lock().unwrap().push((stage, task));
    }
}

#[test]
fn staged_loader_runs_stages_strictly_in_order() {
    let jobs = JobSystem::new(4);
    let context = FlagContext::new();
    let order = Arc::new(Mutex::new(Vec::default()));

    let mut staged = StagedLoader::new("ordering");
    staged.add_stage(
        "jobs a",
        0,
        0,
        StageFlags {
            silent: true,
            use_jobs: true,
        },
    );
    staged.add_stage("main", 1, 2, StageFlags::default());
    staged.add_stage(
        "jobs b",
        2,
        0,
        StageFlags {
            silent: true,
            use_jobs: true,
        },
    );

    for task in 0..6 {
        staged.enqueue(0, record_task(&order, 0, task), &format!("a{}", task));
        staged.enqueue(1, record_task(&order, 1, task), &format!("m{}", task));
        staged.enqueue(2, record_task(&order, 2, task), &format!("b{}", task));
    }

    staged.start(&jobs);
    spin_until(|| staged.update(&jobs, &context), "pipeline completion");

    let order = order.lock().unwrap();
    assert_eq!(order.len(), 18);
    let first_of = |stage: u32| order.iter().position(|(s, _)| *s == stage).unwrap();
    let last_of = |stage: u32| order.iter().rposition(|(s, _)| *s == stage).unwrap();
    // No stage-N+1 task ever ran before stage N fully drained
    assert!(last_of(0) < first_of(1));
    assert!(last_of(1) < first_of(2));

    assert_eq!(staged.progress(), (18, 18));
}

#[test]
fn staged_loader_throttles_main_thread_stage() {
    let jobs = JobSystem::synchronous();
    let context = FlagContext::new();
    let ran = Arc::new(AtomicUsize::new(0));

    let mut staged = StagedLoader::new("throttle");
    staged.add_stage("create", 0, 3, StageFlags::default());
    for task in 0..7 {
        let counter = ran.clone();
        staged.enqueue(
            0,
            move || {
                counter.fetch_add(1, Ordering::Relaxed);
            },
            &format!("t{}", task),
        );
    }
    staged.start(&jobs);

    // 7 tasks at 3 per update: 3, 3, 1
    assert!(!staged.update(&jobs, &context));
    assert_eq!(ran.load(Ordering::Relaxed), 3);
    assert!(!staged.update(&jobs, &context));
    assert_eq!(ran.load(Ordering::Relaxed), 6);
    assert!(staged.update(&jobs, &context));
    assert_eq!(ran.load(Ordering::Relaxed), 7);
}

#[test]
fn staged_loader_unlimited_cap_drains_in_one_update() {
    let jobs = JobSystem::synchronous();
    let context = FlagContext::new();
    let ran = Arc::new(AtomicUsize::new(0));

    let mut staged = StagedLoader::new("unlimited");
    // Cap of zero means no per-frame limit
    staged.add_stage("create", 0, 0, StageFlags::default());
    for task in 0..20 {
        let counter = ran.clone();
        staged.enqueue(
            0,
            move || {
                counter.fetch_add(1, Ordering::Relaxed);
            },
            &format!("t{}", task),
        );
    }
    staged.start(&jobs);

    assert!(staged.update(&jobs, &context));
    assert_eq!(ran.load(Ordering::Relaxed), 20);
}

#[test]
fn staged_loader_cap_larger_than_queue_drains_in_one_update() {
    let jobs = JobSystem::synchronous();
    let context = FlagContext::new();
    let ran = Arc::new(AtomicUsize::new(0));

    let mut staged = StagedLoader::new("wide cap");
    staged.add_stage("create", 0, 10, StageFlags::default());
    for task in 0..3 {
        let counter = ran.clone();
        staged.enqueue(
            0,
            move || {
                counter.fetch_add(1, Ordering::Relaxed);
            },
            &format!("t{}", task),
        );
    }
    staged.start(&jobs);

    assert!(staged.update(&jobs, &context));
    assert_eq!(ran.load(Ordering::Relaxed), 3);
}

#[test]
fn staged_loader_runs_tasks_enqueued_into_the_active_job_stage() {
    let jobs = JobSystem::new(2);
    let context = FlagContext::new();
    let ran = Arc::new(AtomicUsize::new(0));

    let mut staged = StagedLoader::new("late enqueue");
    staged.add_stage(
        "decode",
        0,
        0,
        StageFlags {
            silent: true,
            use_jobs: true,
        },
    );
    let counter = ran.clone();
    staged.enqueue(
        0,
        move || {
            counter.fetch_add(1, Ordering::Relaxed);
        },
        "early",
    );
    staged.start(&jobs);

    // The stage is already active and has submitted its tasks; a task added now must
    // still be picked up rather than starving the drain
    let counter = ran.clone();
    staged.enqueue(
        0,
        move || {
            counter.fetch_add(1, Ordering::Relaxed);
        },
        "late",
    );

    spin_until(|| staged.update(&jobs, &context), "late-enqueue pipeline");
    assert_eq!(ran.load(Ordering::Relaxed), 2);
    assert_eq!(staged.progress(), (2, 2));
}

#[test]
#[should_panic(expected = "update called before start")]
fn staged_loader_rejects_update_before_start() {
    let jobs = JobSystem::synchronous();
    let context = FlagContext::new();
    let mut staged = StagedLoader::new("not started");
    staged.add_stage("create", 0, 0, StageFlags::default());
    staged.enqueue(0, || {}, "task");
    staged.update(&jobs, &context);
}

#[test]
fn staged_loader_finishes_trivial_stages_in_one_update() {
    let jobs = JobSystem::synchronous();
    let context = FlagContext::new();
    let ran = Arc::new(AtomicUsize::new(0));

    let mut staged = StagedLoader::new("trivial");
    for stage in 0..4u32 {
        staged.add_stage(&format!("stage {}", stage), stage, 0, StageFlags::default());
        let counter = ran.clone();
        staged.enqueue(
            stage,
            move || {
                counter.fetch_add(1, Ordering::Relaxed);
            },
            "only task",
        );
    }
    staged.start(&jobs);

    // All four stages drain within a single call
    assert!(staged.update(&jobs, &context));
    assert_eq!(ran.load(Ordering::Relaxed), 4);
    assert_eq!(staged.progress(), (4, 4));
}

#[test]
fn staged_loader_aborts_when_context_dies() {
    let jobs = JobSystem::new(2);
    let context = FlagContext::new();
    let ran = Arc::new(AtomicUsize::new(0));

    let mut staged = StagedLoader::new("abort");
    staged.add_stage("create", 0, 1, StageFlags::default());
    for task in 0..10 {
        let counter = ran.clone();
        staged.enqueue(
            0,
            move || {
                counter.fetch_add(1, Ordering::Relaxed);
            },
            &format!("t{}", task),
        );
    }
    staged.start(&jobs);

    assert!(!staged.update(&jobs, &context));
    assert_eq!(ran.load(Ordering::Relaxed), 1);

    context.kill();

    // The very next update discards everything and reports done
    assert!(staged.update(&jobs, &context));
    assert!(staged.is_done());
    assert_eq!(ran.load(Ordering::Relaxed), 1);
    let (done, total) = staged.progress();
    assert_eq!(done, 1);
    assert_eq!(total, 10);
}

#[test]
#[should_panic(expected = "registered twice")]
fn staged_loader_rejects_duplicate_stage_index() {
    let mut staged = StagedLoader::new("dup");
    staged.add_stage("first", 3, 0, StageFlags::default());
    staged.add_stage("second", 3, 0, StageFlags::default());
}

#[test]
#[should_panic(expected = "no stage registered")]
fn staged_loader_rejects_enqueue_to_unknown_stage() {
    let mut staged = StagedLoader::new("unknown");
    staged.add_stage("only", 0, 0, StageFlags::default());
    staged.enqueue(7, || {}, "lost task");
}

#[test]
fn staged_loader_with_no_stages_is_immediately_done() {
    let jobs = JobSystem::synchronous();
    let context = FlagContext::new();
    let mut staged = StagedLoader::new("empty");
    staged.start(&jobs);
    assert!(staged.is_done());
    assert!(staged.update(&jobs, &context));
}

fn png_bytes(
    width: u32,
    height: u32,
    pixel: [u8; 4],
) -> Vec<u8> {
    let mut image = image::RgbaImage::new(width, height);
    for p in image.pixels_mut() {
        *p = image::Rgba(pixel);
    }
    let mut bytes = std::io::Cursor::new(Vec::new());
    image::DynamicImage::ImageRgba8(image)
        .write_to(&mut bytes, image::ImageOutputFormat::Png)
        .unwrap();
    bytes.into_inner()
}

const CUBE_FACE_OBJ: &str = "\
# one quad
v 0 0 0
v 1 0 0
v 1 1 0
v 0 1 0
vt 0 0
vt 1 0
vt 1 1
vt 0 1
vn 0 0 1
f 1/1/1 2/2/1 3/3/1 4/4/1
";

#[test]
fn obj_subset_parses_quads_as_triangle_fans() {
    let model = parse_obj("quad", CUBE_FACE_OBJ).unwrap();
    // One quad fans into two triangles
    assert_eq!(model.indices.len(), 6);
    assert_eq!(model.positions.len(), 6);
    assert_eq!(model.positions[0], [0.0, 0.0, 0.0]);
    assert_eq!(model.normals[0], [0.0, 0.0, 1.0]);
    assert_eq!(model.tex_coords[2], [1.0, 1.0]);
    assert!(!model.is_ready());
}

#[test]
fn obj_parse_rejects_garbage() {
    assert!(parse_obj("empty", "# nothing here\n").is_err());
    assert!(parse_obj("bad index", "v 0 0 0\nf 1 2 3\n").is_err());
    assert!(parse_obj("bad number", "v a b c\n").is_err());
}

#[test]
fn manifest_load_end_to_end() {
    let jobs = JobSystem::new(4);
    let context = FlagContext::new();
    let store = GfxStore::shared();

    let mut reader = MemoryReader::new();
    reader.insert("textures/crate.png", png_bytes(4, 4, [10, 20, 30, 255]));
    reader.insert("models/quad.obj", CUBE_FACE_OBJ);
    for face in ["px", "nx", "py", "ny", "pz", "nz"] {
        reader.insert(
            format!("sky/{}.png", face),
            png_bytes(2, 2, [0, 0, 255, 255]),
        );
    }
    reader.insert(
        "manifest.json",
        r#"{
            "textures": [
                { "name": "crate", "path": "textures/crate.png" },
                { "name": "ghost", "path": "textures/not-there.png" }
            ],
            "models": [
                { "name": "quad", "path": "models/quad.obj" }
            ],
            "skyboxes": [
                { "name": "day", "faces": [
                    "sky/px.png", "sky/nx.png", "sky/py.png",
                    "sky/ny.png", "sky/pz.png", "sky/nz.png"
                ] }
            ]
        }"#,
    );
    let reader: Arc<dyn IoReader> = Arc::new(reader);

    let manifest = Manifest::load(&*reader, "manifest.json").unwrap();
    assert_eq!(manifest.asset_count(), 4);

    let mut loader = ManifestLoader::new(manifest, reader, store.clone(), 2);
    loader.start(&jobs);
    spin_until(|| loader.update(&jobs, &context), "manifest load");

    let (done, total) = loader.progress();
    assert_eq!(done, total);
    // 4 decode tasks + 4 create tasks
    assert_eq!(total, 8);

    let store = store.lock().unwrap();
    assert_eq!(store.texture_count(), 2);
    assert_eq!(store.model_count(), 1);
    assert_eq!(store.skybox_count(), 1);

    let texture = store.texture("crate").unwrap();
    assert!(texture.is_ready());
    assert_eq!((texture.width, texture.height), (4, 4));
    assert_eq!(&texture.rgba[0..4], &[10, 20, 30, 255]);

    // The missing texture resolved to the magenta placeholder instead of failing the load
    let ghost = store.texture("ghost").unwrap();
    assert!(ghost.is_ready());
    assert_eq!((ghost.width, ghost.height), (2, 2));
    assert_eq!(&ghost.rgba[0..4], &[0xff, 0x00, 0xff, 0xff]);

    let model = store.model("quad").unwrap();
    assert!(model.is_ready());
    assert_eq!(model.indices.len(), 6);

    let skybox = store.skybox("day").unwrap();
    assert!(skybox.is_ready());
    assert_eq!(skybox.faces.len(), 6);
}

#[test]
fn texture_batch_loader_publishes_into_store() {
    let jobs = JobSystem::new(2);
    let store = GfxStore::shared();

    let mut reader = MemoryReader::new();
    reader.insert("a.png", png_bytes(2, 2, [1, 2, 3, 255]));
    let reader: Arc<dyn IoReader> = Arc::new(reader);

    let resources = vec![
        crate::AssetRef {
            name: "a".to_string(),
            path: "a.png".to_string(),
        },
        crate::AssetRef {
            name: "missing".to_string(),
            path: "b.png".to_string(),
        },
    ];

    let mut loader = crate::load_textures(&jobs, reader, store.clone(), resources);
    spin_until(|| loader.load_next(1) == LoadPhase::Idle, "texture batch");

    let store = store.lock().unwrap();
    assert_eq!(store.texture_count(), 2);
    assert!(store.texture("a").unwrap().is_ready());
    // Failed decode still publishes, as the placeholder
    assert_eq!(store.texture("missing").unwrap().width, 2);
}

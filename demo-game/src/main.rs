use ember_jobs::JobSystem;
use ember_loader::{DiskReader, FlagContext, GfxStore, IoReader, Manifest, ManifestLoader};
use std::path::PathBuf;
use std::sync::Arc;

fn demo_asset_path() -> PathBuf {
    std::env::temp_dir().join("ember-demo-assets")
}

// Stages a small asset directory on disk so the demo has something real to load:
// a couple of generated png textures, a cube model, and a six-face skybox.
fn stage_demo_assets() -> std::io::Result<PathBuf> {
    let root = demo_asset_path();
    std::fs::create_dir_all(root.join("textures"))?;
    std::fs::create_dir_all(root.join("models"))?;
    std::fs::create_dir_all(root.join("sky"))?;

    let checker = image::RgbaImage::from_fn(64, 64, |x, y| {
        if (x / 8 + y / 8) % 2 == 0 {
            image::Rgba([200, 200, 200, 255])
        } else {
            image::Rgba([40, 40, 40, 255])
        }
    });
    checker
        .save(root.join("textures/checker.png"))
        .map_err(|e| std::io::Error::new(std::io::ErrorKind::Other, e))?;

    for (face, tint) in [
        ("px", [120u8, 160, 255]),
        ("nx", [110, 150, 245]),
        ("py", [160, 200, 255]),
        ("ny", [80, 110, 200]),
        ("pz", [120, 160, 255]),
        ("nz", [110, 150, 245]),
    ] {
        let sky = image::RgbaImage::from_pixel(16, 16, image::Rgba([tint[0], tint[1], tint[2], 255]));
        sky.save(root.join(format!("sky/{}.png", face)))
            .map_err(|e| std::io::Error::new(std::io::ErrorKind::Other, e))?;
    }

    std::fs::write(
        root.join("models/cube.obj"),
        "\
v -1 -1 -1\nv 1 -1 -1\nv 1 1 -1\nv -1 1 -1\n\
v -1 -1 1\nv 1 -1 1\nv 1 1 1\nv -1 1 1\n\
vn 0 0 -1\nvn 0 0 1\nvn -1 0 0\nvn 1 0 0\nvn 0 -1 0\nvn 0 1 0\n\
f 1//1 3//1 2//1\nf 1//1 4//1 3//1\n\
f 5//2 6//2 7//2\nf 5//2 7//2 8//2\n\
f 1//3 5//3 8//3\nf 1//3 8//3 4//3\n\
f 2//4 3//4 7//4\nf 2//4 7//4 6//4\n\
f 1//5 2//5 6//5\nf 1//5 6//5 5//5\n\
f 4//6 8//6 7//6\nf 4//6 7//6 3//6\n",
    )?;

    std::fs::write(
        root.join("manifest.json"),
        r#"{
    "textures": [
        { "name": "checker", "path": "textures/checker.png" },
        { "name": "missing", "path": "textures/does-not-exist.png" }
    ],
    "models": [
        { "name": "cube", "path": "models/cube.obj" }
    ],
    "skyboxes": [
        { "name": "day", "faces": [
            "sky/px.png", "sky/nx.png", "sky/py.png",
            "sky/ny.png", "sky/pz.png", "sky/nz.png"
        ] }
    ]
}"#,
    )?;

    Ok(root)
}

fn main() {
    // Setup logging
    env_logger::Builder::default()
        .write_style(env_logger::WriteStyle::Always)
        .filter_level(log::LevelFilter::Debug)
        .init();

    let root = stage_demo_assets().expect("failed to stage demo assets");
    log::info!("demo assets staged at {:?}", root);

    let jobs = JobSystem::new(4);
    log::info!("job system started with {} workers", jobs.worker_count());

    // Warm-up: burn through a parallel-for the way a frame job would
    jobs.for_each(
        |i| {
            let _ = (i as f32).sqrt();
        },
        1000,
        100,
        0,
    );

    let reader: Arc<dyn IoReader> = Arc::new(DiskReader::new(&root));
    let store = GfxStore::shared();
    let context = FlagContext::new();

    let manifest = Manifest::load(&*reader, "manifest.json").expect("failed to read manifest");
    log::info!("loading {} assets", manifest.asset_count());

    let mut loader = ManifestLoader::new(manifest, reader, store.clone(), 2);
    loader.start(&jobs);

    // Stand-in for the frame loop: one update per "frame"
    let mut frame = 0u64;
    while !loader.update(&jobs, &context) {
        let (done, total) = loader.progress();
        log::info!("frame {}: {}/{} tasks", frame, done, total);
        frame += 1;
        std::thread::sleep(std::time::Duration::from_millis(5));
        profiling::finish_frame!();
    }

    let store = store.lock().unwrap();
    log::info!(
        "load finished after {} frames: {} textures, {} models, {} skyboxes",
        frame,
        store.texture_count(),
        store.model_count(),
        store.skybox_count()
    );

    let checker = store.texture("checker").expect("checker texture missing");
    log::info!("checker is {}x{}", checker.width, checker.height);
    let missing = store.texture("missing").expect("placeholder missing");
    log::info!(
        "missing texture resolved to the {}x{} placeholder",
        missing.width,
        missing.height
    );
}

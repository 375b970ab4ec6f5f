use std::fs;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use reelsmith::command::RenderCommand;
use reelsmith::config::RenderConfig;
use reelsmith::engine::{staging_path, TranscodeEngine};
use reelsmith::error::{RenderError, RenderResult};
use reelsmith::media::{MediaLocator, RemoteFetch};
use reelsmith::schema::{load_scene_document, parse_scene_document};
use reelsmith::{RenderJob, Renderer, Scene, SubstitutionContext};
use serde_json::json;
use tempfile::tempdir;
use url::Url;

/// Clones share one command log.
#[derive(Clone, Default)]
struct RecordingEngine {
    commands: Arc<Mutex<Vec<RenderCommand>>>,
    fail_with: Option<&'static str>,
}

impl TranscodeEngine for RecordingEngine {
    fn mode_label(&self) -> &'static str {
        "recording"
    }

    fn run(&self, command: &RenderCommand, output: &Path) -> RenderResult<()> {
        self.commands
            .lock()
            .expect("commands lock")
            .push(command.clone());
        fs::write(output, b"encoded").map_err(|error| RenderError::io(output, error))?;
        match self.fail_with {
            Some(diagnostics) => Err(RenderError::RenderFailed {
                status: "exit status: 1".to_owned(),
                diagnostics: diagnostics.to_owned(),
            }),
            None => Ok(()),
        }
    }
}

struct CountingFetcher {
    calls: Arc<AtomicUsize>,
}

impl RemoteFetch for CountingFetcher {
    fn fetch(&self, url: &Url) -> RenderResult<Vec<u8>> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if url.path().ends_with("missing.png") {
            return Err(RenderError::media_not_found(url.as_str()));
        }
        Ok(b"remote-bytes".to_vec())
    }
}

fn fixture(name: &str) -> PathBuf {
    Path::new(env!("CARGO_MANIFEST_DIR"))
        .join("tests/fixtures")
        .join(name)
}

fn media_root(dir: &Path) -> PathBuf {
    let root = dir.join("media");
    fs::create_dir_all(root.join("co1")).expect("media dir should create");
    fs::write(root.join("co1/logo.png"), b"png").expect("logo should write");
    root
}

fn renderer(root: &Path, engine: RecordingEngine, fetches: Option<Arc<AtomicUsize>>) -> Renderer {
    let fetcher = fetches.map(|calls| Box::new(CountingFetcher { calls }) as Box<dyn RemoteFetch>);
    let locator =
        MediaLocator::with_fetcher(root, ".remote-cache", fetcher).expect("locator should build");
    Renderer::with_parts(RenderConfig::new(root), locator, Box::new(engine))
}

fn welcome_context() -> SubstitutionContext {
    let value = serde_json::from_str(
        &fs::read_to_string(fixture("welcome_context.json")).expect("context should read"),
    )
    .expect("context should parse");
    SubstitutionContext::from_value(value)
}

fn welcome_scene() -> Scene {
    let document =
        load_scene_document(&fixture("welcome_scene.json")).expect("fixture scene should load");
    Scene::from_document(document).expect("fixture scene should normalize")
}

#[test]
fn fixture_scene_compiles_with_context() {
    let dir = tempdir().expect("tempdir should create");
    let root = media_root(dir.path());
    let engine = RecordingEngine::default();
    let renderer = renderer(&root, engine, None);

    let graph = renderer
        .compile(&welcome_scene(), Some(&welcome_context()))
        .expect("scene should compile");
    assert_eq!(graph.inputs.len(), 1);
    assert!(graph.inputs[0].path.ends_with("co1/logo.png"));

    let filter = graph.filter_complex();
    let logo_at = filter.find("overlay=").expect("logo overlay");
    let title_at = filter.find("drawtext=").expect("title text");
    assert!(logo_at < title_at, "text track draws above the image track");
    assert!(filter.contains("Dana Reyes"));
    assert!(filter.ends_with("atrim=duration=3[aout]"));
}

#[test]
fn compilation_is_deterministic() {
    let dir = tempdir().expect("tempdir should create");
    let root = media_root(dir.path());
    let renderer = renderer(&root, RecordingEngine::default(), None);
    let scene = welcome_scene();
    let context = welcome_context();
    let output = dir.path().join("out.mp4");

    let first = renderer
        .plan(&scene, Some(&context), &output)
        .expect("plan should build");
    let second = renderer
        .plan(&scene, Some(&context), &output)
        .expect("plan should build");
    assert_eq!(first, second);
}

#[test]
fn render_is_idempotent_per_output_path() {
    let dir = tempdir().expect("tempdir should create");
    let root = media_root(dir.path());
    let engine = RecordingEngine::default();
    let renderer = renderer(&root, engine.clone(), None);
    let output = dir.path().join("renders/dana.mp4");

    let job = RenderJob::new(welcome_scene(), Some(welcome_context()), &output);
    assert_eq!(renderer.run(job.clone()).expect("first render"), output);
    assert_eq!(renderer.run(job).expect("second render"), output);
    assert_eq!(engine.commands.lock().expect("lock").len(), 1);
    assert_eq!(fs::read(&output).expect("output should read"), b"encoded");
}

#[test]
fn engine_failure_surfaces_diagnostics_and_cleans_up() {
    let dir = tempdir().expect("tempdir should create");
    let root = media_root(dir.path());
    let engine = RecordingEngine {
        fail_with: Some("Invalid filter graph"),
        ..RecordingEngine::default()
    };
    let renderer = renderer(&root, engine, None);
    let output = dir.path().join("dana.mp4");

    let err = renderer
        .render(&welcome_scene(), Some(&welcome_context()), &output)
        .expect_err("render should fail");
    assert_eq!(err.code(), "RENDER_FAILED");
    assert!(err.to_string().contains("Invalid filter graph"));
    assert!(!output.exists());
    assert!(!staging_path(&output).exists());
}

#[test]
fn remote_media_is_downloaded_once_into_cache() {
    let dir = tempdir().expect("tempdir should create");
    let root = dir.path().join("media");
    fs::create_dir_all(&root).expect("media dir should create");
    let fetches = Arc::new(AtomicUsize::new(0));
    let engine = RecordingEngine::default();
    let renderer = renderer(&root, engine.clone(), Some(Arc::clone(&fetches)));

    let scene = Scene::from_document(
        parse_scene_document(json!({
            "size": { "width": 320, "height": 240 },
            "duration": 1000,
            "trackItemsMap": {
                "remote": {
                    "type": "image",
                    "details": { "src": "https://assets.example.net/brand/badge.png", "width": 32, "height": 32 }
                }
            }
        }))
        .expect("document should parse"),
    )
    .expect("scene should normalize");

    renderer
        .render(&scene, None, &dir.path().join("one.mp4"))
        .expect("first render");
    renderer
        .render(&scene, None, &dir.path().join("two.mp4"))
        .expect("second render");
    assert_eq!(fetches.load(Ordering::SeqCst), 1);

    let commands = engine.commands.lock().expect("lock");
    let cached = commands[0]
        .args
        .iter()
        .find(|arg| arg.ends_with(".png"))
        .expect("cached input");
    assert!(Path::new(cached).starts_with(fs::canonicalize(&root).expect("canonical root")));
    assert!(cached.contains(".remote-cache"));
    assert_eq!(fs::read(cached).expect("cache should read"), b"remote-bytes");
}

#[test]
fn failed_download_is_media_not_found() {
    let dir = tempdir().expect("tempdir should create");
    let root = dir.path().join("media");
    fs::create_dir_all(&root).expect("media dir should create");
    let engine = RecordingEngine::default();
    let renderer = renderer(
        &root,
        engine.clone(),
        Some(Arc::new(AtomicUsize::new(0))),
    );
    let scene = Scene::from_document(
        parse_scene_document(json!({
            "size": { "width": 320, "height": 240 },
            "duration": 1000,
            "trackItemsMap": {
                "remote": { "type": "image", "details": { "src": "https://assets.example.net/missing.png" } }
            }
        }))
        .expect("document should parse"),
    )
    .expect("scene should normalize");

    let err = renderer
        .render(&scene, None, &dir.path().join("x.mp4"))
        .expect_err("render should fail");
    assert_eq!(err.code(), "MEDIA_NOT_FOUND");
    assert!(engine.commands.lock().expect("lock").is_empty());
}

#[test]
fn unsupported_scheme_is_rejected() {
    let dir = tempdir().expect("tempdir should create");
    let root = media_root(dir.path());
    let renderer = renderer(&root, RecordingEngine::default(), None);
    let scene = Scene::from_document(
        parse_scene_document(json!({
            "size": { "width": 320, "height": 240 },
            "duration": 1000,
            "trackItemsMap": {
                "clip": { "type": "video", "details": { "src": "ftp://files.example.net/clip.mp4" } }
            }
        }))
        .expect("document should parse"),
    )
    .expect("scene should normalize");

    let err = renderer
        .compile(&scene, None)
        .expect_err("compile should fail");
    assert_eq!(err.code(), "UNSUPPORTED_REFERENCE");
}

#[test]
fn shared_renderer_serves_concurrent_jobs() {
    let dir = tempdir().expect("tempdir should create");
    let root = media_root(dir.path());
    let engine = RecordingEngine::default();
    let renderer = renderer(&root, engine.clone(), None);
    let scene = welcome_scene();

    std::thread::scope(|scope| {
        for name in ["ana", "ben", "cy", "dee"] {
            let renderer = &renderer;
            let scene = &scene;
            let out = dir.path().join(format!("{name}.mp4"));
            scope.spawn(move || {
                let mut context = welcome_context();
                context.insert("customer", json!({ "full_name": name }));
                renderer
                    .render(scene, Some(&context), &out)
                    .expect("render should succeed");
            });
        }
    });

    let commands = engine.commands.lock().expect("lock");
    assert_eq!(commands.len(), 4);
    for name in ["ana", "ben", "cy", "dee"] {
        let command = commands
            .iter()
            .find(|command| command.output.ends_with(format!("{name}.mp4")))
            .expect("command per job");
        assert!(command.args.iter().any(|arg| arg.contains(&format!("Welcome\\, {name}!"))));
    }
}

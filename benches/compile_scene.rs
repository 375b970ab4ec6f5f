//! Scene compilation benchmarks.
//! Run: cargo bench

use criterion::{black_box, criterion_group, criterion_main, Criterion};
use std::fs;
use std::path::Path;

use reelsmith::config::RenderConfig;
use reelsmith::engine::select_engine;
use reelsmith::media::MediaLocator;
use reelsmith::schema::{load_scene_document, parse_scene_document};
use reelsmith::{Renderer, Scene, SubstitutionContext};
use serde_json::json;

fn renderer(media_root: &Path) -> Renderer {
    let config = RenderConfig::new(media_root);
    let locator =
        MediaLocator::with_fetcher(media_root, ".remote-cache", None).expect("create locator");
    let engine = select_engine(&config.engine).expect("select engine");
    Renderer::with_parts(config, locator, engine)
}

fn context() -> SubstitutionContext {
    SubstitutionContext::from_value(json!({
        "customer": { "full_name": "Dana Reyes" },
        "company": { "id": "co1" }
    }))
}

/// Forty text items spread over four tracks.
fn busy_scene() -> Scene {
    let mut items = serde_json::Map::new();
    let mut tracks = Vec::new();
    for track in 0..4 {
        let mut ids = Vec::new();
        for index in 0..10 {
            let id = format!("t{track}-{index}");
            items.insert(
                id.clone(),
                json!({
                    "type": "text",
                    "display": { "from": index * 500, "to": index * 500 + 1500 },
                    "details": {
                        "text": "Thanks for choosing us, {{customer.full_name}}. Your order ships today.",
                        "fontSize": 36,
                        "width": 700,
                        "left": 40 * track,
                        "top": 60 * index,
                        "textShadow": "2px 2px 4px rgba(0,0,0,0.5)",
                        "backgroundColor": "#00000080"
                    }
                }),
            );
            ids.push(id);
        }
        tracks.push(json!({ "type": "text", "items": ids }));
    }
    let document = parse_scene_document(json!({
        "size": { "width": 1920, "height": 1080 },
        "duration": 6000,
        "tracks": tracks,
        "trackItemsMap": items
    }))
    .expect("parse scene");
    Scene::from_document(document).expect("normalize scene")
}

fn bench_compile(c: &mut Criterion) {
    let media = tempfile::tempdir().expect("tempdir");
    fs::create_dir_all(media.path().join("co1")).expect("media dir");
    fs::write(media.path().join("co1/logo.png"), b"png").expect("logo");
    let renderer = renderer(media.path());
    let context = context();

    let welcome_path = Path::new(env!("CARGO_MANIFEST_DIR")).join("tests/fixtures/welcome_scene.json");
    let welcome = Scene::from_document(load_scene_document(&welcome_path).expect("load fixture"))
        .expect("normalize fixture");
    let busy = busy_scene();

    let mut group = c.benchmark_group("compile_scene");
    group.sample_size(50);

    group.bench_function("welcome_fixture", |b| {
        b.iter(|| black_box(renderer.compile(&welcome, Some(&context)).expect("compile")));
    });

    group.bench_function("forty_text_items", |b| {
        b.iter(|| black_box(renderer.compile(&busy, Some(&context)).expect("compile")));
    });

    group.finish();
}

criterion_group!(benches, bench_compile);
criterion_main!(benches);

use std::env;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::process::ExitCode;

use anyhow::{bail, Context, Result};
use clap::{ArgAction, Args, Parser, Subcommand};
use serde_json::json;
use tracing::Level;

use reelsmith::batch::{load_batch_entries, render_batch, BatchSummary};
use reelsmith::config::{load_config, resolve_cli_path, RenderConfig, MEDIA_ROOT_ENV};
use reelsmith::error::envelope_for;
use reelsmith::schema::{load_document_value, load_scene_document};
use reelsmith::{Renderer, Scene, SubstitutionContext};

#[derive(Debug, Parser)]
#[command(name = "reelsmith")]
#[command(about = "Compiles personalized video scenes into ffmpeg renders")]
#[command(version = concat!(env!("CARGO_PKG_VERSION"), " (", env!("REELSMITH_GIT_HASH"), ")"))]
struct Cli {
    /// Raise log verbosity (-v info, -vv debug, -vvv trace).
    #[arg(short = 'v', long = "verbose", action = ArgAction::Count, global = true)]
    verbose: u8,
    /// Print errors as a JSON envelope on stdout.
    #[arg(long, global = true)]
    json: bool,
    #[command(flatten)]
    common: CommonArgs,
    #[command(subcommand)]
    command: Commands,
}

#[derive(Debug, Args)]
struct CommonArgs {
    /// YAML render config.
    #[arg(long, global = true)]
    config: Option<PathBuf>,
    /// Directory media references are resolved against.
    #[arg(long = "media-root", env = MEDIA_ROOT_ENV, global = true)]
    media_root: Option<PathBuf>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Load and validate a scene.
    Check { scene: PathBuf },
    /// Print the ffmpeg invocation without running it.
    Plan {
        scene: PathBuf,
        #[arg(long)]
        context: Option<PathBuf>,
        #[arg(short = 'o', long = "output", default_value = "out.mp4")]
        output: PathBuf,
    },
    /// Render one video.
    Render {
        scene: PathBuf,
        #[arg(short = 'o', long = "output")]
        output: PathBuf,
        #[arg(long)]
        context: Option<PathBuf>,
        /// Render even if the output already exists.
        #[arg(long)]
        force: bool,
    },
    /// Render one video per context entry.
    Batch {
        scene: PathBuf,
        #[arg(long)]
        contexts: PathBuf,
        #[arg(long = "out-dir")]
        out_dir: PathBuf,
        #[arg(long, default_value_t = 2)]
        jobs: usize,
        #[arg(long)]
        force: bool,
    },
}

fn main() -> ExitCode {
    let cli = Cli::parse();
    init_logging(cli.verbose);
    let json_errors = cli.json;

    match run(cli) {
        Ok(code) => code,
        Err(error) => {
            if json_errors {
                let envelope = envelope_for(&error);
                match serde_json::to_string_pretty(&envelope) {
                    Ok(text) => println!("{text}"),
                    Err(_) => eprintln!("error: {error:#}"),
                }
            } else {
                eprintln!("error: {error:#}");
            }
            ExitCode::FAILURE
        }
    }
}

fn init_logging(verbose: u8) {
    let level = match verbose {
        0 => Level::WARN,
        1 => Level::INFO,
        2 => Level::DEBUG,
        _ => Level::TRACE,
    };
    tracing_subscriber::fmt()
        .with_max_level(level)
        .with_writer(std::io::stderr)
        .with_target(false)
        .init();
}

fn run(cli: Cli) -> Result<ExitCode> {
    let launch_cwd = env::current_dir().context("failed to resolve current directory")?;
    let config = build_config(&cli.common, &launch_cwd)?;

    match cli.command {
        Commands::Check { scene } => run_check(&scene, cli.json).map(|_| ExitCode::SUCCESS),
        Commands::Plan {
            scene,
            context,
            output,
        } => run_plan(config, &scene, context.as_deref(), &output, cli.json)
            .map(|_| ExitCode::SUCCESS),
        Commands::Render {
            scene,
            output,
            context,
            force,
        } => run_render(config, &scene, context.as_deref(), &output, force, cli.json)
            .map(|_| ExitCode::SUCCESS),
        Commands::Batch {
            scene,
            contexts,
            out_dir,
            jobs,
            force,
        } => run_batch(config, &scene, &contexts, &out_dir, jobs, force, cli.json),
    }
}

/// Config file first, then CLI flags and environment on top.
fn build_config(common: &CommonArgs, launch_cwd: &Path) -> Result<RenderConfig> {
    let mut config = match &common.config {
        Some(path) => load_config(path, launch_cwd)?,
        None => RenderConfig::default(),
    };
    if let Some(media_root) = &common.media_root {
        config.media_root = resolve_cli_path(media_root, launch_cwd)?;
    } else if common.config.is_none() {
        config.media_root = resolve_cli_path(&config.media_root, launch_cwd)?;
    }
    Ok(config)
}

fn load_scene(path: &Path) -> Result<Scene> {
    let document = load_scene_document(path)?;
    Scene::from_document(document).with_context(|| format!("invalid scene {}", path.display()))
}

fn load_context(path: Option<&Path>) -> Result<Option<SubstitutionContext>> {
    let Some(path) = path else {
        return Ok(None);
    };
    let value = load_document_value(path)
        .with_context(|| format!("failed to load substitution context {}", path.display()))?;
    if !value.is_object() {
        bail!("substitution context {} must be an object", path.display());
    }
    Ok(Some(SubstitutionContext::from_value(value)))
}

fn run_check(scene_path: &Path, json_output: bool) -> Result<()> {
    let scene = load_scene(scene_path)?;
    let mut kinds = std::collections::BTreeMap::<&str, usize>::new();
    for item in scene.ordered_items() {
        *kinds.entry(item.kind.label()).or_default() += 1;
    }

    if json_output {
        let summary = json!({
            "ok": true,
            "scene": scene_path.display().to_string(),
            "width": scene.canvas.width,
            "height": scene.canvas.height,
            "fps": scene.canvas.fps,
            "duration_ms": scene.duration_ms,
            "tracks": scene.tracks.len(),
            "items": kinds,
        });
        println!("{}", serde_json::to_string_pretty(&summary)?);
        return Ok(());
    }

    println!(
        "OK: {} ({}x{}, {} fps, {} ms)",
        scene_path.display(),
        scene.canvas.width,
        scene.canvas.height,
        scene.canvas.fps,
        scene.duration_ms
    );
    println!("Tracks: {}", scene.tracks.len());
    for (kind, count) in kinds {
        println!("  {kind}: {count}");
    }
    Ok(())
}

fn run_plan(
    config: RenderConfig,
    scene_path: &Path,
    context_path: Option<&Path>,
    output: &Path,
    json_output: bool,
) -> Result<()> {
    let scene = load_scene(scene_path)?;
    let context = load_context(context_path)?;
    let renderer = Renderer::new(config)?;
    let command = renderer.plan(&scene, context.as_ref(), output)?;

    if json_output {
        let body = json!({
            "program": command.program,
            "args": command.argv(),
        });
        println!("{}", serde_json::to_string_pretty(&body)?);
    } else {
        println!("{}", command.shell_line());
    }
    Ok(())
}

fn run_render(
    mut config: RenderConfig,
    scene_path: &Path,
    context_path: Option<&Path>,
    output: &Path,
    force: bool,
    json_output: bool,
) -> Result<()> {
    if force {
        config.reuse_existing_output = false;
    }
    let scene = load_scene(scene_path)?;
    let context = load_context(context_path)?;
    let renderer = Renderer::new(config)?;
    let written = renderer
        .render(&scene, context.as_ref(), output)
        .with_context(|| format!("failed to render {}", scene_path.display()))?;

    if json_output {
        let body = json!({ "ok": true, "output": written.display().to_string() });
        println!("{}", serde_json::to_string_pretty(&body)?);
    } else {
        println!("Wrote {}", written.display());
    }
    Ok(())
}

fn run_batch(
    mut config: RenderConfig,
    scene_path: &Path,
    contexts_path: &Path,
    out_dir: &Path,
    jobs: usize,
    force: bool,
    json_output: bool,
) -> Result<ExitCode> {
    if force {
        config.reuse_existing_output = false;
    }
    let scene = load_scene(scene_path)?;
    let entries = load_batch_entries(contexts_path)?;
    let renderer = Renderer::new(config)?;
    let outcomes = render_batch(&renderer, &scene, &entries, out_dir, jobs);
    let summary = BatchSummary::from_outcomes(&outcomes);

    let mut stdout = std::io::stdout().lock();
    if json_output {
        let results = outcomes
            .iter()
            .map(|outcome| match &outcome.result {
                Ok(path) => json!({ "id": outcome.id, "ok": true, "output": path.display().to_string() }),
                Err(error) => json!({ "id": outcome.id, "ok": false, "error": error.envelope().error }),
            })
            .collect::<Vec<_>>();
        let body = json!({ "summary": summary, "results": results });
        writeln!(stdout, "{}", serde_json::to_string_pretty(&body)?)?;
    } else {
        for outcome in &outcomes {
            match &outcome.result {
                Ok(path) => writeln!(stdout, "ok    {}  {}", outcome.id, path.display())?,
                Err(error) => writeln!(stdout, "FAIL  {}  {} {}", outcome.id, error.code(), error)?,
            }
        }
        writeln!(
            stdout,
            "{} rendered, {} failed",
            summary.rendered, summary.failed
        )?;
    }

    Ok(if summary.failed == 0 {
        ExitCode::SUCCESS
    } else {
        ExitCode::FAILURE
    })
}

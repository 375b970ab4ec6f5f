use std::path::{Path, PathBuf};

use crate::command::{assemble, RenderCommand};
use crate::config::RenderConfig;
use crate::engine::{execute, select_engine, TranscodeEngine};
use crate::error::RenderResult;
use crate::graph::{CompiledGraph, GraphCompiler};
use crate::media::MediaLocator;
use crate::scene::Scene;
use crate::substitute::SubstitutionContext;
use crate::text::FontLibrary;

/// One render request, consumed by [`Renderer::run`].
#[derive(Debug, Clone)]
pub struct RenderJob {
    pub scene: Scene,
    pub context: Option<SubstitutionContext>,
    pub output_path: PathBuf,
}

impl RenderJob {
    pub fn new(
        scene: Scene,
        context: Option<SubstitutionContext>,
        output_path: impl Into<PathBuf>,
    ) -> Self {
        Self {
            scene,
            context,
            output_path: output_path.into(),
        }
    }
}

/// Compiles scenes and drives the transcoding engine. Holds no per-job
/// state, so one renderer can serve concurrent jobs.
pub struct Renderer {
    config: RenderConfig,
    locator: MediaLocator,
    fonts: FontLibrary,
    engine: Box<dyn TranscodeEngine>,
}

impl std::fmt::Debug for Renderer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Renderer")
            .field("config", &self.config)
            .field("locator", &self.locator)
            .field("engine", &self.engine.mode_label())
            .finish_non_exhaustive()
    }
}

impl Renderer {
    pub fn new(config: RenderConfig) -> RenderResult<Self> {
        let locator = MediaLocator::new(&config.media_root, &config.remote)?;
        let engine = select_engine(&config.engine)?;
        Ok(Self::with_parts(config, locator, engine))
    }

    /// Assembles a renderer from explicit collaborators, e.g. a locator with
    /// a custom fetcher or a recording engine.
    pub fn with_parts(
        config: RenderConfig,
        locator: MediaLocator,
        engine: Box<dyn TranscodeEngine>,
    ) -> Self {
        let fonts = FontLibrary::new(config.font_root.clone(), config.default_font.clone());
        Self {
            config,
            locator,
            fonts,
            engine,
        }
    }

    pub fn config(&self) -> &RenderConfig {
        &self.config
    }

    pub fn locator(&self) -> &MediaLocator {
        &self.locator
    }

    pub fn compile(
        &self,
        scene: &Scene,
        context: Option<&SubstitutionContext>,
    ) -> RenderResult<CompiledGraph> {
        GraphCompiler::new(&self.locator, &self.fonts, &self.config.audio).compile(scene, context)
    }

    /// Compiles and assembles the command without running it.
    pub fn plan(
        &self,
        scene: &Scene,
        context: Option<&SubstitutionContext>,
        output_path: &Path,
    ) -> RenderResult<RenderCommand> {
        let graph = self.compile(scene, context)?;
        Ok(assemble(
            &self.config.engine.binary,
            &graph,
            &self.config.output,
            output_path,
        ))
    }

    /// Renders `scene` to `output_path` and returns the written path.
    #[tracing::instrument(level = "info", skip_all, fields(output = %output_path.display()))]
    pub fn render(
        &self,
        scene: &Scene,
        context: Option<&SubstitutionContext>,
        output_path: &Path,
    ) -> RenderResult<PathBuf> {
        if self.config.reuse_existing_output && output_path.is_file() {
            tracing::info!("output already exists; reusing");
            return Ok(output_path.to_path_buf());
        }
        tracing::info!(
            width = scene.canvas.width,
            height = scene.canvas.height,
            duration_ms = scene.duration_ms,
            items = scene.items.len(),
            media_root = %self.locator.media_root().display(),
            "rendering scene"
        );
        let command = self.plan(scene, context, output_path)?;
        execute(
            self.engine.as_ref(),
            &command,
            self.config.reuse_existing_output,
        )
    }

    pub fn run(&self, job: RenderJob) -> RenderResult<PathBuf> {
        self.render(&job.scene, job.context.as_ref(), &job.output_path)
    }
}

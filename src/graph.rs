//! Filter-graph compiler.
//!
//! The scene is folded in z-order into a [`CompileState`] accumulator that
//! owns the input table, the emitted stages, the label counter and the
//! current visual node. Every visual stage consumes the current node and
//! produces the next one, so stage order is exactly item order.

use std::collections::HashMap;
use std::fmt;
use std::path::{Path, PathBuf};

use serde::Serialize;

use crate::config::AudioConfig;
use crate::error::RenderResult;
use crate::media::MediaLocator;
use crate::resolve::format_decimal;
use crate::scene::{
    AudioDetails, Canvas, ItemKind, Scene, TextDetails, TimelineItem, VisualDetails, VisualFit,
    Window,
};
use crate::substitute::{substitute, SubstitutionContext};
use crate::text::{layout_text, FontLibrary};

const BACKGROUND_LABEL: &str = "bg";
const AUDIO_OUT_LABEL: &str = "aout";
const TRANSPARENT_PAD: &str = "black@0";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum InputKind {
    Video,
    /// Still image looped for the whole scene.
    Image,
    Audio,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct InputSpec {
    pub path: PathBuf,
    pub kind: InputKind,
}

/// One `[in]...filter,filter...[out]` chain.
#[derive(Debug, Clone, PartialEq)]
pub struct Stage {
    pub inputs: Vec<String>,
    pub filters: Vec<String>,
    pub output: String,
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for input in &self.inputs {
            write!(f, "[{input}]")?;
        }
        write!(f, "{}[{}]", self.filters.join(","), self.output)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct CompiledGraph {
    pub canvas: Canvas,
    pub duration_secs: f64,
    pub inputs: Vec<InputSpec>,
    pub stages: Vec<Stage>,
    pub video_out: String,
    pub audio_out: String,
}

impl CompiledGraph {
    /// The whole graph as a single `-filter_complex` expression.
    pub fn filter_complex(&self) -> String {
        self.stages
            .iter()
            .map(Stage::to_string)
            .collect::<Vec<_>>()
            .join(";")
    }
}

/// Effective on-canvas box of a scaled layer.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct LayerBox {
    pub x: f64,
    pub y: f64,
    pub width: f64,
    pub height: f64,
}

/// Scales `width × height` by `scale` around the box center.
pub fn effective_box(left: f64, top: f64, width: f64, height: f64, scale: f64) -> LayerBox {
    let scaled_width = width * scale;
    let scaled_height = height * scale;
    LayerBox {
        x: left + (width - scaled_width) / 2.0,
        y: top + (height - scaled_height) / 2.0,
        width: scaled_width,
        height: scaled_height,
    }
}

/// `[from, to)` enable predicate in seconds.
pub fn enable_expression(window: Window) -> String {
    format!(
        "gte(t,{})*lt(t,{})",
        format_decimal(window.from_secs(), 3),
        format_decimal(window.to_secs(), 3)
    )
}

#[derive(Debug, Clone, PartialEq)]
struct AudioSource {
    input: usize,
    start: Window,
    sample: Window,
    volume: f64,
}

#[derive(Debug, Default)]
struct InputTable {
    entries: Vec<InputSpec>,
    by_path: HashMap<PathBuf, usize>,
}

impl InputTable {
    /// Deduplicates by resolved path; the first use fixes the input kind.
    fn index_for(&mut self, path: PathBuf, kind: InputKind) -> usize {
        if let Some(index) = self.by_path.get(&path) {
            return *index;
        }
        let index = self.entries.len();
        self.by_path.insert(path.clone(), index);
        self.entries.push(InputSpec { path, kind });
        index
    }
}

#[derive(Debug)]
struct CompileState {
    inputs: InputTable,
    stages: Vec<Stage>,
    audio: Vec<AudioSource>,
    current: String,
    next_label: usize,
}

impl CompileState {
    fn new(base: Stage) -> Self {
        let current = base.output.clone();
        Self {
            inputs: InputTable::default(),
            stages: vec![base],
            audio: Vec::new(),
            current,
            next_label: 0,
        }
    }

    fn label(&mut self, prefix: &str) -> String {
        let label = format!("{prefix}{}", self.next_label);
        self.next_label += 1;
        label
    }

    /// Emits a stage on top of the current node and makes its output current.
    fn composite(mut self, mut extra_inputs: Vec<String>, filters: Vec<String>) -> Self {
        let output = self.label("c");
        let mut inputs = vec![std::mem::take(&mut self.current)];
        inputs.append(&mut extra_inputs);
        tracing::debug!(output = %output, filters = filters.len(), "composited stage");
        self.stages.push(Stage {
            inputs,
            filters,
            output: output.clone(),
        });
        self.current = output;
        self
    }
}

pub struct GraphCompiler<'a> {
    locator: &'a MediaLocator,
    fonts: &'a FontLibrary,
    audio: &'a AudioConfig,
}

impl<'a> GraphCompiler<'a> {
    pub fn new(locator: &'a MediaLocator, fonts: &'a FontLibrary, audio: &'a AudioConfig) -> Self {
        Self {
            locator,
            fonts,
            audio,
        }
    }

    /// Compiles `scene` into a filter graph. Media resolution errors abort
    /// the whole compilation.
    pub fn compile(
        &self,
        scene: &Scene,
        context: Option<&SubstitutionContext>,
    ) -> RenderResult<CompiledGraph> {
        let base = Stage {
            inputs: Vec::new(),
            filters: vec![format!(
                "color=c={}:s={}x{}:r={}:d={}",
                scene.background.to_ffmpeg(),
                scene.canvas.width,
                scene.canvas.height,
                format_decimal(scene.canvas.fps, 3),
                format_decimal(scene.duration_secs(), 3)
            )],
            output: BACKGROUND_LABEL.to_owned(),
        };

        let state = scene
            .ordered_items()
            .try_fold(CompileState::new(base), |state, item| {
                self.compile_item(state, item, scene, context)
            })?;
        let state = self.mix_audio(state, scene);

        Ok(CompiledGraph {
            canvas: scene.canvas,
            duration_secs: scene.duration_secs(),
            inputs: state.inputs.entries,
            stages: state.stages,
            video_out: state.current,
            audio_out: AUDIO_OUT_LABEL.to_owned(),
        })
    }

    fn compile_item(
        &self,
        state: CompileState,
        item: &TimelineItem,
        scene: &Scene,
        context: Option<&SubstitutionContext>,
    ) -> RenderResult<CompileState> {
        if item.display.is_empty() {
            tracing::debug!(item = %item.id, "zero-length display window; skipping");
            return Ok(state);
        }
        match &item.kind {
            ItemKind::Video(details) => {
                self.compile_visual(state, item, details, InputKind::Video, scene, context)
            }
            ItemKind::Image(details) => {
                self.compile_visual(state, item, details, InputKind::Image, scene, context)
            }
            ItemKind::Text(details) => Ok(self.compile_text(state, item, details, scene, context)),
            ItemKind::Audio(details) => self.compile_audio(state, item, details, context),
        }
    }

    fn resolve_source(
        &self,
        item: &TimelineItem,
        src: &str,
        context: Option<&SubstitutionContext>,
    ) -> RenderResult<Option<PathBuf>> {
        let reference = substitute(src, context);
        if reference.trim().is_empty() {
            tracing::warn!(item = %item.id, kind = item.kind.label(), "item has no source; skipping");
            return Ok(None);
        }
        self.locator.resolve(&reference).map(Some)
    }

    fn compile_visual(
        &self,
        mut state: CompileState,
        item: &TimelineItem,
        details: &VisualDetails,
        kind: InputKind,
        scene: &Scene,
        context: Option<&SubstitutionContext>,
    ) -> RenderResult<CompileState> {
        let Some(path) = self.resolve_source(item, &details.src, context)? else {
            return Ok(state);
        };
        let probed = match kind {
            InputKind::Image => probe_image(&path),
            _ => None,
        };
        let (width, height) = intrinsic_size(details, probed, scene.canvas);
        let layer = effective_box(details.left, details.top, width, height, details.scale);
        let target_width = layer.width.round().max(1.0) as i64;
        let target_height = layer.height.round().max(1.0) as i64;

        let input = state.inputs.index_for(path, kind);
        let mut filters = Vec::new();
        let sample = sample_window(item);
        match kind {
            InputKind::Video => {
                filters.push(format!(
                    "trim=start={}:end={}",
                    format_decimal(sample.from_secs(), 3),
                    format_decimal(sample.to_secs(), 3)
                ));
                filters.push(format!(
                    "setpts=PTS-STARTPTS+{}/TB",
                    format_decimal(item.display.from_secs(), 3)
                ));
            }
            _ => filters.push("setpts=PTS-STARTPTS".to_owned()),
        }
        if let Some(crop) = details.crop {
            filters.push(format!(
                "crop={}:{}:{}:{}",
                crop.width.round() as i64,
                crop.height.round() as i64,
                crop.x.round() as i64,
                crop.y.round() as i64
            ));
        }
        filters.push(match details.fit {
            VisualFit::Fill => format!("scale={target_width}:{target_height}"),
            VisualFit::Contain => format!(
                "scale={target_width}:{target_height}:force_original_aspect_ratio=decrease"
            ),
        });
        filters.push("format=rgba".to_owned());
        filters.push(format!(
            "crop='min(iw,{target_width})':'min(ih,{target_height})':0:0"
        ));
        filters.push(match details.fit {
            VisualFit::Fill => {
                format!("pad={target_width}:{target_height}:0:0:color={TRANSPARENT_PAD}")
            }
            VisualFit::Contain => format!(
                "pad={target_width}:{target_height}:(ow-iw)/2:(oh-ih)/2:color={TRANSPARENT_PAD}"
            ),
        });
        if details.flip_x {
            filters.push("hflip".to_owned());
        }
        if details.flip_y {
            filters.push("vflip".to_owned());
        }
        if details.opacity < 1.0 {
            filters.push(format!(
                "colorchannelmixer=aa={}",
                format_decimal(details.opacity, 3)
            ));
        }

        let layer_label = state.label("v");
        tracing::debug!(
            item = %item.id,
            input,
            x = layer.x,
            y = layer.y,
            width = target_width,
            height = target_height,
            "prepared visual layer"
        );
        state.stages.push(Stage {
            inputs: vec![format!("{input}:v")],
            filters,
            output: layer_label.clone(),
        });
        let overlay = format!(
            "overlay=x={}:y={}:enable='{}'",
            layer.x.round() as i64,
            layer.y.round() as i64,
            enable_expression(item.display)
        );
        let mut state = state.composite(vec![layer_label], vec![overlay]);

        if kind == InputKind::Video && self.audio.include_source_audio {
            state.audio.push(AudioSource {
                input,
                start: item.display,
                sample,
                volume: details.volume * self.audio.source_volume / 100.0,
            });
        }
        Ok(state)
    }

    fn compile_text(
        &self,
        state: CompileState,
        item: &TimelineItem,
        details: &TextDetails,
        scene: &Scene,
        context: Option<&SubstitutionContext>,
    ) -> CompileState {
        let font = self.fonts.choose(details, context, self.locator);
        let metrics = self.fonts.metrics(&font);
        let layout = layout_text(details, context, scene.canvas, &font, metrics.as_deref());
        if layout.passes.is_empty() {
            tracing::debug!(item = %item.id, "text item has nothing to draw");
            return state;
        }
        let enable = enable_expression(item.display);
        let filters = layout
            .passes
            .iter()
            .map(|pass| pass.to_filter(&enable))
            .collect::<Vec<_>>();
        tracing::debug!(item = %item.id, lines = layout.lines.len(), passes = filters.len(), "laid out text");
        state.composite(Vec::new(), filters)
    }

    fn compile_audio(
        &self,
        mut state: CompileState,
        item: &TimelineItem,
        details: &AudioDetails,
        context: Option<&SubstitutionContext>,
    ) -> RenderResult<CompileState> {
        let Some(path) = self.resolve_source(item, &details.src, context)? else {
            return Ok(state);
        };
        let input = state.inputs.index_for(path, InputKind::Audio);
        let sample = sample_window(item);
        state.audio.push(AudioSource {
            input,
            start: item.display,
            sample,
            volume: details.volume,
        });
        Ok(state)
    }

    /// Mixes every recorded source into `[aout]`, padded and cut to exactly the
    /// scene duration. Without sources a silent track is synthesized.
    fn mix_audio(&self, mut state: CompileState, scene: &Scene) -> CompileState {
        let duration = format_decimal(scene.duration_secs(), 3);
        let sample_rate = self.audio.sample_rate;

        if state.audio.is_empty() {
            state.stages.push(Stage {
                inputs: Vec::new(),
                filters: vec![
                    format!("anullsrc=channel_layout=stereo:sample_rate={sample_rate}"),
                    format!("atrim=duration={duration}"),
                ],
                output: AUDIO_OUT_LABEL.to_owned(),
            });
            return state;
        }

        let sources = std::mem::take(&mut state.audio);
        let mut mixed = Vec::with_capacity(sources.len());
        for source in &sources {
            let label = state.label("a");
            let delay = source.start.from_ms.round() as i64;
            state.stages.push(Stage {
                inputs: vec![format!("{}:a", source.input)],
                filters: vec![
                    format!(
                        "atrim=start={}:end={}",
                        format_decimal(source.sample.from_secs(), 3),
                        format_decimal(source.sample.to_secs(), 3)
                    ),
                    "asetpts=PTS-STARTPTS".to_owned(),
                    format!(
                        "aformat=sample_fmts=fltp:sample_rates={sample_rate}:channel_layouts=stereo"
                    ),
                    format!("volume={}", format_decimal(source.volume, 3)),
                    format!("adelay={delay}:all=1"),
                ],
                output: label.clone(),
            });
            mixed.push(label);
        }

        state.stages.push(Stage {
            inputs: mixed,
            filters: vec![
                format!(
                    "amix=inputs={}:duration=longest:dropout_transition=0:normalize=0",
                    sources.len()
                ),
                format!("apad=whole_dur={duration}"),
                format!("atrim=duration={duration}"),
            ],
            output: AUDIO_OUT_LABEL.to_owned(),
        });
        state
    }
}

/// Source range sampled for an item: the trim window, cut to what the
/// display window can show. Untrimmed items sample from the source start.
fn sample_window(item: &TimelineItem) -> Window {
    let shown = item.display.duration_ms();
    match item.trim {
        Some(trim) => Window::new(trim.from_ms, trim.to_ms.min(trim.from_ms + shown)),
        None => Window::new(0.0, shown),
    }
}

fn probe_image(path: &Path) -> Option<(u32, u32)> {
    match image::image_dimensions(path) {
        Ok(dimensions) => Some(dimensions),
        Err(error) => {
            tracing::debug!(path = %path.display(), error = %error, "could not probe image size");
            None
        }
    }
}

/// Declared box size, completed from the probed media size (keeping aspect
/// ratio) and finally from the canvas.
fn intrinsic_size(details: &VisualDetails, probed: Option<(u32, u32)>, canvas: Canvas) -> (f64, f64) {
    let probed = probed
        .filter(|(w, h)| *w > 0 && *h > 0)
        .map(|(w, h)| (f64::from(w), f64::from(h)));
    match (details.width, details.height, probed) {
        (Some(w), Some(h), _) => (w, h),
        (Some(w), None, Some((pw, ph))) => (w, w * ph / pw),
        (None, Some(h), Some((pw, ph))) => (h * pw / ph, h),
        (None, None, Some(size)) => size,
        (w, h, None) => (
            w.unwrap_or(f64::from(canvas.width)),
            h.unwrap_or(f64::from(canvas.height)),
        ),
    }
}

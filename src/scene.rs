//! Canonical scene model.
//!
//! [`Scene::from_document`] is the parsing boundary: every loosely typed
//! field of a [`SceneDocument`] goes through the value resolvers here, and
//! nothing downstream sees raw document values.

use std::collections::HashMap;

use serde_json::{Map, Value};

use crate::error::{RenderError, RenderResult};
use crate::resolve::{
    compute_line_spacing, parse_bool, parse_color_or, parse_letter_spacing, parse_millis,
    parse_optional_pixels, parse_percent, parse_pixels, parse_scale, parse_shadows,
    parse_text_align, parse_wrap_mode, Rgba, Shadow, TextAlign, WrapMode,
};
use crate::schema::{DesignDocument, ItemDocument, SceneDocument, WindowDocument};

pub type ItemId = String;

pub const DEFAULT_FPS: f64 = 30.0;
pub const DEFAULT_FONT_SIZE: f64 = 48.0;
pub const BASE_VIDEO_ID: &str = "__base_video";
pub const BASE_AUDIO_ID: &str = "__base_audio";

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Canvas {
    pub width: u32,
    pub height: u32,
    pub fps: f64,
}

/// Half-open `[from_ms, to_ms)` window.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Window {
    pub from_ms: f64,
    pub to_ms: f64,
}

impl Window {
    pub fn new(from_ms: f64, to_ms: f64) -> Self {
        Self { from_ms, to_ms }
    }

    pub fn duration_ms(&self) -> f64 {
        (self.to_ms - self.from_ms).max(0.0)
    }

    pub fn is_empty(&self) -> bool {
        self.duration_ms() <= 0.0
    }

    pub fn from_secs(&self) -> f64 {
        self.from_ms / 1000.0
    }

    pub fn to_secs(&self) -> f64 {
        self.to_ms / 1000.0
    }

    pub fn duration_secs(&self) -> f64 {
        self.duration_ms() / 1000.0
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TrackKind {
    Video,
    Image,
    Text,
    Audio,
    /// Absent or unrecognised track type; items still dispatch on their own kind.
    Mixed,
}

impl TrackKind {
    fn from_label(label: Option<&str>) -> Self {
        match label.map(str::to_ascii_lowercase).as_deref() {
            Some("video") => TrackKind::Video,
            Some("image") => TrackKind::Image,
            Some("text") => TrackKind::Text,
            Some("audio") => TrackKind::Audio,
            _ => TrackKind::Mixed,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Track {
    pub id: Option<String>,
    pub kind: TrackKind,
    pub items: Vec<ItemId>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct TimelineItem {
    pub id: ItemId,
    pub display: Window,
    /// Sub-range of the source media to sample.
    pub trim: Option<Window>,
    pub kind: ItemKind,
}

#[derive(Debug, Clone, PartialEq)]
pub enum ItemKind {
    Video(VisualDetails),
    Image(VisualDetails),
    Text(TextDetails),
    Audio(AudioDetails),
}

impl ItemKind {
    pub fn label(&self) -> &'static str {
        match self {
            ItemKind::Video(_) => "video",
            ItemKind::Image(_) => "image",
            ItemKind::Text(_) => "text",
            ItemKind::Audio(_) => "audio",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum VisualFit {
    /// Stretch the source to the item box.
    #[default]
    Fill,
    /// Fit inside the box keeping aspect ratio, centered on a transparent pad.
    Contain,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Crop {
    pub x: f64,
    pub y: f64,
    pub width: f64,
    pub height: f64,
}

#[derive(Debug, Clone, PartialEq)]
pub struct VisualDetails {
    pub src: String,
    pub left: f64,
    pub top: f64,
    /// Intrinsic box size; `None` when the document leaves it out.
    pub width: Option<f64>,
    pub height: Option<f64>,
    pub scale: f64,
    /// 0.0 ..= 1.0
    pub opacity: f64,
    /// 0.0 ..= 1.0, applied to embedded audio.
    pub volume: f64,
    pub crop: Option<Crop>,
    pub flip_x: bool,
    pub flip_y: bool,
    pub fit: VisualFit,
}

#[derive(Debug, Clone, PartialEq)]
pub struct TextDetails {
    pub text: String,
    pub font_size: f64,
    pub font_family: Option<String>,
    pub font_url: Option<String>,
    pub color: Rgba,
    pub background: Rgba,
    pub border_width: f64,
    pub border_color: Rgba,
    pub shadows: Vec<Shadow>,
    pub stroke_width: f64,
    pub stroke_color: Rgba,
    /// Extra pixels between lines at the unscaled font size.
    pub line_spacing: f64,
    pub letter_spacing: f64,
    pub align: TextAlign,
    pub wrap: WrapMode,
    pub left: f64,
    pub top: f64,
    pub width: Option<f64>,
    pub height: Option<f64>,
    pub scale: f64,
    pub opacity: f64,
}

#[derive(Debug, Clone, PartialEq)]
pub struct AudioDetails {
    pub src: String,
    /// 0.0 ..= 1.0
    pub volume: f64,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Scene {
    pub canvas: Canvas,
    pub duration_ms: f64,
    pub background: Rgba,
    pub tracks: Vec<Track>,
    pub items: HashMap<ItemId, TimelineItem>,
}

impl Scene {
    /// Normalizes a raw document. Fails with `InvalidScene` only when canvas
    /// size or duration is missing or non-positive; every other malformed
    /// field resolves to its default.
    pub fn from_document(document: SceneDocument) -> RenderResult<Self> {
        let SceneDocument {
            design,
            base_video_url,
            base_audio_url,
        } = document;
        let canvas = canvas_from(&design)?;
        let duration_ms = parse_millis(design.duration.as_ref())
            .ok_or_else(|| RenderError::invalid_scene("scene duration is missing"))?;
        if duration_ms <= 0.0 {
            return Err(RenderError::invalid_scene(format!(
                "scene duration must be positive, got {duration_ms}"
            )));
        }
        let background = background_from(design.background.as_ref());

        let mut scene = Scene {
            canvas,
            duration_ms,
            background,
            tracks: Vec::new(),
            items: HashMap::new(),
        };
        scene.push_base_layers(base_video_url, base_audio_url);

        let DesignDocument {
            tracks,
            track_items_map,
            ..
        } = design;
        let declared_tracks = match tracks {
            Some(tracks) => tracks
                .into_iter()
                .map(|track| {
                    let ids = track.item_ids().map(str::to_owned).collect::<Vec<_>>();
                    (track.id, TrackKind::from_label(track.kind.as_deref()), ids)
                })
                .collect::<Vec<_>>(),
            None => vec![(
                None,
                TrackKind::Mixed,
                track_items_map.keys().cloned().collect(),
            )],
        };

        for (track_id, kind, ids) in declared_tracks {
            let mut items = Vec::with_capacity(ids.len());
            for id in ids {
                if !scene.items.contains_key(&id) {
                    let Some(item) = normalize_item(&id, &track_items_map, duration_ms) else {
                        continue;
                    };
                    scene.items.insert(id.clone(), item);
                }
                items.push(id);
            }
            scene.tracks.push(Track {
                id: track_id,
                kind,
                items,
            });
        }

        Ok(scene)
    }

    /// Items in z-order: track order, then item order within each track.
    pub fn ordered_items(&self) -> impl Iterator<Item = &TimelineItem> + '_ {
        self.tracks
            .iter()
            .flat_map(|track| track.items.iter())
            .filter_map(|id| self.items.get(id))
    }

    pub fn duration_secs(&self) -> f64 {
        self.duration_ms / 1000.0
    }

    pub fn full_window(&self) -> Window {
        Window::new(0.0, self.duration_ms)
    }

    fn push_base_layers(&mut self, base_video_url: Option<String>, base_audio_url: Option<String>) {
        if let Some(src) = base_video_url {
            let details = VisualDetails {
                src,
                left: 0.0,
                top: 0.0,
                width: Some(f64::from(self.canvas.width)),
                height: Some(f64::from(self.canvas.height)),
                scale: 1.0,
                opacity: 1.0,
                volume: 1.0,
                crop: None,
                flip_x: false,
                flip_y: false,
                fit: VisualFit::Contain,
            };
            self.push_synthetic(BASE_VIDEO_ID, TrackKind::Video, ItemKind::Video(details));
        }
        if let Some(src) = base_audio_url {
            let details = AudioDetails { src, volume: 1.0 };
            self.push_synthetic(BASE_AUDIO_ID, TrackKind::Audio, ItemKind::Audio(details));
        }
    }

    fn push_synthetic(&mut self, id: &str, kind: TrackKind, item_kind: ItemKind) {
        let item = TimelineItem {
            id: id.to_owned(),
            display: self.full_window(),
            trim: None,
            kind: item_kind,
        };
        self.items.insert(id.to_owned(), item);
        self.tracks.push(Track {
            id: Some(id.to_owned()),
            kind,
            items: vec![id.to_owned()],
        });
    }
}

fn canvas_from(design: &DesignDocument) -> RenderResult<Canvas> {
    let size = design
        .size
        .as_ref()
        .ok_or_else(|| RenderError::invalid_scene("scene canvas size is missing"))?;
    let dimension = |value: Option<&Value>, axis: &str| -> RenderResult<u32> {
        let raw = parse_optional_pixels(value)
            .ok_or_else(|| RenderError::invalid_scene(format!("scene canvas {axis} is missing")))?;
        let rounded = raw.round();
        if rounded < 1.0 || rounded > f64::from(u16::MAX) {
            return Err(RenderError::invalid_scene(format!(
                "scene canvas {axis} must be positive, got {raw}"
            )));
        }
        Ok(rounded as u32)
    };
    let width = dimension(size.width.as_ref(), "width")?;
    let height = dimension(size.height.as_ref(), "height")?;
    let fps = parse_millis(design.fps.as_ref())
        .filter(|fps| *fps > 0.0 && *fps <= 240.0)
        .unwrap_or(DEFAULT_FPS);
    Ok(Canvas { width, height, fps })
}

fn background_from(value: Option<&Value>) -> Rgba {
    match value {
        Some(Value::Object(map)) => parse_color_or(map.get("value"), Rgba::BLACK),
        Some(other) => parse_color_or(Some(other), Rgba::BLACK),
        None => Rgba::BLACK,
    }
}

fn normalize_item(id: &str, items: &Map<String, Value>, duration_ms: f64) -> Option<TimelineItem> {
    let Some(raw) = items.get(id) else {
        tracing::warn!(item = id, "track references a missing item; skipping");
        return None;
    };
    let document: ItemDocument = match serde_json::from_value(raw.clone()) {
        Ok(document) => document,
        Err(error) => {
            tracing::warn!(item = id, error = %error, "malformed timeline item; skipping");
            return None;
        }
    };

    let display = display_window(document.display.as_ref(), duration_ms);
    let trim = trim_window(document.trim.as_ref(), display);
    let details = &document.details;
    let kind = match document.kind.trim().to_ascii_lowercase().as_str() {
        "video" => ItemKind::Video(visual_details(details)),
        "image" => ItemKind::Image(visual_details(details)),
        "text" => ItemKind::Text(text_details(details)),
        "audio" => ItemKind::Audio(AudioDetails {
            src: string_field(details, "src").unwrap_or_default(),
            volume: parse_percent(details.get("volume")),
        }),
        other => {
            tracing::warn!(item = id, kind = other, "unsupported item kind; skipping");
            return None;
        }
    };

    Some(TimelineItem {
        id: document.id.unwrap_or_else(|| id.to_owned()),
        display,
        trim,
        kind,
    })
}

/// Clamps into `0 <= from <= to <= duration`.
fn display_window(window: Option<&WindowDocument>, duration_ms: f64) -> Window {
    let from = window
        .and_then(|window| parse_millis(window.from.as_ref()))
        .unwrap_or(0.0)
        .clamp(0.0, duration_ms);
    let to = window
        .and_then(|window| parse_millis(window.to.as_ref()))
        .unwrap_or(duration_ms)
        .clamp(from, duration_ms);
    Window::new(from, to)
}

/// A trim without an end samples as much source as the display window shows.
fn trim_window(window: Option<&WindowDocument>, display: Window) -> Option<Window> {
    let window = window?;
    let from = parse_millis(window.from.as_ref()).unwrap_or(0.0).max(0.0);
    let to = parse_millis(window.to.as_ref())
        .filter(|to| *to > from)
        .unwrap_or(from + display.duration_ms());
    Some(Window::new(from, to))
}

fn visual_details(details: &Map<String, Value>) -> VisualDetails {
    let crop = details
        .get("crop")
        .and_then(Value::as_object)
        .map(|crop| Crop {
            x: parse_pixels(crop.get("x")).max(0.0),
            y: parse_pixels(crop.get("y")).max(0.0),
            width: parse_pixels(crop.get("width")),
            height: parse_pixels(crop.get("height")),
        })
        .filter(|crop| crop.width > 0.0 && crop.height > 0.0);

    VisualDetails {
        src: string_field(details, "src").unwrap_or_default(),
        left: parse_pixels(details.get("left")),
        top: parse_pixels(details.get("top")),
        width: positive_pixels(details.get("width")),
        height: positive_pixels(details.get("height")),
        scale: parse_scale(details.get("transform")),
        opacity: parse_percent(details.get("opacity")),
        volume: parse_percent(details.get("volume")),
        crop,
        flip_x: parse_bool(details.get("flipX")),
        flip_y: parse_bool(details.get("flipY")),
        fit: VisualFit::Fill,
    }
}

fn text_details(details: &Map<String, Value>) -> TextDetails {
    let font_size = positive_pixels(details.get("fontSize")).unwrap_or(DEFAULT_FONT_SIZE);
    let stroke_width = details
        .get("WebkitTextStrokeWidth")
        .or_else(|| details.get("strokeWidth"))
        .map(|value| parse_pixels(Some(value)).max(0.0))
        .unwrap_or(0.0);
    let stroke_color = parse_color_or(
        details
            .get("WebkitTextStrokeColor")
            .or_else(|| details.get("strokeColor")),
        Rgba::BLACK,
    );
    let mut shadows = parse_shadows(details.get("textShadow"));
    shadows.extend(parse_shadows(details.get("boxShadow")));

    TextDetails {
        text: string_field(details, "text").unwrap_or_default(),
        font_size,
        font_family: string_field(details, "fontFamily"),
        font_url: string_field(details, "fontUrl"),
        color: parse_color_or(details.get("color"), Rgba::WHITE),
        background: parse_color_or(details.get("backgroundColor"), Rgba::TRANSPARENT),
        border_width: parse_pixels(details.get("borderWidth")).max(0.0),
        border_color: parse_color_or(details.get("borderColor"), Rgba::BLACK),
        shadows,
        stroke_width,
        stroke_color,
        line_spacing: compute_line_spacing(details.get("lineHeight"), font_size) as f64,
        letter_spacing: parse_letter_spacing(details.get("letterSpacing")),
        align: parse_text_align(details.get("textAlign")),
        wrap: parse_wrap_mode(details.get("wordWrap"), details.get("wordBreak")),
        left: parse_pixels(details.get("left")),
        top: parse_pixels(details.get("top")),
        width: positive_pixels(details.get("width")),
        height: positive_pixels(details.get("height")),
        scale: parse_scale(details.get("transform")),
        opacity: parse_percent(details.get("opacity")),
    }
}

fn positive_pixels(value: Option<&Value>) -> Option<f64> {
    parse_optional_pixels(value).filter(|v| *v > 0.0)
}

fn string_field(details: &Map<String, Value>, key: &str) -> Option<String> {
    match details.get(key) {
        Some(Value::String(text)) if !text.trim().is_empty() => Some(text.clone()),
        Some(Value::Number(number)) => Some(number.to_string()),
        _ => None,
    }
}

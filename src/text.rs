//! Text layout: placeholder substitution, wrapping, font choice and the
//! drawbox/drawtext passes a text item contributes to the filter graph.
//!
//! Layout never fails. A font that cannot be found falls back to the next
//! choice, and without a loadable font file line widths use the average
//! glyph estimate.

use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use fontdue::{Font, FontSettings};
use walkdir::WalkDir;

use crate::media::MediaLocator;
use crate::resolve::{estimated_glyph_width, format_decimal, wrap_text, Rgba, TextAlign};
use crate::scene::{Canvas, TextDetails};
use crate::substitute::{substitute, SubstitutionContext};

/// Shadows are drawn with their declared alpha scaled by this factor.
pub const SHADOW_ALPHA_FACTOR: f64 = 0.6;
const FONT_EXTENSIONS: [&str; 2] = ["ttf", "otf"];
const FONT_SEARCH_DEPTH: usize = 4;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FontChoice {
    File(PathBuf),
    /// Family name handed to fontconfig.
    Family(String),
    /// Whatever drawtext picks on its own.
    Builtin,
}

impl FontChoice {
    fn filter_option(&self) -> Option<String> {
        match self {
            FontChoice::File(path) => Some(format!(
                "fontfile={}",
                escape_filter_value(&path.to_string_lossy())
            )),
            FontChoice::Family(family) => Some(format!("font={}", escape_filter_value(family))),
            FontChoice::Builtin => None,
        }
    }

    pub fn file(&self) -> Option<&Path> {
        match self {
            FontChoice::File(path) => Some(path),
            _ => None,
        }
    }
}

/// Resolves fonts for text items and caches parsed font files for
/// measurement. Shared across render workers.
#[derive(Default)]
pub struct FontLibrary {
    font_root: Option<PathBuf>,
    default_font: Option<PathBuf>,
    loaded: Mutex<HashMap<PathBuf, Option<Arc<Font>>>>,
}

impl std::fmt::Debug for FontLibrary {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FontLibrary")
            .field("font_root", &self.font_root)
            .field("default_font", &self.default_font)
            .finish_non_exhaustive()
    }
}

impl FontLibrary {
    pub fn new(font_root: Option<PathBuf>, default_font: Option<PathBuf>) -> Self {
        Self {
            font_root,
            default_font,
            loaded: Mutex::new(HashMap::new()),
        }
    }

    /// `fontUrl` (after placeholder substitution) through the locator, then
    /// a `fontFamily` file under the font root, then the configured default
    /// font, then the bare family name.
    pub fn choose(
        &self,
        details: &TextDetails,
        context: Option<&SubstitutionContext>,
        locator: &MediaLocator,
    ) -> FontChoice {
        if let Some(raw) = details.font_url.as_deref() {
            let url = substitute(raw, context);
            let url = url.trim();
            if !url.is_empty() {
                match locator.resolve(url) {
                    Ok(path) => return FontChoice::File(path),
                    Err(error) => {
                        tracing::warn!(font_url = url, error = %error, "font URL unresolved; falling back");
                    }
                }
            }
        }
        if let Some(family) = details.font_family.as_deref() {
            if let Some(path) = self.find_family_file(family) {
                return FontChoice::File(path);
            }
        }
        if let Some(path) = self.default_font.as_ref().filter(|path| path.is_file()) {
            return FontChoice::File(path.clone());
        }
        match details.font_family.as_deref() {
            Some(family) => FontChoice::Family(family.to_owned()),
            None => FontChoice::Builtin,
        }
    }

    fn find_family_file(&self, family: &str) -> Option<PathBuf> {
        let root = self.font_root.as_ref()?;
        let wanted = normalize_family(family);
        if wanted.is_empty() {
            return None;
        }
        let regular = format!("{wanted}regular");
        let mut candidates = WalkDir::new(root)
            .max_depth(FONT_SEARCH_DEPTH)
            .sort_by_file_name()
            .into_iter()
            .filter_map(Result::ok)
            .filter(|entry| entry.file_type().is_file())
            .filter(|entry| {
                entry
                    .path()
                    .extension()
                    .and_then(|ext| ext.to_str())
                    .is_some_and(|ext| FONT_EXTENSIONS.contains(&ext.to_ascii_lowercase().as_str()))
            })
            .filter_map(|entry| {
                let stem = normalize_family(&entry.path().file_stem()?.to_string_lossy());
                let rank = if stem == wanted {
                    0
                } else if stem == regular {
                    1
                } else {
                    return None;
                };
                Some((rank, entry.into_path()))
            })
            .collect::<Vec<_>>();
        candidates.sort_by_key(|(rank, _)| *rank);
        candidates.into_iter().next().map(|(_, path)| path)
    }

    /// Parsed font for measurement, loaded once per path.
    pub fn metrics(&self, choice: &FontChoice) -> Option<Arc<Font>> {
        let path = choice.file()?;
        let mut loaded = match self.loaded.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        loaded
            .entry(path.to_path_buf())
            .or_insert_with(|| load_font(path))
            .clone()
    }
}

fn load_font(path: &Path) -> Option<Arc<Font>> {
    let bytes = match fs::read(path) {
        Ok(bytes) => bytes,
        Err(error) => {
            tracing::warn!(path = %path.display(), error = %error, "failed to read font file");
            return None;
        }
    };
    match Font::from_bytes(bytes, FontSettings::default()) {
        Ok(font) => Some(Arc::new(font)),
        Err(error) => {
            tracing::warn!(path = %path.display(), error, "failed to parse font file; using width estimate");
            None
        }
    }
}

fn normalize_family(name: &str) -> String {
    name.chars()
        .filter(|c| c.is_alphanumeric())
        .flat_map(char::to_lowercase)
        .collect()
}

#[derive(Debug, Clone, PartialEq)]
pub enum DrawPass {
    Box(BoxPass),
    Text(TextPass),
}

#[derive(Debug, Clone, PartialEq)]
pub struct BoxPass {
    pub x: f64,
    pub y: f64,
    pub width: f64,
    pub height: f64,
    pub color: Rgba,
    /// `None` fills the box.
    pub thickness: Option<f64>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct TextPass {
    /// One unescaped line.
    pub text: String,
    pub x: f64,
    pub y: f64,
    pub font_size: f64,
    pub color: Rgba,
    pub font: FontChoice,
    pub border_width: f64,
    pub border_color: Rgba,
}

impl DrawPass {
    /// Filter expression for this pass, gated by `enable`.
    pub fn to_filter(&self, enable: &str) -> String {
        match self {
            DrawPass::Box(pass) => {
                let thickness = pass
                    .thickness
                    .map(|t| t.round().max(1.0).to_string())
                    .unwrap_or_else(|| "fill".to_owned());
                format!(
                    "drawbox=x={}:y={}:w={}:h={}:color={}:t={}:enable='{}'",
                    pass.x.round() as i64,
                    pass.y.round() as i64,
                    pass.width.round().max(1.0) as i64,
                    pass.height.round().max(1.0) as i64,
                    pass.color.to_ffmpeg(),
                    thickness,
                    enable
                )
            }
            DrawPass::Text(pass) => {
                let mut options = vec![
                    format!("text={}", escape_drawtext_text(&pass.text)),
                    format!("x={}", format_decimal(pass.x, 2)),
                    format!("y={}", format_decimal(pass.y, 2)),
                    format!("fontsize={}", format_decimal(pass.font_size, 2)),
                    format!("fontcolor={}", pass.color.to_ffmpeg()),
                ];
                if let Some(font) = pass.font.filter_option() {
                    options.push(font);
                }
                if pass.border_width > 0.0 {
                    options.push(format!("borderw={}", format_decimal(pass.border_width, 2)));
                    options.push(format!("bordercolor={}", pass.border_color.to_ffmpeg()));
                }
                options.push(format!("enable='{enable}'"));
                format!("drawtext={}", options.join(":"))
            }
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct TextLayout {
    pub lines: Vec<String>,
    /// Background and border boxes, then shadow passes, then main passes.
    pub passes: Vec<DrawPass>,
}

/// Lays a text item out into draw passes.
///
/// The transform scale applies to font size, spacing and box, anchored at the
/// box center. With a box height the text block is centered vertically; with a
/// box width each line aligns inside it, otherwise lines align against the
/// widest line.
pub fn layout_text(
    details: &TextDetails,
    context: Option<&SubstitutionContext>,
    canvas: Canvas,
    font: &FontChoice,
    metrics: Option<&Font>,
) -> TextLayout {
    let scale = details.scale;
    let font_size = (details.font_size * scale).max(1.0);
    let letter_spacing = details.letter_spacing * scale;
    let line_spacing = details.line_spacing * scale;

    let text = substitute(&details.text, context);
    let box_width = details.width.map(|w| w * scale);
    let wrapped = wrap_text(
        &text,
        box_width,
        font_size,
        letter_spacing,
        details.wrap,
        canvas.width,
    );
    let lines = wrapped
        .split('\n')
        .map(|line| line.trim_end().to_owned())
        .collect::<Vec<_>>();

    let widths = lines
        .iter()
        .map(|line| measure_line(line, font_size, letter_spacing, metrics))
        .collect::<Vec<_>>();
    let block_width = widths.iter().copied().fold(0.0_f64, f64::max);
    let line_count = lines.len() as f64;
    let block_height = line_count * font_size + (line_count - 1.0).max(0.0) * line_spacing;

    let intrinsic_width = details.width.unwrap_or(block_width / scale);
    let intrinsic_height = details.height.unwrap_or(block_height / scale);
    let box_left = details.left + (intrinsic_width - intrinsic_width * scale) / 2.0;
    let box_top = details.top + (intrinsic_height - intrinsic_height * scale) / 2.0;
    let frame_width = box_width.unwrap_or(block_width);
    let frame_height = details.height.map(|h| h * scale);

    let first_line_y = match frame_height {
        Some(height) => box_top + (height - block_height) / 2.0,
        None => box_top,
    };
    let positions = widths
        .iter()
        .enumerate()
        .map(|(index, width)| {
            let slack = frame_width - width;
            let x = match details.align {
                TextAlign::Left => box_left,
                TextAlign::Center => box_left + slack / 2.0,
                TextAlign::Right => box_left + slack,
            };
            (x, first_line_y + index as f64 * (font_size + line_spacing))
        })
        .collect::<Vec<_>>();

    let mut passes = Vec::new();
    let box_height = frame_height.unwrap_or(block_height);
    let background = details.background.with_alpha_factor(details.opacity);
    if !background.is_transparent() {
        passes.push(DrawPass::Box(BoxPass {
            x: box_left,
            y: box_top,
            width: frame_width,
            height: box_height,
            color: background,
            thickness: None,
        }));
    }
    if details.border_width > 0.0 {
        let border = details.border_color.with_alpha_factor(details.opacity);
        if !border.is_transparent() {
            passes.push(DrawPass::Box(BoxPass {
                x: box_left,
                y: box_top,
                width: frame_width,
                height: box_height,
                color: border,
                thickness: Some(details.border_width * scale),
            }));
        }
    }

    let visible = lines
        .iter()
        .zip(&positions)
        .filter(|(line, _)| !line.trim().is_empty())
        .collect::<Vec<_>>();

    for shadow in &details.shadows {
        let color = shadow
            .color
            .with_alpha_factor(SHADOW_ALPHA_FACTOR * details.opacity);
        for (line, (x, y)) in &visible {
            passes.push(DrawPass::Text(TextPass {
                text: (*line).clone(),
                x: x + shadow.offset_x * scale,
                y: y + shadow.offset_y * scale,
                font_size,
                color,
                font: font.clone(),
                border_width: 0.0,
                border_color: Rgba::TRANSPARENT,
            }));
        }
    }

    let color = details.color.with_alpha_factor(details.opacity);
    let stroke = details.stroke_color.with_alpha_factor(details.opacity);
    for (line, (x, y)) in &visible {
        passes.push(DrawPass::Text(TextPass {
            text: (*line).clone(),
            x: *x,
            y: *y,
            font_size,
            color,
            font: font.clone(),
            border_width: details.stroke_width * scale,
            border_color: stroke,
        }));
    }

    TextLayout { lines, passes }
}

/// Line width in pixels: font advances when a font is loaded, the average
/// glyph estimate otherwise.
pub fn measure_line(line: &str, font_size: f64, letter_spacing: f64, font: Option<&Font>) -> f64 {
    let glyphs = line.chars().count();
    if glyphs == 0 {
        return 0.0;
    }
    match font {
        Some(font) => {
            let advances = line
                .chars()
                .map(|c| f64::from(font.metrics(c, font_size as f32).advance_width))
                .sum::<f64>();
            advances + letter_spacing * (glyphs - 1) as f64
        }
        None => estimated_glyph_width(font_size, letter_spacing) * glyphs as f64,
    }
}

/// Escapes a line for a drawtext `text=` option inside a filter graph.
///
/// Three parsers read the value in turn: the graph parser, the filter option
/// parser and drawtext's own `%{...}` expansion. Each level is escaped in
/// reverse order.
pub fn escape_drawtext_text(text: &str) -> String {
    let cleaned = text
        .chars()
        .map(|c| if c == '\t' || c == '\n' || c == '\r' { ' ' } else { c })
        .filter(|c| !c.is_control())
        .collect::<String>();
    let expansion = backslash_escape(&cleaned, &['\\', '%']);
    escape_filter_value(&expansion)
}

/// Escapes an option value (font path, family name) for the option parser
/// and the graph parser.
pub fn escape_filter_value(value: &str) -> String {
    let option = backslash_escape(value, &['\\', '\'', ':']);
    backslash_escape(&option, &['\\', '\'', '[', ']', ',', ';'])
}

fn backslash_escape(value: &str, special: &[char]) -> String {
    let mut escaped = String::with_capacity(value.len());
    for c in value.chars() {
        if special.contains(&c) {
            escaped.push('\\');
        }
        escaped.push(c);
    }
    escaped
}

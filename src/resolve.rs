//! Value resolvers for the loosely typed fields an authoring tool writes into
//! scene documents: pixel strings, CSS transforms, color strings, line heights
//! and word-wrap modes.
//!
//! Every resolver is total. Malformed input resolves to a documented default
//! and never raises, so encoding quirks cannot abort an otherwise renderable
//! scene. Raw strings do not travel past this module.

use std::sync::OnceLock;

use regex::Regex;
use serde_json::Value;

/// Canvas fraction used as wrap width when a text item declares no box.
pub const FALLBACK_WRAP_FRACTION: f64 = 0.7;
/// Average glyph advance as a fraction of the font size.
pub const AVG_GLYPH_WIDTH_EM: f64 = 0.55;
/// Line height used for `normal` / absent, as a multiple of the font size.
pub const NORMAL_LINE_HEIGHT_EM: f64 = 1.2;

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Rgba {
    pub r: u8,
    pub g: u8,
    pub b: u8,
    /// 0.0 (transparent) ..= 1.0 (opaque)
    pub alpha: f64,
}

impl Rgba {
    pub const WHITE: Rgba = Rgba::opaque(255, 255, 255);
    pub const BLACK: Rgba = Rgba::opaque(0, 0, 0);
    pub const TRANSPARENT: Rgba = Rgba {
        r: 0,
        g: 0,
        b: 0,
        alpha: 0.0,
    };

    pub const fn opaque(r: u8, g: u8, b: u8) -> Self {
        Self { r, g, b, alpha: 1.0 }
    }

    pub fn is_transparent(&self) -> bool {
        self.alpha <= f64::EPSILON
    }

    pub fn with_alpha_factor(self, factor: f64) -> Self {
        Self {
            alpha: (self.alpha * factor).clamp(0.0, 1.0),
            ..self
        }
    }

    /// ffmpeg color syntax: `0xRRGGBB@alpha`.
    pub fn to_ffmpeg(&self) -> String {
        format!(
            "0x{:02X}{:02X}{:02X}@{}",
            self.r,
            self.g,
            self.b,
            format_decimal(self.alpha, 3)
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum WrapMode {
    /// Break only between words; an over-long word overflows its line.
    #[default]
    Normal,
    /// Break inside a word when it alone exceeds the line budget.
    BreakWord,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum TextAlign {
    #[default]
    Left,
    Center,
    Right,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Shadow {
    pub offset_x: f64,
    pub offset_y: f64,
    pub blur: f64,
    pub color: Rgba,
}

/// Parses a position or length: `120`, `"120px"`, `"-15.5px"`. Legacy data
/// sometimes stores a two-axis value (`"0.3, 0.3"`) in a one-axis field; only
/// the first component is kept. Defaults to `0.0`.
pub fn parse_pixels(value: Option<&Value>) -> f64 {
    match value {
        Some(Value::Number(number)) => number.as_f64().filter(|v| v.is_finite()).unwrap_or(0.0),
        Some(Value::String(raw)) => pixels_from_str(raw).unwrap_or(0.0),
        _ => 0.0,
    }
}

/// Same as [`parse_pixels`] but distinguishes an absent or unparseable value.
pub fn parse_optional_pixels(value: Option<&Value>) -> Option<f64> {
    match value {
        Some(Value::Number(number)) => number.as_f64().filter(|v| v.is_finite()),
        Some(Value::String(raw)) => pixels_from_str(raw),
        _ => None,
    }
}

fn pixels_from_str(raw: &str) -> Option<f64> {
    let first = raw
        .trim()
        .split(|c: char| c == ',' || c.is_whitespace())
        .next()
        .unwrap_or_default();
    let numeric = first.trim_end_matches(|c: char| c.is_ascii_alphabetic() || c == '%');
    numeric.parse::<f64>().ok().filter(|v| v.is_finite())
}

/// Extracts the first argument of a `scale(...)` transform. `none`, absent,
/// unparseable or non-positive scales resolve to `1.0`.
pub fn parse_scale(value: Option<&Value>) -> f64 {
    static SCALE_RE: OnceLock<Regex> = OnceLock::new();
    let parsed = match value {
        Some(Value::Number(number)) => number.as_f64(),
        Some(Value::String(raw)) => {
            let trimmed = raw.trim();
            if trimmed.is_empty() || trimmed.eq_ignore_ascii_case("none") {
                None
            } else {
                let re = SCALE_RE.get_or_init(|| {
                    Regex::new(r"(?i)scale\(\s*([-+]?(?:\d+\.?\d*|\.\d+)(?:e[-+]?\d+)?)")
                        .expect("scale regex should compile")
                });
                match re.captures(trimmed) {
                    Some(capture) => capture
                        .get(1)
                        .and_then(|m| m.as_str().parse::<f64>().ok()),
                    None => trimmed.parse::<f64>().ok(),
                }
            }
        }
        _ => None,
    };
    parsed.filter(|v| v.is_finite() && *v > 0.0).unwrap_or(1.0)
}

/// Parses `#rgb`, `#rgba`, `#rrggbb`, `#rrggbbaa` (with or without `#`/`0x`),
/// `rgb()`, `rgba()`, `transparent` and a handful of CSS keywords. Defaults
/// to opaque white.
pub fn parse_color(value: Option<&Value>) -> Rgba {
    match value {
        Some(Value::String(raw)) => color_from_str(raw).unwrap_or(Rgba::WHITE),
        _ => Rgba::WHITE,
    }
}

/// Like [`parse_color`] but keeps a caller-chosen default for absent values.
pub fn parse_color_or(value: Option<&Value>, default: Rgba) -> Rgba {
    match value {
        Some(Value::String(raw)) if !raw.trim().is_empty() => {
            color_from_str(raw).unwrap_or(Rgba::WHITE)
        }
        _ => default,
    }
}

fn color_from_str(raw: &str) -> Option<Rgba> {
    let trimmed = raw.trim();
    let lower = trimmed.to_ascii_lowercase();
    if lower.starts_with("rgb") {
        return color_from_function(&lower);
    }
    if let Some(named) = named_color(&lower) {
        return Some(named);
    }
    let hex = lower
        .strip_prefix('#')
        .or_else(|| lower.strip_prefix("0x"))
        .unwrap_or(&lower);
    color_from_hex(hex)
}

fn named_color(name: &str) -> Option<Rgba> {
    let color = match name {
        "transparent" | "none" => Rgba::TRANSPARENT,
        "white" | "default" => Rgba::WHITE,
        "black" => Rgba::BLACK,
        "red" => Rgba::opaque(255, 0, 0),
        "green" => Rgba::opaque(0, 128, 0),
        "lime" => Rgba::opaque(0, 255, 0),
        "blue" => Rgba::opaque(0, 0, 255),
        "yellow" => Rgba::opaque(255, 255, 0),
        "orange" => Rgba::opaque(255, 165, 0),
        "gray" | "grey" => Rgba::opaque(128, 128, 128),
        _ => return None,
    };
    Some(color)
}

fn color_from_hex(hex: &str) -> Option<Rgba> {
    if !hex.chars().all(|c| c.is_ascii_hexdigit()) {
        return None;
    }
    let nibble = |i: usize| u8::from_str_radix(&hex[i..=i], 16).ok().map(|v| v * 17);
    let byte = |i: usize| u8::from_str_radix(&hex[i..i + 2], 16).ok();
    match hex.len() {
        3 => Some(Rgba::opaque(nibble(0)?, nibble(1)?, nibble(2)?)),
        4 => Some(Rgba {
            r: nibble(0)?,
            g: nibble(1)?,
            b: nibble(2)?,
            alpha: f64::from(nibble(3)?) / 255.0,
        }),
        6 => Some(Rgba::opaque(byte(0)?, byte(2)?, byte(4)?)),
        8 => Some(Rgba {
            r: byte(0)?,
            g: byte(2)?,
            b: byte(4)?,
            alpha: f64::from(byte(6)?) / 255.0,
        }),
        _ => None,
    }
}

fn color_from_function(lower: &str) -> Option<Rgba> {
    let open = lower.find('(')?;
    let close = lower.rfind(')')?;
    let args = lower
        .get(open + 1..close)?
        .split(|c: char| c == ',' || c == '/' || c.is_whitespace())
        .filter(|part| !part.is_empty())
        .collect::<Vec<_>>();
    if args.len() < 3 {
        return None;
    }
    let channel = |raw: &str| -> Option<u8> {
        let value = match raw.strip_suffix('%') {
            Some(percent) => percent.parse::<f64>().ok()? * 2.55,
            None => raw.parse::<f64>().ok()?,
        };
        Some(value.round().clamp(0.0, 255.0) as u8)
    };
    let alpha = match args.get(3) {
        Some(raw) => match raw.strip_suffix('%') {
            Some(percent) => percent.parse::<f64>().ok()? / 100.0,
            None => raw.parse::<f64>().ok()?,
        },
        None => 1.0,
    };
    Some(Rgba {
        r: channel(args[0])?,
        g: channel(args[1])?,
        b: channel(args[2])?,
        alpha: alpha.clamp(0.0, 1.0),
    })
}

/// Returns the extra spacing between lines, in pixels, relative to the font
/// size. `normal`/absent means 1.2em; a numeric value below 3 is an em
/// multiplier, anything else is an absolute line height in pixels.
pub fn compute_line_spacing(line_height: Option<&Value>, font_size: f64) -> i64 {
    let line_height_px = match line_height {
        Some(Value::Number(number)) => number
            .as_f64()
            .filter(|v| v.is_finite() && *v > 0.0)
            .map(|v| line_height_to_px(v, font_size)),
        Some(Value::String(raw)) => {
            let trimmed = raw.trim();
            if let Some(percent) = trimmed.strip_suffix('%') {
                percent
                    .trim()
                    .parse::<f64>()
                    .ok()
                    .filter(|v| v.is_finite() && *v > 0.0)
                    .map(|v| font_size * v / 100.0)
            } else {
                pixels_from_str(trimmed)
                    .filter(|v| *v > 0.0)
                    .map(|v| line_height_to_px(v, font_size))
            }
        }
        _ => None,
    }
    .unwrap_or(font_size * NORMAL_LINE_HEIGHT_EM);
    (line_height_px - font_size).round() as i64
}

fn line_height_to_px(value: f64, font_size: f64) -> f64 {
    if value < 3.0 {
        value * font_size
    } else {
        value
    }
}

/// `normal`, absent and unparseable letter spacing resolve to zero.
pub fn parse_letter_spacing(value: Option<&Value>) -> f64 {
    parse_pixels(value)
}

pub fn parse_wrap_mode(word_wrap: Option<&Value>, word_break: Option<&Value>) -> WrapMode {
    let breaks = |value: Option<&Value>| {
        value.and_then(Value::as_str).is_some_and(|raw| {
            matches!(
                raw.trim().to_ascii_lowercase().as_str(),
                "break-word" | "break-all" | "anywhere"
            )
        })
    };
    if breaks(word_wrap) || breaks(word_break) {
        WrapMode::BreakWord
    } else {
        WrapMode::Normal
    }
}

pub fn parse_text_align(value: Option<&Value>) -> TextAlign {
    match value
        .and_then(Value::as_str)
        .map(|raw| raw.trim().to_ascii_lowercase())
        .as_deref()
    {
        Some("center") => TextAlign::Center,
        Some("right") | Some("end") => TextAlign::Right,
        _ => TextAlign::Left,
    }
}

/// Percent fields (`opacity`, `volume`) in 0–100; absent means 100. Returns a
/// factor in `0.0..=1.0`.
pub fn parse_percent(value: Option<&Value>) -> f64 {
    let raw = match value {
        Some(Value::Number(number)) => number.as_f64(),
        Some(Value::String(raw)) => raw.trim().trim_end_matches('%').parse::<f64>().ok(),
        _ => None,
    };
    raw.filter(|v| v.is_finite())
        .map(|v| (v / 100.0).clamp(0.0, 1.0))
        .unwrap_or(1.0)
}

/// Milliseconds as number or numeric string; `None` when absent/unparseable.
pub fn parse_millis(value: Option<&Value>) -> Option<f64> {
    match value {
        Some(Value::Number(number)) => number.as_f64(),
        Some(Value::String(raw)) => raw.trim().parse::<f64>().ok(),
        _ => None,
    }
    .filter(|v| v.is_finite())
}

pub fn parse_bool(value: Option<&Value>) -> bool {
    match value {
        Some(Value::Bool(flag)) => *flag,
        Some(Value::Number(number)) => number.as_f64().is_some_and(|v| v != 0.0),
        Some(Value::String(raw)) => matches!(raw.trim(), "true" | "1" | "yes"),
        _ => false,
    }
}

/// Parses a CSS `text-shadow` list (`"2px 2px 4px #000, -1px 0 red"`) or a
/// `{x, y, blur, color}` object. Shadows with no offset, no blur, or a fully
/// transparent color are dropped.
pub fn parse_shadows(value: Option<&Value>) -> Vec<Shadow> {
    let shadows = match value {
        Some(Value::String(raw)) => split_top_level(raw)
            .into_iter()
            .filter_map(shadow_from_css)
            .collect(),
        Some(Value::Object(map)) => {
            let shadow = Shadow {
                offset_x: parse_pixels(map.get("x")),
                offset_y: parse_pixels(map.get("y")),
                blur: parse_pixels(map.get("blur")),
                color: parse_color_or(map.get("color"), Rgba::BLACK),
            };
            vec![shadow]
        }
        Some(Value::Array(list)) => list
            .iter()
            .flat_map(|entry| parse_shadows(Some(entry)))
            .collect(),
        _ => Vec::new(),
    };
    shadows
        .into_iter()
        .filter(|shadow| {
            !shadow.color.is_transparent()
                && (shadow.offset_x != 0.0 || shadow.offset_y != 0.0 || shadow.blur > 0.0)
        })
        .collect()
}

fn split_top_level(raw: &str) -> Vec<&str> {
    let mut parts = Vec::new();
    let mut depth = 0_i32;
    let mut start = 0;
    for (index, ch) in raw.char_indices() {
        match ch {
            '(' => depth += 1,
            ')' => depth -= 1,
            ',' if depth == 0 => {
                parts.push(&raw[start..index]);
                start = index + 1;
            }
            _ => {}
        }
    }
    parts.push(&raw[start..]);
    parts
}

fn shadow_from_css(raw: &str) -> Option<Shadow> {
    let trimmed = raw.trim();
    if trimmed.is_empty() || trimmed.eq_ignore_ascii_case("none") {
        return None;
    }
    let mut lengths = Vec::new();
    let mut color = None;
    let mut rest = trimmed;
    while !rest.is_empty() {
        rest = rest.trim_start();
        let token_end = if rest.to_ascii_lowercase().starts_with("rgb") {
            rest.find(')').map_or(rest.len(), |i| i + 1)
        } else {
            rest.find(char::is_whitespace).unwrap_or(rest.len())
        };
        let token = &rest[..token_end];
        rest = &rest[token_end..];
        if token.is_empty() {
            continue;
        }
        match pixels_from_str(token) {
            Some(length) if !token.starts_with('#') => lengths.push(length),
            _ => color = color_from_str(token),
        }
    }
    if lengths.len() < 2 {
        return None;
    }
    Some(Shadow {
        offset_x: lengths[0],
        offset_y: lengths[1],
        blur: lengths.get(2).copied().unwrap_or(0.0),
        color: color.unwrap_or(Rgba::BLACK),
    })
}

/// Estimated glyph advance for wrapping, in pixels.
pub fn estimated_glyph_width(font_size: f64, letter_spacing: f64) -> f64 {
    (font_size * AVG_GLYPH_WIDTH_EM + letter_spacing).max(1.0)
}

/// Greedy word wrap using the average-glyph-width estimate. Without a box
/// width the text wraps at 70% of the canvas width. Explicit line breaks are
/// kept.
pub fn wrap_text(
    text: &str,
    box_width: Option<f64>,
    font_size: f64,
    letter_spacing: f64,
    wrap_mode: WrapMode,
    canvas_width: u32,
) -> String {
    let width = box_width
        .filter(|w| *w > 0.0)
        .unwrap_or(f64::from(canvas_width) * FALLBACK_WRAP_FRACTION);
    let glyphs = width / estimated_glyph_width(font_size, letter_spacing);
    let budget = ((glyphs + 1e-9).floor() as usize).max(1);

    text.replace("\r\n", "\n")
        .replace('\r', "\n")
        .split('\n')
        .map(|paragraph| wrap_paragraph(paragraph, budget, wrap_mode).join("\n"))
        .collect::<Vec<_>>()
        .join("\n")
}

fn wrap_paragraph(paragraph: &str, budget: usize, wrap_mode: WrapMode) -> Vec<String> {
    let mut lines = Vec::new();
    let mut current = String::new();
    let mut current_len = 0_usize;

    for word in paragraph.split_whitespace() {
        let word_len = word.chars().count();
        let needed = if current.is_empty() {
            word_len
        } else {
            current_len + 1 + word_len
        };
        if needed <= budget {
            if !current.is_empty() {
                current.push(' ');
            }
            current.push_str(word);
            current_len = needed;
            continue;
        }

        if !current.is_empty() {
            lines.push(std::mem::take(&mut current));
            current_len = 0;
        }

        if word_len > budget && wrap_mode == WrapMode::BreakWord {
            let chars = word.chars().collect::<Vec<_>>();
            let mut chunks = chars.chunks(budget).peekable();
            while let Some(chunk) = chunks.next() {
                let piece = chunk.iter().collect::<String>();
                if chunks.peek().is_some() {
                    lines.push(piece);
                } else {
                    current_len = chunk.len();
                    current = piece;
                }
            }
        } else {
            current.push_str(word);
            current_len = word_len;
        }
    }

    if !current.is_empty() || lines.is_empty() {
        lines.push(current);
    }
    lines
}

/// Formats a float with at most `places` decimals and no trailing zeros, so
/// generated filter graphs stay stable and readable.
pub fn format_decimal(value: f64, places: usize) -> String {
    let formatted = format!("{value:.places$}");
    let trimmed = if formatted.contains('.') {
        formatted.trim_end_matches('0').trim_end_matches('.')
    } else {
        formatted.as_str()
    };
    match trimmed {
        "-0" | "" => "0".to_owned(),
        other => other.to_owned(),
    }
}

//! Raw scene documents as the authoring tool stores them.
//!
//! Fields here stay loosely typed (`serde_json::Value`); [`crate::scene`]
//! turns them into the canonical model through the value resolvers.

use std::fs;
use std::path::Path;

use anyhow::{anyhow, Context, Result};
use serde::Deserialize;
use serde_json::{Map, Value};

use crate::error::{RenderError, RenderResult};

/// Keys under which a design document may be wrapped by the persistence
/// layer, outermost first.
const WRAPPER_KEYS: [&str; 3] = ["template", "template_json", "design"];

#[derive(Debug, Clone, Default)]
pub struct SceneDocument {
    pub design: DesignDocument,
    /// Template-level background video, painted under every track.
    pub base_video_url: Option<String>,
    /// Template-level background audio, played from the start.
    pub base_audio_url: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DesignDocument {
    #[serde(default, alias = "canvas")]
    pub size: Option<SizeDocument>,
    #[serde(default)]
    pub fps: Option<Value>,
    #[serde(default)]
    pub duration: Option<Value>,
    #[serde(default)]
    pub background: Option<Value>,
    #[serde(default)]
    pub tracks: Option<Vec<TrackDocument>>,
    #[serde(default)]
    pub track_items_map: Map<String, Value>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct SizeDocument {
    #[serde(default)]
    pub width: Option<Value>,
    #[serde(default)]
    pub height: Option<Value>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct TrackDocument {
    #[serde(default)]
    pub id: Option<String>,
    #[serde(default, rename = "type")]
    pub kind: Option<String>,
    #[serde(default)]
    pub items: Vec<Value>,
}

impl TrackDocument {
    pub fn item_ids(&self) -> impl Iterator<Item = &str> {
        self.items.iter().filter_map(Value::as_str)
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct ItemDocument {
    #[serde(default)]
    pub id: Option<String>,
    #[serde(default, rename = "type")]
    pub kind: String,
    #[serde(default)]
    pub display: Option<WindowDocument>,
    #[serde(default)]
    pub trim: Option<WindowDocument>,
    #[serde(default)]
    pub details: Map<String, Value>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct WindowDocument {
    #[serde(default)]
    pub from: Option<Value>,
    #[serde(default)]
    pub to: Option<Value>,
}

/// Unwraps `template` / `template_json` / `design` envelopes. Values found on
/// a wrapper level (duration, fps, base media URLs) are kept as fallbacks for
/// the design itself.
pub fn parse_scene_document(value: Value) -> RenderResult<SceneDocument> {
    let mut current = value;
    let mut fallbacks = Map::new();

    loop {
        let Value::Object(mut object) = current else {
            return Err(RenderError::invalid_scene(
                "scene document must be a JSON object",
            ));
        };
        let Some(key) = WRAPPER_KEYS.iter().find(|key| object.contains_key(**key)) else {
            current = Value::Object(object);
            break;
        };
        let inner = object.remove(*key).unwrap_or(Value::Null);
        for field in ["duration", "fps", "base_video_url", "base_audio_url"] {
            if let Some(value) = object.remove(field) {
                fallbacks.entry(field.to_owned()).or_insert(value);
            }
        }
        current = inner;
    }

    let mut object = match current {
        Value::Object(object) => object,
        _ => {
            return Err(RenderError::invalid_scene(
                "scene design must be a JSON object",
            ))
        }
    };
    let base_video_url = take_url(&mut object, &fallbacks, "base_video_url");
    let base_audio_url = take_url(&mut object, &fallbacks, "base_audio_url");

    let mut design: DesignDocument = serde_json::from_value(Value::Object(object))
        .map_err(|error| RenderError::invalid_scene(format!("malformed scene design: {error}")))?;
    if design.duration.is_none() {
        design.duration = fallbacks.get("duration").cloned();
    }
    if design.fps.is_none() {
        design.fps = fallbacks.get("fps").cloned();
    }

    Ok(SceneDocument {
        design,
        base_video_url,
        base_audio_url,
    })
}

fn take_url(object: &mut Map<String, Value>, fallbacks: &Map<String, Value>, key: &str) -> Option<String> {
    object
        .remove(key)
        .or_else(|| fallbacks.get(key).cloned())
        .and_then(|value| match value {
            Value::String(url) if !url.trim().is_empty() => Some(url),
            _ => None,
        })
}

/// Reads a JSON or YAML document (by extension; `.yaml`/`.yml` are YAML,
/// everything else JSON).
pub fn load_document_value(path: &Path) -> Result<Value> {
    let contents = fs::read_to_string(path)
        .with_context(|| format!("failed to read {}", path.display()))?;
    let is_yaml = path
        .extension()
        .and_then(|ext| ext.to_str())
        .is_some_and(|ext| matches!(ext.to_ascii_lowercase().as_str(), "yaml" | "yml"));

    if is_yaml {
        serde_yaml::from_str(&contents).map_err(|error| {
            let location = error
                .location()
                .map(|location| format!("line {}, column {}", location.line(), location.column()))
                .unwrap_or_else(|| "unknown location".to_owned());
            anyhow!(
                "failed to parse yaml in {} at {}: {}",
                path.display(),
                location,
                error
            )
        })
    } else {
        serde_json::from_str(&contents).map_err(|error| {
            anyhow!(
                "failed to parse json in {} at line {}, column {}: {}",
                path.display(),
                error.line(),
                error.column(),
                error
            )
        })
    }
}

pub fn load_scene_document(path: &Path) -> Result<SceneDocument> {
    let value = load_document_value(path)?;
    parse_scene_document(value)
        .with_context(|| format!("failed to read scene document {}", path.display()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn unwraps_nested_template_envelopes() {
        let document = parse_scene_document(json!({
            "template_json": {
                "design": {
                    "size": { "width": 640, "height": 360 },
                    "fps": 30,
                    "trackItemsMap": {
                        "text_1": { "type": "text", "details": { "text": "Hi" } }
                    }
                },
                "duration": 2000,
                "base_audio_url": "/media/co1/theme.mp3"
            }
        }))
        .unwrap();

        assert_eq!(document.design.duration, Some(json!(2000)));
        assert_eq!(document.design.track_items_map.len(), 1);
        assert_eq!(
            document.base_audio_url.as_deref(),
            Some("/media/co1/theme.mp3")
        );
        assert!(document.base_video_url.is_none());
    }

    #[test]
    fn accepts_bare_design_with_canvas_alias() {
        let document = parse_scene_document(json!({
            "canvas": { "width": "1080", "height": 1920 },
            "duration": 5000,
            "tracks": [{ "id": "t1", "type": "text", "items": ["a", 7, "b"] }]
        }))
        .unwrap();
        let size = document.design.size.unwrap();
        assert_eq!(size.width, Some(json!("1080")));
        let tracks = document.design.tracks.unwrap();
        assert_eq!(tracks[0].item_ids().collect::<Vec<_>>(), vec!["a", "b"]);
    }

    #[test]
    fn track_items_keep_document_order() {
        let text = r#"{"duration": 10, "trackItemsMap": {"z": {}, "a": {}, "m": {}}}"#;
        let value: Value = serde_json::from_str(text).unwrap();
        let document = parse_scene_document(value).unwrap();
        let keys = document
            .design
            .track_items_map
            .keys()
            .cloned()
            .collect::<Vec<_>>();
        assert_eq!(keys, vec!["z", "a", "m"]);
    }

    #[test]
    fn rejects_non_object_documents() {
        let err = parse_scene_document(json!([1, 2, 3])).unwrap_err();
        assert_eq!(err.code(), "INVALID_SCENE");
        let err = parse_scene_document(json!({ "design": "nope" })).unwrap_err();
        assert_eq!(err.code(), "INVALID_SCENE");
    }

    #[test]
    fn yaml_documents_load_by_extension() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("scene.yaml");
        fs::write(
            &path,
            "design:\n  size: { width: 320, height: 240 }\n  duration: 1000\n",
        )
        .unwrap();
        let document = load_scene_document(&path).unwrap();
        assert_eq!(document.design.duration, Some(json!(1000)));
    }

    #[test]
    fn json_errors_carry_location() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("broken.json");
        fs::write(&path, "{\n  \"duration\": ,\n}").unwrap();
        let err = load_scene_document(&path).unwrap_err().to_string();
        assert!(err.contains("line 2"), "unexpected error: {err}");
    }
}

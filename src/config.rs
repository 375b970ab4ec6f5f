use std::env;
use std::fs;
use std::path::{Component, Path, PathBuf};

use anyhow::{anyhow, bail, Context, Result};
use serde::{Deserialize, Serialize};

use crate::engine::FfmpegMode;

pub const DEFAULT_MEDIA_ROOT: &str = "./media";
pub const MEDIA_ROOT_ENV: &str = "REELSMITH_MEDIA_ROOT";
pub const DEFAULT_REMOTE_CACHE_DIR: &str = ".remote-cache";
pub const DEFAULT_DIAGNOSTICS_LIMIT: usize = 1500;

/// Fully resolved render settings. Every root the pipeline touches is carried
/// here explicitly.
#[derive(Debug, Clone, PartialEq)]
pub struct RenderConfig {
    pub media_root: PathBuf,
    pub font_root: Option<PathBuf>,
    pub default_font: Option<PathBuf>,
    pub remote: RemoteConfig,
    pub engine: EngineConfig,
    pub audio: AudioConfig,
    pub output: OutputConfig,
    /// Skip the engine when the output file already exists.
    pub reuse_existing_output: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteConfig {
    pub enabled: bool,
    pub timeout_secs: u64,
    /// Directory name, under the media root, holding downloaded media.
    pub cache_dir_name: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EngineConfig {
    pub binary: String,
    pub mode: FfmpegMode,
    pub diagnostics_limit: usize,
}

#[derive(Debug, Clone, PartialEq)]
pub struct AudioConfig {
    pub include_source_audio: bool,
    /// 0–100, applied to audio embedded in video items.
    pub source_volume: f64,
    pub sample_rate: u32,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutputConfig {
    pub video_codec: String,
    pub preset: String,
    pub crf: u8,
    pub pixel_format: String,
    pub audio_codec: String,
    pub audio_bitrate: String,
    pub faststart: bool,
    pub threads: Option<u32>,
}

impl Default for RemoteConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            timeout_secs: 30,
            cache_dir_name: DEFAULT_REMOTE_CACHE_DIR.to_owned(),
        }
    }
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            binary: "ffmpeg".to_owned(),
            mode: FfmpegMode::Auto,
            diagnostics_limit: DEFAULT_DIAGNOSTICS_LIMIT,
        }
    }
}

impl Default for AudioConfig {
    fn default() -> Self {
        Self {
            include_source_audio: false,
            source_volume: 100.0,
            sample_rate: 48_000,
        }
    }
}

impl Default for OutputConfig {
    fn default() -> Self {
        Self {
            video_codec: "libx264".to_owned(),
            preset: "medium".to_owned(),
            crf: 23,
            pixel_format: "yuv420p".to_owned(),
            audio_codec: "aac".to_owned(),
            audio_bitrate: "192k".to_owned(),
            faststart: true,
            threads: None,
        }
    }
}

impl Default for RenderConfig {
    fn default() -> Self {
        Self::new(DEFAULT_MEDIA_ROOT)
    }
}

impl RenderConfig {
    pub fn new(media_root: impl Into<PathBuf>) -> Self {
        Self {
            media_root: media_root.into(),
            font_root: None,
            default_font: None,
            remote: RemoteConfig::default(),
            engine: EngineConfig::default(),
            audio: AudioConfig::default(),
            output: OutputConfig::default(),
            reuse_existing_output: true,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RenderConfigFile {
    #[serde(default)]
    pub media_root: Option<String>,
    #[serde(default)]
    pub font_root: Option<String>,
    #[serde(default)]
    pub default_font: Option<String>,
    #[serde(default)]
    pub remote: Option<RemoteConfigFile>,
    #[serde(default)]
    pub engine: Option<EngineConfigFile>,
    #[serde(default)]
    pub audio: Option<AudioConfigFile>,
    #[serde(default)]
    pub output: Option<OutputConfigFile>,
    #[serde(default)]
    pub reuse_existing_output: Option<bool>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RemoteConfigFile {
    #[serde(default)]
    pub enabled: Option<bool>,
    #[serde(default)]
    pub timeout_secs: Option<u64>,
    #[serde(default)]
    pub cache_dir_name: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct EngineConfigFile {
    #[serde(default)]
    pub binary: Option<String>,
    #[serde(default)]
    pub mode: Option<FfmpegMode>,
    #[serde(default)]
    pub diagnostics_limit: Option<usize>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct AudioConfigFile {
    #[serde(default)]
    pub include_source_audio: Option<bool>,
    #[serde(default)]
    pub source_volume: Option<f64>,
    #[serde(default)]
    pub sample_rate: Option<u32>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct OutputConfigFile {
    #[serde(default)]
    pub video_codec: Option<String>,
    #[serde(default)]
    pub preset: Option<String>,
    #[serde(default)]
    pub crf: Option<u8>,
    #[serde(default)]
    pub pixel_format: Option<String>,
    #[serde(default)]
    pub audio_codec: Option<String>,
    #[serde(default)]
    pub audio_bitrate: Option<String>,
    #[serde(default)]
    pub faststart: Option<bool>,
    #[serde(default)]
    pub threads: Option<u32>,
}

pub fn load_config(config_path: &Path, launch_cwd: &Path) -> Result<RenderConfig> {
    let file = load_config_file(config_path)?;
    let config_path = resolve_against_base_path(config_path, launch_cwd)?;
    let config_dir = config_path
        .parent()
        .map(Path::to_path_buf)
        .unwrap_or_else(|| PathBuf::from("."));
    resolve_config(file, &config_dir)
}

pub fn load_config_file(config_path: &Path) -> Result<RenderConfigFile> {
    let config_text = fs::read_to_string(config_path)
        .with_context(|| format!("failed to read render config at {}", config_path.display()))?;
    if config_text.trim().is_empty() {
        return Ok(RenderConfigFile::default());
    }
    let parsed: RenderConfigFile = serde_yaml::from_str(&config_text).with_context(|| {
        format!(
            "failed to parse render config yaml at {}",
            config_path.display()
        )
    })?;
    Ok(parsed)
}

/// Applies defaults and resolves relative paths against `base_dir`.
pub fn resolve_config(file: RenderConfigFile, base_dir: &Path) -> Result<RenderConfig> {
    let media_root = resolve_string_path(
        non_empty(file.media_root.as_deref()).unwrap_or(DEFAULT_MEDIA_ROOT),
        base_dir,
    )?;
    let mut config = RenderConfig::new(media_root);
    config.font_root = non_empty(file.font_root.as_deref())
        .map(|value| resolve_string_path(value, base_dir))
        .transpose()?;
    config.default_font = non_empty(file.default_font.as_deref())
        .map(|value| resolve_string_path(value, base_dir))
        .transpose()?;
    if let Some(flag) = file.reuse_existing_output {
        config.reuse_existing_output = flag;
    }

    if let Some(remote) = file.remote {
        if let Some(enabled) = remote.enabled {
            config.remote.enabled = enabled;
        }
        if let Some(timeout) = remote.timeout_secs {
            if timeout == 0 {
                bail!("remote.timeout_secs must be greater than zero");
            }
            config.remote.timeout_secs = timeout;
        }
        if let Some(name) = non_empty(remote.cache_dir_name.as_deref()) {
            if Path::new(name)
                .components()
                .any(|component| !matches!(component, Component::Normal(_)))
            {
                bail!("remote.cache_dir_name must be a plain directory name, got '{name}'");
            }
            config.remote.cache_dir_name = name.to_owned();
        }
    }

    if let Some(engine) = file.engine {
        if let Some(binary) = non_empty(engine.binary.as_deref()) {
            config.engine.binary = binary.to_owned();
        }
        if let Some(mode) = engine.mode {
            config.engine.mode = mode;
        }
        if let Some(limit) = engine.diagnostics_limit {
            if limit == 0 {
                bail!("engine.diagnostics_limit must be greater than zero");
            }
            config.engine.diagnostics_limit = limit;
        }
    }

    if let Some(audio) = file.audio {
        if let Some(include) = audio.include_source_audio {
            config.audio.include_source_audio = include;
        }
        if let Some(volume) = audio.source_volume {
            if !(0.0..=100.0).contains(&volume) {
                bail!("audio.source_volume must be within 0..=100, got {volume}");
            }
            config.audio.source_volume = volume;
        }
        if let Some(rate) = audio.sample_rate {
            if rate == 0 {
                bail!("audio.sample_rate must be greater than zero");
            }
            config.audio.sample_rate = rate;
        }
    }

    if let Some(output) = file.output {
        let target = &mut config.output;
        if let Some(codec) = non_empty(output.video_codec.as_deref()) {
            target.video_codec = codec.to_owned();
        }
        if let Some(preset) = non_empty(output.preset.as_deref()) {
            target.preset = preset.to_owned();
        }
        if let Some(crf) = output.crf {
            if crf > 51 {
                bail!("output.crf must be within 0..=51, got {crf}");
            }
            target.crf = crf;
        }
        if let Some(format) = non_empty(output.pixel_format.as_deref()) {
            target.pixel_format = format.to_owned();
        }
        if let Some(codec) = non_empty(output.audio_codec.as_deref()) {
            target.audio_codec = codec.to_owned();
        }
        if let Some(bitrate) = non_empty(output.audio_bitrate.as_deref()) {
            target.audio_bitrate = bitrate.to_owned();
        }
        if let Some(faststart) = output.faststart {
            target.faststart = faststart;
        }
        target.threads = output.threads.filter(|threads| *threads > 0);
    }

    Ok(config)
}

/// Resolves a CLI or environment supplied path against the launch directory.
pub fn resolve_cli_path(value: &Path, launch_cwd: &Path) -> Result<PathBuf> {
    let text = value.to_string_lossy();
    resolve_string_path(&text, launch_cwd)
}

fn non_empty(value: Option<&str>) -> Option<&str> {
    value.map(str::trim).filter(|value| !value.is_empty())
}

fn resolve_string_path(value: &str, base_dir: &Path) -> Result<PathBuf> {
    let expanded = expand_home(value)?;
    resolve_against_base_path(&expanded, base_dir)
}

fn resolve_against_base_path(path: &Path, base_dir: &Path) -> Result<PathBuf> {
    let joined = if path.is_absolute() {
        path.to_path_buf()
    } else {
        base_dir.join(path)
    };
    let absolute = if joined.is_absolute() {
        joined
    } else {
        env::current_dir()
            .context("failed to resolve current directory")?
            .join(joined)
    };
    Ok(normalize_path(absolute))
}

fn expand_home(value: &str) -> Result<PathBuf> {
    if !value.starts_with('~') {
        return Ok(PathBuf::from(value));
    }

    let home = env::var_os("HOME")
        .map(PathBuf::from)
        .or_else(|| env::var_os("USERPROFILE").map(PathBuf::from))
        .ok_or_else(|| anyhow!("cannot resolve home directory for path '{value}'"))?;

    if value == "~" {
        return Ok(home);
    }

    if value.starts_with("~/") || value.starts_with("~\\") {
        return Ok(home.join(&value[2..]));
    }

    bail!("unsupported home path syntax: {value}")
}

fn normalize_path(path: PathBuf) -> PathBuf {
    let mut result = PathBuf::new();
    for component in path.components() {
        match component {
            Component::CurDir => {}
            Component::ParentDir => {
                let _ = result.pop();
            }
            other => result.push(other.as_os_str()),
        }
    }
    result
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_delivery_profile() {
        let config = RenderConfig::new("/srv/media");
        assert_eq!(config.output.video_codec, "libx264");
        assert_eq!(config.output.crf, 23);
        assert_eq!(config.output.pixel_format, "yuv420p");
        assert_eq!(config.output.audio_bitrate, "192k");
        assert_eq!(config.engine.diagnostics_limit, 1500);
        assert_eq!(config.remote.cache_dir_name, ".remote-cache");
        assert!(!config.audio.include_source_audio);
        assert!(config.reuse_existing_output);
    }

    #[test]
    fn resolve_config_applies_overrides_and_relative_paths() {
        let temp = tempfile::tempdir().expect("tempdir");
        let file: RenderConfigFile = serde_yaml::from_str(
            r#"
media_root: ./assets
font_root: fonts
engine:
  binary: /opt/ffmpeg/bin/ffmpeg
  mode: system
audio:
  include_source_audio: true
  source_volume: 40
output:
  preset: veryfast
  crf: 28
"#,
        )
        .expect("parse yaml");

        let config = resolve_config(file, temp.path()).expect("resolve config");
        assert_eq!(config.media_root, temp.path().join("assets"));
        assert_eq!(config.font_root, Some(temp.path().join("fonts")));
        assert_eq!(config.engine.binary, "/opt/ffmpeg/bin/ffmpeg");
        assert_eq!(config.engine.mode, FfmpegMode::System);
        assert!(config.audio.include_source_audio);
        assert_eq!(config.audio.source_volume, 40.0);
        assert_eq!(config.output.preset, "veryfast");
        assert_eq!(config.output.crf, 28);
        assert_eq!(config.output.audio_codec, "aac");
    }

    #[test]
    fn unknown_keys_are_rejected() {
        let parsed = serde_yaml::from_str::<RenderConfigFile>("media_rot: ./media\n");
        assert!(parsed.is_err());
    }

    #[test]
    fn out_of_range_values_are_rejected() {
        let temp = tempfile::tempdir().expect("tempdir");
        let file: RenderConfigFile =
            serde_yaml::from_str("output:\n  crf: 60\n").expect("parse yaml");
        let err = resolve_config(file, temp.path()).unwrap_err();
        assert!(err.to_string().contains("crf"));

        let file: RenderConfigFile =
            serde_yaml::from_str("remote:\n  cache_dir_name: ../escape\n").expect("parse yaml");
        assert!(resolve_config(file, temp.path()).is_err());
    }

    #[test]
    fn load_config_resolves_against_config_directory() {
        let temp = tempfile::tempdir().expect("tempdir");
        let config_dir = temp.path().join("cfg");
        fs::create_dir_all(&config_dir).expect("create cfg dir");
        let config_path = config_dir.join("reelsmith.yaml");
        fs::write(&config_path, "media_root: ../media\n").expect("write config");

        let config = load_config(&config_path, temp.path()).expect("load config");
        assert_eq!(config.media_root, temp.path().join("media"));
    }

    #[test]
    fn empty_config_file_uses_defaults() {
        let temp = tempfile::tempdir().expect("tempdir");
        let config_path = temp.path().join("empty.yaml");
        fs::write(&config_path, "\n").expect("write config");
        let config = load_config(&config_path, temp.path()).expect("load config");
        assert_eq!(config.media_root, temp.path().join("media"));
        assert_eq!(config.output, OutputConfig::default());
    }
}

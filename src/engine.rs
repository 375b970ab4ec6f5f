use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};

use anyhow::anyhow;
use serde::{Deserialize, Serialize};

use crate::command::RenderCommand;
use crate::config::EngineConfig;
use crate::error::{RenderError, RenderResult};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FfmpegMode {
    #[default]
    Auto,
    System,
    Sidecar,
}

/// Runs one assembled ffmpeg invocation to completion, writing to `output`
/// instead of the command's own output path.
pub trait TranscodeEngine: Send + Sync {
    fn mode_label(&self) -> &'static str;
    fn run(&self, command: &RenderCommand, output: &Path) -> RenderResult<()>;
}

pub struct SystemFfmpeg {
    binary: PathBuf,
    diagnostics_limit: usize,
}

impl SystemFfmpeg {
    pub fn new(binary: impl Into<PathBuf>, diagnostics_limit: usize) -> Self {
        Self {
            binary: binary.into(),
            diagnostics_limit,
        }
    }
}

impl TranscodeEngine for SystemFfmpeg {
    fn mode_label(&self) -> &'static str {
        "system"
    }

    fn run(&self, command: &RenderCommand, output: &Path) -> RenderResult<()> {
        run_ffmpeg_process(
            &self.binary,
            command,
            output,
            self.mode_label(),
            self.diagnostics_limit,
        )
    }
}

#[cfg(feature = "sidecar_ffmpeg")]
pub struct SidecarFfmpeg {
    diagnostics_limit: usize,
}

#[cfg(feature = "sidecar_ffmpeg")]
impl SidecarFfmpeg {
    pub fn new(diagnostics_limit: usize) -> Self {
        Self { diagnostics_limit }
    }
}

#[cfg(feature = "sidecar_ffmpeg")]
impl TranscodeEngine for SidecarFfmpeg {
    fn mode_label(&self) -> &'static str {
        "sidecar"
    }

    fn run(&self, command: &RenderCommand, output: &Path) -> RenderResult<()> {
        let path = ffmpeg_sidecar::paths::ffmpeg_path();
        if !path.exists() {
            ffmpeg_sidecar::download::auto_download().map_err(|error| {
                RenderError::EngineUnavailable(format!(
                    "failed to auto-download ffmpeg sidecar binary: {error}"
                ))
            })?;
        }
        run_ffmpeg_process(
            &path,
            command,
            output,
            self.mode_label(),
            self.diagnostics_limit,
        )
    }
}

pub fn select_engine(config: &EngineConfig) -> RenderResult<Box<dyn TranscodeEngine>> {
    match config.mode {
        FfmpegMode::Auto | FfmpegMode::System => Ok(Box::new(SystemFfmpeg::new(
            &config.binary,
            config.diagnostics_limit,
        ))),
        FfmpegMode::Sidecar => {
            #[cfg(feature = "sidecar_ffmpeg")]
            {
                Ok(Box::new(SidecarFfmpeg::new(config.diagnostics_limit)))
            }
            #[cfg(not(feature = "sidecar_ffmpeg"))]
            {
                Err(RenderError::EngineUnavailable(
                    "ffmpeg sidecar mode requested but reelsmith was built without `sidecar_ffmpeg`. Rebuild with `--features sidecar_ffmpeg`.".to_owned(),
                ))
            }
        }
    }
}

/// Runs `command` through `engine`, writing to a staging file beside the
/// output and renaming it into place on success. A failed run removes the
/// staging file so no partial output is left behind. With `reuse_existing`
/// an output that already exists is returned without invoking the engine.
pub fn execute(
    engine: &dyn TranscodeEngine,
    command: &RenderCommand,
    reuse_existing: bool,
) -> RenderResult<PathBuf> {
    let output = command.output.clone();
    if reuse_existing && output.is_file() {
        tracing::info!(output = %output.display(), "output already exists; skipping render");
        return Ok(output);
    }
    check_output_path(&output)?;
    if let Some(parent) = output.parent().filter(|parent| !parent.as_os_str().is_empty()) {
        fs::create_dir_all(parent).map_err(|error| RenderError::io(parent, error))?;
    }

    let staging = staging_path(&output);
    tracing::info!(
        mode = engine.mode_label(),
        output = %output.display(),
        "invoking ffmpeg"
    );
    tracing::debug!(command = %command.shell_line(), "ffmpeg command line");

    if let Err(error) = engine.run(command, &staging) {
        remove_staging(&staging);
        return Err(error);
    }
    if !staging.is_file() {
        return Err(RenderError::RenderFailed {
            status: "missing output".to_owned(),
            diagnostics: format!("ffmpeg reported success but wrote no file at {}", staging.display()),
        });
    }
    if let Err(error) = fs::rename(&staging, &output) {
        remove_staging(&staging);
        return Err(RenderError::io(&output, error));
    }
    tracing::info!(output = %output.display(), "render finished");
    Ok(output)
}

/// `<dir>/.<stem>.partial.<ext>`; the extension is kept so ffmpeg picks the
/// same muxer.
pub fn staging_path(output: &Path) -> PathBuf {
    let stem = output
        .file_stem()
        .map(|stem| stem.to_string_lossy().into_owned())
        .unwrap_or_else(|| "render".to_owned());
    let name = match output.extension().and_then(|ext| ext.to_str()) {
        Some(ext) => format!(".{stem}.partial.{ext}"),
        None => format!(".{stem}.partial"),
    };
    output.with_file_name(name)
}

fn remove_staging(staging: &Path) {
    if staging.exists() {
        if let Err(error) = fs::remove_file(staging) {
            tracing::warn!(path = %staging.display(), error = %error, "failed to remove staging file");
        }
    }
}

fn check_output_path(output: &Path) -> RenderResult<()> {
    let path_str = output.to_string_lossy();
    if path_str.len() > 1024 {
        return Err(anyhow!("output path is suspiciously long").into());
    }
    if path_str.chars().any(|c| c.is_control()) {
        return Err(anyhow!("output path contains invalid control characters").into());
    }
    if output.file_name().is_none() {
        return Err(anyhow!("output path '{}' has no file name", output.display()).into());
    }
    Ok(())
}

fn run_ffmpeg_process(
    ffmpeg_path: &Path,
    command: &RenderCommand,
    output: &Path,
    mode_label: &str,
    diagnostics_limit: usize,
) -> RenderResult<()> {
    let args = command.argv_with_output(output);
    let result = Command::new(ffmpeg_path)
        .args(args.iter().map(String::as_str))
        .stdin(Stdio::null())
        .stdout(Stdio::null())
        .stderr(Stdio::piped())
        .output()
        .map_err(|error| {
            if error.kind() == ErrorKind::NotFound {
                RenderError::EngineUnavailable(format!(
                    "ffmpeg executable not found (mode={mode_label}, resolved_path={}). Install ffmpeg (system mode) or use sidecar mode with `--features sidecar_ffmpeg`.",
                    ffmpeg_path.display()
                ))
            } else {
                RenderError::EngineUnavailable(format!(
                    "failed to spawn ffmpeg process (mode={mode_label}, resolved_path={}): {error}",
                    ffmpeg_path.display()
                ))
            }
        })?;

    if !result.status.success() {
        let stderr = String::from_utf8_lossy(&result.stderr);
        return Err(RenderError::RenderFailed {
            status: result.status.to_string(),
            diagnostics: last_n_chars(&stderr, diagnostics_limit),
        });
    }
    Ok(())
}

pub fn last_n_chars(s: &str, max_chars: usize) -> String {
    let mut chars = s.chars().collect::<Vec<_>>();
    if chars.len() > max_chars {
        chars = chars[chars.len().saturating_sub(max_chars)..].to_vec();
    }
    chars.into_iter().collect::<String>().trim().to_owned()
}

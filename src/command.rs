use std::path::{Path, PathBuf};

use serde::Serialize;

use crate::config::OutputConfig;
use crate::graph::{CompiledGraph, InputKind};
use crate::resolve::format_decimal;

/// A fully assembled ffmpeg invocation. The output path is kept apart from
/// the argument list so the executor can redirect it to a staging file.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RenderCommand {
    pub program: String,
    pub args: Vec<String>,
    pub output: PathBuf,
}

impl RenderCommand {
    pub fn argv(&self) -> Vec<String> {
        self.argv_with_output(&self.output)
    }

    pub fn argv_with_output(&self, output: &Path) -> Vec<String> {
        let mut argv = self.args.clone();
        argv.push(output.to_string_lossy().into_owned());
        argv
    }

    /// Shell-quoted command line, for logs and `plan`.
    pub fn shell_line(&self) -> String {
        let mut words = vec![self.program.clone()];
        words.extend(self.argv());
        shell_words::join(words)
    }
}

pub fn assemble(
    program: &str,
    graph: &CompiledGraph,
    output: &OutputConfig,
    output_path: &Path,
) -> RenderCommand {
    let duration = format_decimal(graph.duration_secs, 3);
    let mut args = base_args();
    args.extend(input_args(graph, &duration));
    args.push("-filter_complex".to_owned());
    args.push(graph.filter_complex());
    args.extend(map_args(graph));
    args.extend(video_output_args(graph, output));
    args.extend(audio_output_args(output));
    if let Some(threads) = output.threads {
        args.push("-threads".to_owned());
        args.push(threads.to_string());
    }
    args.push("-t".to_owned());
    args.push(duration);
    if output.faststart {
        args.extend(container_output_args(output_path));
    }

    RenderCommand {
        program: program.to_owned(),
        args,
        output: output_path.to_path_buf(),
    }
}

fn base_args() -> Vec<String> {
    vec![
        "-hide_banner".to_owned(),
        "-loglevel".to_owned(),
        "error".to_owned(),
        "-y".to_owned(),
    ]
}

/// One `-i` per deduplicated input; still images loop for the scene length.
pub fn input_args(graph: &CompiledGraph, duration: &str) -> Vec<String> {
    let mut args = Vec::new();
    for input in &graph.inputs {
        if input.kind == InputKind::Image {
            args.push("-loop".to_owned());
            args.push("1".to_owned());
            args.push("-t".to_owned());
            args.push(duration.to_owned());
        }
        args.push("-i".to_owned());
        args.push(input.path.to_string_lossy().into_owned());
    }
    args
}

fn map_args(graph: &CompiledGraph) -> Vec<String> {
    vec![
        "-map".to_owned(),
        format!("[{}]", graph.video_out),
        "-map".to_owned(),
        format!("[{}]", graph.audio_out),
    ]
}

pub fn video_output_args(graph: &CompiledGraph, output: &OutputConfig) -> Vec<String> {
    vec![
        "-r".to_owned(),
        format_decimal(graph.canvas.fps, 3),
        "-c:v".to_owned(),
        output.video_codec.clone(),
        "-preset".to_owned(),
        output.preset.clone(),
        "-crf".to_owned(),
        output.crf.to_string(),
        "-pix_fmt".to_owned(),
        output.pixel_format.clone(),
    ]
}

pub fn audio_output_args(output: &OutputConfig) -> Vec<String> {
    vec![
        "-c:a".to_owned(),
        output.audio_codec.clone(),
        "-b:a".to_owned(),
        output.audio_bitrate.clone(),
    ]
}

pub fn container_output_args(output_path: &Path) -> Vec<String> {
    let ext = output_path
        .extension()
        .and_then(|ext| ext.to_str())
        .unwrap_or_default()
        .to_ascii_lowercase();
    if matches!(ext.as_str(), "mov" | "mp4" | "m4v") {
        vec!["-movflags".to_owned(), "+faststart".to_owned()]
    } else {
        Vec::new()
    }
}

use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;
use std::thread;

use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::{RenderError, RenderResult};
use crate::render::Renderer;
use crate::scene::Scene;
use crate::schema::load_document_value;
use crate::substitute::SubstitutionContext;

/// One personalization entry of a batch file.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct BatchEntry {
    pub id: String,
    #[serde(default)]
    pub context: Value,
}

#[derive(Debug)]
pub struct BatchOutcome {
    pub id: String,
    pub output: PathBuf,
    pub result: RenderResult<PathBuf>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct BatchSummary {
    pub rendered: usize,
    pub failed: usize,
}

impl BatchSummary {
    pub fn from_outcomes(outcomes: &[BatchOutcome]) -> Self {
        let failed = outcomes.iter().filter(|outcome| outcome.result.is_err()).count();
        Self {
            rendered: outcomes.len() - failed,
            failed,
        }
    }
}

/// Reads a JSON or YAML list of `{id, context}` entries. Ids must be unique
/// since each one names an output file.
pub fn load_batch_entries(path: &Path) -> Result<Vec<BatchEntry>> {
    let value = load_document_value(path)?;
    let entries: Vec<BatchEntry> = serde_json::from_value(value)
        .with_context(|| format!("batch file {} must be a list of {{id, context}} entries", path.display()))?;

    let mut seen = HashSet::new();
    for entry in &entries {
        if entry.id.trim().is_empty() {
            bail!("batch entry with empty id in {}", path.display());
        }
        if !seen.insert(output_stem(&entry.id)) {
            bail!("duplicate batch id '{}' in {}", entry.id, path.display());
        }
    }
    Ok(entries)
}

/// Output path for an entry: `<out_dir>/<id>.mp4`, with characters outside
/// `[A-Za-z0-9._-]` replaced by `_`.
pub fn output_path_for(out_dir: &Path, id: &str) -> PathBuf {
    out_dir.join(format!("{}.mp4", output_stem(id)))
}

fn output_stem(id: &str) -> String {
    let stem = id
        .trim()
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || matches!(c, '.' | '_' | '-') {
                c
            } else {
                '_'
            }
        })
        .collect::<String>();
    stem.trim_start_matches('.').to_owned()
}

/// Renders one output per entry on up to `jobs` worker threads sharing one
/// renderer. Failures are reported per entry and never stop other jobs.
/// Outcomes are returned in entry order.
pub fn render_batch(
    renderer: &Renderer,
    scene: &Scene,
    entries: &[BatchEntry],
    out_dir: &Path,
    jobs: usize,
) -> Vec<BatchOutcome> {
    let workers = jobs.clamp(1, entries.len().max(1));
    let next = AtomicUsize::new(0);
    let slots: Mutex<Vec<Option<BatchOutcome>>> =
        Mutex::new(entries.iter().map(|_| None).collect());
    tracing::info!(entries = entries.len(), workers, "starting batch");

    thread::scope(|scope| {
        for _ in 0..workers {
            scope.spawn(|| loop {
                let index = next.fetch_add(1, Ordering::SeqCst);
                let Some(entry) = entries.get(index) else {
                    break;
                };
                let outcome = render_entry(renderer, scene, entry, out_dir);
                if let Ok(mut slots) = slots.lock() {
                    slots[index] = Some(outcome);
                }
            });
        }
    });

    slots
        .into_inner()
        .unwrap_or_else(|poisoned| poisoned.into_inner())
        .into_iter()
        .zip(entries)
        .map(|(slot, entry)| {
            slot.unwrap_or_else(|| BatchOutcome {
                id: entry.id.clone(),
                output: output_path_for(out_dir, &entry.id),
                result: Err(RenderError::Other(anyhow::anyhow!(
                    "batch worker exited before finishing '{}'",
                    entry.id
                ))),
            })
        })
        .collect()
}

fn render_entry(renderer: &Renderer, scene: &Scene, entry: &BatchEntry, out_dir: &Path) -> BatchOutcome {
    let output = output_path_for(out_dir, &entry.id);
    let context = SubstitutionContext::from_value(entry.context.clone());
    let result = renderer.render(scene, Some(&context), &output);
    match &result {
        Ok(path) => tracing::info!(id = %entry.id, output = %path.display(), "batch job finished"),
        Err(error) => tracing::warn!(id = %entry.id, code = error.code(), error = %error, "batch job failed"),
    }
    BatchOutcome {
        id: entry.id.clone(),
        output,
        result,
    }
}

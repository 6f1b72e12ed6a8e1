use std::path::Path;

use chrono::{SecondsFormat, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::assets::ImageAsset;

/// Terminal state of a refinement run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunOutcome {
    /// The best candidate reached the acceptance threshold.
    Accepted,
    /// The round budget ran out; the best candidate so far is returned.
    RoundsExhausted,
    /// Scoring failed, no corrective fixes were available, or an edit
    /// round produced no image.
    Stalled,
    /// Initial generation produced nothing, even after the simplified
    /// retry.
    FailedTerminal,
}

impl RunOutcome {
    pub fn as_str(self) -> &'static str {
        match self {
            RunOutcome::Accepted => "accepted",
            RunOutcome::RoundsExhausted => "rounds_exhausted",
            RunOutcome::Stalled => "stalled",
            RunOutcome::FailedTerminal => "failed_terminal",
        }
    }
}

/// One verify-then-correct iteration: the score that triggered it and the
/// corrective instructions that were applied.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CorrectionRound {
    pub round: u32,
    pub score_before: i64,
    #[serde(default)]
    pub fixes_applied: Vec<String>,
}

/// Terminal output of a refinement run. Immutable once returned.
#[derive(Debug, Clone)]
pub struct PipelineResult {
    pub best_image: Option<ImageAsset>,
    /// -1 when no candidate was ever scored.
    pub best_score: i64,
    /// Last commentary text captured from the generation service.
    pub text: Option<String>,
    pub outcome: RunOutcome,
    pub correction_rounds: Vec<CorrectionRound>,
}

/// Writes `outcome.json` for a finished run. `image_path` is where the best
/// candidate's bytes were persisted, when there was one; `extra` entries are
/// merged last and may override defaults.
pub fn write_outcome(
    path: &Path,
    result: &PipelineResult,
    image_path: Option<&Path>,
    extra: Option<&Map<String, Value>>,
) -> anyhow::Result<()> {
    let mut payload = Map::new();
    payload.insert(
        "best_score".to_string(),
        Value::Number(result.best_score.into()),
    );
    payload.insert(
        "outcome".to_string(),
        Value::String(result.outcome.as_str().to_string()),
    );
    payload.insert(
        "text".to_string(),
        result
            .text
            .as_ref()
            .map(|text| Value::String(text.clone()))
            .unwrap_or(Value::Null),
    );
    payload.insert(
        "correction_rounds".to_string(),
        serde_json::to_value(&result.correction_rounds)?,
    );
    payload.insert(
        "image_path".to_string(),
        image_path
            .map(|path| Value::String(path.to_string_lossy().to_string()))
            .unwrap_or(Value::Null),
    );
    payload.insert("ts".to_string(), Value::String(now_utc_iso()));
    if let Some(extra) = extra {
        for (key, value) in extra {
            payload.insert(key.clone(), value.clone());
        }
    }

    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    std::fs::write(path, serde_json::to_string_pretty(&Value::Object(payload))?)?;
    Ok(())
}

fn now_utc_iso() -> String {
    Utc::now().to_rfc3339_opts(SecondsFormat::Micros, false)
}

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::description::strip_code_fences;

/// Sentinel score meaning "evaluation failed"; the pipeline stops rather
/// than acting on it.
pub const SCORE_EVALUATION_FAILED: i64 = -1;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Severity {
    Critical,
    /// Any unrecognized severity token lands here as well.
    #[default]
    Minor,
}

impl<'de> Deserialize<'de> for Severity {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        let token = String::deserialize(deserializer)?;
        Ok(Severity::from_token(&token))
    }
}

impl Severity {
    pub fn from_token(token: &str) -> Self {
        if token.trim().eq_ignore_ascii_case("critical") {
            Severity::Critical
        } else {
            Severity::Minor
        }
    }

    pub fn is_critical(self) -> bool {
        matches!(self, Severity::Critical)
    }
}

/// One detected mismatch between the reference and a candidate, with the
/// corrective instruction the next edit round should apply.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Discrepancy {
    #[serde(default)]
    pub feature: String,
    #[serde(default)]
    pub severity: Severity,
    #[serde(default)]
    pub expected: String,
    #[serde(default)]
    pub observed: String,
    #[serde(default)]
    pub fix: String,
}

/// Result of scoring one candidate against the reference.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DifferenceReport {
    pub score: i64,
    #[serde(default)]
    pub summary: String,
    #[serde(default)]
    pub discrepancies: Vec<Discrepancy>,
}

impl DifferenceReport {
    /// The sentinel report used when the comparison call or its response
    /// parse failed.
    pub fn failed() -> Self {
        Self {
            score: SCORE_EVALUATION_FAILED,
            summary: String::new(),
            discrepancies: Vec::new(),
        }
    }

    pub fn evaluation_failed(&self) -> bool {
        self.score < 0
    }

    /// Parses comparison-service output, tolerating code fences and missing
    /// fields. Never fails: an unparsable body or a missing/non-numeric
    /// score degrades to the sentinel report. A numeric score outside
    /// `[0, 100]` is clamped.
    pub fn parse(raw: &str) -> Self {
        let Ok(value) = serde_json::from_str::<Value>(strip_code_fences(raw)) else {
            return Self::failed();
        };
        let Some(object) = value.as_object() else {
            return Self::failed();
        };
        let Some(score) = object
            .get("score")
            .and_then(|value| value.as_i64().or_else(|| value.as_f64().map(|f| f as i64)))
        else {
            return Self::failed();
        };

        let summary = object
            .get("summary")
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string();
        let discrepancies = object
            .get("discrepancies")
            .and_then(Value::as_array)
            .map(|rows| rows.iter().filter_map(parse_discrepancy).collect())
            .unwrap_or_default();

        Self {
            score: score.clamp(0, 100),
            summary,
            discrepancies,
        }
    }

    /// Selects up to `top_k` discrepancies for the next correction round:
    /// all critical entries first, then minor ones, preserving the original
    /// relative order within each severity group. Entries without a fix
    /// instruction are not actionable and are skipped.
    pub fn select_fixes(&self, top_k: usize) -> Vec<Discrepancy> {
        let actionable = || {
            self.discrepancies
                .iter()
                .filter(|entry| !entry.fix.trim().is_empty())
        };
        actionable()
            .filter(|entry| entry.severity.is_critical())
            .chain(actionable().filter(|entry| !entry.severity.is_critical()))
            .take(top_k)
            .cloned()
            .collect()
    }
}

fn parse_discrepancy(value: &Value) -> Option<Discrepancy> {
    let object = value.as_object()?;
    let text = |key: &str| {
        object
            .get(key)
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string()
    };
    let severity = object
        .get("severity")
        .and_then(Value::as_str)
        .map(Severity::from_token)
        .unwrap_or_default();
    Some(Discrepancy {
        feature: text("feature"),
        severity,
        expected: text("expected"),
        observed: text("observed"),
        fix: text("fix"),
    })
}

#[cfg(test)]
mod tests {
    use super::{DifferenceReport, Discrepancy, Severity, SCORE_EVALUATION_FAILED};

    fn entry(feature: &str, severity: Severity) -> Discrepancy {
        Discrepancy {
            feature: feature.to_string(),
            severity,
            expected: String::new(),
            observed: String::new(),
            fix: format!("fix {feature}"),
        }
    }

    #[test]
    fn parse_reads_score_summary_and_discrepancies() {
        let raw = r#"```json
        {
          "score": 72,
          "summary": "close match, embroidery wrong",
          "discrepancies": [
            {"feature": "embroidery", "severity": "CRITICAL",
             "expected": "gold zari", "observed": "plain", "fix": "add gold zari"},
            {"feature": "hemline", "severity": "MINOR", "fix": "straighten hem"}
          ]
        }
        ```"#;
        let report = DifferenceReport::parse(raw);
        assert_eq!(report.score, 72);
        assert_eq!(report.summary, "close match, embroidery wrong");
        assert_eq!(report.discrepancies.len(), 2);
        assert_eq!(report.discrepancies[0].severity, Severity::Critical);
        assert_eq!(report.discrepancies[1].fix, "straighten hem");
    }

    #[test]
    fn parse_degrades_to_sentinel() {
        assert!(DifferenceReport::parse("not json").evaluation_failed());
        assert!(DifferenceReport::parse("[1, 2]").evaluation_failed());
        assert!(DifferenceReport::parse(r#"{"summary": "no score"}"#).evaluation_failed());
        assert_eq!(
            DifferenceReport::parse("{}").score,
            SCORE_EVALUATION_FAILED
        );
    }

    #[test]
    fn parse_clamps_out_of_range_scores() {
        assert_eq!(DifferenceReport::parse(r#"{"score": 140}"#).score, 100);
        assert_eq!(DifferenceReport::parse(r#"{"score": -3}"#).score, 0);
        assert_eq!(DifferenceReport::parse(r#"{"score": 87.6}"#).score, 87);
    }

    #[test]
    fn unknown_severity_sorts_into_minor_bucket() {
        assert_eq!(Severity::from_token("CRITICAL"), Severity::Critical);
        assert_eq!(Severity::from_token("critical "), Severity::Critical);
        assert_eq!(Severity::from_token("MINOR"), Severity::Minor);
        assert_eq!(Severity::from_token("COSMETIC"), Severity::Minor);

        let raw = r#"{"score": 50, "discrepancies": [
            {"feature": "a", "severity": "BLOCKER", "fix": "f"}
        ]}"#;
        let report = DifferenceReport::parse(raw);
        assert_eq!(report.discrepancies[0].severity, Severity::Minor);
    }

    #[test]
    fn select_fixes_is_stable_and_severity_grouped() {
        let report = DifferenceReport {
            score: 40,
            summary: String::new(),
            discrepancies: vec![
                entry("m1", Severity::Minor),
                entry("c1", Severity::Critical),
                entry("m2", Severity::Minor),
                entry("c2", Severity::Critical),
            ],
        };
        let selected = report.select_fixes(4);
        let order: Vec<&str> = selected.iter().map(|d| d.feature.as_str()).collect();
        assert_eq!(order, vec!["c1", "c2", "m1", "m2"]);
    }

    #[test]
    fn select_fixes_skips_entries_without_a_fix() {
        let mut unfixable = entry("c1", Severity::Critical);
        unfixable.fix = "  ".to_string();
        let report = DifferenceReport {
            score: 40,
            summary: String::new(),
            discrepancies: vec![unfixable, entry("m1", Severity::Minor)],
        };
        let selected = report.select_fixes(4);
        let order: Vec<&str> = selected.iter().map(|d| d.feature.as_str()).collect();
        assert_eq!(order, vec!["m1"]);
    }

    #[test]
    fn select_fixes_truncates_to_top_k() {
        let report = DifferenceReport {
            score: 40,
            summary: String::new(),
            discrepancies: vec![
                entry("m1", Severity::Minor),
                entry("m2", Severity::Minor),
                entry("c1", Severity::Critical),
            ],
        };
        let selected = report.select_fixes(2);
        let order: Vec<&str> = selected.iter().map(|d| d.feature.as_str()).collect();
        assert_eq!(order, vec!["c1", "m1"]);
    }
}

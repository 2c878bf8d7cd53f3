//! Analysis requests and results, and parsing of the service's answers.
//!
//! The service is asked for `{"outcome", "tip"}` JSON but is only loosely
//! held to it. [`parse_analysis_text`] therefore never fails: it accepts
//! fenced or prose-wrapped JSON, the richer structured coach schema, and
//! finally falls back to keyword heuristics on plain text.

use crate::frame::Frame;
use serde::Deserialize;
use std::fmt;
use uuid::Uuid;

/// Tip used when nothing better can be extracted.
pub const GENERIC_TIP: &str = "Keep practicing your form!";

const TIP_KEYWORDS: [&str; 3] = ["tip", "focus", "try"];

/// Result of one shot.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShotOutcome {
    Make,
    Miss,
    Indeterminate,
}

impl ShotOutcome {
    /// Case-insensitive mapping; anything unrecognised counts as a miss.
    pub fn from_label(label: &str) -> Self {
        match label.trim().to_ascii_lowercase().as_str() {
            "make" | "made" => ShotOutcome::Make,
            "indeterminate" | "unknown" => ShotOutcome::Indeterminate,
            _ => ShotOutcome::Miss,
        }
    }
}

impl fmt::Display for ShotOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ShotOutcome::Make => write!(f, "make"),
            ShotOutcome::Miss => write!(f, "miss"),
            ShotOutcome::Indeterminate => write!(f, "indeterminate"),
        }
    }
}

/// Shot category reported by the structured schema.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShotType {
    Layup,
    MidRange,
    ThreePointer,
}

impl ShotType {
    pub fn from_label(label: &str) -> Option<Self> {
        let normalised: String = label
            .trim()
            .to_ascii_lowercase()
            .chars()
            .filter(|c| c.is_ascii_alphanumeric())
            .collect();
        match normalised.as_str() {
            "layup" => Some(ShotType::Layup),
            "midrange" => Some(ShotType::MidRange),
            "threepointer" | "three" | "3pointer" | "3pt" => Some(ShotType::ThreePointer),
            _ => None,
        }
    }

    pub fn display_name(&self) -> &'static str {
        match self {
            ShotType::Layup => "Layup",
            ShotType::MidRange => "Mid-Range",
            ShotType::ThreePointer => "Three-Pointer",
        }
    }
}

/// A request to analyse one shot.
#[derive(Debug, Clone)]
pub struct AnalysisRequest {
    /// Correlation identifier
    pub id: Uuid,

    /// Selected frames, release first
    pub frames: Vec<Frame>,

    /// Tip given for the previous shot, to avoid repetition
    pub last_tip: String,
}

impl AnalysisRequest {
    pub fn new(frames: Vec<Frame>, last_tip: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4(),
            frames,
            last_tip: last_tip.into(),
        }
    }
}

/// Outcome and coaching tip for one shot.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AnalysisResult {
    pub outcome: ShotOutcome,
    /// Possibly empty
    pub tip: String,
    pub shot_type: Option<ShotType>,
}

impl AnalysisResult {
    pub fn new(outcome: ShotOutcome, tip: impl Into<String>) -> Self {
        Self {
            outcome,
            tip: tip.into(),
            shot_type: None,
        }
    }

    /// Result used when every analysis channel failed.
    pub fn unavailable() -> Self {
        Self::new(ShotOutcome::Miss, GENERIC_TIP)
    }
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct StructuredFeedback {
    #[serde(default)]
    positive_feedback: Option<String>,
    #[serde(default)]
    corrective_feedback: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RawAnswer {
    #[serde(default)]
    outcome: Option<String>,
    #[serde(default)]
    tip: Option<String>,
    #[serde(default)]
    shot_type: Option<String>,
    #[serde(default)]
    analysis: Option<StructuredFeedback>,
}

impl RawAnswer {
    fn is_recognisable(&self) -> bool {
        self.outcome.is_some() || self.tip.is_some() || self.analysis.is_some()
    }

    fn into_result(self) -> AnalysisResult {
        let outcome = self
            .outcome
            .as_deref()
            .map(ShotOutcome::from_label)
            .unwrap_or(ShotOutcome::Miss);

        let tip = match self.tip {
            Some(tip) => tip,
            None => self
                .analysis
                .map(|a| {
                    non_empty(a.corrective_feedback)
                        .or_else(|| non_empty(a.positive_feedback))
                        .unwrap_or_default()
                })
                .unwrap_or_default(),
        };

        AnalysisResult {
            outcome,
            tip: tip.trim().to_string(),
            shot_type: self.shot_type.as_deref().and_then(ShotType::from_label),
        }
    }
}

fn non_empty(value: Option<String>) -> Option<String> {
    value.filter(|s| !s.trim().is_empty())
}

/// Remove a surrounding markdown code fence, if any.
fn strip_code_fence(text: &str) -> &str {
    let text = text.trim();
    let Some(rest) = text.strip_prefix("```") else {
        return text;
    };
    // Drop the info string ("json") on the opening line
    let rest = match rest.find('\n') {
        Some(newline) if rest[..newline].chars().all(|c| c.is_ascii_alphanumeric()) => {
            &rest[newline + 1..]
        }
        _ => rest.trim_start_matches("json"),
    };
    rest.trim().trim_end_matches("```").trim()
}

/// The outermost `{...}` span of the text.
fn json_object_span(text: &str) -> Option<&str> {
    let start = text.find('{')?;
    let end = text.rfind('}')?;
    (end > start).then(|| &text[start..=end])
}

fn parse_json_answer(text: &str) -> Option<RawAnswer> {
    let stripped = strip_code_fence(text);
    let parsed = serde_json::from_str::<RawAnswer>(stripped).ok().or_else(|| {
        json_object_span(stripped).and_then(|span| serde_json::from_str::<RawAnswer>(span).ok())
    })?;
    parsed.is_recognisable().then_some(parsed)
}

/// Whether the text already holds a complete JSON object.
///
/// Used to resolve a streamed turn before the server marks it complete.
pub fn is_complete_json(text: &str) -> bool {
    let stripped = strip_code_fence(text);
    json_object_span(stripped)
        .map(|span| serde_json::from_str::<serde_json::Value>(span).is_ok())
        .unwrap_or(false)
}

/// First line mentioning a coaching keyword, starting at the keyword.
fn extract_tip(text: &str) -> Option<String> {
    text.lines().find_map(|line| {
        let lower = line.to_lowercase();
        let position = TIP_KEYWORDS.iter().filter_map(|k| lower.find(k)).min()?;
        // Lowercasing can shift byte offsets for non-ASCII text
        let tip = line.get(position..).unwrap_or(line).trim();
        (!tip.is_empty()).then(|| tip.to_string())
    })
}

/// Keyword heuristics for answers that are not JSON.
pub fn parse_heuristic(text: &str) -> AnalysisResult {
    let outcome = if text.to_lowercase().contains("make") {
        ShotOutcome::Make
    } else {
        ShotOutcome::Miss
    };
    let tip = extract_tip(text).unwrap_or_else(|| GENERIC_TIP.to_string());
    AnalysisResult::new(outcome, tip)
}

/// Parse a service answer. Never fails.
pub fn parse_analysis_text(text: &str) -> AnalysisResult {
    match parse_json_answer(text) {
        Some(answer) => answer.into_result(),
        None => parse_heuristic(text),
    }
}

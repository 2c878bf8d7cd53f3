//! Shot feedback sequencing.
//!
//! Turns analysis results into display events, keeps the session's running
//! counters and remembers the last tip so the next request can ask the
//! service not to repeat it.

use crate::analysis::{AnalysisResult, ShotOutcome, ShotType};
use rand::prelude::IndexedRandom;
use rand::rngs::StdRng;
use rand::SeedableRng;
use serde::Deserialize;
use std::path::Path;
use thiserror::Error;
use tracing::{debug, info, warn};

const DEFAULT_TIP: &str = "Keep practicing your form!";
const DEFAULT_ENCOURAGEMENT: &str = "Great job!";
const DEFAULT_MAKE_COMMENT: &str = "Great shot!";
const DEFAULT_MISS_COMMENT: &str = "Keep shooting!";

/// Errors that can occur while loading tip pools.
#[derive(Debug, Error)]
pub enum TipsError {
    #[error("Failed to read tips file {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Invalid tips file: {0}")]
    Parse(#[from] serde_json::Error),
}

/// Canned coaching lines, keyed by purpose.
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
pub struct TipPools {
    /// Generic form tips
    #[serde(default)]
    pub tips: Vec<String>,

    /// Encouragement lines
    #[serde(default)]
    pub encouragement: Vec<String>,

    /// Comments for made shots
    #[serde(default)]
    pub makes: Vec<String>,

    /// Comments for missed shots
    #[serde(default)]
    pub misses: Vec<String>,
}

impl TipPools {
    /// Parse pools from JSON.
    pub fn from_json(json: &str) -> Result<Self, TipsError> {
        Ok(serde_json::from_str(json)?)
    }

    /// Load pools from a JSON file.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, TipsError> {
        let path = path.as_ref();
        let json = std::fs::read_to_string(path).map_err(|source| TipsError::Io {
            path: path.display().to_string(),
            source,
        })?;
        Self::from_json(&json)
    }

    /// Load pools, falling back to empty pools on any failure.
    pub fn load_or_default(path: Option<&str>) -> Self {
        let Some(path) = path else {
            return Self::default();
        };
        match Self::load(path) {
            Ok(pools) => {
                info!(
                    path,
                    tips = pools.tips.len(),
                    encouragement = pools.encouragement.len(),
                    makes = pools.makes.len(),
                    misses = pools.misses.len(),
                    "Loaded coaching tips"
                );
                pools
            }
            Err(e) => {
                warn!(path, error = %e, "Could not load coaching tips, using defaults");
                Self::default()
            }
        }
    }
}

/// Running statistics of one training session.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SessionStats {
    pub makes: u32,
    pub total_shots: u32,
    pub last_tip: String,
}

impl SessionStats {
    /// Made shots as a percentage of all shots.
    pub fn shooting_percentage(&self) -> f32 {
        if self.total_shots == 0 {
            return 0.0;
        }
        self.makes as f32 / self.total_shots as f32 * 100.0
    }
}

/// What the UI and audio collaborators present for one shot.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DisplayEvent {
    pub outcome: ShotOutcome,
    pub tip: String,
    pub makes: u32,
    pub total_shots: u32,
    pub shot_type: Option<ShotType>,
}

#[derive(Debug, Clone, Copy)]
enum Pool {
    Tips,
    Encouragement,
    Makes,
    Misses,
}

/// Applies results to the session statistics.
pub struct FeedbackSequencer {
    pools: TipPools,
    stats: SessionStats,
    rng: StdRng,
    active: bool,
}

impl FeedbackSequencer {
    pub fn new(pools: TipPools) -> Self {
        Self::with_rng(pools, StdRng::from_os_rng())
    }

    /// Deterministic tip selection.
    pub fn with_seed(pools: TipPools, seed: u64) -> Self {
        Self::with_rng(pools, StdRng::seed_from_u64(seed))
    }

    fn with_rng(pools: TipPools, rng: StdRng) -> Self {
        Self {
            pools,
            stats: SessionStats::default(),
            rng,
            active: false,
        }
    }

    /// Reset the statistics and start accepting results.
    pub fn start(&mut self) {
        self.stats = SessionStats::default();
        self.active = true;
    }

    /// Stop accepting results. Statistics are kept for the final report.
    pub fn end(&mut self) {
        self.active = false;
    }

    pub fn is_active(&self) -> bool {
        self.active
    }

    pub fn stats(&self) -> SessionStats {
        self.stats.clone()
    }

    pub fn last_tip(&self) -> &str {
        &self.stats.last_tip
    }

    /// Apply a result if the session is still active.
    ///
    /// Results arriving after `end` are discarded without touching the stats.
    pub fn accept(&mut self, result: &AnalysisResult) -> Option<DisplayEvent> {
        if !self.active {
            debug!(outcome = %result.outcome, "Discarding result for inactive session");
            return None;
        }
        Some(self.on_result(result))
    }

    /// Apply a result and produce the display event. Never fails.
    pub fn on_result(&mut self, result: &AnalysisResult) -> DisplayEvent {
        self.stats.total_shots += 1;
        if result.outcome == ShotOutcome::Make {
            self.stats.makes += 1;
        }

        let tip = self.choose_tip(result);
        self.stats.last_tip = tip.clone();

        debug!(
            outcome = %result.outcome,
            makes = self.stats.makes,
            total_shots = self.stats.total_shots,
            "Shot recorded"
        );

        DisplayEvent {
            outcome: result.outcome,
            tip,
            makes: self.stats.makes,
            total_shots: self.stats.total_shots,
            shot_type: result.shot_type,
        }
    }

    fn choose_tip(&mut self, result: &AnalysisResult) -> String {
        let service_tip = result.tip.trim();
        if !service_tip.is_empty() {
            if !service_tip.eq_ignore_ascii_case(self.stats.last_tip.trim()) {
                return service_tip.to_string();
            }
            debug!("Service repeated the last tip, substituting encouragement");
            return self.pick(Pool::Encouragement);
        }

        let pool = match result.outcome {
            ShotOutcome::Make => Pool::Makes,
            ShotOutcome::Miss => Pool::Misses,
            ShotOutcome::Indeterminate => Pool::Tips,
        };
        self.pick(pool)
    }

    /// Random line from a pool, avoiding the last tip when possible.
    fn pick(&mut self, pool: Pool) -> String {
        let (lines, default) = match pool {
            Pool::Tips => (&self.pools.tips, DEFAULT_TIP),
            Pool::Encouragement => (&self.pools.encouragement, DEFAULT_ENCOURAGEMENT),
            Pool::Makes => (&self.pools.makes, DEFAULT_MAKE_COMMENT),
            Pool::Misses => (&self.pools.misses, DEFAULT_MISS_COMMENT),
        };

        let last = self.stats.last_tip.as_str();
        let fresh: Vec<&String> = lines
            .iter()
            .filter(|line| !line.trim().is_empty() && line.as_str() != last)
            .collect();

        fresh
            .choose(&mut self.rng)
            .map(|line| line.to_string())
            .or_else(|| lines.choose(&mut self.rng).cloned())
            .unwrap_or_else(|| default.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn create_test_pools() -> TipPools {
        TipPools {
            tips: vec!["Square your shoulders".to_string()],
            encouragement: vec!["Stay with it".to_string()],
            makes: vec!["Money!".to_string(), "Splash!".to_string()],
            misses: vec!["Shake it off".to_string()],
        }
    }

    fn sequencer() -> FeedbackSequencer {
        let mut sequencer = FeedbackSequencer::with_seed(create_test_pools(), 7);
        sequencer.start();
        sequencer
    }

    #[test]
    fn test_counts_makes_and_shots() {
        let mut sequencer = sequencer();
        let outcomes = [
            ShotOutcome::Make,
            ShotOutcome::Miss,
            ShotOutcome::Make,
            ShotOutcome::Make,
            ShotOutcome::Miss,
            ShotOutcome::Make,
            ShotOutcome::Miss,
            ShotOutcome::Make,
            ShotOutcome::Miss,
            ShotOutcome::Make,
        ];

        let mut last = None;
        for outcome in outcomes {
            last = Some(sequencer.on_result(&AnalysisResult::new(outcome, "")));
        }

        let last = last.unwrap();
        assert_eq!(last.makes, 6);
        assert_eq!(last.total_shots, 10);
        assert_eq!(sequencer.stats().makes, 6);
        assert!((sequencer.stats().shooting_percentage() - 60.0).abs() < 1e-4);
    }

    #[test]
    fn test_service_tip_preferred_and_recorded() {
        let mut sequencer = sequencer();
        let event = sequencer.on_result(&AnalysisResult::new(ShotOutcome::Make, " Elbow in "));
        assert_eq!(event.tip, "Elbow in");
        assert_eq!(sequencer.last_tip(), "Elbow in");
    }

    #[test]
    fn test_repeated_service_tip_replaced() {
        let mut sequencer = sequencer();
        sequencer.on_result(&AnalysisResult::new(ShotOutcome::Miss, "Elbow in"));
        let event = sequencer.on_result(&AnalysisResult::new(ShotOutcome::Miss, "elbow in"));
        assert_eq!(event.tip, "Stay with it");
    }

    #[test]
    fn test_canned_tip_by_outcome() {
        let mut sequencer = sequencer();

        let miss = sequencer.on_result(&AnalysisResult::new(ShotOutcome::Miss, ""));
        assert_eq!(miss.tip, "Shake it off");

        let unknown = sequencer.on_result(&AnalysisResult::new(ShotOutcome::Indeterminate, ""));
        assert_eq!(unknown.tip, "Square your shoulders");

        let make = sequencer.on_result(&AnalysisResult::new(ShotOutcome::Make, ""));
        assert!(["Money!", "Splash!"].contains(&make.tip.as_str()));
    }

    #[test]
    fn test_canned_tip_avoids_repeat() {
        let mut sequencer = sequencer();
        let mut previous = sequencer.on_result(&AnalysisResult::new(ShotOutcome::Make, "")).tip;
        for _ in 0..20 {
            let tip = sequencer.on_result(&AnalysisResult::new(ShotOutcome::Make, "")).tip;
            assert_ne!(tip, previous);
            previous = tip;
        }
    }

    #[test]
    fn test_empty_pools_use_defaults() {
        let mut sequencer = FeedbackSequencer::with_seed(TipPools::default(), 1);
        sequencer.start();
        assert_eq!(
            sequencer.on_result(&AnalysisResult::new(ShotOutcome::Make, "")).tip,
            "Great shot!"
        );
        assert_eq!(
            sequencer.on_result(&AnalysisResult::new(ShotOutcome::Miss, "")).tip,
            "Keep shooting!"
        );
        assert_eq!(
            sequencer
                .on_result(&AnalysisResult::new(ShotOutcome::Indeterminate, ""))
                .tip,
            "Keep practicing your form!"
        );
    }

    #[test]
    fn test_single_line_pool_may_repeat() {
        let mut sequencer = sequencer();
        sequencer.on_result(&AnalysisResult::new(ShotOutcome::Miss, ""));
        let again = sequencer.on_result(&AnalysisResult::new(ShotOutcome::Miss, ""));
        assert_eq!(again.tip, "Shake it off");
    }

    #[test]
    fn test_inactive_session_discards_results() {
        let mut sequencer = sequencer();
        sequencer.accept(&AnalysisResult::new(ShotOutcome::Make, "Nice"));
        sequencer.end();

        assert!(sequencer.accept(&AnalysisResult::new(ShotOutcome::Make, "Late")).is_none());
        let stats = sequencer.stats();
        assert_eq!(stats.total_shots, 1);
        assert_eq!(stats.last_tip, "Nice");

        // Restart resets
        sequencer.start();
        assert_eq!(sequencer.stats(), SessionStats::default());
    }

    #[test]
    fn test_shot_type_passed_through() {
        let mut sequencer = sequencer();
        let mut result = AnalysisResult::new(ShotOutcome::Make, "Smooth");
        result.shot_type = Some(ShotType::Layup);
        assert_eq!(sequencer.on_result(&result).shot_type, Some(ShotType::Layup));
    }

    #[test]
    fn test_load_pools_from_file() {
        let path = std::env::temp_dir().join(format!("coaching-tips-{}.json", uuid::Uuid::new_v4()));
        let mut file = std::fs::File::create(&path).unwrap();
        write!(
            file,
            r#"{{"tips":["a"],"encouragement":["b"],"makes":["c"],"misses":["d"]}}"#
        )
        .unwrap();

        let pools = TipPools::load(&path).unwrap();
        assert_eq!(pools.makes, vec!["c".to_string()]);
        std::fs::remove_file(&path).unwrap();
    }

    #[test]
    fn test_missing_file_yields_empty_pools() {
        assert!(matches!(
            TipPools::load("/definitely/not/here.json"),
            Err(TipsError::Io { .. })
        ));
        assert_eq!(
            TipPools::load_or_default(Some("/definitely/not/here.json")),
            TipPools::default()
        );
        assert!(matches!(TipPools::from_json("[1,2]"), Err(TipsError::Parse(_))));
    }
}

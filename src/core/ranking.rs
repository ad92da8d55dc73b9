//! Procurement ranking.
//!
//! Each prepared version gets four scores and a single priority:
//!
//! ```text
//! priority = round(W_impact * impact * (1 + W_votes * ln(1 + votes))
//!                  + W_quality * quality
//!                  + W_temporal * temporal
//!                  - W_cost * estimated_cost)
//! ```
//!
//! Votes enter through a logarithm so a burst of votes cannot dominate
//! the other signals.

use std::collections::HashMap;

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

use crate::domain::{ExclusionReason, FileCandidate, Procurement, RankingScores};

use super::selector::fold_text;

/// Ranking weights and thresholds
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RankingConfig {
    #[serde(default = "default_w_impact")]
    pub w_impact: f64,

    #[serde(default = "default_w_quality")]
    pub w_quality: f64,

    #[serde(default = "default_w_cost")]
    pub w_cost: f64,

    #[serde(default = "default_w_votes")]
    pub w_votes: f64,

    #[serde(default = "default_w_temporal")]
    pub w_temporal: f64,

    /// Hours without upstream updates before a version is stable
    #[serde(default = "default_stability_hours")]
    pub stability_hours: i64,

    #[serde(default = "default_high_impact_keywords")]
    pub high_impact_keywords: Vec<String>,

    #[serde(default = "default_keyword_score")]
    pub keyword_score: i64,

    /// Quality points lost per excluded file, by reason
    #[serde(default = "default_penalties")]
    pub penalties: HashMap<ExclusionReason, i64>,

    #[serde(default = "default_temporal_min_days")]
    pub temporal_min_days: i64,

    #[serde(default = "default_temporal_max_days")]
    pub temporal_max_days: i64,
}

fn default_w_impact() -> f64 {
    1.5
}
fn default_w_quality() -> f64 {
    1.0
}
fn default_w_cost() -> f64 {
    0.1
}
fn default_w_votes() -> f64 {
    0.2
}
fn default_w_temporal() -> f64 {
    0.3
}
fn default_stability_hours() -> i64 {
    48
}
fn default_keyword_score() -> i64 {
    20
}
fn default_temporal_min_days() -> i64 {
    5
}
fn default_temporal_max_days() -> i64 {
    15
}

fn default_high_impact_keywords() -> Vec<String> {
    ["saúde", "hospitalar", "educação", "saneamento", "infraestrutura"]
        .iter()
        .map(|s| s.to_string())
        .collect()
}

fn default_penalties() -> HashMap<ExclusionReason, i64> {
    HashMap::from([
        (ExclusionReason::ExtractionFailed, 20),
        (ExclusionReason::ConversionFailed, 15),
        (ExclusionReason::UnsupportedExtension, 10),
        (ExclusionReason::LockFile, 5),
        (ExclusionReason::TokenLimitExceeded, 5),
    ])
}

impl Default for RankingConfig {
    fn default() -> Self {
        Self {
            w_impact: default_w_impact(),
            w_quality: default_w_quality(),
            w_cost: default_w_cost(),
            w_votes: default_w_votes(),
            w_temporal: default_w_temporal(),
            stability_hours: default_stability_hours(),
            high_impact_keywords: default_high_impact_keywords(),
            keyword_score: default_keyword_score(),
            penalties: default_penalties(),
            temporal_min_days: default_temporal_min_days(),
            temporal_max_days: default_temporal_max_days(),
        }
    }
}

impl RankingConfig {
    /// Quality of the document set, 0..=100
    pub fn quality_score(&self, candidates: &[FileCandidate]) -> i64 {
        if candidates.is_empty() {
            return 0;
        }

        let mut score = 100;
        let mut excluded = 0usize;
        for reason in candidates.iter().filter_map(FileCandidate::exclusion_reason) {
            score -= self.penalties.get(&reason).copied().unwrap_or(0);
            excluded += 1;
        }

        let usable_ratio = (candidates.len() - excluded) as f64 / candidates.len() as f64;
        if usable_ratio < 0.5 {
            score -= 20;
        } else if usable_ratio < 0.8 {
            score -= 10;
        }

        score.max(0)
    }

    /// Value bracket plus sector keywords, capped at 100
    pub fn impact_score(&self, procurement: &Procurement) -> i64 {
        let mut score = match procurement.total_estimated_value {
            Some(v) if v > 1_000_000.0 => 50,
            Some(v) if v > 100_000.0 => 25,
            _ => 0,
        };

        let description = fold_text(&procurement.object_description);
        for keyword in &self.high_impact_keywords {
            if description.contains(&fold_text(keyword)) {
                score += self.keyword_score;
            }
        }

        score.min(100)
    }

    /// Peaks while the proposal deadline is inside the configured window
    pub fn temporal_score(&self, procurement: &Procurement, now: DateTime<Utc>) -> i64 {
        let Some(deadline) = procurement.proposal_closing_date else {
            return 0;
        };
        let days = (deadline - now).num_days();
        if (self.temporal_min_days..=self.temporal_max_days).contains(&days) {
            30
        } else if days > 0 && days < self.temporal_min_days {
            15
        } else {
            0
        }
    }

    pub fn is_stable(&self, procurement: &Procurement, now: DateTime<Utc>) -> bool {
        self.is_stable_since(procurement.last_update_date, now)
    }

    /// No upstream update for longer than the stability window
    pub fn is_stable_since(&self, last_update: DateTime<Utc>, now: DateTime<Utc>) -> bool {
        now - last_update > Duration::hours(self.stability_hours)
    }

    /// All scores for one version
    pub fn score(
        &self,
        procurement: &Procurement,
        candidates: &[FileCandidate],
        votes: i64,
        estimated_cost: f64,
        now: DateTime<Utc>,
    ) -> RankingScores {
        let quality = self.quality_score(candidates);
        let impact = self.impact_score(procurement);
        let temporal = self.temporal_score(procurement, now);

        let vote_factor = 1.0 + self.w_votes * (votes.max(0) as f64).ln_1p();
        let priority = self.w_impact * (impact as f64 * vote_factor)
            + self.w_quality * quality as f64
            + self.w_temporal * temporal as f64
            - self.w_cost * estimated_cost;

        RankingScores {
            quality_score: quality,
            potential_impact_score: impact,
            temporal_score: temporal,
            estimated_cost,
            priority_score: priority.round() as i64,
            is_stable: self.is_stable(procurement, now),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use serde_json::json;

    fn procurement(value: f64, object: &str, closing: Option<&str>) -> Procurement {
        let mut raw = json!({
            "numeroControlePNCP": "1",
            "orgaoEntidade": {"cnpj": "1"},
            "anoCompra": 2025,
            "sequencialCompra": 1,
            "objetoCompra": object,
            "valorTotalEstimado": value,
            "dataAtualizacao": "2025-03-01T12:00:00"
        });
        if let Some(c) = closing {
            raw["dataEncerramentoProposta"] = json!(c);
        }
        Procurement::from_raw(raw).unwrap()
    }

    fn now() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2025, 3, 5, 12, 0, 0).unwrap()
    }

    #[test]
    fn test_quality_penalties() {
        let config = RankingConfig::default();
        assert_eq!(config.quality_score(&[]), 0);

        let ok = FileCandidate::new("d", "a.pdf", Vec::new(), 0);
        let mut failed = FileCandidate::new("d", "b.zip", Vec::new(), 0);
        failed.exclude(ExclusionReason::ExtractionFailed);

        // one of two unusable: -20 for the file, -10 for a 0.5 ratio
        assert_eq!(config.quality_score(&[ok.clone(), failed.clone()]), 70);
        assert_eq!(config.quality_score(&[ok]), 100);
        // ratio 0 -> -20, plus the penalty
        assert_eq!(config.quality_score(&[failed]), 60);
    }

    #[test]
    fn test_impact_brackets_and_keywords() {
        let config = RankingConfig::default();
        assert_eq!(config.impact_score(&procurement(2_000_000.0, "Obra", None)), 50);
        assert_eq!(config.impact_score(&procurement(200_000.0, "Material hospitalar", None)), 45);
        assert_eq!(
            config.impact_score(&procurement(
                5_000_000.0,
                "Saude, educacao, saneamento e infraestrutura",
                None
            )),
            100
        );
    }

    #[test]
    fn test_temporal_window() {
        let config = RankingConfig::default();
        assert_eq!(config.temporal_score(&procurement(0.0, "x", None), now()), 0);
        assert_eq!(config.temporal_score(&procurement(0.0, "x", Some("2025-03-15T12:00:00")), now()), 30);
        assert_eq!(config.temporal_score(&procurement(0.0, "x", Some("2025-03-07T12:00:00")), now()), 15);
        assert_eq!(config.temporal_score(&procurement(0.0, "x", Some("2025-04-30T12:00:00")), now()), 0);
    }

    #[test]
    fn test_votes_are_logarithmic() {
        let config = RankingConfig::default();
        let p = procurement(2_000_000.0, "obra", None);
        let few = config.score(&p, &[], 1, 0.0, now()).priority_score;
        let many = config.score(&p, &[], 1000, 0.0, now()).priority_score;
        // impact 50 * 1.5 = 75 with no votes; a linear weight would multiply it by 200
        assert!(many > few);
        assert!(many < 3 * 75);
    }

    #[test]
    fn test_stability_window() {
        let config = RankingConfig::default();
        let p = procurement(0.0, "x", None);
        assert!(config.is_stable(&p, now()));
        assert!(!config.is_stable(&p, Utc.with_ymd_and_hms(2025, 3, 2, 12, 0, 0).unwrap()));
    }
}

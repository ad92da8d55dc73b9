//! Cost estimation from token counts.

use serde::{Deserialize, Serialize};

use crate::domain::{CostBreakdown, Modality, TokenUsage};

/// Per-million-token rates in the configured currency
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PricingConfig {
    #[serde(default = "default_text_input")]
    pub text_input: f64,

    #[serde(default = "default_text_input_long")]
    pub text_input_long: f64,

    #[serde(default = "default_text_input")]
    pub audio_input: f64,

    #[serde(default = "default_text_input_long")]
    pub audio_input_long: f64,

    #[serde(default = "default_text_input")]
    pub image_input: f64,

    #[serde(default = "default_text_input_long")]
    pub image_input_long: f64,

    #[serde(default = "default_text_input")]
    pub video_input: f64,

    #[serde(default = "default_text_input_long")]
    pub video_input_long: f64,

    /// Output and thinking tokens
    #[serde(default = "default_output")]
    pub output: f64,

    #[serde(default = "default_output_long")]
    pub output_long: f64,

    /// Per 1000 grounding search queries
    #[serde(default)]
    pub search_per_thousand: f64,

    /// Input above this many tokens is billed at the long-context rates
    #[serde(default = "default_long_context_threshold")]
    pub long_context_threshold: u64,
}

fn default_text_input() -> f64 {
    7.750969275
}
fn default_text_input_long() -> f64 {
    15.50193855
}
fn default_output() -> f64 {
    62.0077542
}
fn default_output_long() -> f64 {
    93.0116313
}
fn default_long_context_threshold() -> u64 {
    200_000
}

impl Default for PricingConfig {
    fn default() -> Self {
        Self {
            text_input: default_text_input(),
            text_input_long: default_text_input_long(),
            audio_input: default_text_input(),
            audio_input_long: default_text_input_long(),
            image_input: default_text_input(),
            image_input_long: default_text_input_long(),
            video_input: default_text_input(),
            video_input_long: default_text_input_long(),
            output: default_output(),
            output_long: default_output_long(),
            search_per_thousand: 0.0,
            long_context_threshold: default_long_context_threshold(),
        }
    }
}

impl PricingConfig {
    fn input_rate(&self, modality: Modality, long_context: bool) -> f64 {
        match (modality, long_context) {
            (Modality::Text, false) => self.text_input,
            (Modality::Text, true) => self.text_input_long,
            (Modality::Audio, false) => self.audio_input,
            (Modality::Audio, true) => self.audio_input_long,
            (Modality::Image, false) => self.image_input,
            (Modality::Image, true) => self.image_input_long,
            (Modality::Video, false) => self.video_input,
            (Modality::Video, true) => self.video_input_long,
        }
    }

    fn output_rate(&self, long_context: bool) -> f64 {
        if long_context {
            self.output_long
        } else {
            self.output
        }
    }

    /// Cost of an analysis. Pure; zero tokens cost zero.
    pub fn estimate(&self, tokens: &TokenUsage, modality: Modality, search_queries: u64) -> CostBreakdown {
        let long_context = tokens.input_tokens > self.long_context_threshold;
        let input_cost = per_million(tokens.input_tokens, self.input_rate(modality, long_context));
        let output_cost = per_million(tokens.output_tokens, self.output_rate(long_context));
        let thinking_cost = per_million(tokens.thinking_tokens, self.output_rate(long_context));
        let search_cost = if search_queries == 0 {
            0.0
        } else {
            search_queries as f64 / 1000.0 * self.search_per_thousand
        };

        CostBreakdown {
            input_cost,
            output_cost,
            thinking_cost,
            search_cost,
            total_cost: input_cost + output_cost + thinking_cost + search_cost,
        }
    }
}

fn per_million(tokens: u64, rate: f64) -> f64 {
    if tokens == 0 {
        return 0.0;
    }
    tokens as f64 / 1_000_000.0 * rate
}

#[cfg(test)]
mod tests {
    use super::*;

    fn usage(input: u64, output: u64, thinking: u64) -> TokenUsage {
        TokenUsage {
            input_tokens: input,
            output_tokens: output,
            thinking_tokens: thinking,
        }
    }

    #[test]
    fn test_zero_tokens_cost_nothing() {
        let cost = PricingConfig::default().estimate(&TokenUsage::default(), Modality::Video, 0);
        assert_eq!(cost, CostBreakdown::default());
    }

    #[test]
    fn test_short_context_text() {
        let pricing = PricingConfig::default();
        let cost = pricing.estimate(&usage(1_000_000, 0, 0), Modality::Text, 0);
        assert!((cost.input_cost - 7.750969275).abs() < 1e-9);
        assert_eq!(cost.total_cost, cost.input_cost);
    }

    #[test]
    fn test_long_context_switches_all_rates() {
        let pricing = PricingConfig::default();
        let cost = pricing.estimate(&usage(400_000, 1_000_000, 1_000_000), Modality::Text, 0);
        assert!((cost.input_cost - 0.4 * 15.50193855).abs() < 1e-9);
        assert!((cost.output_cost - 93.0116313).abs() < 1e-9);
        assert!((cost.thinking_cost - 93.0116313).abs() < 1e-9);
        assert!((cost.total_cost - (cost.input_cost + cost.output_cost + cost.thinking_cost)).abs() < 1e-9);
    }

    #[test]
    fn test_modality_and_search_rates() {
        let pricing = PricingConfig {
            video_input: 10.0,
            search_per_thousand: 35.0,
            ..Default::default()
        };
        let cost = pricing.estimate(&usage(100_000, 0, 0), Modality::Video, 2);
        assert!((cost.input_cost - 1.0).abs() < 1e-9);
        assert!((cost.search_cost - 0.07).abs() < 1e-9);
    }
}

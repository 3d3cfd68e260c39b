//! Connection quality scoring
//!
//! Derived from the command latency and success rate a session has
//! accumulated. No network access, so it is trivially testable.

use serde::{Deserialize, Serialize};

/// Coarse connection quality
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum QualityTier {
    Excellent,
    Good,
    Fair,
    Poor,
}

impl QualityTier {
    pub fn as_str(&self) -> &'static str {
        match self {
            QualityTier::Excellent => "excellent",
            QualityTier::Good => "good",
            QualityTier::Fair => "fair",
            QualityTier::Poor => "poor",
        }
    }
}

impl std::fmt::Display for QualityTier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Map average latency and success rate (0.0..=1.0) to a tier.
///
/// `None` latency means no commands have run yet; a fresh session is `Good`.
pub fn quality_tier(avg_latency_ms: Option<f64>, success_rate: f64) -> QualityTier {
    let Some(latency) = avg_latency_ms else {
        return QualityTier::Good;
    };

    if latency < 100.0 && success_rate >= 0.99 {
        QualityTier::Excellent
    } else if latency < 300.0 && success_rate >= 0.95 {
        QualityTier::Good
    } else if latency < 1000.0 && success_rate >= 0.80 {
        QualityTier::Fair
    } else {
        QualityTier::Poor
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_tiers() {
        assert_eq!(quality_tier(Some(40.0), 1.0), QualityTier::Excellent);
        assert_eq!(quality_tier(Some(40.0), 0.97), QualityTier::Good);
        assert_eq!(quality_tier(Some(250.0), 1.0), QualityTier::Good);
        assert_eq!(quality_tier(Some(600.0), 0.9), QualityTier::Fair);
        assert_eq!(quality_tier(Some(600.0), 0.5), QualityTier::Poor);
        assert_eq!(quality_tier(Some(2500.0), 1.0), QualityTier::Poor);
    }

    #[test]
    fn test_no_samples_is_good() {
        assert_eq!(quality_tier(None, 0.0), QualityTier::Good);
    }

    #[test]
    fn test_serializes_snake_case() {
        let json = serde_json::to_string(&QualityTier::Excellent).unwrap();
        assert_eq!(json, "\"excellent\"");
    }
}

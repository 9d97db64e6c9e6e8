use centime_match::{CategorizeConfig, PairingConfig};
use serde::Deserialize;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config: {0}")]
    Io(#[from] std::io::Error),
    #[error("failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),
}

/// Engine configuration, loaded from a TOML document. Every field has a
/// default so an empty document is a valid config.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct EngineConfig {
    pub pairing: PairingSection,
    pub categorization: CategorizationSection,
    pub collaborators: CollaboratorSection,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct PairingSection {
    pub date_window_days: i64,
    pub amount_tolerance_cents: i64,
    pub min_score: f64,
    pub top_k: usize,
    pub transfer_keywords: Vec<String>,
}

impl Default for PairingSection {
    fn default() -> Self {
        let base = PairingConfig::default();
        PairingSection {
            date_window_days: base.date_window_days,
            amount_tolerance_cents: base.amount_tolerance_cents,
            min_score: base.min_score,
            top_k: base.top_k,
            transfer_keywords: base.transfer_keywords,
        }
    }
}

impl PairingSection {
    pub fn to_pairing_config(&self) -> PairingConfig {
        PairingConfig {
            date_window_days: self.date_window_days,
            amount_tolerance_cents: self.amount_tolerance_cents,
            min_score: self.min_score,
            top_k: self.top_k,
            transfer_keywords: self.transfer_keywords.clone(),
            ..PairingConfig::default()
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct CategorizationSection {
    pub top_k: usize,
    pub min_confidence: f64,
    pub tie_epsilon: f64,
}

impl Default for CategorizationSection {
    fn default() -> Self {
        let base = CategorizeConfig::default();
        CategorizationSection {
            top_k: base.top_k,
            min_confidence: base.min_confidence,
            tie_epsilon: base.tie_epsilon,
        }
    }
}

impl CategorizationSection {
    pub fn to_categorize_config(&self) -> CategorizeConfig {
        CategorizeConfig {
            top_k: self.top_k,
            min_confidence: self.min_confidence,
            tie_epsilon: self.tie_epsilon,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct CollaboratorSection {
    /// Budget per external collaborator call. On expiry the engine falls
    /// back to its deterministic behavior.
    pub timeout_ms: u64,
}

impl Default for CollaboratorSection {
    fn default() -> Self {
        CollaboratorSection { timeout_ms: 2_000 }
    }
}

impl EngineConfig {
    pub fn from_toml(doc: &str) -> Result<Self, ConfigError> {
        Ok(toml::from_str(doc)?)
    }

    pub fn from_file(path: &std::path::Path) -> Result<Self, ConfigError> {
        Self::from_toml(&std::fs::read_to_string(path)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_document_yields_defaults() {
        let config = EngineConfig::from_toml("").unwrap();
        assert_eq!(config.pairing.date_window_days, 3);
        assert_eq!(config.pairing.amount_tolerance_cents, 200);
        assert_eq!(config.categorization.top_k, 3);
        assert_eq!(config.collaborators.timeout_ms, 2_000);
    }

    #[test]
    fn sections_override_individually() {
        let config = EngineConfig::from_toml(
            r#"
            [pairing]
            date_window_days = 7
            transfer_keywords = ["xfer"]

            [categorization]
            min_confidence = 0.5

            [collaborators]
            timeout_ms = 500
            "#,
        )
        .unwrap();
        assert_eq!(config.pairing.date_window_days, 7);
        assert_eq!(config.pairing.transfer_keywords, vec!["xfer".to_string()]);
        // Untouched fields keep defaults.
        assert_eq!(config.pairing.amount_tolerance_cents, 200);
        assert_eq!(config.categorization.min_confidence, 0.5);
        assert_eq!(config.collaborators.timeout_ms, 500);
    }

    #[test]
    fn unknown_keys_are_rejected() {
        assert!(EngineConfig::from_toml("[pairing]\nwindow = 3\n").is_err());
    }
}

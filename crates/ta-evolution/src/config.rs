// config.rs — Evolution condition sets and the top-level governance config.
//
// `.ta/governance.toml` holds one table per subsystem:
//
// ```toml
// [trust.tier]
// lookback_days = 30
//
// [policy.context]
// daily_limit_high = 50
//
// [evolution.revoke]
// max_trailing_failures = 5
// ```
//
// Every field has a serde default, so a missing file or an empty table yields
// the documented defaults.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use ta_policy::{PolicyConfig, PolicyEngine};
use ta_trust::{TrustConfig, TrustState};

use crate::error::ConfigError;

/// Location of the governance config inside a project.
pub const GOVERNANCE_CONFIG_PATH: &str = ".ta/governance.toml";

/// All governance configuration for one project.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct GovernanceConfig {
    #[serde(default)]
    pub trust: TrustConfig,

    #[serde(default)]
    pub policy: PolicyConfig,

    #[serde(default)]
    pub evolution: EvolutionConfig,
}

impl GovernanceConfig {
    /// Load and validate a config file.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.display().to_string(),
            source,
        })?;
        let config: Self = toml::from_str(&content)?;
        config.validate()?;
        Ok(config)
    }

    /// Load the config, falling back to the defaults when the file is missing
    /// or invalid.
    pub fn load_or_default(path: &Path) -> Self {
        match Self::load(path) {
            Ok(config) => config,
            Err(ConfigError::Io { source, .. }) if source.kind() == std::io::ErrorKind::NotFound => {
                Self::default()
            }
            Err(e) => {
                tracing::warn!(path = %path.display(), "ignoring governance config: {}", e);
                Self::default()
            }
        }
    }

    /// Load `<project_root>/.ta/governance.toml`.
    pub fn for_project(project_root: &Path) -> Self {
        Self::load_or_default(&Self::path_for(project_root))
    }

    pub fn path_for(project_root: &Path) -> PathBuf {
        project_root.join(GOVERNANCE_CONFIG_PATH)
    }

    /// Check the parts that can be wrong after parsing, i.e. the blacklist
    /// glob patterns.
    pub fn validate(&self) -> Result<(), ConfigError> {
        PolicyEngine::new(self.policy.clone())?;
        Ok(())
    }
}

/// Condition sets and timing for evolution decisions.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct EvolutionConfig {
    #[serde(default)]
    pub promote: PromoteConditions,

    #[serde(default)]
    pub freeze: FreezeConditions,

    #[serde(default)]
    pub revoke: RevokeConditions,

    /// Trailing window for execution and violation statistics.
    #[serde(default = "default_window_days")]
    pub window_days: u32,

    /// How long a PROPOSED decision stays actionable.
    #[serde(default = "default_expiry_hours")]
    pub expiry_hours: u32,
}

impl Default for EvolutionConfig {
    fn default() -> Self {
        Self {
            promote: PromoteConditions::default(),
            freeze: FreezeConditions::default(),
            revoke: RevokeConditions::default(),
            window_days: default_window_days(),
            expiry_hours: default_expiry_hours(),
        }
    }
}

fn default_window_days() -> u32 {
    30
}

fn default_expiry_hours() -> u32 {
    7 * 24
}

/// PROMOTE: every condition must hold.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PromoteConditions {
    #[serde(default = "default_promote_state")]
    pub required_state: TrustState,

    #[serde(default = "default_min_consecutive_successes")]
    pub min_consecutive_successes: u32,

    /// Tolerance for policy rejections on the trajectory record.
    #[serde(default)]
    pub max_policy_rejections: u32,

    /// Tolerance for policy denials in the statistics window.
    #[serde(default)]
    pub max_policy_denials: u64,

    #[serde(default = "default_true")]
    pub forbid_high_tier: bool,
}

impl Default for PromoteConditions {
    fn default() -> Self {
        Self {
            required_state: default_promote_state(),
            min_consecutive_successes: default_min_consecutive_successes(),
            max_policy_rejections: 0,
            max_policy_denials: 0,
            forbid_high_tier: true,
        }
    }
}

fn default_promote_state() -> TrustState {
    TrustState::Earning
}

fn default_min_consecutive_successes() -> u32 {
    10
}

fn default_true() -> bool {
    true
}

/// FREEZE: sustained high-risk activity without a failure spike.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct FreezeConditions {
    #[serde(default = "default_min_high_risk_events")]
    pub min_high_risk_events: u32,

    /// A trailing failure run above this is a spike. `None` uses the REVOKE
    /// failure tolerance.
    #[serde(default)]
    pub max_trailing_failures: Option<u64>,
}

impl Default for FreezeConditions {
    fn default() -> Self {
        Self {
            min_high_risk_events: default_min_high_risk_events(),
            max_trailing_failures: None,
        }
    }
}

fn default_min_high_risk_events() -> u32 {
    2
}

/// REVOKE: any exceeded tolerance triggers.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RevokeConditions {
    #[serde(default = "default_max_trailing_failures")]
    pub max_trailing_failures: u64,

    #[serde(default = "default_max_sandbox_violations")]
    pub max_sandbox_violations: u64,
}

impl Default for RevokeConditions {
    fn default() -> Self {
        Self {
            max_trailing_failures: default_max_trailing_failures(),
            max_sandbox_violations: default_max_sandbox_violations(),
        }
    }
}

fn default_max_trailing_failures() -> u64 {
    5
}

fn default_max_sandbox_violations() -> u64 {
    1
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults() {
        let config = EvolutionConfig::default();
        assert_eq!(config.promote.min_consecutive_successes, 10);
        assert_eq!(config.promote.required_state, TrustState::Earning);
        assert!(config.promote.forbid_high_tier);
        assert_eq!(config.freeze.min_high_risk_events, 2);
        assert_eq!(config.revoke.max_trailing_failures, 5);
        assert_eq!(config.revoke.max_sandbox_violations, 1);
        assert_eq!(config.window_days, 30);
        assert_eq!(config.expiry_hours, 168);
    }

    #[test]
    fn partial_toml_keeps_other_defaults() {
        let config: GovernanceConfig = toml::from_str(
            r#"
[trust.tier]
fallback_score = 75.0

[policy.context]
daily_limit_high = 5

[evolution.revoke]
max_trailing_failures = 3
"#,
        )
        .unwrap();
        assert_eq!(config.trust.tier.fallback_score, 75.0);
        assert_eq!(config.trust.tier.lookback_days, 30);
        assert_eq!(config.policy.context.daily_limit_high, 5);
        assert_eq!(config.policy.context.daily_limit_low, 1000);
        assert_eq!(config.evolution.revoke.max_trailing_failures, 3);
        assert_eq!(config.evolution.revoke.max_sandbox_violations, 1);
        assert_eq!(config.evolution.promote, PromoteConditions::default());
    }

    #[test]
    fn for_project_reads_governance_file() {
        let dir = tempfile::tempdir().unwrap();
        assert_eq!(GovernanceConfig::for_project(dir.path()), GovernanceConfig::default());

        let path = GovernanceConfig::path_for(dir.path());
        std::fs::create_dir_all(path.parent().unwrap()).unwrap();
        std::fs::write(&path, "[evolution]\nwindow_days = 7\n").unwrap();
        assert_eq!(GovernanceConfig::for_project(dir.path()).evolution.window_days, 7);
    }

    #[test]
    fn bad_pattern_fails_validation() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("governance.toml");
        std::fs::write(&path, "[policy.blacklists]\nglobal = [\"[unclosed\"]\n").unwrap();
        assert!(matches!(GovernanceConfig::load(&path), Err(ConfigError::Policy(_))));
        assert_eq!(GovernanceConfig::load_or_default(&path), GovernanceConfig::default());
    }

    #[test]
    fn unparsable_file_is_a_parse_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("governance.toml");
        std::fs::write(&path, "[evolution\n").unwrap();
        assert!(matches!(GovernanceConfig::load(&path), Err(ConfigError::Parse(_))));
    }
}

//! Configuration for the refresh engine.
//!
//! pgtrickle's GUCs have no standalone equivalent once the extension
//! surface is gone; this is a plain struct instead, built once by the
//! embedding application and threaded through [`crate::lib`]'s facade.

use crate::types::Strategy;

/// Tunables for the refresh engine. Construct with [`Default::default`]
/// and override only the fields a deployment actually needs to change.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Default refresh strategy for a view with no per-view override and
    /// no `group_by_columns` eligibility gate satisfied. Always `Full`
    /// unless a future strategy is added — kept as a field rather than a
    /// hardcoded constant so callers can express intent explicitly.
    pub default_strategy: Strategy,

    /// Fraction of a target table's row count that the `AFFECTED_KEYS`
    /// affected-key set may reach before the executor falls back to
    /// `FULL` (`spec.md` §4.8). A per-view `DynamicTableDef::cardinality_threshold`
    /// overrides this for that view only.
    pub cardinality_threshold: f64,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            default_strategy: Strategy::Full,
            cardinality_threshold: 0.3,
        }
    }
}

impl EngineConfig {
    /// The threshold a given view should use: its own override if set,
    /// otherwise the engine-wide default.
    pub fn threshold_for(&self, view_override: Option<f64>) -> f64 {
        view_override.unwrap_or(self.cardinality_threshold)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_threshold_is_point_three() {
        assert_eq!(EngineConfig::default().cardinality_threshold, 0.3);
    }

    #[test]
    fn per_view_override_wins() {
        let config = EngineConfig::default();
        assert_eq!(config.threshold_for(Some(0.5)), 0.5);
        assert_eq!(config.threshold_for(None), 0.3);
    }
}

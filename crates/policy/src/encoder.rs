//! Discretization of incident contexts into policy state keys.
//!
//! Finer keys separate more situations but share less experience between
//! them, so the fine encoder learns slower than the coarse one. Which one a
//! deployment uses is a config choice (`encoder.kind`); a snapshot is only
//! meaningful under the encoder it was trained with.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::context::{Context, Severity};

const fn default_confidence_bins() -> u32 {
    20
}

/// Hashable, discretized form of a [`Context`].
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct StateKey(String);

impl StateKey {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for StateKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case", deny_unknown_fields)]
pub enum StateEncoder {
    /// `<severity>_<category>_c<bin>_a<assets>`.
    Fine {
        #[serde(default = "default_confidence_bins")]
        confidence_bins: u32,
    },
    /// `<severity3>_<category>` with critical folded into high.
    Coarse,
}

impl Default for StateEncoder {
    fn default() -> Self {
        StateEncoder::Fine {
            confidence_bins: default_confidence_bins(),
        }
    }
}

impl StateEncoder {
    pub fn encode(&self, context: &Context) -> StateKey {
        match *self {
            StateEncoder::Fine { confidence_bins } => StateKey(format!(
                "{}_{}_c{}_a{}",
                context.severity(),
                context.category(),
                confidence_bin(context.confidence(), confidence_bins),
                asset_range(context.affected_assets()),
            )),
            StateEncoder::Coarse => {
                let severity = match context.severity() {
                    Severity::Critical => Severity::High,
                    other => other,
                };
                StateKey(format!("{}_{}", severity, context.category()))
            }
        }
    }
}

fn confidence_bin(confidence: f64, bins: u32) -> u32 {
    let bins = bins.max(1);
    // confidence is validated to [0, 1]; 1.0 lands in its own top bin.
    (confidence * f64::from(bins)).floor() as u32
}

fn asset_range(count: u32) -> &'static str {
    match count {
        0..=2 => "0-2",
        3..=5 => "3-5",
        6..=10 => "6-10",
        11..=20 => "11-20",
        _ => "21+",
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::AttackCategory;

    fn ctx(severity: Severity, confidence: f64, assets: u32) -> Context {
        Context::new(severity, AttackCategory::LateralMovement, confidence, assets).unwrap()
    }

    #[test]
    fn fine_key_layout() {
        let key = StateEncoder::default().encode(&ctx(Severity::Critical, 0.9, 5));
        assert_eq!(key.as_str(), "critical_lateral_movement_c18_a3-5");
    }

    #[test]
    fn same_bucket_same_key() {
        let enc = StateEncoder::default();
        let a = ctx(Severity::High, 0.901, 6).with_techniques(["T1021"]);
        let b = ctx(Severity::High, 0.949, 10).with_techniques(["T1570", "T1021"]);
        assert_eq!(enc.encode(&a), enc.encode(&b));
    }

    #[test]
    fn bucket_edges() {
        let enc = StateEncoder::default();
        let key = |c: f64, n: u32| enc.encode(&ctx(Severity::Low, c, n)).to_string();
        assert!(key(0.0, 0).ends_with("_c0_a0-2"));
        assert!(key(0.049, 2).ends_with("_c0_a0-2"));
        assert!(key(0.05, 3).ends_with("_c1_a3-5"));
        assert!(key(1.0, 11).ends_with("_c20_a11-20"));
        assert!(key(0.5, 20).ends_with("_c10_a11-20"));
        assert!(key(0.5, 21).ends_with("_c10_a21+"));
        assert!(key(0.5, u32::MAX).ends_with("_a21+"));
    }

    #[test]
    fn different_buckets_differ() {
        let enc = StateEncoder::default();
        assert_ne!(
            enc.encode(&ctx(Severity::High, 0.90, 5)),
            enc.encode(&ctx(Severity::High, 0.95, 5))
        );
        assert_ne!(
            enc.encode(&ctx(Severity::High, 0.90, 5)),
            enc.encode(&ctx(Severity::Critical, 0.90, 5))
        );
    }

    #[test]
    fn coarse_collapses_critical_and_drops_numeric_fields() {
        let enc = StateEncoder::Coarse;
        let a = enc.encode(&ctx(Severity::Critical, 0.1, 1));
        let b = enc.encode(&ctx(Severity::High, 0.99, 300));
        assert_eq!(a, b);
        assert_eq!(a.as_str(), "high_lateral_movement");
        assert_eq!(
            enc.encode(&ctx(Severity::Medium, 0.5, 1)).as_str(),
            "medium_lateral_movement"
        );
    }

    #[test]
    fn configurable_bin_count() {
        let enc = StateEncoder::Fine { confidence_bins: 10 };
        assert!(enc
            .encode(&ctx(Severity::Low, 0.55, 0))
            .as_str()
            .contains("_c5_"));
    }

    #[test]
    fn encoder_config_from_yaml() {
        let fine: StateEncoder = serde_yaml_ng::from_str("kind: fine").unwrap();
        assert_eq!(fine, StateEncoder::default());
        let coarse: StateEncoder = serde_yaml_ng::from_str("kind: coarse").unwrap();
        assert_eq!(coarse, StateEncoder::Coarse);
    }
}

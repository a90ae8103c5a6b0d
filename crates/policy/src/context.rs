//! Incident context supplied by upstream detection.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::{PolicyError, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Severity {
    Low,
    Medium,
    High,
    Critical,
}

impl Severity {
    pub const ALL: [Severity; 4] = [
        Severity::Low,
        Severity::Medium,
        Severity::High,
        Severity::Critical,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            Severity::Low => "low",
            Severity::Medium => "medium",
            Severity::High => "high",
            Severity::Critical => "critical",
        }
    }

    /// High and critical incidents get the same treatment in the coarse encoder
    /// and in the tiered outcome model.
    pub fn is_elevated(self) -> bool {
        self >= Severity::High
    }
}

impl fmt::Display for Severity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Severity {
    type Err = PolicyError;

    fn from_str(s: &str) -> Result<Self> {
        let key = s.trim().to_ascii_lowercase();
        Severity::ALL
            .into_iter()
            .find(|sev| sev.as_str() == key)
            .ok_or_else(|| PolicyError::InvalidContext(format!("unknown severity {s:?}")))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AttackCategory {
    Phishing,
    CredentialMisuse,
    LateralMovement,
    DataExfiltration,
    MalwareExecution,
    PrivilegeEscalation,
}

impl AttackCategory {
    pub const ALL: [AttackCategory; 6] = [
        AttackCategory::Phishing,
        AttackCategory::CredentialMisuse,
        AttackCategory::LateralMovement,
        AttackCategory::DataExfiltration,
        AttackCategory::MalwareExecution,
        AttackCategory::PrivilegeEscalation,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            AttackCategory::Phishing => "phishing",
            AttackCategory::CredentialMisuse => "credential_misuse",
            AttackCategory::LateralMovement => "lateral_movement",
            AttackCategory::DataExfiltration => "data_exfiltration",
            AttackCategory::MalwareExecution => "malware_execution",
            AttackCategory::PrivilegeEscalation => "privilege_escalation",
        }
    }

    /// Representative ATT&CK technique ids, used to tag synthetic contexts.
    pub fn typical_techniques(self) -> &'static [&'static str] {
        match self {
            AttackCategory::Phishing => &["T1566", "T1204"],
            AttackCategory::CredentialMisuse => &["T1078", "T1110"],
            AttackCategory::LateralMovement => &["T1021", "T1570"],
            AttackCategory::DataExfiltration => &["T1041", "T1048"],
            AttackCategory::MalwareExecution => &["T1059", "T1204"],
            AttackCategory::PrivilegeEscalation => &["T1068", "T1548"],
        }
    }
}

impl fmt::Display for AttackCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for AttackCategory {
    type Err = PolicyError;

    fn from_str(s: &str) -> Result<Self> {
        let key = s.trim().to_ascii_lowercase().replace(['-', ' '], "_");
        AttackCategory::ALL
            .into_iter()
            .find(|cat| cat.as_str() == key)
            .ok_or_else(|| PolicyError::InvalidContext(format!("unknown attack category {s:?}")))
    }
}

/// Description of the incident a decision is made about.
///
/// Fields are private so a `Context` always satisfies `confidence ∈ [0, 1]`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "RawContext")]
pub struct Context {
    severity: Severity,
    category: AttackCategory,
    confidence: f64,
    affected_assets: u32,
    #[serde(default)]
    techniques: Vec<String>,
}

#[derive(Deserialize)]
struct RawContext {
    severity: Severity,
    category: AttackCategory,
    confidence: f64,
    affected_assets: u32,
    #[serde(default)]
    techniques: Vec<String>,
}

impl TryFrom<RawContext> for Context {
    type Error = PolicyError;

    fn try_from(raw: RawContext) -> Result<Self> {
        Context::new(raw.severity, raw.category, raw.confidence, raw.affected_assets)
            .map(|ctx| ctx.with_techniques(raw.techniques))
    }
}

impl Context {
    pub fn new(
        severity: Severity,
        category: AttackCategory,
        confidence: f64,
        affected_assets: u32,
    ) -> Result<Self> {
        if !confidence.is_finite() || !(0.0..=1.0).contains(&confidence) {
            return Err(PolicyError::InvalidContext(format!(
                "confidence must lie in [0, 1], got {confidence}"
            )));
        }
        Ok(Self {
            severity,
            category,
            confidence,
            affected_assets,
            techniques: Vec::new(),
        })
    }

    pub fn with_techniques<I, S>(mut self, techniques: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.techniques = techniques.into_iter().map(Into::into).collect();
        self
    }

    pub fn severity(&self) -> Severity {
        self.severity
    }

    pub fn category(&self) -> AttackCategory {
        self.category
    }

    pub fn confidence(&self) -> f64 {
        self.confidence
    }

    pub fn affected_assets(&self) -> u32 {
        self.affected_assets
    }

    pub fn techniques(&self) -> &[String] {
        &self.techniques
    }
}

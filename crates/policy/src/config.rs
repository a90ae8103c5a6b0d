use serde::{Deserialize, Serialize};
use std::{
    fs,
    path::{Path, PathBuf},
};

use crate::encoder::StateEncoder;
use crate::error::{PolicyError, Result};
use crate::reward::RewardConfig;
use crate::selector::SelectionStrategy;
use crate::simulator::SimulatorConfig;

pub const DEFAULT_CONFIG_PATH: &str = "./configs/remedy.yaml";

/// Named hyperparameter bundles.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Profile {
    /// Conservative settings tuned against the measured effectiveness model.
    #[default]
    Measured,
    /// High learning rate, optimistic start and a high exploration floor.
    FastLearning,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Hyperparameters {
    pub alpha: f64,
    pub epsilon: f64,
    pub epsilon_decay: f64,
    pub min_epsilon: f64,
    pub gamma: f64,
    pub q_init: f64,
}

impl Hyperparameters {
    pub const fn measured() -> Self {
        Self {
            alpha: 0.1,
            epsilon: 0.1,
            epsilon_decay: 0.995,
            min_epsilon: 0.01,
            gamma: 0.95,
            q_init: 0.0,
        }
    }

    pub const fn fast_learning() -> Self {
        Self {
            alpha: 0.5,
            epsilon: 0.4,
            epsilon_decay: 0.99,
            min_epsilon: 0.15,
            gamma: 0.95,
            q_init: 0.7,
        }
    }

    /// Range checks plus `epsilon >= min_epsilon`.
    pub fn validate(&self) -> Result<()> {
        self.check_ranges()?;
        if self.epsilon < self.min_epsilon {
            return Err(PolicyError::Config(format!(
                "epsilon {} is below min_epsilon {}",
                self.epsilon, self.min_epsilon
            )));
        }
        Ok(())
    }

    /// Each value on its own, without relating epsilon to its floor.
    pub(crate) fn check_ranges(&self) -> Result<()> {
        let unit = |name: &str, v: f64, lower_open: bool| {
            let ok = v.is_finite() && v <= 1.0 && if lower_open { v > 0.0 } else { v >= 0.0 };
            if ok {
                Ok(())
            } else {
                Err(PolicyError::Config(format!("{name} out of range: {v}")))
            }
        };
        unit("alpha", self.alpha, true)?;
        unit("epsilon", self.epsilon, false)?;
        unit("epsilon_decay", self.epsilon_decay, true)?;
        unit("min_epsilon", self.min_epsilon, false)?;
        unit("gamma", self.gamma, false)?;
        if !self.q_init.is_finite() {
            return Err(PolicyError::Config("q_init must be finite".into()));
        }
        Ok(())
    }
}

impl From<Profile> for Hyperparameters {
    fn from(profile: Profile) -> Self {
        match profile {
            Profile::Measured => Self::measured(),
            Profile::FastLearning => Self::fast_learning(),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StorageBackend {
    #[default]
    File,
    Sqlite,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct StorageConfig {
    #[serde(default)]
    pub backend: StorageBackend,
    /// Overrides `<data_dir>/policy`.
    #[serde(default)]
    pub dir: Option<PathBuf>,
}

impl StorageConfig {
    pub fn resolved_dir(&self) -> PathBuf {
        self.dir
            .clone()
            .unwrap_or_else(|| data_dir().join("policy"))
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct EngineConfig {
    #[serde(default)]
    pub profile: Profile,
    /// Replaces the profile's bundle entirely when present.
    #[serde(default)]
    pub hyperparameters: Option<Hyperparameters>,
    #[serde(default)]
    pub encoder: StateEncoder,
    #[serde(default)]
    pub selection: SelectionStrategy,
    #[serde(default)]
    pub simulator: SimulatorConfig,
    #[serde(default)]
    pub reward: RewardConfig,
    #[serde(default)]
    pub storage: StorageConfig,
    #[serde(default)]
    pub seed: Option<u64>,
    /// Append decisions and updates to `<data_dir>/events`.
    #[serde(default)]
    pub audit_events: bool,
}

impl EngineConfig {
    pub fn fast_learning() -> Self {
        Self {
            profile: Profile::FastLearning,
            simulator: SimulatorConfig::Tiered(Default::default()),
            selection: SelectionStrategy::ucb(),
            ..Self::default()
        }
    }

    pub fn hyperparameters(&self) -> Hyperparameters {
        self.hyperparameters
            .unwrap_or_else(|| Hyperparameters::from(self.profile))
    }

    pub fn validate(&self) -> Result<()> {
        self.hyperparameters().validate()?;
        self.simulator.validate()?;
        if let StateEncoder::Fine { confidence_bins } = self.encoder {
            if confidence_bins == 0 {
                return Err(PolicyError::Config("confidence_bins must be > 0".into()));
            }
        }
        Ok(())
    }
}

/// `REMEDY_CONFIG` or [`DEFAULT_CONFIG_PATH`].
pub fn config_path() -> PathBuf {
    std::env::var_os("REMEDY_CONFIG")
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from(DEFAULT_CONFIG_PATH))
}

/// `REMEDY_DATA` or `~/.remedy`.
pub fn data_dir() -> PathBuf {
    let home = dirs::home_dir().unwrap_or_else(|| ".".into());
    std::env::var("REMEDY_DATA")
        .map(Into::into)
        .unwrap_or(home.join(".remedy"))
}

pub fn load_config<P: AsRef<Path>>(path: P) -> anyhow::Result<EngineConfig> {
    let path = path.as_ref();
    match fs::read_to_string(path) {
        Ok(content) => match serde_yaml_ng::from_str(&content) {
            Ok(config) => Ok(config),
            Err(err) => {
                tracing::warn!(
                    path = %path.display(),
                    error = %err,
                    "failed to parse engine config YAML, falling back to defaults"
                );
                Ok(EngineConfig::default())
            }
        },
        Err(err) => {
            tracing::warn!(
                path = %path.display(),
                error = %err,
                "failed to read engine config YAML, falling back to defaults"
            );
            Ok(EngineConfig::default())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;
    use std::io::Write;

    #[test]
    fn missing_file_falls_back_to_defaults() {
        let config = load_config("/does/not/exist.yaml").unwrap();
        assert_eq!(config, EngineConfig::default());
        assert_eq!(config.hyperparameters(), Hyperparameters::measured());
    }

    #[test]
    fn partial_yaml_merges_with_defaults() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(
            file,
            "profile: fast_learning\nselection:\n  kind: ucb\nreward:\n  failure: -0.8\n"
        )
        .unwrap();

        let config = load_config(file.path()).unwrap();
        assert_eq!(config.profile, Profile::FastLearning);
        assert_eq!(config.hyperparameters().q_init, 0.7);
        assert_eq!(config.selection, SelectionStrategy::ucb());
        assert_eq!(config.reward.failure, -0.8);
        assert_eq!(config.reward.success, 1.0);
        assert_eq!(config.encoder, StateEncoder::default());
        assert_eq!(config.storage.backend, StorageBackend::File);
    }

    #[test]
    fn shipped_config_parses_to_defaults() {
        let shipped = include_str!("../../../configs/remedy.yaml");
        let config: EngineConfig = serde_yaml_ng::from_str(shipped).unwrap();
        assert_eq!(config, EngineConfig::default());
    }

    #[test]
    fn unknown_keys_fall_back_to_defaults() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "profil: fast_learning").unwrap();
        let config = load_config(file.path()).unwrap();
        assert_eq!(config.profile, Profile::Measured);
    }

    #[test]
    fn explicit_hyperparameters_override_profile() {
        let config: EngineConfig = serde_yaml_ng::from_str(
            "profile: fast_learning\nhyperparameters:\n  alpha: 0.2\n  epsilon: 1.0\n  epsilon_decay: 0.9\n  min_epsilon: 0.05\n  gamma: 0.0\n  q_init: 0.0\n",
        )
        .unwrap();
        let hp = config.hyperparameters();
        assert_eq!(hp.alpha, 0.2);
        assert_eq!(hp.min_epsilon, 0.05);
        config.validate().unwrap();
    }

    #[test]
    fn validation_rejects_out_of_range_values() {
        let mut hp = Hyperparameters::measured();
        hp.alpha = 0.0;
        assert!(matches!(hp.validate(), Err(PolicyError::Config(_))));
        let mut hp = Hyperparameters::fast_learning();
        hp.epsilon_decay = 1.2;
        assert!(hp.validate().is_err());
        assert!(Hyperparameters::measured().validate().is_ok());
        assert!(Hyperparameters::fast_learning().validate().is_ok());

        let config = EngineConfig {
            encoder: StateEncoder::Fine { confidence_bins: 0 },
            ..EngineConfig::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn validation_rejects_epsilon_below_floor() {
        let hp = Hyperparameters {
            epsilon: 0.0,
            min_epsilon: 0.1,
            ..Hyperparameters::measured()
        };
        assert!(matches!(hp.validate(), Err(PolicyError::Config(_))));
        assert!(hp.check_ranges().is_ok());

        let config = EngineConfig {
            hyperparameters: Some(hp),
            ..EngineConfig::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn validation_rejects_inverted_simulator_band() {
        let config: EngineConfig = serde_yaml_ng::from_str(
            "simulator:\n  model: effectiveness\n  band:\n    min: 0.9\n    max: 0.3\n",
        )
        .unwrap();
        assert!(matches!(config.validate(), Err(PolicyError::Config(_))));

        let config: EngineConfig =
            serde_yaml_ng::from_str("simulator:\n  model: tiered\n  false_positive_p: .nan\n")
                .unwrap();
        assert!(config.validate().is_err());
    }

    #[test]
    #[serial]
    fn data_dir_honours_env_override() {
        let dir = tempfile::tempdir().unwrap();
        std::env::set_var("REMEDY_DATA", dir.path());
        assert_eq!(data_dir(), dir.path());
        assert_eq!(StorageConfig::default().resolved_dir(), dir.path().join("policy"));
        std::env::remove_var("REMEDY_DATA");
    }

    #[test]
    #[serial]
    fn config_path_honours_env_override() {
        std::env::set_var("REMEDY_CONFIG", "/etc/remedy/custom.yaml");
        assert_eq!(config_path(), PathBuf::from("/etc/remedy/custom.yaml"));
        std::env::remove_var("REMEDY_CONFIG");
        assert_eq!(config_path(), PathBuf::from(DEFAULT_CONFIG_PATH));
    }
}

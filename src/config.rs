use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use serde::Deserialize;

use crate::error::{ConfigError, Error, Result};
use crate::planner::TieBreak;

/// Top-level experiment configuration
///
/// Mirrors the YAML configuration document. Field names keep the external
/// spelling of the file format, so a configuration written for any driver of
/// this system parses unchanged.
#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    #[serde(rename = "General")]
    pub general: General,
    #[serde(rename = "Experiment")]
    pub experiment: Experiment,
    /// Per-agent controller specification, keyed by agent id
    #[serde(rename = "AgentComponent")]
    pub agent_component: BTreeMap<String, AgentConfig>,
    /// Domain sections, keyed by domain name (e.g. `FireFighter`)
    #[serde(flatten)]
    pub domains: BTreeMap<String, DomainConfig>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct General {
    pub domain: String,
    pub horizon: usize,
    #[serde(rename = "discountFactor")]
    pub discount_factor: f32,
    #[serde(rename = "IDOfAgentToControl")]
    pub id_of_agent_to_control: String,
    /// Seed for every random draw in the process; entropy-seeded when absent
    #[serde(default)]
    pub seed: Option<u64>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct Experiment {
    pub repeat: usize,
    #[serde(rename = "saveReplay")]
    pub save_replay: bool,
    #[serde(rename = "fullLogging")]
    pub full_logging: bool,
}

#[derive(Debug, Clone, Deserialize)]
pub struct AgentConfig {
    /// Controller kind: `Random`, `Fixed`, `Naive`, or `POMCP`
    #[serde(rename = "Type")]
    pub kind: String,
    /// Action taken by a `Fixed` controller
    #[serde(default)]
    pub action: Option<usize>,
    #[serde(rename = "Simulator", default)]
    pub simulator: Option<SimulatorConfig>,
    #[serde(rename = "Rollout", default)]
    pub rollout: Option<RolloutConfig>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct SimulatorConfig {
    /// `Global` or `Local`
    #[serde(rename = "Type")]
    pub kind: String,
    #[serde(rename = "InfluencePredictor", default)]
    pub influence_predictor: Option<PredictorConfig>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct PredictorConfig {
    /// `Random`, `RNN`, or `GRU`
    #[serde(rename = "Type")]
    pub kind: String,
    #[serde(rename = "modelPath", default)]
    pub model_path: Option<PathBuf>,
    #[serde(rename = "numberOfHiddenStates", default)]
    pub number_of_hidden_states: Option<usize>,
    /// Step-wise hidden-state variant when true, full-history variant otherwise
    #[serde(default)]
    pub recurrent: bool,
    /// Accepted for compatibility; the decomposed-matrix path is always used
    #[serde(default)]
    pub fast: Option<bool>,
    #[serde(rename = "numberOfSampledEpisodesForTraining", default)]
    pub episodes_for_training: Option<usize>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct RolloutConfig {
    #[serde(rename = "numberOfParticles")]
    pub number_of_particles: usize,
    #[serde(rename = "discountHorizon")]
    pub discount_horizon: f32,
    #[serde(rename = "particleReinvigoration")]
    pub particle_reinvigoration: bool,
    #[serde(rename = "particleReinvigorationRate", default)]
    pub particle_reinvigoration_rate: f32,
    #[serde(rename = "explorationConstant")]
    pub exploration_constant: f32,
    #[serde(rename = "numberOfSimulationsPerStep", default)]
    pub number_of_simulations_per_step: Option<u32>,
    #[serde(rename = "numberOfSecondsPerStep", default)]
    pub number_of_seconds_per_step: Option<f64>,
    #[serde(rename = "tieBreak", default)]
    pub tie_break: TieBreak,
}

#[derive(Debug, Clone, Deserialize)]
pub struct DomainConfig {
    /// Path to the two-stage DBN description file
    #[serde(rename = "2SDBNYamlFilePath")]
    pub dbn_file: PathBuf,
    /// Domain-specific knobs, passed through to the domain encoding
    #[serde(flatten, default)]
    pub extra: BTreeMap<String, serde_yaml::Value>,
}

impl Config {
    /// Load and validate a configuration file
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path).map_err(|source| Error::Io {
            path: path.to_path_buf(),
            source,
        })?;
        let config: Config = serde_yaml::from_str(&content)?;
        config.validate()?;
        Ok(config)
    }

    /// The domain section named by `General.domain`
    pub fn domain(&self) -> Result<&DomainConfig, ConfigError> {
        self.domains
            .get(&self.general.domain)
            .ok_or_else(|| ConfigError::UnknownDomain(self.general.domain.clone()))
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if !(0.0 < self.general.discount_factor && self.general.discount_factor <= 1.0) {
            return Err(ConfigError::InvalidValue {
                field: "General.discountFactor".into(),
                reason: "must be in (0, 1]".into(),
            });
        }
        if self.general.horizon == 0 {
            return Err(ConfigError::InvalidValue {
                field: "General.horizon".into(),
                reason: "must be at least 1".into(),
            });
        }
        if !self
            .agent_component
            .contains_key(&self.general.id_of_agent_to_control)
        {
            return Err(ConfigError::MissingField(format!(
                "AgentComponent.{}",
                self.general.id_of_agent_to_control
            )));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const CONFIG: &str = "
General:
  domain: FireFighter
  horizon: 10
  discountFactor: 0.95
  IDOfAgentToControl: '0'
  seed: 7
Experiment:
  repeat: 2
  saveReplay: false
  fullLogging: false
AgentComponent:
  '0':
    Type: POMCP
    Simulator:
      Type: Local
      InfluencePredictor:
        Type: Random
    Rollout:
      numberOfParticles: 32
      discountHorizon: 0.01
      particleReinvigoration: true
      particleReinvigorationRate: 0.5
      explorationConstant: 5.0
      numberOfSimulationsPerStep: 128
  '1':
    Type: Naive
FireFighter:
  2SDBNYamlFilePath: nets/firefighter.yaml
  numberOfHouses: 3
";

    #[test]
    fn config_parses() {
        let config: Config = serde_yaml::from_str(CONFIG).unwrap();
        config.validate().unwrap();

        assert_eq!(config.general.horizon, 10);
        assert_eq!(config.general.seed, Some(7));
        assert_eq!(config.general.id_of_agent_to_control, "0");

        let planner = &config.agent_component["0"];
        assert_eq!(planner.kind, "POMCP");
        let simulator = planner.simulator.as_ref().unwrap();
        assert_eq!(simulator.kind, "Local");
        assert_eq!(simulator.influence_predictor.as_ref().unwrap().kind, "Random");
        let rollout = planner.rollout.as_ref().unwrap();
        assert_eq!(rollout.number_of_particles, 32);
        assert_eq!(rollout.number_of_simulations_per_step, Some(128));
        assert!(rollout.number_of_seconds_per_step.is_none());
        assert_eq!(rollout.tie_break, TieBreak::Last);

        let domain = config.domain().unwrap();
        assert_eq!(domain.dbn_file, PathBuf::from("nets/firefighter.yaml"));
        assert!(domain.extra.contains_key("numberOfHouses"));
    }

    #[test]
    fn config_rejects_bad_discount() {
        let bad = CONFIG.replace("discountFactor: 0.95", "discountFactor: 1.5");
        let config: Config = serde_yaml::from_str(&bad).unwrap();
        assert!(matches!(
            config.validate(),
            Err(ConfigError::InvalidValue { .. })
        ));
    }

    #[test]
    fn config_requires_controlled_agent_entry() {
        let bad = CONFIG.replace("IDOfAgentToControl: '0'", "IDOfAgentToControl: '9'");
        let config: Config = serde_yaml::from_str(&bad).unwrap();
        assert!(matches!(
            config.validate(),
            Err(ConfigError::MissingField(_))
        ));
    }
}

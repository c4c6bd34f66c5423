use std::collections::BTreeMap;
use std::fs::File;
use std::io::{BufWriter, Write as _};
use std::path::{Path, PathBuf};

use clap::ValueEnum;
use log::{debug, info};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde::{Deserialize, Serialize};

use crate::agent::{make_agent_component, AgentModel, FixedModel, RandomModel, ReactiveModel};
use crate::config::Config;
use crate::dbn::TwoStageDbn;
use crate::episode::{Environment, Episode, EpisodeResult};
use crate::error::{ConfigError, Error, Result};
use crate::sim::{GlobalSimulator, Simulator};

/// The three supported experiment kinds
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum ExperimentKind {
    #[value(name = "Testing")]
    Testing,
    #[value(name = "Planning")]
    Planning,
    #[value(name = "DataGeneration")]
    DataGeneration,
}

/// Per-agent record written into the results file for one episode
#[derive(Debug, Clone, Serialize)]
struct AgentRecord {
    #[serde(rename = "Return")]
    episodic_return: f32,
    #[serde(rename = "Times")]
    times: Vec<f64>,
    #[serde(rename = "Num_simulations", skip_serializing_if = "Option::is_none")]
    num_simulations: Option<Vec<u32>>,
    #[serde(rename = "Num_particles", skip_serializing_if = "Option::is_none")]
    num_particles: Option<Vec<usize>>,
}

/// A dense integer tensor dumped for influence-predictor training
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IntTensor {
    pub shape: [usize; 3],
    pub data: Vec<u32>,
}

impl IntTensor {
    pub fn zeros(shape: [usize; 3]) -> Self {
        Self {
            data: vec![0; shape.iter().product()],
            shape,
        }
    }

    pub fn set(&mut self, episode: usize, step: usize, column: usize, value: u32) {
        let [_, steps, columns] = self.shape;
        self.data[(episode * steps + step) * columns + column] = value;
    }

    pub fn get(&self, episode: usize, step: usize, column: usize) -> u32 {
        let [_, steps, columns] = self.shape;
        self.data[(episode * steps + step) * columns + column]
    }

    pub fn save(&self, path: impl AsRef<Path>) -> Result<()> {
        let path = path.as_ref();
        let file = File::create(path).map_err(|source| Error::Io {
            path: path.to_path_buf(),
            source,
        })?;
        bincode::serialize_into(BufWriter::new(file), self)?;
        Ok(())
    }
}

/// Drives a configured experiment against a results directory
pub struct Experiment {
    config: Config,
    results_dir: PathBuf,
}

impl Experiment {
    pub fn new(config_path: impl AsRef<Path>, results_dir: impl AsRef<Path>) -> Result<Self> {
        let config = Config::load(config_path)?;
        Ok(Self {
            config,
            results_dir: results_dir.as_ref().to_path_buf(),
        })
    }

    pub fn from_config(config: Config, results_dir: impl AsRef<Path>) -> Self {
        Self {
            config,
            results_dir: results_dir.as_ref().to_path_buf(),
        }
    }

    pub fn run(&self, kind: ExperimentKind) -> Result<()> {
        match kind {
            ExperimentKind::Testing => self.run_testing(),
            ExperimentKind::Planning => self.run_planning(),
            ExperimentKind::DataGeneration => self.run_data_generation(),
        }
    }

    fn build_dbn(&self) -> Result<TwoStageDbn> {
        let domain = self.config.domain()?;
        TwoStageDbn::load(&domain.dbn_file, self.config.general.seed)
    }

    /// Configuration and model smoke check: everything loads or we fail
    fn run_testing(&self) -> Result<()> {
        let mut dbn = self.build_dbn()?;
        dbn.construct_local_model(&self.config.general.id_of_agent_to_control)?;
        info!("testing experiment finished");
        Ok(())
    }

    fn run_planning(&self) -> Result<()> {
        let general = &self.config.general;
        let experiment = &self.config.experiment;
        let controlled = &general.id_of_agent_to_control;

        let dbn = self.build_dbn()?;
        let mut environment_dbn = dbn.clone();
        if let Some(seed) = general.seed {
            environment_dbn.reseed(seed.wrapping_add(0x0DD0));
        }
        let agent_ids: Vec<String> = self.config.agent_component.keys().cloned().collect();
        let mut environment = Environment::new(environment_dbn, agent_ids.clone());
        let mut component = make_agent_component(&self.config, &dbn)?;

        let mut results: BTreeMap<usize, BTreeMap<String, AgentRecord>> = BTreeMap::new();
        let mut moving_averages: BTreeMap<String, f32> = BTreeMap::new();

        for episode_id in 0..experiment.repeat {
            let mut episode = Episode::new(
                episode_id,
                &mut environment,
                &mut component,
                general.horizon,
                general.discount_factor,
                experiment.save_replay,
            );
            let result = episode.dispatch()?;

            let mut records = BTreeMap::new();
            for agent_id in &agent_ids {
                let episodic_return = result
                    .discounted_return
                    .get(agent_id)
                    .copied()
                    .unwrap_or_default();
                let is_controlled = agent_id == controlled;

                let average = moving_averages
                    .entry(agent_id.clone())
                    .and_modify(|avg| {
                        *avg = (*avg * episode_id as f32 + episodic_return) / (episode_id + 1) as f32
                    })
                    .or_insert(episodic_return);
                let message = format!(
                    "[Episode {episode_id}] agent {agent_id}: discounted return {episodic_return:.4}, running average {average:.4}"
                );
                if is_controlled {
                    info!("{message}");
                    log_decision_summary(episode_id, agent_id, &result);
                } else {
                    debug!("{message}");
                }

                if experiment.full_logging || is_controlled {
                    records.insert(
                        agent_id.clone(),
                        AgentRecord {
                            episodic_return,
                            times: result
                                .time_per_action
                                .get(agent_id)
                                .cloned()
                                .unwrap_or_default(),
                            num_simulations: is_controlled
                                .then(|| result.simulations_per_step.get(agent_id).cloned())
                                .flatten(),
                            num_particles: is_controlled
                                .then(|| {
                                    result.particles_before_simulation.get(agent_id).cloned()
                                })
                                .flatten(),
                        },
                    );
                }
            }
            results.insert(episode_id, records);

            if let Some(replay) = &result.replay {
                self.write_replay(episode_id, replay)?;
            }
        }

        self.write_yaml(&self.results_dir.join("results.yaml"), &results)
    }

    /// Drive the global simulator with random controlled actions and dump the
    /// `(local states + action)` inputs and influence-source outputs
    fn run_data_generation(&self) -> Result<()> {
        let general = &self.config.general;
        let controlled = &general.id_of_agent_to_control;
        let horizon = general.horizon;

        let agent_spec = self
            .config
            .agent_component
            .get(controlled)
            .ok_or_else(|| ConfigError::MissingField(format!("AgentComponent.{controlled}")))?;
        let episodes = agent_spec
            .simulator
            .as_ref()
            .and_then(|sim| sim.influence_predictor.as_ref())
            .and_then(|predictor| predictor.episodes_for_training)
            .ok_or_else(|| {
                ConfigError::MissingField(format!(
                    "AgentComponent.{controlled}.Simulator.InfluencePredictor.numberOfSampledEpisodesForTraining"
                ))
            })?;

        let dbn = self.build_dbn()?;
        let mut local_dbn = dbn.clone();
        let local = local_dbn.construct_local_model(controlled)?;
        let num_actions = *dbn
            .num_actions()
            .get(controlled)
            .ok_or_else(|| ConfigError::MissingField(format!("a{controlled}")))?;

        let mut models: Vec<(String, Box<dyn AgentModel>)> = Vec::new();
        for (stream, (other_id, other_spec)) in self
            .config
            .agent_component
            .iter()
            .filter(|(id, _)| id.as_str() != controlled.as_str())
            .enumerate()
        {
            let other_actions = *dbn
                .num_actions()
                .get(other_id)
                .ok_or_else(|| ConfigError::MissingField(format!("a{other_id}")))?;
            let seed = general.seed.map(|s| s.wrapping_add(7 + stream as u64));
            let model: Box<dyn AgentModel> = match other_spec.kind.as_str() {
                "Random" | "POMCP" => Box::new(RandomModel::new(other_actions, seed)),
                "Fixed" => Box::new(FixedModel::new(other_spec.action.unwrap_or(0))),
                "Naive" => Box::new(ReactiveModel),
                other => return Err(ConfigError::UnknownAgentType(other.into()).into()),
            };
            models.push((other_id.clone(), model));
        }
        let mut simulator = GlobalSimulator::new(
            controlled,
            dbn,
            models,
            general.discount_factor,
            horizon,
        )?;

        let input_columns = local.local_states.len() + 1;
        let output_columns = local.source_factors.len();
        let mut inputs = IntTensor::zeros([episodes, horizon - 1, input_columns]);
        let mut outputs = IntTensor::zeros([episodes, horizon - 1, output_columns]);
        info!(
            "generating {episodes} episodes of training data: inputs {:?}, outputs {:?}",
            inputs.shape, outputs.shape
        );

        let mut rng = match general.seed {
            Some(seed) => StdRng::seed_from_u64(seed.wrapping_add(0xDA7A)),
            None => StdRng::from_entropy(),
        };
        for episode in 0..episodes {
            let mut state = simulator.sample_initial_state();
            for step in 0..horizon - 1 {
                let action = rng.gen_range(0..num_actions);
                simulator.step(&mut state, action);
                for (column, name) in local.local_states.iter().enumerate() {
                    inputs.set(episode, step, column, state.environment[name] as u32);
                }
                inputs.set(episode, step, input_columns - 1, action as u32);
                for (column, name) in local.source_factors.iter().enumerate() {
                    outputs.set(episode, step, column, state.environment[name] as u32);
                }
            }
        }

        inputs.save(self.results_dir.join("inputs.bin"))?;
        outputs.save(self.results_dir.join("outputs.bin"))?;
        info!("training tensors written to {}", self.results_dir.display());
        Ok(())
    }

    fn write_replay(&self, episode_id: usize, replay: &crate::episode::Replay) -> Result<()> {
        let dir = self.results_dir.join("replays");
        std::fs::create_dir_all(&dir).map_err(|source| Error::Io {
            path: dir.clone(),
            source,
        })?;
        self.write_yaml(&dir.join(format!("episode{episode_id}.yaml")), replay)
    }

    fn write_yaml<T: Serialize>(&self, path: &Path, value: &T) -> Result<()> {
        let mut file = File::create(path).map_err(|source| Error::Io {
            path: path.to_path_buf(),
            source,
        })?;
        let text = serde_yaml::to_string(value)?;
        file.write_all(text.as_bytes()).map_err(|source| Error::Io {
            path: path.to_path_buf(),
            source,
        })?;
        Ok(())
    }
}

fn log_decision_summary(episode_id: usize, agent_id: &str, result: &EpisodeResult) {
    let mean = |values: &[f64]| {
        if values.is_empty() {
            0.0
        } else {
            values.iter().sum::<f64>() / values.len() as f64
        }
    };
    if let Some(times) = result.time_per_action.get(agent_id) {
        info!(
            "[Episode {episode_id}] agent {agent_id}: average decision time {:.4}s",
            mean(times)
        );
    }
    if let Some(simulations) = result.simulations_per_step.get(agent_id) {
        let total: u32 = simulations.iter().sum();
        let per_step = total as f64 / simulations.len().max(1) as f64;
        info!("[Episode {episode_id}] agent {agent_id}: {per_step:.1} simulations per step");
    }
    if let Some(particles) = result.particles_before_simulation.get(agent_id) {
        let total: usize = particles.iter().sum();
        let per_step = total as f64 / particles.len().max(1) as f64;
        info!("[Episode {episode_id}] agent {agent_id}: {per_step:.1} particles before planning");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn int_tensor_layout_round_trips() {
        let mut tensor = IntTensor::zeros([2, 3, 2]);
        tensor.set(1, 2, 1, 9);
        tensor.set(0, 0, 0, 4);
        assert_eq!(tensor.get(1, 2, 1), 9);
        assert_eq!(tensor.get(0, 0, 0), 4);
        assert_eq!(tensor.data.len(), 12);

        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("tensor.bin");
        tensor.save(&path).unwrap();
        let raw = std::fs::read(&path).unwrap();
        let restored: IntTensor = bincode::deserialize(&raw).unwrap();
        assert_eq!(restored, tensor);
    }
}

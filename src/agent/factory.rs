use std::collections::BTreeMap;

use log::info;

use crate::config::{AgentConfig, Config, PredictorConfig, RolloutConfig};
use crate::dbn::{LocalModel, TwoStageDbn};
use crate::error::{ConfigError, Result};
use crate::influence::{GruPredictor, InfluencePredictor, RandomInfluencePredictor, RnnPredictor};
use crate::planner::{PomcpConfig, PomcpPlanner};
use crate::sim::{GlobalSimulator, RecurrentInfluenceSimulator, SequentialInfluenceSimulator};

use super::{
    AgentComponent, AgentModel, AtomicAgent, FixedModel, PomcpAgent, RandomModel, ReactiveModel,
    SimpleAgent,
};

/// Distinct deterministic seed per consumer of the base seed, so the
/// environment, the planners, and the agent models draw uncorrelated streams
fn derive_seed(base: Option<u64>, stream: u64) -> Option<u64> {
    base.map(|seed| seed.wrapping_add(0x9E37_79B9_7F4A_7C15u64.wrapping_mul(stream + 1)))
}

fn pomcp_config(rollout: &RolloutConfig, discount_factor: f32) -> PomcpConfig {
    PomcpConfig {
        num_particles: rollout.number_of_particles,
        discount_factor,
        discount_horizon: rollout.discount_horizon,
        exploration_constant: rollout.exploration_constant,
        particle_reinvigoration: rollout.particle_reinvigoration,
        particle_reinvigoration_rate: rollout.particle_reinvigoration_rate,
        num_simulations_per_step: rollout.number_of_simulations_per_step,
        num_seconds_per_step: rollout.number_of_seconds_per_step,
        tie_break: rollout.tie_break,
    }
}

/// A model of one agent's behaviour for use inside the global simulator
fn make_agent_model(
    agent_id: &str,
    spec: &AgentConfig,
    num_actions: usize,
    seed: Option<u64>,
) -> Result<Box<dyn AgentModel>> {
    let model: Box<dyn AgentModel> = match spec.kind.as_str() {
        // planning agents are approximated by a uniform-random model
        "Random" | "POMCP" => Box::new(RandomModel::new(num_actions, seed)),
        "Fixed" => Box::new(FixedModel::new(spec.action.unwrap_or(0))),
        "Naive" => Box::new(ReactiveModel),
        other => {
            return Err(ConfigError::UnknownAgentType(format!(
                "{other} (modeling agent {agent_id})"
            ))
            .into())
        }
    };
    Ok(model)
}

fn missing(agent_id: &str, field: &str) -> ConfigError {
    ConfigError::MissingField(format!("AgentComponent.{agent_id}.{field}"))
}

fn make_influence_predictor(
    agent_id: &str,
    spec: &PredictorConfig,
    dbn: &TwoStageDbn,
    local: &LocalModel,
) -> Result<Box<dyn InfluencePredictor>> {
    let predictor: Box<dyn InfluencePredictor> = match spec.kind.as_str() {
        "Random" => Box::new(RandomInfluencePredictor::new(dbn, &local.source_factors)?),
        kind @ ("GRU" | "RNN") => {
            let path = spec
                .model_path
                .as_ref()
                .ok_or_else(|| missing(agent_id, "Simulator.InfluencePredictor.modelPath"))?;
            let hidden = spec.number_of_hidden_states.ok_or_else(|| {
                missing(agent_id, "Simulator.InfluencePredictor.numberOfHiddenStates")
            })?;
            let input_size = local.local_states.len() + 1;
            if kind == "GRU" {
                Box::new(GruPredictor::load(
                    dbn,
                    &local.source_factors,
                    input_size,
                    hidden,
                    path,
                )?)
            } else {
                Box::new(RnnPredictor::load(
                    dbn,
                    &local.source_factors,
                    input_size,
                    hidden,
                    path,
                )?)
            }
        }
        other => return Err(ConfigError::UnknownPredictorType(other.into()).into()),
    };
    Ok(predictor)
}

fn make_pomcp_agent(
    config: &Config,
    agent_id: &str,
    spec: &AgentConfig,
    dbn: &TwoStageDbn,
    seed: Option<u64>,
) -> Result<Box<dyn AtomicAgent>> {
    let simulator_spec = spec
        .simulator
        .as_ref()
        .ok_or_else(|| missing(agent_id, "Simulator"))?;
    let rollout = spec
        .rollout
        .as_ref()
        .ok_or_else(|| missing(agent_id, "Rollout"))?;
    if rollout.number_of_simulations_per_step.is_none()
        && rollout.number_of_seconds_per_step.is_none()
    {
        return Err(missing(
            agent_id,
            "Rollout.numberOfSimulationsPerStep or Rollout.numberOfSecondsPerStep",
        )
        .into());
    }
    let general = &config.general;
    let planner_config = pomcp_config(rollout, general.discount_factor);
    let horizon = general.horizon;

    let mut simulator_dbn = dbn.clone();
    if let Some(seed) = derive_seed(seed, 1) {
        simulator_dbn.reseed(seed);
    }

    let agent: Box<dyn AtomicAgent> = match simulator_spec.kind.as_str() {
        "Global" => {
            let mut models = Vec::new();
            for (stream, (other_id, other_spec)) in config
                .agent_component
                .iter()
                .filter(|(id, _)| id.as_str() != agent_id)
                .enumerate()
            {
                let num_actions = *simulator_dbn
                    .num_actions()
                    .get(other_id)
                    .ok_or_else(|| ConfigError::MissingField(format!("a{other_id}")))?;
                let model_seed = derive_seed(seed, 100 + stream as u64);
                models.push((
                    other_id.clone(),
                    make_agent_model(other_id, other_spec, num_actions, model_seed)?,
                ));
            }
            let simulator =
                GlobalSimulator::new(agent_id, simulator_dbn, models, general.discount_factor, horizon)?;
            Box::new(PomcpAgent::new(PomcpPlanner::new(
                simulator,
                planner_config,
                horizon,
                derive_seed(seed, 2),
            )))
        }
        "Local" => {
            let local = simulator_dbn.construct_local_model(agent_id)?;
            let predictor_spec = simulator_spec
                .influence_predictor
                .as_ref()
                .ok_or_else(|| missing(agent_id, "Simulator.InfluencePredictor"))?;
            let predictor =
                make_influence_predictor(agent_id, predictor_spec, &simulator_dbn, &local)?;
            if predictor_spec.recurrent {
                let simulator = RecurrentInfluenceSimulator::new(
                    agent_id,
                    simulator_dbn,
                    local,
                    predictor,
                    general.discount_factor,
                )?;
                Box::new(PomcpAgent::new(PomcpPlanner::new(
                    simulator,
                    planner_config,
                    horizon,
                    derive_seed(seed, 2),
                )))
            } else {
                let simulator = SequentialInfluenceSimulator::new(
                    agent_id,
                    simulator_dbn,
                    local,
                    predictor,
                    general.discount_factor,
                )?;
                Box::new(PomcpAgent::new(PomcpPlanner::new(
                    simulator,
                    planner_config,
                    horizon,
                    derive_seed(seed, 2),
                )))
            }
        }
        other => return Err(ConfigError::UnknownSimulatorType(other.into()).into()),
    };
    Ok(agent)
}

/// Build the full agent component from the configuration
///
/// The passed network is cloned per planning agent so each simulator owns an
/// independently seeded copy.
pub fn make_agent_component(config: &Config, dbn: &TwoStageDbn) -> Result<AgentComponent> {
    let action_counts = dbn.num_actions();
    let horizon = config.general.horizon;
    let mut agents: BTreeMap<String, Box<dyn AtomicAgent>> = BTreeMap::new();

    for (stream, (agent_id, spec)) in config.agent_component.iter().enumerate() {
        let seed = derive_seed(config.general.seed, stream as u64);
        let num_actions = *action_counts
            .get(agent_id)
            .ok_or_else(|| ConfigError::MissingField(format!("a{agent_id}")))?;

        let agent: Box<dyn AtomicAgent> = match spec.kind.as_str() {
            "Random" => Box::new(SimpleAgent::new(
                Box::new(RandomModel::new(num_actions, seed)),
                horizon,
            )),
            "Fixed" => Box::new(SimpleAgent::new(
                Box::new(FixedModel::new(spec.action.unwrap_or(0))),
                horizon,
            )),
            "Naive" => Box::new(SimpleAgent::new(Box::new(ReactiveModel), horizon)),
            "POMCP" => make_pomcp_agent(config, agent_id, spec, dbn, seed)?,
            other => return Err(ConfigError::UnknownAgentType(other.into()).into()),
        };
        info!("agent {agent_id} built with type {}", spec.kind);
        agents.insert(agent_id.clone(), agent);
    }

    Ok(AgentComponent::new(agents))
}

use std::collections::BTreeMap;
use std::time::Instant;

use log::{debug, info};
use serde::Serialize;

use crate::agent::AgentComponent;
use crate::dbn::{Assignment, TwoStageDbn};
use crate::error::{ModelError, Result};

/// The real multi-agent environment backed by the factored network
pub struct Environment {
    dbn: TwoStageDbn,
    agent_ids: Vec<String>,
    state: Assignment,
}

impl Environment {
    pub fn new(dbn: TwoStageDbn, agent_ids: Vec<String>) -> Self {
        Self {
            dbn,
            agent_ids,
            state: Assignment::new(),
        }
    }

    pub fn reset(&mut self) -> Result<(), ModelError> {
        debug!("resetting environment");
        self.state = self.dbn.sample_initial_state()?;
        Ok(())
    }

    pub fn state(&self) -> &Assignment {
        &self.state
    }

    /// Apply the joint action, advance one stage, and read every agent's
    /// observation and reward; only the unprimed state survives into the
    /// next step
    pub fn step(
        &mut self,
        actions: &BTreeMap<String, usize>,
    ) -> (BTreeMap<String, usize>, BTreeMap<String, f32>, bool) {
        for id in &self.agent_ids {
            self.state.insert(format!("a{id}"), actions[id]);
        }
        self.dbn.step(&mut self.state, "full");

        let mut observations = BTreeMap::new();
        let mut rewards = BTreeMap::new();
        for id in &self.agent_ids {
            observations.insert(
                id.clone(),
                self.dbn.value_of(&format!("o{id}"), &self.state) as usize,
            );
            rewards.insert(id.clone(), self.dbn.value_of(&format!("r{id}"), &self.state));
        }

        self.state
            .retain(|key, _| key.starts_with('x') && !key.ends_with('\''));

        (observations, rewards, false)
    }
}

/// One recorded step of a replay
#[derive(Debug, Clone, Serialize)]
pub struct ReplayStep {
    pub state: BTreeMap<String, usize>,
    pub action: BTreeMap<String, usize>,
    pub observation: BTreeMap<String, usize>,
    pub reward: BTreeMap<String, f32>,
}

pub type Replay = BTreeMap<usize, ReplayStep>;

/// Everything one episode produced, keyed by agent id
#[derive(Debug, Clone, Default)]
pub struct EpisodeResult {
    pub undiscounted_return: BTreeMap<String, f32>,
    pub discounted_return: BTreeMap<String, f32>,
    pub time_per_action: BTreeMap<String, Vec<f64>>,
    pub simulations_per_step: BTreeMap<String, Vec<u32>>,
    pub particles_before_simulation: BTreeMap<String, Vec<usize>>,
    pub replay: Option<Replay>,
}

/// One interaction of the agent component with the environment
pub struct Episode<'a> {
    id: usize,
    environment: &'a mut Environment,
    agents: &'a mut AgentComponent,
    horizon: usize,
    discount_factor: f32,
    save_replay: bool,
}

impl<'a> Episode<'a> {
    pub fn new(
        id: usize,
        environment: &'a mut Environment,
        agents: &'a mut AgentComponent,
        horizon: usize,
        discount_factor: f32,
        save_replay: bool,
    ) -> Self {
        Self {
            id,
            environment,
            agents,
            horizon,
            discount_factor,
            save_replay,
        }
    }

    /// Reset everything, then run plan → act → step → observe for the whole
    /// horizon, accumulating `Σ γ^t · r_t` with one factor update per step
    pub fn dispatch(&mut self) -> Result<EpisodeResult, ModelError> {
        info!("episode {} dispatched", self.id);
        let mut result = EpisodeResult::default();
        let mut replay = Replay::new();

        self.agents.reset();
        self.environment.reset()?;

        let mut factor = 1.0;
        for t in 0..self.horizon {
            let state_snapshot = self
                .save_replay
                .then(|| self.environment.state().iter().map(|(k, v)| (k.clone(), *v)).collect());

            let mut actions = BTreeMap::new();
            for (id, agent) in self.agents.iter_mut() {
                let begin = Instant::now();
                let action = agent.act();
                result
                    .time_per_action
                    .entry(id.clone())
                    .or_default()
                    .push(begin.elapsed().as_secs_f64());
                if let Some(stats) = agent.last_decision() {
                    result
                        .simulations_per_step
                        .entry(id.clone())
                        .or_default()
                        .push(stats.simulations);
                    result
                        .particles_before_simulation
                        .entry(id.clone())
                        .or_default()
                        .push(stats.particles);
                }
                actions.insert(id.clone(), action);
            }

            let (observations, rewards, done) = self.environment.step(&actions);
            self.agents.observe(&observations);

            for (id, reward) in &rewards {
                *result.undiscounted_return.entry(id.clone()).or_default() += reward;
                *result.discounted_return.entry(id.clone()).or_default() += factor * reward;
            }
            factor *= self.discount_factor;

            if let Some(state) = state_snapshot {
                replay.insert(
                    t,
                    ReplayStep {
                        state,
                        action: actions,
                        observation: observations,
                        reward: rewards,
                    },
                );
            }

            if done {
                break;
            }
        }

        if self.save_replay {
            result.replay = Some(replay);
        }
        Ok(result)
    }
}

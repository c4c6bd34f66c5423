use log::debug;
use rand::Rng;

use crate::agent::AgentModel;
use crate::dbn::{Assignment, TwoStageDbn};
use crate::ds::History;
use crate::error::{ModelError, Result};

use super::Simulator;

/// One modeled agent inside the global simulator
struct OtherAgent {
    id: String,
    action_key: String,
    observation_key: String,
    model: Box<dyn AgentModel>,
}

/// State of the global simulator: the full factored assignment plus one
/// history tape per modeled agent
#[derive(Debug, Clone)]
pub struct GlobalState {
    pub environment: Assignment,
    pub histories: Vec<History>,
}

/// Simulator that models every other agent explicitly
///
/// Each step first queries the per-agent models for their actions, then runs
/// one factored transition with the `"full"` order, and finally feeds the
/// produced observations back into the per-agent tapes.
pub struct GlobalSimulator {
    dbn: TwoStageDbn,
    others: Vec<OtherAgent>,
    own_action_key: String,
    observation_key: String,
    reward_key: String,
    num_actions: usize,
    discount_factor: f32,
    history_capacity: usize,
}

impl GlobalSimulator {
    /// `models` holds one [`AgentModel`] per agent other than the controlled
    /// one; `horizon` bounds the history tapes
    pub fn new(
        agent_id: &str,
        dbn: TwoStageDbn,
        models: Vec<(String, Box<dyn AgentModel>)>,
        discount_factor: f32,
        horizon: usize,
    ) -> Result<Self> {
        let num_actions = *dbn
            .num_actions()
            .get(agent_id)
            .ok_or_else(|| ModelError::UnknownVariable(format!("a{agent_id}")))?;
        let others = models
            .into_iter()
            .map(|(id, model)| OtherAgent {
                action_key: format!("a{id}"),
                observation_key: format!("o{id}"),
                id,
                model,
            })
            .collect();
        let mut simulator = Self {
            dbn,
            others,
            own_action_key: format!("a{agent_id}"),
            observation_key: format!("o{agent_id}"),
            reward_key: format!("r{agent_id}"),
            num_actions,
            discount_factor,
            history_capacity: 2 * horizon,
        };
        // surfaces a missing initial distribution at construction time
        simulator.dbn.sample_initial_state()?;
        debug!("global simulator built for agent {agent_id}");
        Ok(simulator)
    }

    /// Query every modeled agent and write its action into the assignment
    fn apply_other_actions(&mut self, state: &mut GlobalState) {
        for (index, other) in self.others.iter_mut().enumerate() {
            let action = other.model.step(&mut state.histories[index]);
            state.environment.insert(other.action_key.clone(), action);
        }
    }

    /// Feed the freshly produced observations back into the per-agent tapes
    fn feed_observations(&mut self, state: &mut GlobalState) {
        for (index, other) in self.others.iter_mut().enumerate() {
            let observation = self.dbn.value_of(&other.observation_key, &state.environment) as usize;
            other
                .model
                .observe(&mut state.histories[index], observation);
        }
    }
}

impl Simulator for GlobalSimulator {
    type State = GlobalState;

    fn sample_initial_state(&mut self) -> GlobalState {
        let environment = self
            .dbn
            .sample_initial_state()
            .expect("initial distributions checked at construction");
        let histories = self
            .others
            .iter()
            .map(|_| History::with_capacity(self.history_capacity))
            .collect();
        GlobalState {
            environment,
            histories,
        }
    }

    fn step(&mut self, state: &mut GlobalState, action: usize) -> (usize, f32, bool) {
        self.apply_other_actions(state);
        state
            .environment
            .insert(self.own_action_key.clone(), action);
        self.dbn.step(&mut state.environment, "full");
        let observation = self.dbn.value_of(&self.observation_key, &state.environment) as usize;
        let reward = self.dbn.value_of(&self.reward_key, &state.environment);
        self.feed_observations(state);
        (observation, reward, false)
    }

    fn rollout(
        &mut self,
        state: &mut GlobalState,
        horizon: usize,
        depth: usize,
        discount_horizon: f32,
    ) -> f32 {
        let mut undiscounted_return = 0.0;
        let mut factor = 1.0;
        let mut truncation_factor = self.discount_factor.powi(depth as i32);
        for step in 0..horizon {
            if truncation_factor < discount_horizon {
                break;
            }
            self.apply_other_actions(state);
            let action = self.dbn.rng_mut().gen_range(0..self.num_actions);
            state
                .environment
                .insert(self.own_action_key.clone(), action);
            self.dbn.step(&mut state.environment, "full");
            undiscounted_return += factor * self.dbn.value_of(&self.reward_key, &state.environment);
            if step != horizon - 1 {
                self.feed_observations(state);
            }
            factor *= self.discount_factor;
            truncation_factor *= self.discount_factor;
        }
        undiscounted_return
    }

    fn num_actions(&self) -> usize {
        self.num_actions
    }
}

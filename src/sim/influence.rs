use log::debug;
use rand::Rng;

use crate::dbn::{Assignment, LocalModel, TwoStageDbn};
use crate::error::{ModelError, Result};
use crate::influence::InfluencePredictor;

use super::Simulator;

/// Common pieces of the influence-augmented simulators
struct LocalCore {
    dbn: TwoStageDbn,
    predictor: Box<dyn InfluencePredictor>,
    local: LocalModel,
    own_action_key: String,
    observation_key: String,
    reward_key: String,
    num_actions: usize,
    discount_factor: f32,
}

impl LocalCore {
    fn new(
        agent_id: &str,
        dbn: TwoStageDbn,
        local: LocalModel,
        predictor: Box<dyn InfluencePredictor>,
        discount_factor: f32,
    ) -> Result<Self> {
        let num_actions = *dbn
            .num_actions()
            .get(agent_id)
            .ok_or_else(|| ModelError::UnknownVariable(format!("a{agent_id}")))?;
        let mut core = Self {
            dbn,
            predictor,
            local,
            own_action_key: format!("a{agent_id}"),
            observation_key: format!("o{agent_id}"),
            reward_key: format!("r{agent_id}"),
            num_actions,
            discount_factor,
        };
        core.dbn.sample_initial_state()?;
        Ok(core)
    }

    /// A fresh local assignment: the local states of one full initial sample
    fn sample_local_environment(&mut self) -> Assignment {
        let full = self
            .dbn
            .sample_initial_state()
            .expect("initial distributions checked at construction");
        self.local
            .local_states
            .iter()
            .map(|name| (name.clone(), full[name]))
            .collect()
    }

    fn random_action(&mut self) -> usize {
        self.dbn.rng_mut().gen_range(0..self.num_actions)
    }
}

/// State of the sequential simulator: local assignment plus the entire
/// local-factor history so far
#[derive(Debug, Clone)]
pub struct SequentialState {
    pub environment: Assignment,
    pub history: Vec<usize>,
}

/// Influence-augmented simulator driving the feed-forward predictor with the
/// full local history each step
pub struct SequentialInfluenceSimulator {
    core: LocalCore,
}

impl SequentialInfluenceSimulator {
    pub fn new(
        agent_id: &str,
        dbn: TwoStageDbn,
        local: LocalModel,
        predictor: Box<dyn InfluencePredictor>,
        discount_factor: f32,
    ) -> Result<Self> {
        let core = LocalCore::new(agent_id, dbn, local, predictor, discount_factor)?;
        debug!("sequential influence-augmented simulator built for agent {agent_id}");
        Ok(Self { core })
    }

    /// Append the post-step local states and the taken action to the history
    fn update_history(&self, state: &mut SequentialState, action: usize) {
        for name in &self.core.local.local_states {
            state.history.push(state.environment[name]);
        }
        state.history.push(action);
    }
}

impl Simulator for SequentialInfluenceSimulator {
    type State = SequentialState;

    fn sample_initial_state(&mut self) -> SequentialState {
        SequentialState {
            environment: self.core.sample_local_environment(),
            history: Vec::new(),
        }
    }

    fn step(&mut self, state: &mut SequentialState, action: usize) -> (usize, f32, bool) {
        state
            .environment
            .insert(self.core.own_action_key.clone(), action);
        self.core
            .predictor
            .sample(&mut self.core.dbn, &state.history, &mut state.environment);
        self.core.dbn.step(&mut state.environment, "local");
        let reward = self.core.dbn.value_of(&self.core.reward_key, &state.environment);
        let observation =
            self.core.dbn.value_of(&self.core.observation_key, &state.environment) as usize;
        self.update_history(state, action);
        (observation, reward, false)
    }

    fn rollout(
        &mut self,
        state: &mut SequentialState,
        horizon: usize,
        depth: usize,
        discount_horizon: f32,
    ) -> f32 {
        let mut undiscounted_return = 0.0;
        let mut factor = 1.0;
        let mut truncation_factor = self.core.discount_factor.powi(depth as i32);
        for step in 0..horizon {
            if truncation_factor < discount_horizon {
                break;
            }
            let action = self.core.random_action();
            self.core
                .predictor
                .sample(&mut self.core.dbn, &state.history, &mut state.environment);
            state
                .environment
                .insert(self.core.own_action_key.clone(), action);
            self.core.dbn.step(&mut state.environment, "local");
            undiscounted_return +=
                factor * self.core.dbn.value_of(&self.core.reward_key, &state.environment);
            if step != horizon - 1 {
                self.update_history(state, action);
            }
            factor *= self.core.discount_factor;
            truncation_factor *= self.core.discount_factor;
        }
        undiscounted_return
    }

    fn num_actions(&self) -> usize {
        self.core.num_actions
    }
}

/// State of the recurrent simulator: local assignment, predictor hidden
/// state, the one-step input scratch buffer, and the first-call flag
#[derive(Debug, Clone)]
pub struct RecurrentState {
    pub environment: Assignment,
    pub hidden: Vec<f32>,
    pub inputs: Vec<usize>,
    pub initial: bool,
}

/// Influence-augmented simulator driving the hidden-state predictor with one
/// local-state/action tuple per step
pub struct RecurrentInfluenceSimulator {
    core: LocalCore,
}

impl RecurrentInfluenceSimulator {
    pub fn new(
        agent_id: &str,
        dbn: TwoStageDbn,
        local: LocalModel,
        predictor: Box<dyn InfluencePredictor>,
        discount_factor: f32,
    ) -> Result<Self> {
        let core = LocalCore::new(agent_id, dbn, local, predictor, discount_factor)?;
        debug!("recurrent influence-augmented simulator built for agent {agent_id}");
        Ok(Self { core })
    }

    /// Overwrite the scratch buffer with the post-step local states and the
    /// taken action; later steps are no longer the first of the episode
    fn update_inputs(&self, state: &mut RecurrentState, action: usize) {
        for (slot, name) in state
            .inputs
            .iter_mut()
            .zip(&self.core.local.local_states)
        {
            *slot = state.environment[name];
        }
        *state.inputs.last_mut().expect("scratch buffer is non-empty") = action;
        state.initial = false;
    }
}

impl Simulator for RecurrentInfluenceSimulator {
    type State = RecurrentState;

    fn sample_initial_state(&mut self) -> RecurrentState {
        let environment = self.core.sample_local_environment();
        RecurrentState {
            environment,
            hidden: self.core.predictor.initial_state(),
            inputs: vec![0; self.core.local.local_states.len() + 1],
            initial: true,
        }
    }

    fn step(&mut self, state: &mut RecurrentState, action: usize) -> (usize, f32, bool) {
        state
            .environment
            .insert(self.core.own_action_key.clone(), action);
        self.core.predictor.one_step_sample(
            &mut self.core.dbn,
            &mut state.hidden,
            &state.inputs,
            state.initial,
            &mut state.environment,
        );
        self.core.dbn.step(&mut state.environment, "local");
        let reward = self.core.dbn.value_of(&self.core.reward_key, &state.environment);
        let observation =
            self.core.dbn.value_of(&self.core.observation_key, &state.environment) as usize;
        self.update_inputs(state, action);
        (observation, reward, false)
    }

    fn rollout(
        &mut self,
        state: &mut RecurrentState,
        horizon: usize,
        depth: usize,
        discount_horizon: f32,
    ) -> f32 {
        let mut undiscounted_return = 0.0;
        let mut factor = 1.0;
        let mut truncation_factor = self.core.discount_factor.powi(depth as i32);
        for step in 0..horizon {
            if truncation_factor < discount_horizon {
                break;
            }
            let action = self.core.random_action();
            self.core.predictor.one_step_sample(
                &mut self.core.dbn,
                &mut state.hidden,
                &state.inputs,
                state.initial,
                &mut state.environment,
            );
            state
                .environment
                .insert(self.core.own_action_key.clone(), action);
            self.core.dbn.step(&mut state.environment, "local");
            undiscounted_return +=
                factor * self.core.dbn.value_of(&self.core.reward_key, &state.environment);
            if step != horizon - 1 {
                self.update_inputs(state, action);
            }
            factor *= self.core.discount_factor;
            truncation_factor *= self.core.discount_factor;
        }
        undiscounted_return
    }

    fn num_actions(&self) -> usize {
        self.core.num_actions
    }
}

#[cfg(test)]
mod tests {
    use crate::influence::RandomInfluencePredictor;

    use super::*;

    // x1' is coupled to the outside through x2, the influence source
    const NET: &str = "
x1: {parents: [], values: [0, 1], initial_dist: [1.0, 0.0]}
x2: {parents: [], values: [0, 1], initial_dist: [0.5, 0.5]}
a0: {parents: [], values: [0, 1]}
a1: {parents: [], values: [0, 1]}
x1': {parents: [x1, x2, a0], mode: SUM, values: [0, 1, 2, 3]}
x2': {parents: [x2, a1], mode: SUM, values: [0, 1, 2]}
o0: {parents: [x1'], mode: SUM, values: [0, 1, 2, 3]}
o1: {parents: [x2'], mode: SUM, values: [0, 1, 2]}
r0: {parents: [x1'], mode: SUM, values: [0.0, 1.0, 2.0, 3.0]}
r1: {parents: [x2'], mode: SUM, values: [0.0, 1.0, 2.0]}
";

    fn sequential() -> SequentialInfluenceSimulator {
        let mut dbn = TwoStageDbn::from_spec_str(NET, Some(31)).unwrap();
        let local = dbn.construct_local_model("0").unwrap();
        let predictor = RandomInfluencePredictor::new(&dbn, &local.source_factors).unwrap();
        SequentialInfluenceSimulator::new("0", dbn, local, Box::new(predictor), 1.0).unwrap()
    }

    fn recurrent() -> RecurrentInfluenceSimulator {
        let mut dbn = TwoStageDbn::from_spec_str(NET, Some(32)).unwrap();
        let local = dbn.construct_local_model("0").unwrap();
        let predictor = RandomInfluencePredictor::new(&dbn, &local.source_factors).unwrap();
        RecurrentInfluenceSimulator::new("0", dbn, local, Box::new(predictor), 1.0).unwrap()
    }

    #[test]
    fn sequential_state_holds_only_local_factors() {
        let mut sim = sequential();
        let state = sim.sample_initial_state();
        assert!(state.environment.contains_key("x1"));
        assert!(!state.environment.contains_key("x2"));
        assert!(state.history.is_empty());
    }

    #[test]
    fn sequential_history_grows_by_states_plus_action() {
        let mut sim = sequential();
        let mut state = sim.sample_initial_state();
        let stride = 2; // one local state + the action

        sim.step(&mut state, 1);
        assert_eq!(state.history.len(), stride);
        assert_eq!(state.history[1], 1, "action recorded after the states");

        sim.step(&mut state, 0);
        assert_eq!(state.history.len(), 2 * stride);
    }

    #[test]
    fn sequential_step_reads_local_channels() {
        let mut sim = sequential();
        let mut state = sim.sample_initial_state();
        let (observation, reward, done) = sim.step(&mut state, 1);
        // x1' = x1 + x2 + a0 with x1 = 0 and sampled x2 in {0, 1}
        assert!(observation == 1 || observation == 2);
        assert_eq!(reward, observation as f32);
        assert!(!done);
        assert_eq!(state.environment["x1"], observation);
    }

    #[test]
    fn recurrent_scratch_buffer_is_overwritten_in_place() {
        let mut sim = recurrent();
        let mut state = sim.sample_initial_state();
        assert!(state.initial);
        assert_eq!(state.inputs, [0, 0]);

        sim.step(&mut state, 1);
        assert!(!state.initial, "first call clears the flag");
        assert_eq!(state.inputs.len(), 2, "buffer does not grow");
        assert_eq!(state.inputs[0], state.environment["x1"]);
        assert_eq!(state.inputs[1], 1);

        sim.step(&mut state, 0);
        assert_eq!(state.inputs.len(), 2);
        assert_eq!(state.inputs[1], 0);
    }

    #[test]
    fn rollout_horizon_zero_returns_zero() {
        let mut sim = sequential();
        let mut state = sim.sample_initial_state();
        assert_eq!(sim.rollout(&mut state, 0, 0, 0.01), 0.0);

        let mut sim = recurrent();
        let mut state = sim.sample_initial_state();
        assert_eq!(sim.rollout(&mut state, 0, 0, 0.01), 0.0);
    }

    #[test]
    fn influence_sources_are_sampled_each_step() {
        let mut sim = sequential();
        let mut state = sim.sample_initial_state();
        sim.step(&mut state, 0);
        assert!(
            state.environment.contains_key("x2"),
            "the predictor fills the influence source"
        );
    }
}

use std::collections::BTreeMap;

use log::info;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use crate::ds::History;

pub mod factory;
pub mod pomcp;

pub use factory::make_agent_component;
pub use pomcp::PomcpAgent;

/// Planner bookkeeping from the latest decision of a planning agent
#[derive(Debug, Clone, Copy)]
pub struct DecisionStats {
    pub simulations: u32,
    pub particles: usize,
}

/// A model of one agent's action selection given its own history
///
/// Used both to predict *other* agents inside the global simulator and, via
/// [`SimpleAgent`], to drive real non-planning agents in the episode loop.
/// `step` chooses an action and records it on the tape; `observe` records an
/// incoming observation.
pub trait AgentModel {
    fn step(&mut self, history: &mut History) -> usize;

    fn observe(&mut self, history: &mut History, observation: usize) {
        history.push_observation(observation);
    }
}

/// Uniform-random action selection
pub struct RandomModel {
    num_actions: usize,
    rng: StdRng,
}

impl RandomModel {
    pub fn new(num_actions: usize, seed: Option<u64>) -> Self {
        let rng = match seed {
            Some(seed) => StdRng::seed_from_u64(seed),
            None => StdRng::from_entropy(),
        };
        Self { num_actions, rng }
    }
}

impl AgentModel for RandomModel {
    fn step(&mut self, history: &mut History) -> usize {
        let action = self.rng.gen_range(0..self.num_actions);
        history.push_action(action);
        action
    }
}

/// Always plays one configured action
pub struct FixedModel {
    action: usize,
}

impl FixedModel {
    pub fn new(action: usize) -> Self {
        Self { action }
    }
}

impl AgentModel for FixedModel {
    fn step(&mut self, history: &mut History) -> usize {
        history.push_action(self.action);
        self.action
    }
}

/// Hand-coded reactive policy: starts with action 0, then repeats its
/// previous action while the last observation was 1 and flips it otherwise
pub struct ReactiveModel;

impl AgentModel for ReactiveModel {
    fn step(&mut self, history: &mut History) -> usize {
        let action = match history.last_pair() {
            None => 0,
            Some((previous_action, previous_observation)) => {
                if previous_observation == 1 {
                    previous_action
                } else {
                    1 - previous_action
                }
            }
        };
        history.push_action(action);
        action
    }
}

/// A real agent driven by the episode loop
pub trait AtomicAgent {
    /// Forget the episode so far
    fn reset(&mut self);

    /// Choose the next action
    fn act(&mut self) -> usize;

    /// Receive the real observation for the step just taken
    fn observe(&mut self, observation: usize);

    /// Planner bookkeeping from the latest decision, for planning agents
    fn last_decision(&self) -> Option<DecisionStats> {
        None
    }
}

/// An [`AgentModel`] acting as a real agent over its own history tape
pub struct SimpleAgent {
    model: Box<dyn AgentModel>,
    history: History,
}

impl SimpleAgent {
    pub fn new(model: Box<dyn AgentModel>, horizon: usize) -> Self {
        Self {
            model,
            history: History::with_capacity(2 * horizon),
        }
    }
}

impl AtomicAgent for SimpleAgent {
    fn reset(&mut self) {
        self.history.clear();
    }

    fn act(&mut self) -> usize {
        self.model.step(&mut self.history)
    }

    fn observe(&mut self, observation: usize) {
        self.model.observe(&mut self.history, observation);
    }
}

/// The group of per-agent controllers the episode loop drives
pub struct AgentComponent {
    agents: BTreeMap<String, Box<dyn AtomicAgent>>,
}

impl AgentComponent {
    pub fn new(agents: BTreeMap<String, Box<dyn AtomicAgent>>) -> Self {
        info!("agent component built with {} agents", agents.len());
        Self { agents }
    }

    pub fn reset(&mut self) {
        for agent in self.agents.values_mut() {
            agent.reset();
        }
    }

    /// Joint action from every agent, keyed by agent id
    pub fn act(&mut self) -> BTreeMap<String, usize> {
        self.agents
            .iter_mut()
            .map(|(id, agent)| (id.clone(), agent.act()))
            .collect()
    }

    /// Deliver each agent its element of the joint observation
    pub fn observe(&mut self, observations: &BTreeMap<String, usize>) {
        for (id, agent) in self.agents.iter_mut() {
            agent.observe(observations[id]);
        }
    }

    pub fn iter_mut(
        &mut self,
    ) -> std::collections::btree_map::IterMut<'_, String, Box<dyn AtomicAgent>> {
        self.agents.iter_mut()
    }

    pub fn ids(&self) -> impl Iterator<Item = &String> {
        self.agents.keys()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fixed_model_repeats_its_action() {
        let mut model = FixedModel::new(2);
        let mut history = History::new();
        assert_eq!(model.step(&mut history), 2);
        model.observe(&mut history, 0);
        assert_eq!(model.step(&mut history), 2);
        assert_eq!(history.view(), [2, 0, 2]);
    }

    #[test]
    fn random_model_stays_in_range() {
        let mut model = RandomModel::new(3, Some(11));
        let mut history = History::new();
        for _ in 0..50 {
            let action = model.step(&mut history);
            assert!(action < 3);
            model.observe(&mut history, 0);
        }
    }

    #[test]
    fn reactive_model_follows_its_observation() {
        let mut model = ReactiveModel;
        let mut history = History::new();

        // opening move is always 0
        assert_eq!(model.step(&mut history), 0);

        // observation 1 keeps the previous action
        model.observe(&mut history, 1);
        assert_eq!(model.step(&mut history), 0);

        // observation 0 flips it
        model.observe(&mut history, 0);
        assert_eq!(model.step(&mut history), 1);

        model.observe(&mut history, 1);
        assert_eq!(model.step(&mut history), 1);
    }

    #[test]
    fn component_collects_joint_actions() {
        let mut agents: BTreeMap<String, Box<dyn AtomicAgent>> = BTreeMap::new();
        agents.insert(
            "0".into(),
            Box::new(SimpleAgent::new(Box::new(FixedModel::new(1)), 4)),
        );
        agents.insert(
            "1".into(),
            Box::new(SimpleAgent::new(Box::new(ReactiveModel), 4)),
        );
        let mut component = AgentComponent::new(agents);

        component.reset();
        let actions = component.act();
        assert_eq!(actions["0"], 1);
        assert_eq!(actions["1"], 0);

        let observations = BTreeMap::from([("0".to_string(), 0), ("1".to_string(), 1)]);
        component.observe(&observations);
        let actions = component.act();
        assert_eq!(actions["1"], 0, "observation 1 repeats the previous action");
    }
}

use std::time::Instant;

use log::{debug, info, trace};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde::Deserialize;

use crate::assert_interval;
use crate::sim::Simulator;

pub mod tree;

pub use tree::{ActId, ObsId, SearchTree};

/// How equal action values are resolved during selection
///
/// `Last` keeps the historical `value >= best` semantics, which favours the
/// largest action id; `First` switches to a strict comparison.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
pub enum TieBreak {
    #[default]
    Last,
    First,
}

/// Configuration for the [`PomcpPlanner`]
#[derive(Debug, Clone)]
pub struct PomcpConfig {
    /// Size of the root belief sampled at reset
    ///
    /// **Default:** `128`
    pub num_particles: usize,
    /// The discount factor γ
    ///
    /// **Default:** `0.95`
    pub discount_factor: f32,
    /// Simulations and rollouts stop once `γ^depth` falls below this value
    ///
    /// **Default:** `0.01`
    pub discount_horizon: f32,
    /// The UCB1 exploration constant `c`
    ///
    /// **Default:** `5.0`
    pub exploration_constant: f32,
    /// Refill the belief with fresh initial-state samples after pruning
    ///
    /// **Default:** `false`
    pub particle_reinvigoration: bool,
    /// Fraction of the surviving particles to add as fresh samples
    ///
    /// **Default:** `0.1`
    pub particle_reinvigoration_rate: f32,
    /// Stop a decision after this many simulations
    ///
    /// **Default:** `Some(512)`
    pub num_simulations_per_step: Option<u32>,
    /// Stop a decision after this much planning time, in seconds
    ///
    /// **Default:** `None`
    pub num_seconds_per_step: Option<f64>,
    /// Tie-breaking rule for action selection
    ///
    /// **Default:** [`TieBreak::Last`]
    pub tie_break: TieBreak,
}

impl Default for PomcpConfig {
    fn default() -> Self {
        Self {
            num_particles: 128,
            discount_factor: 0.95,
            discount_horizon: 0.01,
            exploration_constant: 5.0,
            particle_reinvigoration: false,
            particle_reinvigoration_rate: 0.1,
            num_simulations_per_step: Some(512),
            num_seconds_per_step: None,
            tie_break: TieBreak::Last,
        }
    }
}

/// Outcome of one decision, with the bookkeeping the experiment records
#[derive(Debug, Clone, Copy)]
pub struct Decision {
    pub action: usize,
    pub simulations: u32,
    /// Root particles available before planning started
    pub particles: usize,
}

/// The POMCP planner: online tree search over belief-reachable histories
///
/// Holds the simulator it plans against, the search tree rooted at the
/// current real action-observation history, and the particle belief stored in
/// the tree's observation nodes. A decision runs simulations until the
/// configured budget is exhausted and returns the greedy action; the real
/// observation then prunes the tree to the reached branch.
pub struct PomcpPlanner<S: Simulator> {
    simulator: S,
    tree: SearchTree<S::State>,
    config: PomcpConfig,
    num_actions: usize,
    planning_horizon: usize,
    horizon_left: usize,
    previous_action: usize,
    particle_depleted: bool,
    rng: StdRng,
}

impl<S: Simulator> PomcpPlanner<S> {
    /// Initialize a planner for `planning_horizon` decisions per episode
    ///
    /// **Panics** if the discount factor is not in `(0, 1]`, the discount
    /// horizon is negative, or neither stopping budget is configured.
    pub fn new(
        simulator: S,
        config: PomcpConfig,
        planning_horizon: usize,
        seed: Option<u64>,
    ) -> Self {
        assert_interval!(config.discount_factor, f32::MIN_POSITIVE, 1.0);
        assert!(
            config.discount_horizon >= 0.0,
            "discount horizon must be non-negative"
        );
        assert!(
            config.num_simulations_per_step.is_some() || config.num_seconds_per_step.is_some(),
            "either a simulation-count or a wall-clock budget is required"
        );
        assert!(
            config.num_particles > 0,
            "the root belief needs at least one particle"
        );
        let num_actions = simulator.num_actions();
        let rng = match seed {
            Some(seed) => StdRng::seed_from_u64(seed),
            None => StdRng::from_entropy(),
        };
        Self {
            simulator,
            tree: SearchTree::new(num_actions),
            config,
            num_actions,
            planning_horizon,
            horizon_left: planning_horizon,
            previous_action: 0,
            particle_depleted: false,
            rng,
        }
    }

    /// Rebuild the search tree and resample the root belief
    pub fn reset(&mut self) {
        self.horizon_left = self.planning_horizon;
        self.particle_depleted = false;
        self.tree = SearchTree::new(self.num_actions);
        let root = self.tree.root();
        for _ in 0..self.config.num_particles {
            let state = self.simulator.sample_initial_state();
            self.tree.push_particle(root, state);
        }
    }

    /// Root particles currently backing the belief
    pub fn num_particles(&self) -> usize {
        self.tree.particles(self.tree.root()).len()
    }

    pub fn is_particle_depleted(&self) -> bool {
        self.particle_depleted
    }

    /// Plan until the budget is exhausted and commit to the greedy action
    pub fn act(&mut self) -> Decision {
        let particles = self.num_particles();
        let mut simulations = 0;

        let action = if self.particle_depleted {
            trace!("acting uniformly at random under particle depletion");
            self.rng.gen_range(0..self.num_actions)
        } else {
            let mut elapsed = 0.0;
            loop {
                if let Some(budget) = self.config.num_seconds_per_step {
                    if elapsed >= budget {
                        debug!("planning time budget reached");
                        break;
                    }
                }
                if let Some(budget) = self.config.num_simulations_per_step {
                    if simulations >= budget {
                        debug!("simulation budget reached");
                        break;
                    }
                }
                let begin = Instant::now();
                self.root_simulate();
                elapsed += begin.elapsed().as_secs_f64();
                simulations += 1;
            }
            trace!("{simulations} simulations performed");
            let root = self.tree.root();
            self.tree.select_action(root, None, self.config.tie_break)
        };

        self.previous_action = action;
        self.horizon_left = self.horizon_left.saturating_sub(1);
        Decision {
            action,
            simulations,
            particles,
        }
    }

    /// Prune the tree to the branch the real step reached and refresh the
    /// belief; an unseen observation depletes the particle set
    pub fn observe(&mut self, observation: usize) {
        if self.particle_depleted {
            return;
        }

        let tree = std::mem::replace(&mut self.tree, SearchTree::new(self.num_actions));
        self.tree = tree.extract(self.previous_action, observation);

        let root = self.tree.root();
        let remaining = self.tree.particles(root).len();
        trace!("{remaining} particles left after filtering");
        if remaining == 0 {
            self.particle_depleted = true;
            info!(
                "particle depleted with {} steps to go",
                self.horizon_left
            );
        } else if self.config.particle_reinvigoration {
            let fresh = (remaining as f32 * self.config.particle_reinvigoration_rate) as usize;
            for _ in 0..fresh {
                let state = self.simulator.sample_initial_state();
                self.tree.push_particle(root, state);
            }
            trace!("{fresh} new particles added");
        }
    }

    /// One simulation from a particle drawn uniformly at the root
    fn root_simulate(&mut self) {
        let root = self.tree.root();
        let particles = self.tree.particles(root);
        let index = self.rng.gen_range(0..particles.len());
        let mut state = particles[index].clone();
        let horizon = self.horizon_left;
        self.simulate(root, &mut state, horizon, 0);
    }

    fn simulate(&mut self, node: ObsId, state: &mut S::State, horizon: usize, depth: usize) -> f32 {
        if horizon == 0
            || self.config.discount_factor.powi(depth as i32) < self.config.discount_horizon
        {
            return 0.0;
        }

        // belief refresh below the root
        if depth > 0 {
            self.tree.push_particle(node, state.clone());
        }

        let action = self.tree.select_action(
            node,
            Some(self.config.exploration_constant),
            self.config.tie_break,
        );
        let (observation, reward, _done) = self.simulator.step(state, action);

        let act_id = self.tree.action_child(node, action);
        let ret = match self.tree.observation_child(act_id, observation) {
            Some(child) => {
                reward
                    + self.config.discount_factor * self.simulate(child, state, horizon - 1, depth + 1)
            }
            None => {
                let child = self.tree.add_observation_child(act_id, observation);
                let rollout_return = self.simulator.rollout(
                    state,
                    horizon - 1,
                    depth + 1,
                    self.config.discount_horizon,
                );
                self.tree.update_observation(child, rollout_return);
                reward + self.config.discount_factor * rollout_return
            }
        };

        self.tree.update_observation(node, ret);
        self.tree.update_action(act_id, ret);
        ret
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Stateless bandit: reward equals the chosen action, observation fixed
    struct BanditSim {
        num_actions: usize,
    }

    impl Simulator for BanditSim {
        type State = ();

        fn sample_initial_state(&mut self) {}

        fn step(&mut self, _state: &mut (), action: usize) -> (usize, f32, bool) {
            (0, action as f32, false)
        }

        fn rollout(&mut self, _state: &mut (), _h: usize, _d: usize, _dh: f32) -> f32 {
            0.0
        }

        fn num_actions(&self) -> usize {
            self.num_actions
        }
    }

    /// Every step emits observation 7 and zero reward
    struct ConstantObsSim;

    impl Simulator for ConstantObsSim {
        type State = ();

        fn sample_initial_state(&mut self) {}

        fn step(&mut self, _state: &mut (), _action: usize) -> (usize, f32, bool) {
            (7, 0.0, false)
        }

        fn rollout(&mut self, _state: &mut (), _h: usize, _d: usize, _dh: f32) -> f32 {
            0.0
        }

        fn num_actions(&self) -> usize {
            1
        }
    }

    fn config(simulations: u32) -> PomcpConfig {
        PomcpConfig {
            num_particles: 8,
            discount_factor: 1.0,
            discount_horizon: 0.001,
            exploration_constant: 0.0,
            num_simulations_per_step: Some(simulations),
            ..Default::default()
        }
    }

    #[test]
    fn bandit_planner_finds_the_best_arm() {
        let mut planner = PomcpPlanner::new(BanditSim { num_actions: 2 }, config(64), 1, Some(4));
        planner.reset();
        let decision = planner.act();
        assert_eq!(decision.action, 1);
        assert_eq!(decision.simulations, 64);
        assert_eq!(decision.particles, 8);
    }

    #[test]
    fn zero_budget_returns_the_first_listed_action() {
        let mut planner = PomcpPlanner::new(BanditSim { num_actions: 3 }, config(0), 2, Some(4));
        planner.reset();
        let decision = planner.act();
        assert_eq!(decision.action, 0, "all actions untried, first one pops");
        assert_eq!(decision.simulations, 0);
    }

    #[test]
    fn unseen_observation_depletes_and_recovers_randomly() {
        let mut planner = PomcpPlanner::new(BanditSim { num_actions: 2 }, config(16), 4, Some(4));
        planner.reset();
        planner.act();
        // the bandit only ever emits observation 0
        planner.observe(99);
        assert!(planner.is_particle_depleted());
        assert_eq!(planner.num_particles(), 0);

        // subsequent decisions do not crash and run no simulations
        for _ in 0..3 {
            let decision = planner.act();
            assert!(decision.action < 2);
            assert_eq!(decision.simulations, 0);
            planner.observe(99);
        }
    }

    #[test]
    fn reinvigoration_tops_up_the_pruned_belief() {
        let mut cfg = config(9);
        cfg.num_particles = 3;
        cfg.particle_reinvigoration = true;
        cfg.particle_reinvigoration_rate = 0.5;
        let mut planner = PomcpPlanner::new(ConstantObsSim, cfg, 5, Some(4));
        planner.reset();

        // sim 1 creates the (0, 7) child via rollout; sims 2..9 each push one
        // particle into it, leaving 8 after pruning
        planner.act();
        planner.observe(7);
        assert!(!planner.is_particle_depleted());
        let decision = planner.act();
        assert_eq!(decision.particles, 12, "8 survivors plus ⌊0.5·8⌋ fresh");
    }

    #[test]
    fn horizon_left_shrinks_every_decision() {
        let mut planner = PomcpPlanner::new(ConstantObsSim, config(4), 2, Some(4));
        planner.reset();
        planner.act();
        planner.observe(7);
        planner.act();
        planner.observe(7);
        // horizon exhausted: decisions still work without underflow
        let decision = planner.act();
        assert_eq!(decision.action, 0);
    }
}

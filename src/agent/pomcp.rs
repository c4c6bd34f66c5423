use log::trace;

use crate::planner::PomcpPlanner;
use crate::sim::Simulator;

use super::{AtomicAgent, DecisionStats};

/// The planner wrapped as a real agent for the episode loop
pub struct PomcpAgent<S: Simulator> {
    planner: PomcpPlanner<S>,
    last: Option<DecisionStats>,
}

impl<S: Simulator> PomcpAgent<S> {
    pub fn new(planner: PomcpPlanner<S>) -> Self {
        Self {
            planner,
            last: None,
        }
    }
}

impl<S: Simulator> AtomicAgent for PomcpAgent<S> {
    fn reset(&mut self) {
        self.last = None;
        self.planner.reset();
    }

    fn act(&mut self) -> usize {
        let decision = self.planner.act();
        trace!(
            "planner selected action {} after {} simulations",
            decision.action,
            decision.simulations
        );
        self.last = Some(DecisionStats {
            simulations: decision.simulations,
            particles: decision.particles,
        });
        decision.action
    }

    fn observe(&mut self, observation: usize) {
        self.planner.observe(observation);
    }

    fn last_decision(&self) -> Option<DecisionStats> {
        self.last
    }
}

pub mod global;
pub mod influence;

pub use global::{GlobalSimulator, GlobalState};
pub use influence::{
    RecurrentInfluenceSimulator, RecurrentState, SequentialInfluenceSimulator, SequentialState,
};

/// The environment model the planner simulates against
///
/// The state is owned by the caller and mutated in place; a simulator never
/// retains references to it across calls. `step` advances one stage and
/// returns `(observation, reward, done)` for the controlled agent. `rollout`
/// plays uniformly random controlled-agent actions and returns the
/// *undiscounted* return accumulated with an internal `γ^offset` factor; the
/// caller applies `γ` once more at the tree boundary. A rollout stops early
/// once `γ^depth` falls below the discount horizon.
pub trait Simulator {
    type State: Clone;

    fn sample_initial_state(&mut self) -> Self::State;

    fn step(&mut self, state: &mut Self::State, action: usize) -> (usize, f32, bool);

    fn rollout(
        &mut self,
        state: &mut Self::State,
        horizon: usize,
        depth: usize,
        discount_horizon: f32,
    ) -> f32;

    /// Size of the controlled agent's action set
    fn num_actions(&self) -> usize;
}

use crate::dbn::{Assignment, TwoStageDbn};
use crate::error::ModelError;

pub mod recurrent;

pub use recurrent::{GruPredictor, ModelWeights, RnnPredictor};

/// A distribution over the influence source variables given local history
///
/// The feed-forward entry point consumes the entire `(local states, action)`
/// history; the step-wise entry point consumes one such tuple and a hidden
/// state it updates in place. Implementations write one value per influence
/// source into the assignment and draw through the network's generator.
pub trait InfluencePredictor {
    /// Populate the influence sources from the full local-factor history
    fn sample(&mut self, dbn: &mut TwoStageDbn, history: &[usize], assignment: &mut Assignment);

    /// Populate the influence sources from one input tuple, advancing the
    /// hidden state in place; `initial` marks the first call of an episode
    fn one_step_sample(
        &mut self,
        dbn: &mut TwoStageDbn,
        hidden: &mut [f32],
        input: &[usize],
        initial: bool,
        assignment: &mut Assignment,
    );

    /// Hidden state to start an episode from; empty for stateless variants
    fn initial_state(&self) -> Vec<f32> {
        Vec::new()
    }
}

/// Baseline predictor: every influence source uniform over its values
pub struct RandomInfluencePredictor {
    sources: Vec<String>,
}

impl RandomInfluencePredictor {
    pub fn new(dbn: &TwoStageDbn, sources: &[String]) -> Result<Self, ModelError> {
        for name in sources {
            if dbn.variable(name)?.cardinality() == 0 {
                return Err(ModelError::UnknownCardinality(name.clone()));
            }
        }
        Ok(Self {
            sources: sources.to_vec(),
        })
    }

    fn fill(&self, dbn: &mut TwoStageDbn, assignment: &mut Assignment) {
        for name in &self.sources {
            let value = dbn.sample_uniform(name);
            assignment.insert(name.clone(), value);
        }
    }
}

impl InfluencePredictor for RandomInfluencePredictor {
    fn sample(&mut self, dbn: &mut TwoStageDbn, _history: &[usize], assignment: &mut Assignment) {
        self.fill(dbn, assignment);
    }

    fn one_step_sample(
        &mut self,
        dbn: &mut TwoStageDbn,
        _hidden: &mut [f32],
        _input: &[usize],
        _initial: bool,
        assignment: &mut Assignment,
    ) {
        self.fill(dbn, assignment);
    }
}

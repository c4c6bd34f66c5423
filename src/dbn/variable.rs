use std::collections::HashMap;

use rand::distributions::{Distribution, WeightedIndex};
use rand::Rng;
use serde::Deserialize;

use crate::error::ModelError;

/// Description of one variable as written in the DBN file
#[derive(Debug, Clone, Deserialize)]
pub struct VariableSpec {
    pub parents: Vec<String>,
    /// Real-valued interpretation of each index; also fixes the cardinality
    #[serde(default)]
    pub values: Option<Vec<f32>>,
    /// `SUM`, `EXPSUM`, or `NOISYEXPSUM`; a CPT is assumed otherwise
    #[serde(default)]
    pub mode: Option<String>,
    #[serde(rename = "CPT", default)]
    pub cpt: Option<HashMap<Vec<usize>, Vec<f32>>>,
    #[serde(rename = "EXPSUM", default)]
    pub expsum: Option<ExpSumSpec>,
    #[serde(rename = "NOISYEXPSUM", default)]
    pub noisyexpsum: Option<NoisyExpSumSpec>,
    #[serde(default)]
    pub initial_dist: Option<Vec<f32>>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ExpSumSpec {
    pub base: usize,
}

#[derive(Debug, Clone, Deserialize)]
pub struct NoisyExpSumSpec {
    pub base: usize,
    pub noise: f32,
}

/// Sampling law of a variable, conditioned on its parents
#[derive(Debug, Clone)]
enum Law {
    /// Discrete distribution per joint parent assignment
    Cpt(HashMap<Vec<usize>, WeightedIndex<f32>>),
    /// `value = Σ parents`
    Sum,
    /// `value = Σᵢ baseⁱ · parentᵢ`
    ExpSum { base: usize },
    /// EXPSUM over parent bits independently flipped with probability `noise`
    NoisyExpSum { base: usize, noise: f32 },
}

/// A single factored random variable of the two-stage network
///
/// The first character of the name encodes the role (`x` state, `a` action,
/// `o` observation, `r` reward); a trailing prime marks the next-stage copy.
#[derive(Debug, Clone)]
pub struct Variable {
    name: String,
    parents: Vec<String>,
    values: Vec<f32>,
    cardinality: usize,
    law: Law,
    initial: Option<WeightedIndex<f32>>,
}

impl Variable {
    pub fn from_spec(name: &str, spec: VariableSpec) -> Result<Self, ModelError> {
        let values = spec.values.unwrap_or_default();
        let mut cardinality = values.len();

        let law = match spec.mode.as_deref() {
            Some("SUM") => Law::Sum,
            Some("EXPSUM") => {
                let base = spec
                    .expsum
                    .ok_or_else(|| ModelError::MalformedCpt {
                        variable: name.into(),
                        parents: vec![],
                        reason: "mode EXPSUM requires an EXPSUM section".into(),
                    })?
                    .base;
                Law::ExpSum { base }
            }
            Some("NOISYEXPSUM") => {
                let section = spec.noisyexpsum.ok_or_else(|| ModelError::MalformedCpt {
                    variable: name.into(),
                    parents: vec![],
                    reason: "mode NOISYEXPSUM requires a NOISYEXPSUM section".into(),
                })?;
                Law::NoisyExpSum {
                    base: section.base,
                    noise: section.noise,
                }
            }
            _ => {
                let mut table = HashMap::new();
                for (key, probs) in spec.cpt.unwrap_or_default() {
                    if cardinality == 0 {
                        cardinality = probs.len();
                    }
                    let dist =
                        WeightedIndex::new(probs.clone()).map_err(|e| ModelError::MalformedCpt {
                            variable: name.into(),
                            parents: key.clone(),
                            reason: e.to_string(),
                        })?;
                    table.insert(key, dist);
                }
                Law::Cpt(table)
            }
        };

        let initial = match spec.initial_dist {
            Some(probs) => {
                if cardinality == 0 {
                    cardinality = probs.len();
                }
                Some(
                    WeightedIndex::new(probs).map_err(|e| ModelError::MalformedCpt {
                        variable: name.into(),
                        parents: vec![],
                        reason: format!("initial_dist: {e}"),
                    })?,
                )
            }
            None => None,
        };

        Ok(Self {
            name: name.into(),
            parents: spec.parents,
            values,
            cardinality,
            law,
            initial,
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn parents(&self) -> &[String] {
        &self.parents
    }

    /// Number of discrete values, `0` when it could not be derived
    pub fn cardinality(&self) -> usize {
        self.cardinality
    }

    /// Whether this is an unprimed state variable
    pub fn is_state_variable(&self) -> bool {
        self.name.starts_with('x') && !self.name.ends_with('\'')
    }

    /// Draw a value given the parent indices, dispatching on the sampling law
    ///
    /// **Panics** on a CPT lookup miss: the sampling orders guarantee parents
    /// are assigned before their children, so a missing row means the network
    /// description does not cover its own reachable state space.
    pub fn sample(&self, parents: &[usize], rng: &mut impl Rng) -> usize {
        match &self.law {
            Law::Cpt(table) => {
                let dist = table.get(parents).unwrap_or_else(|| {
                    panic!(
                        "variable `{}` has no CPT row for parent assignment {:?}",
                        self.name, parents
                    )
                });
                dist.sample(rng)
            }
            Law::Sum => parents.iter().sum(),
            Law::ExpSum { base } => parents
                .iter()
                .enumerate()
                .map(|(i, &p)| base.pow(i as u32) * p)
                .sum(),
            Law::NoisyExpSum { base, noise } => parents
                .iter()
                .enumerate()
                .map(|(i, &p)| {
                    let bit = if rng.gen::<f32>() < *noise { 1 - p } else { p };
                    base.pow(i as u32) * bit
                })
                .sum(),
        }
    }

    /// Draw from the initial distribution used to bootstrap an episode
    pub fn sample_initial(&self, rng: &mut impl Rng) -> Result<usize, ModelError> {
        let dist = self
            .initial
            .as_ref()
            .ok_or_else(|| ModelError::MissingInitialDistribution(self.name.clone()))?;
        Ok(dist.sample(rng))
    }

    /// Draw uniformly over the variable's values
    pub fn sample_uniform(&self, rng: &mut impl Rng) -> usize {
        rng.gen_range(0..self.cardinality)
    }

    pub fn has_initial_distribution(&self) -> bool {
        self.initial.is_some()
    }

    /// Real-valued interpretation of an index; identity without a value map
    pub fn value_of(&self, index: usize) -> f32 {
        if self.values.is_empty() {
            index as f32
        } else {
            self.values[index]
        }
    }
}

use std::cmp::Ordering;
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::path::Path;

use log::{debug, info};
use rand::rngs::StdRng;
use rand::SeedableRng;

use crate::error::{Error, ModelError, Result};

pub mod variable;

pub use variable::{Variable, VariableSpec};

/// A joint assignment of variable name to value index
pub type Assignment = HashMap<String, usize>;

/// Strip a trailing prime, if any
pub fn strip_prime(name: &str) -> &str {
    name.strip_suffix('\'').unwrap_or(name)
}

/// Append a prime to a non-action variable that does not carry one yet
pub fn add_prime(name: &str) -> String {
    if !name.starts_with('a') && !name.ends_with('\'') {
        format!("{name}'")
    } else {
        name.to_string()
    }
}

/// Ordering used for reproducible logging of factor lists: role precedence
/// `x < a < o < r`, then numeric suffix after the shared prefix, then
/// lexicographic
pub fn factor_cmp(a_raw: &str, b_raw: &str) -> Ordering {
    let a = strip_prime(a_raw);
    let b = strip_prime(b_raw);
    let rank = |s: &str| match s.as_bytes().first() {
        Some(b'x') => 0,
        Some(b'a') => 1,
        Some(b'o') => 2,
        _ => 3,
    };
    rank(a).cmp(&rank(b)).then_with(|| {
        let shared = a
            .bytes()
            .zip(b.bytes())
            .take_while(|(ca, cb)| ca == cb)
            .count();
        match (a[shared..].parse::<i64>(), b[shared..].parse::<i64>()) {
            (Ok(na), Ok(nb)) => na.cmp(&nb),
            _ => a.cmp(b),
        }
    })
}

/// The local sub-model derived for one controlled agent
///
/// `local_factors` are the parents of the agent's observation and reward
/// (stripped of prime) plus its own action; `source_factors` are the
/// influence sources `U`, `destination_factors` the stage-1 copies of local
/// factors with a parent in `U`. The d-separation set is kept equal to the
/// local factors.
#[derive(Debug, Clone)]
pub struct LocalModel {
    pub local_factors: Vec<String>,
    pub local_states: Vec<String>,
    pub source_factors: Vec<String>,
    pub destination_factors: Vec<String>,
    pub d_separation_set: Vec<String>,
}

/// The factored two-stage dynamic Bayesian network
///
/// Owns its variables, the cached sampling orders, and the random generator
/// consulted by every sampling path (including the trained influence
/// predictors' categorical draws). Cloning yields an independent network with
/// an identical generator state; consumers that need uncorrelated streams
/// should [`reseed`](Self::reseed) their copy.
#[derive(Debug, Clone)]
pub struct TwoStageDbn {
    variables: BTreeMap<String, Variable>,
    state_variables: Vec<String>,
    orders: HashMap<String, Vec<String>>,
    rng: StdRng,
}

impl TwoStageDbn {
    /// Load a network from a DBN description file
    pub fn load(path: impl AsRef<Path>, seed: Option<u64>) -> Result<Self> {
        let path = path.as_ref();
        info!("loading DBN description from {}", path.display());
        let content = std::fs::read_to_string(path).map_err(|source| Error::Io {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_spec_str(&content, seed)
    }

    /// Build a network from the YAML text of a DBN description
    pub fn from_spec_str(yaml: &str, seed: Option<u64>) -> Result<Self> {
        let specs: BTreeMap<String, VariableSpec> = serde_yaml::from_str(yaml)?;

        let mut variables = BTreeMap::new();
        let mut state_variables = Vec::new();
        for (name, spec) in specs {
            let variable = Variable::from_spec(&name, spec)?;
            if variable.is_state_variable() {
                state_variables.push(name.clone());
            }
            variables.insert(name, variable);
        }

        for variable in variables.values() {
            for parent in variable.parents() {
                if !variables.contains_key(parent) {
                    return Err(ModelError::UnknownParent {
                        variable: variable.name().into(),
                        parent: parent.clone(),
                    }
                    .into());
                }
            }
        }

        let rng = match seed {
            Some(seed) => StdRng::seed_from_u64(seed),
            None => StdRng::from_entropy(),
        };

        let mut dbn = Self {
            variables,
            state_variables,
            orders: HashMap::new(),
            rng,
        };
        dbn.compute_full_sampling_order()?;
        info!(
            "two-stage DBN built with {} variables",
            dbn.variables.len()
        );
        Ok(dbn)
    }

    /// Replace the generator; copies of one network stay correlated otherwise
    pub fn reseed(&mut self, seed: u64) {
        self.rng = StdRng::seed_from_u64(seed);
    }

    pub fn variable(&self, name: &str) -> Result<&Variable, ModelError> {
        self.variables
            .get(name)
            .ok_or_else(|| ModelError::UnknownVariable(name.into()))
    }

    /// Unprimed state-variable names, in stable order
    pub fn state_variables(&self) -> &[String] {
        &self.state_variables
    }

    /// Action cardinality per agent id, read off the `a…` variables
    pub fn num_actions(&self) -> BTreeMap<String, usize> {
        self.variables
            .iter()
            .filter(|(name, _)| name.starts_with('a'))
            .map(|(name, var)| (name[1..].to_string(), var.cardinality()))
            .collect()
    }

    /// The generator shared by every sampling path of this network
    pub fn rng_mut(&mut self) -> &mut StdRng {
        &mut self.rng
    }

    /// Draw uniformly over a variable's values
    ///
    /// **Panics** on an unknown variable name; callers validate their factor
    /// lists against the network at construction.
    pub fn sample_uniform(&mut self, name: &str) -> usize {
        let variable = self
            .variables
            .get(name)
            .unwrap_or_else(|| panic!("unknown variable `{name}`"));
        variable.sample_uniform(&mut self.rng)
    }

    /// Draw a variable's value from its initial distribution
    pub fn sample_initial_value(&mut self, name: &str) -> Result<usize, ModelError> {
        let variable = self
            .variables
            .get(name)
            .ok_or_else(|| ModelError::UnknownVariable(name.into()))?;
        variable.sample_initial(&mut self.rng)
    }

    /// Sample every state variable from its initial distribution
    pub fn sample_initial_state(&mut self) -> Result<Assignment, ModelError> {
        let mut state = Assignment::new();
        for name in &self.state_variables {
            let value = self.variables[name].sample_initial(&mut self.rng)?;
            state.insert(name.clone(), value);
        }
        Ok(state)
    }

    /// Real-valued interpretation of a variable's current index in `state`
    ///
    /// **Panics** when the variable is absent from the assignment; the
    /// sampling orders put it there before any reader runs.
    pub fn value_of(&self, name: &str, state: &Assignment) -> f32 {
        let index = *state
            .get(name)
            .unwrap_or_else(|| panic!("variable `{name}` has no value in the assignment"));
        self.variables
            .get(name)
            .unwrap_or_else(|| panic!("unknown variable `{name}`"))
            .value_of(index)
    }

    /// One factored transition: sample each variable in the named order, then
    /// advance time by copying every primed state value onto its unprimed key
    ///
    /// **Panics** on an unknown order name or a missing CPT row; both indicate
    /// a mismatch between the network description and the code driving it.
    pub fn step(&mut self, state: &mut Assignment, mode: &str) {
        let order = self
            .orders
            .get(mode)
            .unwrap_or_else(|| panic!("no sampling order named `{mode}`"));

        let mut parent_values = Vec::new();
        for name in order {
            let variable = &self.variables[name];
            parent_values.clear();
            parent_values.extend(
                variable
                    .parents()
                    .iter()
                    .map(|parent| state.get(parent).copied().unwrap_or(0)),
            );
            let value = variable.sample(&parent_values, &mut self.rng);
            state.insert(name.clone(), value);
        }

        for name in order {
            if name.starts_with('x') && name.ends_with('\'') {
                let value = state[name];
                state.insert(strip_prime(name).to_string(), value);
            }
        }
    }

    /// Kahn-style expansion: repeatedly emit an output whose parents are all
    /// sampled or inputs; when stuck, drag the missing parents in as outputs.
    /// Pool iteration over ordered sets keeps the tie-break deterministic.
    pub fn compute_sampling_order(
        &mut self,
        inputs: &BTreeSet<String>,
        outputs: &BTreeSet<String>,
        name: &str,
    ) -> Result<(), ModelError> {
        debug!("computing sampling order `{name}` with inputs {inputs:?} and outputs {outputs:?}");
        let mut to_sample = outputs.clone();
        let mut sampled = inputs.clone();
        let mut order = Vec::with_capacity(outputs.len());

        while !to_sample.is_empty() {
            let mut emitted = None;
            let mut dragged = Vec::new();
            for candidate in to_sample.iter() {
                let variable = self
                    .variables
                    .get(candidate)
                    .ok_or_else(|| ModelError::UnknownVariable(candidate.clone()))?;
                let missing: Vec<&String> = variable
                    .parents()
                    .iter()
                    .filter(|parent| !sampled.contains(*parent))
                    .collect();
                if missing.is_empty() {
                    emitted = Some(candidate.clone());
                    break;
                }
                dragged.extend(missing.into_iter().cloned());
            }

            match emitted {
                Some(variable) => {
                    to_sample.remove(&variable);
                    sampled.insert(variable.clone());
                    order.push(variable);
                }
                None => {
                    let mut grew = false;
                    for parent in dragged {
                        grew |= to_sample.insert(parent);
                    }
                    if !grew {
                        return Err(ModelError::Cycle(to_sample.into_iter().collect()));
                    }
                }
            }
        }

        debug!("sampling order `{name}`: {order:?}");
        self.orders.insert(name.to_string(), order);
        Ok(())
    }

    /// The `"full"` order: all actions and stage-0 states in, all stage-1
    /// states, observations, and rewards out
    fn compute_full_sampling_order(&mut self) -> Result<(), ModelError> {
        let mut inputs = BTreeSet::new();
        let mut outputs = BTreeSet::new();
        for name in self.variables.keys() {
            match name.as_bytes()[0] {
                b'a' => {
                    inputs.insert(name.clone());
                }
                b'o' | b'r' => {
                    outputs.insert(name.clone());
                }
                _ => {
                    if name.ends_with('\'') {
                        outputs.insert(name.clone());
                    } else {
                        inputs.insert(name.clone());
                    }
                }
            }
        }
        self.compute_sampling_order(&inputs, &outputs, "full")
    }

    /// Derive the local model for one controlled agent and cache its
    /// `"local"` sampling order
    pub fn construct_local_model(&mut self, agent_id: &str) -> Result<LocalModel, ModelError> {
        let observation_name = format!("o{agent_id}");
        let reward_name = format!("r{agent_id}");

        let mut local = BTreeSet::new();
        for name in [&observation_name, &reward_name] {
            for parent in self.variable(name)?.parents() {
                local.insert(strip_prime(parent).to_string());
            }
        }
        local.insert(format!("a{agent_id}"));

        let mut sources = BTreeSet::new();
        let mut destinations = BTreeSet::new();
        for factor in &local {
            let primed = add_prime(factor);
            let mut has_link_from_outside = false;
            for parent in self.variable(&primed)?.parents() {
                if !local.contains(strip_prime(parent)) {
                    sources.insert(strip_prime(parent).to_string());
                    has_link_from_outside = true;
                }
            }
            if has_link_from_outside {
                destinations.insert(primed);
            }
        }

        let sorted = |set: &BTreeSet<String>| {
            let mut list: Vec<String> = set.iter().cloned().collect();
            list.sort_by(|a, b| factor_cmp(a, b));
            list
        };

        let local_factors = sorted(&local);
        let source_factors = sorted(&sources);
        let destination_factors = sorted(&destinations);
        let d_separation_set = local_factors.clone();
        let local_states: Vec<String> = local_factors
            .iter()
            .filter(|name| !name.starts_with('a') && !name.starts_with('o'))
            .cloned()
            .collect();

        info!("local factors for agent {agent_id}: {local_factors:?}");
        info!("influence sources: {source_factors:?}");
        info!("influence destinations: {destination_factors:?}");

        let inputs: BTreeSet<String> = local.union(&sources).cloned().collect();
        let mut outputs: BTreeSet<String> = local
            .iter()
            .filter(|name| !name.starts_with('a'))
            .map(|name| add_prime(name))
            .collect();
        outputs.insert(observation_name);
        outputs.insert(reward_name);
        self.compute_sampling_order(&inputs, &outputs, "local")?;

        Ok(LocalModel {
            local_factors,
            local_states,
            source_factors,
            destination_factors,
            d_separation_set,
        })
    }
}

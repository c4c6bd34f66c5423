use std::path::Path;

use log::info;
use ndarray::{s, Array1, Array2};
use rand::distributions::{Distribution, WeightedIndex};
use serde::Deserialize;

use crate::dbn::{Assignment, TwoStageDbn};
use crate::error::{Error, ModelError, Result};

use super::InfluencePredictor;

/// Serialized parameters of a trained recurrent influence predictor
///
/// The canonical parameter names follow the module the predictor was trained
/// as: a (gated) recurrent layer feeding one linear output layer. For the
/// simple-recurrent variant the same names hold a single tanh cell.
#[derive(Debug, Clone, Deserialize)]
pub struct ModelWeights {
    #[serde(rename = "gru.weight_ih_l0")]
    pub weight_ih: Vec<Vec<f32>>,
    #[serde(rename = "gru.weight_hh_l0")]
    pub weight_hh: Vec<Vec<f32>>,
    #[serde(rename = "gru.bias_ih_l0")]
    pub bias_ih: Vec<f32>,
    #[serde(rename = "gru.bias_hh_l0")]
    pub bias_hh: Vec<f32>,
    #[serde(rename = "linear_layer.weight")]
    pub linear_weight: Vec<Vec<f32>>,
    #[serde(rename = "linear_layer.bias")]
    pub linear_bias: Vec<f32>,
}

impl ModelWeights {
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path).map_err(|source| Error::Io {
            path: path.to_path_buf(),
            source,
        })?;
        let weights = serde_json::from_str(&content)?;
        info!("influence predictor weights loaded from {}", path.display());
        Ok(weights)
    }
}

/// Convert nested rows into a matrix, checking the advertised shape
fn to_matrix(name: &str, rows: &[Vec<f32>], expected: (usize, usize)) -> Result<Array2<f32>, ModelError> {
    let found = (rows.len(), rows.first().map_or(0, Vec::len));
    if found != expected || rows.iter().any(|row| row.len() != expected.1) {
        return Err(ModelError::BadParameterShape {
            name: name.into(),
            found: vec![found.0, found.1],
            expected: vec![expected.0, expected.1],
        });
    }
    let flat: Vec<f32> = rows.iter().flatten().copied().collect();
    Ok(Array2::from_shape_vec(expected, flat).expect("shape checked above"))
}

fn to_vector(name: &str, data: &[f32], expected: usize) -> Result<Array1<f32>, ModelError> {
    if data.len() != expected {
        return Err(ModelError::BadParameterShape {
            name: name.into(),
            found: vec![data.len()],
            expected: vec![expected],
        });
    }
    Ok(Array1::from_vec(data.to_vec()))
}

/// Resolve the influence sources against the network: cardinalities for the
/// softmax segments, initial distributions for the first step of an episode
fn resolve_sources(
    dbn: &TwoStageDbn,
    sources: &[String],
) -> Result<Vec<(String, usize)>, ModelError> {
    sources
        .iter()
        .map(|name| {
            let variable = dbn.variable(name)?;
            if variable.cardinality() == 0 {
                return Err(ModelError::UnknownCardinality(name.clone()));
            }
            if !variable.has_initial_distribution() {
                return Err(ModelError::MissingInitialDistribution(name.clone()));
            }
            Ok((name.clone(), variable.cardinality()))
        })
        .collect()
}

fn sample_initial_sources(
    dbn: &mut TwoStageDbn,
    sources: &[(String, usize)],
    assignment: &mut Assignment,
) {
    for (name, _) in sources {
        let value = dbn
            .sample_initial_value(name)
            .expect("initial distributions checked at construction");
        assignment.insert(name.clone(), value);
    }
}

/// Sample each influence source from its softmax segment of the output layer
fn sample_output_segments(
    dbn: &mut TwoStageDbn,
    sources: &[(String, usize)],
    y: &Array1<f32>,
    assignment: &mut Assignment,
) {
    let mut offset = 0;
    for (name, cardinality) in sources {
        let segment = y.slice(s![offset..offset + cardinality]);
        let max = segment.fold(f32::NEG_INFINITY, |m, &v| m.max(v));
        let weights: Vec<f32> = segment.iter().map(|&v| (v - max).exp()).collect();
        let dist = WeightedIndex::new(&weights).expect("softmax weights are positive");
        let value = dist.sample(dbn.rng_mut());
        assignment.insert(name.clone(), value);
        offset += cardinality;
    }
}

fn sigmoid(v: f32) -> f32 {
    1.0 / (1.0 + (-v).exp())
}

/// Trained gated-recurrent influence predictor, executed step-wise from the
/// decomposed gate matrices
pub struct GruPredictor {
    sources: Vec<(String, usize)>,
    input_size: usize,
    hidden_size: usize,
    wxr: Array2<f32>,
    whr: Array2<f32>,
    bxr: Array1<f32>,
    bhr: Array1<f32>,
    wxz: Array2<f32>,
    whz: Array2<f32>,
    bxz: Array1<f32>,
    bhz: Array1<f32>,
    wxn: Array2<f32>,
    whn: Array2<f32>,
    bxn: Array1<f32>,
    bhn: Array1<f32>,
    why: Array2<f32>,
    by: Array1<f32>,
}

impl GruPredictor {
    pub fn new(
        dbn: &TwoStageDbn,
        sources: &[String],
        input_size: usize,
        hidden_size: usize,
        weights: &ModelWeights,
    ) -> Result<Self, ModelError> {
        let sources = resolve_sources(dbn, sources)?;
        let output_size: usize = sources.iter().map(|(_, k)| k).sum();

        let ih = to_matrix("gru.weight_ih_l0", &weights.weight_ih, (3 * hidden_size, input_size))?;
        let hh = to_matrix("gru.weight_hh_l0", &weights.weight_hh, (3 * hidden_size, hidden_size))?;
        let bih = to_vector("gru.bias_ih_l0", &weights.bias_ih, 3 * hidden_size)?;
        let bhh = to_vector("gru.bias_hh_l0", &weights.bias_hh, 3 * hidden_size)?;

        let h = hidden_size;
        // gate rows are stacked reset, update, new; transposed for x·W
        let gate = |m: &Array2<f32>, i: usize| m.slice(s![i * h..(i + 1) * h, ..]).t().to_owned();
        let bias = |v: &Array1<f32>, i: usize| v.slice(s![i * h..(i + 1) * h]).to_owned();

        Ok(Self {
            wxr: gate(&ih, 0),
            wxz: gate(&ih, 1),
            wxn: gate(&ih, 2),
            whr: gate(&hh, 0),
            whz: gate(&hh, 1),
            whn: gate(&hh, 2),
            bxr: bias(&bih, 0),
            bxz: bias(&bih, 1),
            bxn: bias(&bih, 2),
            bhr: bias(&bhh, 0),
            bhz: bias(&bhh, 1),
            bhn: bias(&bhh, 2),
            why: to_matrix("linear_layer.weight", &weights.linear_weight, (output_size, hidden_size))?
                .t()
                .to_owned(),
            by: to_vector("linear_layer.bias", &weights.linear_bias, output_size)?,
            sources,
            input_size,
            hidden_size,
        })
    }

    pub fn load(
        dbn: &TwoStageDbn,
        sources: &[String],
        input_size: usize,
        hidden_size: usize,
        path: impl AsRef<Path>,
    ) -> Result<Self> {
        let weights = ModelWeights::load(path)?;
        Ok(Self::new(dbn, sources, input_size, hidden_size, &weights)?)
    }

    /// One cell application: standard GRU equations
    fn cell(&self, x: &Array1<f32>, h: &Array1<f32>) -> Array1<f32> {
        let r = (x.dot(&self.wxr) + &self.bxr + h.dot(&self.whr) + &self.bhr).mapv(sigmoid);
        let z = (x.dot(&self.wxz) + &self.bxz + h.dot(&self.whz) + &self.bhz).mapv(sigmoid);
        let n = (x.dot(&self.wxn) + &self.bxn + &r * &(h.dot(&self.whn) + &self.bhn))
            .mapv(f32::tanh);
        z.mapv(|v| 1.0 - v) * &n + &z * h
    }

    fn output(&self, h: &Array1<f32>) -> Array1<f32> {
        h.dot(&self.why) + &self.by
    }
}

impl InfluencePredictor for GruPredictor {
    /// Feed-forward path: run the cell over the whole history from a zero
    /// hidden state and read the final output
    fn sample(&mut self, dbn: &mut TwoStageDbn, history: &[usize], assignment: &mut Assignment) {
        if history.is_empty() {
            sample_initial_sources(dbn, &self.sources, assignment);
            return;
        }
        let mut h = Array1::zeros(self.hidden_size);
        for chunk in history.chunks_exact(self.input_size) {
            let x = Array1::from_iter(chunk.iter().map(|&v| v as f32));
            h = self.cell(&x, &h);
        }
        let y = self.output(&h);
        sample_output_segments(dbn, &self.sources, &y, assignment);
    }

    fn one_step_sample(
        &mut self,
        dbn: &mut TwoStageDbn,
        hidden: &mut [f32],
        input: &[usize],
        initial: bool,
        assignment: &mut Assignment,
    ) {
        if initial {
            sample_initial_sources(dbn, &self.sources, assignment);
            return;
        }
        let x = Array1::from_iter(input.iter().map(|&v| v as f32));
        let h = Array1::from_iter(hidden.iter().copied());
        let h_new = self.cell(&x, &h);
        let y = self.output(&h_new);
        sample_output_segments(dbn, &self.sources, &y, assignment);
        hidden.copy_from_slice(h_new.as_slice().expect("contiguous hidden state"));
    }

    fn initial_state(&self) -> Vec<f32> {
        vec![0.0; self.hidden_size]
    }
}

/// Trained simple-recurrent influence predictor: a single tanh cell under the
/// same canonical parameter names
pub struct RnnPredictor {
    sources: Vec<(String, usize)>,
    input_size: usize,
    hidden_size: usize,
    wxh: Array2<f32>,
    whh: Array2<f32>,
    bxh: Array1<f32>,
    bhh: Array1<f32>,
    why: Array2<f32>,
    by: Array1<f32>,
}

impl RnnPredictor {
    pub fn new(
        dbn: &TwoStageDbn,
        sources: &[String],
        input_size: usize,
        hidden_size: usize,
        weights: &ModelWeights,
    ) -> Result<Self, ModelError> {
        let sources = resolve_sources(dbn, sources)?;
        let output_size: usize = sources.iter().map(|(_, k)| k).sum();

        Ok(Self {
            wxh: to_matrix("gru.weight_ih_l0", &weights.weight_ih, (hidden_size, input_size))?
                .t()
                .to_owned(),
            whh: to_matrix("gru.weight_hh_l0", &weights.weight_hh, (hidden_size, hidden_size))?
                .t()
                .to_owned(),
            bxh: to_vector("gru.bias_ih_l0", &weights.bias_ih, hidden_size)?,
            bhh: to_vector("gru.bias_hh_l0", &weights.bias_hh, hidden_size)?,
            why: to_matrix("linear_layer.weight", &weights.linear_weight, (output_size, hidden_size))?
                .t()
                .to_owned(),
            by: to_vector("linear_layer.bias", &weights.linear_bias, output_size)?,
            sources,
            input_size,
            hidden_size,
        })
    }

    pub fn load(
        dbn: &TwoStageDbn,
        sources: &[String],
        input_size: usize,
        hidden_size: usize,
        path: impl AsRef<Path>,
    ) -> Result<Self> {
        let weights = ModelWeights::load(path)?;
        Ok(Self::new(dbn, sources, input_size, hidden_size, &weights)?)
    }

    fn cell(&self, x: &Array1<f32>, h: &Array1<f32>) -> Array1<f32> {
        (x.dot(&self.wxh) + &self.bxh + h.dot(&self.whh) + &self.bhh).mapv(f32::tanh)
    }
}

impl InfluencePredictor for RnnPredictor {
    fn sample(&mut self, dbn: &mut TwoStageDbn, history: &[usize], assignment: &mut Assignment) {
        if history.is_empty() {
            sample_initial_sources(dbn, &self.sources, assignment);
            return;
        }
        let mut h = Array1::zeros(self.hidden_size);
        for chunk in history.chunks_exact(self.input_size) {
            let x = Array1::from_iter(chunk.iter().map(|&v| v as f32));
            h = self.cell(&x, &h);
        }
        let y = h.dot(&self.why) + &self.by;
        sample_output_segments(dbn, &self.sources, &y, assignment);
    }

    fn one_step_sample(
        &mut self,
        dbn: &mut TwoStageDbn,
        hidden: &mut [f32],
        input: &[usize],
        initial: bool,
        assignment: &mut Assignment,
    ) {
        if initial {
            sample_initial_sources(dbn, &self.sources, assignment);
            return;
        }
        let x = Array1::from_iter(input.iter().map(|&v| v as f32));
        let h = Array1::from_iter(hidden.iter().copied());
        let h_new = self.cell(&x, &h);
        let y = h_new.dot(&self.why) + &self.by;
        sample_output_segments(dbn, &self.sources, &y, assignment);
        hidden.copy_from_slice(h_new.as_slice().expect("contiguous hidden state"));
    }

    fn initial_state(&self) -> Vec<f32> {
        vec![0.0; self.hidden_size]
    }
}

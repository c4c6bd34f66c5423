use std::collections::HashMap;

use pomcp::agent::make_agent_component;
use pomcp::config::Config;
use pomcp::dbn::TwoStageDbn;
use pomcp::episode::{Environment, Episode};
use pomcp::experiment::{Experiment, ExperimentKind, IntTensor};
use pomcp::influence::RandomInfluencePredictor;
use pomcp::planner::{PomcpConfig, PomcpPlanner, TieBreak};
use pomcp::sim::{GlobalSimulator, SequentialInfluenceSimulator, Simulator};

fn planner_config(simulations: u32, particles: usize) -> PomcpConfig {
    PomcpConfig {
        num_particles: particles,
        discount_factor: 1.0,
        discount_horizon: 0.001,
        exploration_constant: 0.0,
        particle_reinvigoration: false,
        particle_reinvigoration_rate: 0.0,
        num_simulations_per_step: Some(simulations),
        num_seconds_per_step: None,
        tie_break: TieBreak::Last,
    }
}

fn global_simulator(net: &str, seed: u64, discount_factor: f32) -> GlobalSimulator {
    let dbn = TwoStageDbn::from_spec_str(net, Some(seed)).unwrap();
    GlobalSimulator::new("0", dbn, Vec::new(), discount_factor, 16).unwrap()
}

/// Deterministic singleton world: the state never moves off zero and the
/// reward tracks it, so any planning run reports a return of exactly zero.
#[test]
fn deterministic_singleton_reports_zero_return() {
    const NET: &str = "
x: {parents: [], values: [0, 1], initial_dist: [1.0, 0.0]}
a0: {parents: [], values: [0, 1]}
x':
  parents: [x]
  values: [0, 1]
  CPT:
    ? [0]
    : [1.0, 0.0]
    ? [1]
    : [0.0, 1.0]
o0: {parents: [x'], mode: SUM, values: [0, 1]}
r0: {parents: [x'], mode: SUM, values: [0.0, 1.0]}
";
    let dir = tempfile::tempdir().unwrap();
    let net_path = dir.path().join("singleton.yaml");
    std::fs::write(&net_path, NET).unwrap();

    let config_text = format!(
        "
General:
  domain: Singleton
  horizon: 5
  discountFactor: 1.0
  IDOfAgentToControl: '0'
  seed: 7
Experiment:
  repeat: 2
  saveReplay: true
  fullLogging: false
AgentComponent:
  '0':
    Type: POMCP
    Simulator:
      Type: Global
    Rollout:
      numberOfParticles: 16
      discountHorizon: 0.001
      particleReinvigoration: false
      particleReinvigorationRate: 0.0
      explorationConstant: 1.0
      numberOfSimulationsPerStep: 32
Singleton:
  2SDBNYamlFilePath: {}
",
        net_path.display()
    );
    let config: Config = serde_yaml::from_str(&config_text).unwrap();
    let experiment = Experiment::from_config(config, dir.path());
    experiment.run(ExperimentKind::Planning).unwrap();

    let results: std::collections::BTreeMap<
        usize,
        std::collections::BTreeMap<String, serde_yaml::Value>,
    > = serde_yaml::from_str(&std::fs::read_to_string(dir.path().join("results.yaml")).unwrap())
        .unwrap();
    for episode in [0usize, 1] {
        let record = &results[&episode]["0"];
        assert_eq!(record["Return"].as_f64().unwrap(), 0.0);
        assert_eq!(record["Times"].as_sequence().unwrap().len(), 5);
        assert_eq!(record["Num_simulations"].as_sequence().unwrap().len(), 5);
    }
    assert!(
        dir.path().join("replays/episode0.yaml").exists(),
        "replay written when requested"
    );
}

/// Bandit: the reward equals the chosen action, so the planner must commit
/// to the larger arm.
#[test]
fn bandit_prefers_the_rewarding_arm() {
    const NET: &str = "
x: {parents: [], values: [0], initial_dist: [1.0]}
a0: {parents: [], values: [0, 1]}
x':
  parents: [x]
  values: [0]
  CPT:
    ? [0]
    : [1.0]
o0: {parents: [x'], mode: SUM, values: [0]}
r0: {parents: [a0], mode: SUM, values: [0.0, 1.0]}
";
    let simulator = global_simulator(NET, 11, 1.0);
    let mut planner = PomcpPlanner::new(simulator, planner_config(64, 8), 1, Some(11));
    planner.reset();
    assert_eq!(planner.act().action, 1);
}

/// Delayed reward: the reward reads the pre-step state, so toggling pays off
/// only on later steps; with enough lookahead the planner still starts with
/// the toggle.
#[test]
fn delayed_reward_prefers_the_toggle() {
    const NET: &str = "
x: {parents: [], values: [0, 1], initial_dist: [1.0, 0.0]}
a0: {parents: [], values: [0, 1]}
x':
  parents: [x, a0]
  values: [0, 1]
  CPT:
    ? [0, 0]
    : [1.0, 0.0]
    ? [0, 1]
    : [0.0, 1.0]
    ? [1, 0]
    : [0.0, 1.0]
    ? [1, 1]
    : [1.0, 0.0]
o0: {parents: [x'], mode: SUM, values: [0, 1]}
r0: {parents: [x], mode: SUM, values: [0.0, 1.0]}
";
    let simulator = global_simulator(NET, 17, 1.0);
    let mut planner = PomcpPlanner::new(simulator, planner_config(512, 32), 3, Some(17));
    planner.reset();
    assert_eq!(planner.act().action, 1);
}

/// Particle depletion: a real observation the generative model gives zero
/// probability empties the belief, and the planner degrades to uniformly
/// random actions without crashing.
#[test]
fn impossible_observation_depletes_the_belief() {
    const NET: &str = "
x: {parents: [], values: [0], initial_dist: [1.0]}
a0: {parents: [], values: [0, 1]}
x':
  parents: [x]
  values: [0]
  CPT:
    ? [0]
    : [1.0]
o0: {parents: [x'], mode: SUM, values: [0]}
r0: {parents: [x'], mode: SUM, values: [0.0]}
";
    let simulator = global_simulator(NET, 23, 1.0);
    let mut planner = PomcpPlanner::new(simulator, planner_config(32, 8), 6, Some(23));
    planner.reset();

    planner.act();
    // the generative model only ever emits observation 0
    planner.observe(1);
    assert!(planner.is_particle_depleted());

    for _ in 0..5 {
        let decision = planner.act();
        assert!(decision.action < 2);
        assert_eq!(decision.simulations, 0);
        planner.observe(1);
    }
}

/// Reinvigoration: a pruned root of 8 particles with rate 0.5 is topped up
/// with exactly ⌊0.5 · 8⌋ fresh draws.
#[test]
fn reinvigoration_adds_a_fixed_fraction() {
    const NET: &str = "
x: {parents: [], values: [0], initial_dist: [1.0]}
a0: {parents: [], values: [0]}
x':
  parents: [x]
  values: [0]
  CPT:
    ? [0]
    : [1.0]
o0: {parents: [x'], mode: SUM, values: [0]}
r0: {parents: [x'], mode: SUM, values: [0.0]}
";
    let simulator = global_simulator(NET, 29, 1.0);
    let mut config = planner_config(9, 3);
    config.particle_reinvigoration = true;
    config.particle_reinvigoration_rate = 0.5;
    let mut planner = PomcpPlanner::new(simulator, config, 5, Some(29));
    planner.reset();

    // the first simulation creates the sole child by rollout, the other
    // eight each deposit one particle in it
    planner.act();
    planner.observe(0);
    assert!(!planner.is_particle_depleted());
    assert_eq!(planner.act().particles, 12);
}

/// Influence-random equivalence: under the random predictor the simulator's
/// influence-source marginals are uniform.
#[test]
fn random_influence_marginals_are_uniform() {
    const NET: &str = "
x1: {parents: [], values: [0, 1], initial_dist: [1.0, 0.0]}
x2: {parents: [], values: [0, 1, 2], initial_dist: [1.0, 0.0, 0.0]}
a0: {parents: [], values: [0, 1]}
a1: {parents: [], values: [0, 1]}
x1': {parents: [x1, x2, a0], mode: SUM, values: [0, 1, 2, 3, 4]}
x2': {parents: [x2, a1], mode: SUM, values: [0, 1, 2, 3]}
o0: {parents: [x1'], mode: SUM, values: [0, 1, 2, 3, 4]}
o1: {parents: [x2'], mode: SUM, values: [0, 1, 2, 3]}
r0: {parents: [x1'], mode: SUM, values: [0.0, 1.0, 2.0, 3.0, 4.0]}
r1: {parents: [x2'], mode: SUM, values: [0.0, 1.0, 2.0, 3.0]}
";
    let mut dbn = TwoStageDbn::from_spec_str(NET, Some(31)).unwrap();
    let local = dbn.construct_local_model("0").unwrap();
    assert_eq!(local.source_factors, ["x2"]);
    let predictor = RandomInfluencePredictor::new(&dbn, &local.source_factors).unwrap();
    let mut simulator =
        SequentialInfluenceSimulator::new("0", dbn, local, Box::new(predictor), 1.0).unwrap();

    let trials = 10_000;
    let mut counts: HashMap<usize, usize> = HashMap::new();
    for _ in 0..trials {
        let mut state = simulator.sample_initial_state();
        simulator.step(&mut state, 0);
        *counts.entry(state.environment["x2"]).or_default() += 1;
    }

    let expected = trials as f64 / 3.0;
    for value in 0..3 {
        let count = counts.get(&value).copied().unwrap_or(0) as f64;
        assert!(
            (count - expected).abs() / expected < 0.1,
            "value {value} drawn {count} times, expected ~{expected:.0}"
        );
    }
}

/// The data-generation runner dumps tensors shaped by the local model.
#[test]
fn data_generation_writes_training_tensors() {
    const NET: &str = "
x1: {parents: [], values: [0, 1], initial_dist: [0.5, 0.5]}
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
    let dir = tempfile::tempdir().unwrap();
    let net_path = dir.path().join("coupled.yaml");
    std::fs::write(&net_path, NET).unwrap();

    let config_text = format!(
        "
General:
  domain: Coupled
  horizon: 4
  discountFactor: 0.95
  IDOfAgentToControl: '0'
  seed: 3
Experiment:
  repeat: 1
  saveReplay: false
  fullLogging: false
AgentComponent:
  '0':
    Type: POMCP
    Simulator:
      Type: Local
      InfluencePredictor:
        Type: Random
        numberOfSampledEpisodesForTraining: 6
    Rollout:
      numberOfParticles: 8
      discountHorizon: 0.01
      particleReinvigoration: false
      particleReinvigorationRate: 0.0
      explorationConstant: 1.0
      numberOfSimulationsPerStep: 16
  '1':
    Type: Random
Coupled:
  2SDBNYamlFilePath: {}
",
        net_path.display()
    );
    let config: Config = serde_yaml::from_str(&config_text).unwrap();
    let experiment = Experiment::from_config(config, dir.path());
    experiment.run(ExperimentKind::DataGeneration).unwrap();

    let inputs: IntTensor =
        bincode::deserialize(&std::fs::read(dir.path().join("inputs.bin")).unwrap()).unwrap();
    let outputs: IntTensor =
        bincode::deserialize(&std::fs::read(dir.path().join("outputs.bin")).unwrap()).unwrap();
    // one local state plus the action; one influence source
    assert_eq!(inputs.shape, [6, 3, 2]);
    assert_eq!(outputs.shape, [6, 3, 1]);
    // recorded actions and sources stay within their cardinalities
    for episode in 0..6 {
        for step in 0..3 {
            assert!(inputs.get(episode, step, 1) < 2);
            assert!(outputs.get(episode, step, 0) < 2);
        }
    }
}

/// A full planning run with the influence-augmented local simulator built
/// through the configuration factory.
#[test]
fn local_planning_pipeline_runs_end_to_end() {
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
    let dir = tempfile::tempdir().unwrap();
    let net_path = dir.path().join("coupled.yaml");
    std::fs::write(&net_path, NET).unwrap();

    let config_text = format!(
        "
General:
  domain: Coupled
  horizon: 3
  discountFactor: 0.9
  IDOfAgentToControl: '0'
  seed: 5
Experiment:
  repeat: 1
  saveReplay: false
  fullLogging: true
AgentComponent:
  '0':
    Type: POMCP
    Simulator:
      Type: Local
      InfluencePredictor:
        Type: Random
    Rollout:
      numberOfParticles: 16
      discountHorizon: 0.01
      particleReinvigoration: true
      particleReinvigorationRate: 0.1
      explorationConstant: 2.0
      numberOfSimulationsPerStep: 64
  '1':
    Type: Naive
Coupled:
  2SDBNYamlFilePath: {}
",
        net_path.display()
    );
    let config: Config = serde_yaml::from_str(&config_text).unwrap();

    let dbn = TwoStageDbn::from_spec_str(NET, Some(5)).unwrap();
    let mut component = make_agent_component(&config, &dbn).unwrap();
    let mut environment = Environment::new(dbn, vec!["0".into(), "1".into()]);

    let mut episode = Episode::new(0, &mut environment, &mut component, 3, 0.9, false);
    let result = episode.dispatch().unwrap();

    assert!(result.discounted_return.contains_key("0"));
    let simulations = &result.simulations_per_step["0"];
    assert_eq!(simulations.len(), 3);
    assert!(simulations.iter().all(|&n| n <= 64));
    assert_eq!(result.time_per_action["1"].len(), 3);
}

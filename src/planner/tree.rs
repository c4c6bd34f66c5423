use std::collections::{BTreeMap, VecDeque};

use super::TieBreak;

/// Handle to an observation node in its arena
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ObsId(usize);

/// Handle to an action node in its arena
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ActId(usize);

#[derive(Debug)]
struct ObsNode<S> {
    n: u32,
    q: f32,
    /// One action child per action id, created eagerly
    children: Vec<ActId>,
    /// Actions not yet forced once through selection
    untried: VecDeque<usize>,
    /// Belief particles conditional on this node's history
    particles: Vec<S>,
}

#[derive(Debug)]
struct ActNode {
    n: u32,
    q: f32,
    /// Observation children, created lazily as simulations reach them
    children: BTreeMap<usize, ObsId>,
}

/// The bipartite POMCP search tree, arena-allocated
///
/// Observation and action nodes live in two parallel vectors addressed by
/// typed handles, so pruning is a subtree extraction into a fresh arena
/// rather than pointer surgery. Nodes carry no reference to the planner.
#[derive(Debug)]
pub struct SearchTree<S> {
    observation_nodes: Vec<ObsNode<S>>,
    action_nodes: Vec<ActNode>,
    root: ObsId,
    num_actions: usize,
}

impl<S> SearchTree<S> {
    /// A fresh tree holding a single root observation node
    pub fn new(num_actions: usize) -> Self {
        let mut tree = Self {
            observation_nodes: Vec::new(),
            action_nodes: Vec::new(),
            root: ObsId(0),
            num_actions,
        };
        tree.root = tree.new_observation_node();
        tree
    }

    pub fn root(&self) -> ObsId {
        self.root
    }

    pub fn num_actions(&self) -> usize {
        self.num_actions
    }

    /// Allocate an observation node with its eager action children
    pub fn new_observation_node(&mut self) -> ObsId {
        let mut children = Vec::with_capacity(self.num_actions);
        for _ in 0..self.num_actions {
            let id = ActId(self.action_nodes.len());
            self.action_nodes.push(ActNode {
                n: 0,
                q: 0.0,
                children: BTreeMap::new(),
            });
            children.push(id);
        }
        let id = ObsId(self.observation_nodes.len());
        self.observation_nodes.push(ObsNode {
            n: 0,
            q: 0.0,
            children,
            untried: (0..self.num_actions).collect(),
            particles: Vec::new(),
        });
        id
    }

    pub fn particles(&self, id: ObsId) -> &[S] {
        &self.observation_nodes[id.0].particles
    }

    pub fn push_particle(&mut self, id: ObsId, state: S) {
        self.observation_nodes[id.0].particles.push(state);
    }

    pub fn visits(&self, id: ObsId) -> u32 {
        self.observation_nodes[id.0].n
    }

    pub fn value(&self, id: ObsId) -> f32 {
        self.observation_nodes[id.0].q
    }

    pub fn action_visits(&self, id: ActId) -> u32 {
        self.action_nodes[id.0].n
    }

    pub fn action_value(&self, id: ActId) -> f32 {
        self.action_nodes[id.0].q
    }

    pub fn action_child(&self, id: ObsId, action: usize) -> ActId {
        self.observation_nodes[id.0].children[action]
    }

    pub fn observation_child(&self, id: ActId, observation: usize) -> Option<ObsId> {
        self.action_nodes[id.0].children.get(&observation).copied()
    }

    pub fn add_observation_child(&mut self, id: ActId, observation: usize) -> ObsId {
        let child = self.new_observation_node();
        self.action_nodes[id.0].children.insert(observation, child);
        child
    }

    /// Incremental-mean update of an observation node
    pub fn update_observation(&mut self, id: ObsId, ret: f32) {
        let node = &mut self.observation_nodes[id.0];
        node.n += 1;
        node.q += (ret - node.q) / node.n as f32;
    }

    /// Incremental-mean update of an action node
    pub fn update_action(&mut self, id: ActId, ret: f32) {
        let node = &mut self.action_nodes[id.0];
        node.n += 1;
        node.q += (ret - node.q) / node.n as f32;
    }

    /// Pick an action at an observation node
    ///
    /// Untried actions are forced first, in stable order. Afterwards the
    /// choice maximises `Q(a)` plus, when an exploration constant is given,
    /// the UCB1 bonus `c·√(ln N / N(a))`. Forcing untried actions first
    /// guarantees `N(a) ≥ 1` on the UCB path.
    pub fn select_action(
        &mut self,
        id: ObsId,
        exploration: Option<f32>,
        tie_break: TieBreak,
    ) -> usize {
        if let Some(action) = self.observation_nodes[id.0].untried.pop_front() {
            return action;
        }

        let total = self.observation_nodes[id.0].n as f32;
        let mut best = 0;
        let mut best_value = f32::NEG_INFINITY;
        for action in 0..self.num_actions {
            let child = &self.action_nodes[self.observation_nodes[id.0].children[action].0];
            let mut value = child.q;
            if let Some(constant) = exploration {
                value += constant * (total.ln() / child.n as f32).sqrt();
            }
            let better = match tie_break {
                TieBreak::Last => value >= best_value,
                TieBreak::First => value > best_value,
            };
            if better {
                best = action;
                best_value = value;
            }
        }
        best
    }

    /// Extract the subtree under `(action, observation)` of the root into a
    /// fresh arena; the remainder of this tree is dropped. A missing subtree
    /// yields a fresh tree with an empty particle set.
    pub fn extract(mut self, action: usize, observation: usize) -> SearchTree<S> {
        let act_id = self.action_child(self.root, action);
        let target = match self.observation_child(act_id, observation) {
            Some(id) => id,
            None => return SearchTree::new(self.num_actions),
        };

        let mut fresh = SearchTree {
            observation_nodes: Vec::new(),
            action_nodes: Vec::new(),
            root: ObsId(0),
            num_actions: self.num_actions,
        };
        fresh.root = fresh.adopt_observation_subtree(&mut self, target);
        fresh
    }

    /// Move one observation node and everything below it out of `old`
    fn adopt_observation_subtree(&mut self, old: &mut SearchTree<S>, id: ObsId) -> ObsId {
        let source = &mut old.observation_nodes[id.0];
        let n = source.n;
        let q = source.q;
        let untried = std::mem::take(&mut source.untried);
        let particles = std::mem::take(&mut source.particles);
        let action_children = std::mem::take(&mut source.children);

        let new_id = ObsId(self.observation_nodes.len());
        self.observation_nodes.push(ObsNode {
            n,
            q,
            children: Vec::new(),
            untried,
            particles,
        });

        let mut children = Vec::with_capacity(action_children.len());
        for act in action_children {
            let source = &mut old.action_nodes[act.0];
            let n = source.n;
            let q = source.q;
            let observation_children = std::mem::take(&mut source.children);

            let new_act = ActId(self.action_nodes.len());
            self.action_nodes.push(ActNode {
                n,
                q,
                children: BTreeMap::new(),
            });
            children.push(new_act);

            let mut adopted = BTreeMap::new();
            for (observation, child) in observation_children {
                adopted.insert(observation, self.adopt_observation_subtree(old, child));
            }
            self.action_nodes[new_act.0].children = adopted;
        }
        self.observation_nodes[new_id.0].children = children;
        new_id
    }
}

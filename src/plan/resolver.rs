//! Dependency analysis and level scheduling.
//!
//! Steps are turned into an arena graph: nodes are indices into the step
//! slice, edges live in one `Vec` and are tombstoned instead of removed so
//! edge indices stay stable while cycles are repaired.

use super::types::{Step, StepId, ToolCategory};
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::collections::{HashMap, HashSet};
use std::fmt;
use tracing::{debug, warn};

/// Why one step must (or may) follow another
#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq, Hash)]
#[serde(rename_all = "kebab-case")]
pub enum RelationKind {
    Sequential,
    ResourceConflict,
    Data,
    Conditional,
    ParallelHint,
}

impl RelationKind {
    /// Certainty of the relation; the weakest edge of a cycle is dropped first
    pub fn weight(&self) -> f64 {
        match self {
            RelationKind::Sequential => 1.0,
            RelationKind::Data => 0.9,
            RelationKind::ResourceConflict => 0.8,
            RelationKind::Conditional => 0.5,
            RelationKind::ParallelHint => 0.1,
        }
    }

    /// Parallel hints never constrain ordering
    pub fn is_ordering(&self) -> bool {
        !matches!(self, RelationKind::ParallelHint)
    }
}

/// Edge `source -> target`: `source` has to finish before `target` starts
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct DependencyRelation {
    pub source: StepId,
    pub target: StepId,
    pub kind: RelationKind,
    pub required: bool,
    pub weight: f64,
}

/// Problems found (and repaired) while resolving a step set
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
#[serde(tag = "issue", rename_all = "snake_case")]
pub enum DependencyIssue {
    DuplicateStep {
        step_id: StepId,
    },
    MissingDependency {
        step_id: StepId,
        dependency: StepId,
    },
    SelfDependency {
        step_id: StepId,
    },
    CycleEdgeRemoved {
        source: StepId,
        target: StepId,
        kind: RelationKind,
        cycle: Vec<StepId>,
    },
    DeadlockEdgeRemoved {
        source: StepId,
        target: StepId,
        kind: RelationKind,
    },
    FlushedSteps {
        step_ids: Vec<StepId>,
    },
}

impl fmt::Display for DependencyIssue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DependencyIssue::DuplicateStep { step_id } => {
                write!(f, "duplicate step id '{}' ignored", step_id)
            }
            DependencyIssue::MissingDependency {
                step_id,
                dependency,
            } => write!(f, "step '{}' depends on unknown step '{}'", step_id, dependency),
            DependencyIssue::SelfDependency { step_id } => {
                write!(f, "step '{}' depends on itself", step_id)
            }
            DependencyIssue::CycleEdgeRemoved {
                source,
                target,
                kind,
                cycle,
            } => write!(
                f,
                "removed {:?} edge {} -> {} to break cycle [{}]",
                kind,
                source,
                target,
                cycle.join(" -> ")
            ),
            DependencyIssue::DeadlockEdgeRemoved {
                source,
                target,
                kind,
            } => write!(
                f,
                "removed {:?} edge {} -> {} to resolve deadlock",
                kind, source, target
            ),
            DependencyIssue::FlushedSteps { step_ids } => write!(
                f,
                "flushed {} unresolved steps into final level: {}",
                step_ids.len(),
                step_ids.join(", ")
            ),
        }
    }
}

/// One execution level: groups run concurrently, sequential steps one by one
#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq)]
pub struct LevelSchedule {
    pub index: usize,
    /// Every group has at least two members
    pub parallel_groups: Vec<Vec<StepId>>,
    pub sequential: Vec<StepId>,
}

impl LevelSchedule {
    pub fn step_ids(&self) -> Vec<StepId> {
        self.parallel_groups
            .iter()
            .flatten()
            .chain(self.sequential.iter())
            .cloned()
            .collect()
    }

    pub fn len(&self) -> usize {
        self.parallel_groups.iter().map(Vec::len).sum::<usize>() + self.sequential.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Full resolver output
#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq)]
pub struct ResolvedSchedule {
    pub levels: Vec<LevelSchedule>,
    /// Required dependencies that survived repair, per step
    pub effective_dependencies: HashMap<StepId, Vec<StepId>>,
    pub issues: Vec<DependencyIssue>,
}

impl ResolvedSchedule {
    pub fn execution_order(&self) -> Vec<Vec<StepId>> {
        self.levels.iter().map(LevelSchedule::step_ids).collect()
    }
}

/// Which edge families the resolver infers beyond declared dependencies
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct ResolverConfig {
    pub infer_implicit_edges: bool,
    pub infer_resource_conflicts: bool,
    pub infer_data_edges: bool,
}

impl Default for ResolverConfig {
    fn default() -> Self {
        Self {
            infer_implicit_edges: true,
            infer_resource_conflicts: true,
            infer_data_edges: true,
        }
    }
}

#[derive(Clone, Debug)]
struct Edge {
    from: usize,
    to: usize,
    kind: RelationKind,
    required: bool,
    removed: bool,
}

impl Edge {
    fn weight(&self) -> f64 {
        self.kind.weight()
    }

    /// Ordering key for "weakest": non-required first, then lower weight
    fn strength_cmp(&self, other: &Edge) -> Ordering {
        self.required.cmp(&other.required).then(
            self.weight()
                .partial_cmp(&other.weight())
                .unwrap_or(Ordering::Equal),
        )
    }
}

#[derive(Clone, Copy, PartialEq, Eq)]
enum Visit {
    New,
    Active,
    Done,
}

/// Arena graph over the (deduplicated) step slice
struct DependencyGraph<'a> {
    steps: Vec<&'a Step>,
    index: HashMap<&'a str, usize>,
    edges: Vec<Edge>,
    outgoing: Vec<Vec<usize>>,
    incoming: Vec<Vec<usize>>,
    issues: Vec<DependencyIssue>,
}

impl<'a> DependencyGraph<'a> {
    fn new(all_steps: &'a [Step]) -> Self {
        let mut steps = Vec::with_capacity(all_steps.len());
        let mut index = HashMap::new();
        let mut issues = Vec::new();

        for step in all_steps {
            if index.contains_key(step.id.as_str()) {
                issues.push(DependencyIssue::DuplicateStep {
                    step_id: step.id.clone(),
                });
                continue;
            }
            index.insert(step.id.as_str(), steps.len());
            steps.push(step);
        }

        let n = steps.len();
        Self {
            steps,
            index,
            edges: Vec::new(),
            outgoing: vec![Vec::new(); n],
            incoming: vec![Vec::new(); n],
            issues,
        }
    }

    fn id(&self, node: usize) -> &StepId {
        &self.steps[node].id
    }

    /// Add `from -> to`, merging with an existing live edge between the same
    /// nodes (the stronger kind wins)
    fn add_edge(&mut self, from: usize, to: usize, kind: RelationKind, required: bool) {
        if from == to {
            return;
        }
        let existing = self.outgoing[from]
            .iter()
            .copied()
            .find(|&e| self.edges[e].to == to && !self.edges[e].removed);
        if let Some(existing) = existing {
            let edge = &mut self.edges[existing];
            if kind.weight() > edge.kind.weight() {
                edge.kind = kind;
            }
            edge.required |= required;
            return;
        }
        let edge_index = self.edges.len();
        self.edges.push(Edge {
            from,
            to,
            kind,
            required,
            removed: false,
        });
        self.outgoing[from].push(edge_index);
        self.incoming[to].push(edge_index);
    }

    fn add_explicit_edges(&mut self) {
        for node in 0..self.steps.len() {
            let step = self.steps[node];
            for dependency in &step.dependencies {
                if *dependency == step.id {
                    self.issues.push(DependencyIssue::SelfDependency {
                        step_id: step.id.clone(),
                    });
                    continue;
                }
                match self.index.get(dependency.as_str()).copied() {
                    Some(source) => self.add_edge(source, node, RelationKind::Sequential, true),
                    None => self.issues.push(DependencyIssue::MissingDependency {
                        step_id: step.id.clone(),
                        dependency: dependency.clone(),
                    }),
                }
            }
        }
    }

    fn add_data_edges(&mut self) {
        let n = self.steps.len();
        for producer in 0..n {
            for consumer in 0..n {
                if producer != consumer
                    && intersects(&self.steps[producer].outputs, &self.steps[consumer].inputs)
                {
                    self.add_edge(producer, consumer, RelationKind::Data, true);
                }
            }
        }
    }

    fn add_resource_edges(&mut self) {
        let tags: Vec<HashSet<String>> = self
            .steps
            .iter()
            .map(|step| step.effective_resource_tags())
            .collect();
        let n = self.steps.len();
        for earlier in 0..n {
            for later in earlier + 1..n {
                if !tags[earlier].is_disjoint(&tags[later]) {
                    self.add_edge(earlier, later, RelationKind::ResourceConflict, false);
                }
            }
        }
    }

    /// Tool-ordering heuristics, inferred forward in list order only
    fn add_implicit_edges(&mut self) {
        let n = self.steps.len();
        for earlier in 0..n {
            for later in earlier + 1..n {
                if implicitly_precedes(self.steps[earlier], self.steps[later]) {
                    self.add_edge(earlier, later, RelationKind::Conditional, false);
                }
            }
        }
    }

    fn live_edges(&self) -> impl Iterator<Item = &Edge> {
        self.edges.iter().filter(|edge| !edge.removed)
    }

    fn find_cycle(&self) -> Option<Vec<usize>> {
        let mut state = vec![Visit::New; self.steps.len()];
        let mut path = Vec::new();
        for start in 0..self.steps.len() {
            if state[start] == Visit::New
                && let Some(cycle) = self.find_cycle_from(start, &mut state, &mut path)
            {
                return Some(cycle);
            }
        }
        None
    }

    fn find_cycle_from(
        &self,
        node: usize,
        state: &mut [Visit],
        path: &mut Vec<usize>,
    ) -> Option<Vec<usize>> {
        state[node] = Visit::Active;
        for &edge_index in &self.outgoing[node] {
            let edge = &self.edges[edge_index];
            if edge.removed {
                continue;
            }
            match state[edge.to] {
                Visit::Active => {
                    let start = path
                        .iter()
                        .position(|&e| self.edges[e].from == edge.to)
                        .unwrap_or(path.len());
                    let mut cycle = path[start..].to_vec();
                    cycle.push(edge_index);
                    return Some(cycle);
                }
                Visit::New => {
                    path.push(edge_index);
                    if let Some(cycle) = self.find_cycle_from(edge.to, state, path) {
                        return Some(cycle);
                    }
                    path.pop();
                }
                Visit::Done => {}
            }
        }
        state[node] = Visit::Done;
        None
    }

    /// Remove the weakest edge of every cycle until the graph is acyclic
    fn repair_cycles(&mut self) {
        while let Some(cycle) = self.find_cycle() {
            // Ties go to the later edge, i.e. the one closing the cycle
            let mut weakest = cycle[0];
            for &edge_index in &cycle[1..] {
                if self.edges[edge_index].strength_cmp(&self.edges[weakest]) != Ordering::Greater {
                    weakest = edge_index;
                }
            }
            self.edges[weakest].removed = true;

            let edge = &self.edges[weakest];
            let cycle_ids = cycle
                .iter()
                .map(|&e| self.id(self.edges[e].from).clone())
                .collect();
            let issue = DependencyIssue::CycleEdgeRemoved {
                source: self.id(edge.from).clone(),
                target: self.id(edge.to).clone(),
                kind: edge.kind,
                cycle: cycle_ids,
            };
            warn!("Dependency cycle repaired: {}", issue);
            self.issues.push(issue);
        }
    }

    /// Kahn's algorithm, one level at a time
    fn levels(&mut self) -> Vec<Vec<usize>> {
        let n = self.steps.len();
        let mut placed = vec![false; n];
        let mut remaining = n;
        let mut levels = Vec::new();

        while remaining > 0 {
            let mut ready: Vec<usize> = (0..n)
                .filter(|&node| !placed[node])
                .filter(|&node| {
                    self.incoming[node].iter().all(|&e| {
                        let edge = &self.edges[e];
                        edge.removed || placed[edge.from]
                    })
                })
                .collect();

            if ready.is_empty() {
                if self.drop_weakest_remaining_edge(&placed) {
                    continue;
                }
                let flushed: Vec<usize> = (0..n).filter(|&node| !placed[node]).collect();
                let issue = DependencyIssue::FlushedSteps {
                    step_ids: flushed.iter().map(|&node| self.id(node).clone()).collect(),
                };
                warn!("Dependency resolution deadlocked: {}", issue);
                self.issues.push(issue);
                ready = flushed;
            }

            ready.sort_by(|&a, &b| {
                self.steps[b]
                    .priority
                    .cmp(&self.steps[a].priority)
                    .then(a.cmp(&b))
            });
            for &node in &ready {
                placed[node] = true;
            }
            remaining -= ready.len();
            levels.push(ready);
        }

        levels
    }

    fn drop_weakest_remaining_edge(&mut self, placed: &[bool]) -> bool {
        let weakest = self
            .edges
            .iter()
            .enumerate()
            .filter(|(_, edge)| !edge.removed && !placed[edge.from] && !placed[edge.to])
            .min_by(|(_, a), (_, b)| a.strength_cmp(b))
            .map(|(index, _)| index);

        let Some(edge_index) = weakest else {
            return false;
        };
        self.edges[edge_index].removed = true;
        let edge = &self.edges[edge_index];
        let issue = DependencyIssue::DeadlockEdgeRemoved {
            source: self.id(edge.from).clone(),
            target: self.id(edge.to).clone(),
            kind: edge.kind,
        };
        warn!("Dependency deadlock repaired: {}", issue);
        self.issues.push(issue);
        true
    }

    fn effective_dependencies(&self) -> HashMap<StepId, Vec<StepId>> {
        (0..self.steps.len())
            .map(|node| {
                let mut sources: Vec<usize> = self.incoming[node]
                    .iter()
                    .map(|&e| &self.edges[e])
                    .filter(|edge| !edge.removed && edge.required)
                    .map(|edge| edge.from)
                    .collect();
                sources.sort_unstable();
                (
                    self.id(node).clone(),
                    sources.into_iter().map(|s| self.id(s).clone()).collect(),
                )
            })
            .collect()
    }

    fn relation(&self, edge: &Edge) -> DependencyRelation {
        DependencyRelation {
            source: self.id(edge.from).clone(),
            target: self.id(edge.to).clone(),
            kind: edge.kind,
            required: edge.required,
            weight: edge.weight(),
        }
    }
}

fn intersects(a: &[String], b: &[String]) -> bool {
    a.iter().any(|item| b.contains(item))
}

fn implicitly_precedes(earlier: &Step, later: &Step) -> bool {
    match (earlier.category(), later.category()) {
        (
            ToolCategory::FileWrite,
            ToolCategory::Shell | ToolCategory::FileRead | ToolCategory::Analysis,
        ) => earlier
            .path_parameter()
            .is_some_and(|path| later.references(path)),
        (ToolCategory::Search, ToolCategory::Analysis) => true,
        _ => false,
    }
}

/// Two steps of one level may run concurrently
pub fn can_run_together(a: &Step, b: &Step) -> bool {
    a.can_parallelize
        && b.can_parallelize
        && a.tool != b.tool
        && a.effective_resource_tags()
            .is_disjoint(&b.effective_resource_tags())
        && !intersects(&a.outputs, &b.inputs)
        && !intersects(&b.outputs, &a.inputs)
        && !intersects(&a.outputs, &b.outputs)
}

/// Builds the dependency graph of a step set and levels it
#[derive(Clone, Debug, Default)]
pub struct DependencyResolver {
    config: ResolverConfig,
}

impl DependencyResolver {
    pub fn new(config: ResolverConfig) -> Self {
        Self { config }
    }

    fn build_graph<'a>(&self, steps: &'a [Step]) -> DependencyGraph<'a> {
        let mut graph = DependencyGraph::new(steps);
        graph.add_explicit_edges();
        if self.config.infer_data_edges {
            graph.add_data_edges();
        }
        if self.config.infer_resource_conflicts {
            graph.add_resource_edges();
        }
        if self.config.infer_implicit_edges {
            graph.add_implicit_edges();
        }
        debug!(
            steps = graph.steps.len(),
            edges = graph.edges.len(),
            "Built dependency graph"
        );
        graph
    }

    /// All inferred relations, keyed by the step they constrain. Parallel
    /// hints are keyed by the later step of the pair.
    pub fn analyze_dependencies(&self, steps: &[Step]) -> HashMap<StepId, Vec<DependencyRelation>> {
        let graph = self.build_graph(steps);
        let mut relations: HashMap<StepId, Vec<DependencyRelation>> = graph
            .steps
            .iter()
            .map(|step| (step.id.clone(), Vec::new()))
            .collect();

        for edge in graph.live_edges() {
            if let Some(entry) = relations.get_mut(graph.id(edge.to)) {
                entry.push(graph.relation(edge));
            }
        }

        let n = graph.steps.len();
        for earlier in 0..n {
            for later in earlier + 1..n {
                let ordered = graph.live_edges().any(|edge| {
                    (edge.from == earlier && edge.to == later)
                        || (edge.from == later && edge.to == earlier)
                });
                if !ordered && can_run_together(graph.steps[earlier], graph.steps[later]) {
                    let hint = DependencyRelation {
                        source: graph.id(earlier).clone(),
                        target: graph.id(later).clone(),
                        kind: RelationKind::ParallelHint,
                        required: false,
                        weight: RelationKind::ParallelHint.weight(),
                    };
                    if let Some(entry) = relations.get_mut(graph.id(later)) {
                        entry.push(hint);
                    }
                }
            }
        }

        relations
    }

    /// Leveled order; every step appears exactly once
    pub fn resolve_execution_order(&self, steps: &[Step]) -> Vec<Vec<StepId>> {
        let mut graph = self.build_graph(steps);
        graph.repair_cycles();
        graph
            .levels()
            .into_iter()
            .map(|level| level.into_iter().map(|node| graph.id(node).clone()).collect())
            .collect()
    }

    /// Levels subdivided into parallel groups and sequential leftovers
    pub fn optimize_parallel_execution(&self, steps: &[Step]) -> Vec<LevelSchedule> {
        self.resolve(steps).levels
    }

    /// Issues found while building and repairing the graph
    pub fn validate(&self, steps: &[Step]) -> Vec<DependencyIssue> {
        let mut graph = self.build_graph(steps);
        graph.repair_cycles();
        graph.levels();
        graph.issues
    }

    /// Complete resolution: levels, surviving required dependencies, issues.
    /// Never fails; a degraded schedule is returned instead.
    pub fn resolve(&self, steps: &[Step]) -> ResolvedSchedule {
        let mut graph = self.build_graph(steps);
        graph.repair_cycles();
        let node_levels = graph.levels();

        let levels = node_levels
            .iter()
            .enumerate()
            .map(|(index, nodes)| {
                let members: Vec<&Step> = nodes.iter().map(|&node| graph.steps[node]).collect();
                group_level(index, &members)
            })
            .collect();

        for issue in &graph.issues {
            debug!("Dependency issue: {}", issue);
        }

        ResolvedSchedule {
            levels,
            effective_dependencies: graph.effective_dependencies(),
            issues: graph.issues.clone(),
        }
    }

    /// Prune dangling and self dependencies and break cycles among declared
    /// dependencies only, rewriting the steps in place
    pub fn break_explicit_cycles(&self, steps: &mut [Step]) -> Vec<DependencyIssue> {
        let (kept, issues) = {
            let mut graph = DependencyGraph::new(steps);
            graph.add_explicit_edges();
            graph.repair_cycles();
            let kept: HashMap<StepId, HashSet<StepId>> = (0..graph.steps.len())
                .map(|node| {
                    let sources = graph.incoming[node]
                        .iter()
                        .map(|&e| &graph.edges[e])
                        .filter(|edge| !edge.removed)
                        .map(|edge| graph.id(edge.from).clone())
                        .collect();
                    (graph.id(node).clone(), sources)
                })
                .collect();
            (kept, graph.issues)
        };

        for step in steps.iter_mut() {
            if let Some(sources) = kept.get(&step.id) {
                step.dependencies.retain(|dependency| sources.contains(dependency));
            }
        }
        issues
    }
}

/// Greedy grouping: each parallelizable step joins the first group whose
/// members it is compatible with
fn group_level(index: usize, members: &[&Step]) -> LevelSchedule {
    let mut groups: Vec<Vec<&Step>> = Vec::new();

    for &step in members.iter().filter(|step| step.can_parallelize) {
        match groups
            .iter_mut()
            .find(|group| group.iter().all(|member| can_run_together(member, step)))
        {
            Some(group) => group.push(step),
            None => groups.push(vec![step]),
        }
    }

    let parallel_groups: Vec<Vec<StepId>> = groups
        .into_iter()
        .filter(|group| group.len() >= 2)
        .map(|group| group.iter().map(|step| step.id.clone()).collect())
        .collect();
    let grouped: HashSet<&StepId> = parallel_groups.iter().flatten().collect();

    // Everything else keeps level order (priority first)
    let sequential = members
        .iter()
        .map(|step| &step.id)
        .filter(|id| !grouped.contains(id))
        .cloned()
        .collect();

    LevelSchedule {
        index,
        parallel_groups,
        sequential,
    }
}

//! Directed acyclic graph for spreadsheet dependency tracking.
//!
//! Nodes are cell coordinates. An edge `source -> target` records that the
//! formula in `source` reads `target`; range references fan out to one edge
//! per contained coordinate, so the graph only ever holds single-cell edges.
//! Every insertion runs a cycle check and is rolled back on failure, which
//! keeps the graph acyclic at all times.

use gridcalc_primitives::{CellCoordinate, CellRange};
use indexmap::{IndexMap, IndexSet};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet, VecDeque};

/// Why a formula depends on a cell.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum DependencyKind {
    /// Plain cell reference (`A1`).
    Direct,
    /// Member of a referenced range (`A1:B10`).
    Range,
    /// The formula calls a volatile function.
    Volatile,
    /// Reference supplied from outside the sheet.
    External,
}

/// The target of a dependency: one cell or a whole range.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Dependency {
    Cell(CellCoordinate),
    Range(CellRange),
}

impl Dependency {
    pub fn cell_count(&self) -> u64 {
        match self {
            Dependency::Cell(_) => 1,
            Dependency::Range(range) => range.cell_count(),
        }
    }

    fn cells(&self) -> Vec<CellCoordinate> {
        match self {
            Dependency::Cell(coord) => vec![*coord],
            Dependency::Range(range) => range.iter_rows().collect(),
        }
    }
}

impl From<CellCoordinate> for Dependency {
    fn from(coord: CellCoordinate) -> Self {
        Dependency::Cell(coord)
    }
}

impl From<CellRange> for Dependency {
    fn from(range: CellRange) -> Self {
        Dependency::Range(range)
    }
}

#[derive(Debug, Clone, Default)]
pub struct DependencyNode {
    dependencies: IndexMap<CellCoordinate, DependencyKind>,
    dependents: IndexSet<CellCoordinate>,
    is_dirty: bool,
    is_volatile: bool,
    calculation_order: Option<usize>,
}

impl DependencyNode {
    /// Cells this node reads, in insertion order.
    pub fn dependencies(&self) -> impl Iterator<Item = (CellCoordinate, DependencyKind)> + '_ {
        self.dependencies.iter().map(|(coord, kind)| (*coord, *kind))
    }

    /// Cells that read this node, in insertion order.
    pub fn dependents(&self) -> impl Iterator<Item = CellCoordinate> + '_ {
        self.dependents.iter().copied()
    }

    pub fn is_dirty(&self) -> bool {
        self.is_dirty
    }

    pub fn is_volatile(&self) -> bool {
        self.is_volatile
    }

    /// Position in the last computed calculation order.
    pub fn calculation_order(&self) -> Option<usize> {
        self.calculation_order
    }

    fn is_orphan(&self) -> bool {
        self.dependencies.is_empty() && self.dependents.is_empty() && !self.is_volatile
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum DagError {
    #[error("circular dependency detected: {}", format_cycle(.cycle))]
    CircularDependency { cycle: Vec<CellCoordinate> },
    #[error("range dependency too large: {cells} cells (max {max})")]
    RangeTooLarge { cells: u64, max: u64 },
}

fn format_cycle(cycle: &[CellCoordinate]) -> String {
    cycle
        .iter()
        .map(|c| c.to_a1())
        .collect::<Vec<_>>()
        .join(" -> ")
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct GraphStatistics {
    pub node_count: usize,
    pub edge_count: usize,
    pub dirty_count: usize,
    pub volatile_count: usize,
    /// Deepest dependency level, when a calculation order is cached.
    pub max_level: Option<usize>,
    pub order_cached: bool,
}

/// Serializable snapshot of one node.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeExport {
    pub cell: CellCoordinate,
    pub dependencies: Vec<EdgeExport>,
    pub dependents: Vec<CellCoordinate>,
    pub is_dirty: bool,
    pub is_volatile: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub calculation_order: Option<usize>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EdgeExport {
    pub target: CellCoordinate,
    pub kind: DependencyKind,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GraphExport {
    pub nodes: Vec<NodeExport>,
}

/// Cached result of the last topological sort.
#[derive(Debug, Clone)]
struct OrderCache {
    order: Vec<CellCoordinate>,
    levels: HashMap<CellCoordinate, usize>,
}

/// Edges added by one insertion, kept so a rejected insertion can be undone.
#[derive(Debug, Default)]
struct EdgeJournal {
    added: Vec<CellCoordinate>,
    created: Vec<CellCoordinate>,
}

#[derive(Debug, Clone)]
pub struct DependencyGraph {
    nodes: IndexMap<CellCoordinate, DependencyNode>,
    dirty: IndexSet<CellCoordinate>,
    volatile: IndexSet<CellCoordinate>,
    order: Option<OrderCache>,
    max_range_cells: u64,
}

impl Default for DependencyGraph {
    fn default() -> Self {
        Self {
            nodes: IndexMap::new(),
            dirty: IndexSet::new(),
            volatile: IndexSet::new(),
            order: None,
            max_range_cells: 100_000,
        }
    }
}

impl DependencyGraph {
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a graph with a custom maximum range size.
    pub fn with_max_range_cells(max_range_cells: u64) -> Self {
        Self {
            max_range_cells,
            ..Self::default()
        }
    }

    pub fn max_range_cells(&self) -> u64 {
        self.max_range_cells
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    pub fn contains(&self, coord: CellCoordinate) -> bool {
        self.nodes.contains_key(&coord)
    }

    pub fn node(&self, coord: CellCoordinate) -> Option<&DependencyNode> {
        self.nodes.get(&coord)
    }

    /// Record that `source` reads `target`.
    ///
    /// On a cycle every edge this call added is removed again and the
    /// ordered cycle path (`source ... source`) is returned. On success the
    /// cached order is dropped and `source` plus its dependents become dirty.
    pub fn add_dependency(
        &mut self,
        source: CellCoordinate,
        target: impl Into<Dependency>,
        kind: DependencyKind,
    ) -> Result<(), DagError> {
        let target = target.into();
        self.check_range_size(&target)?;

        let was_volatile = self.is_volatile(source);
        let mut journal = EdgeJournal::default();
        self.insert_edges(source, &target, kind, &mut journal);
        if kind == DependencyKind::Volatile {
            self.set_volatile(source, true);
        }

        if let Some(cycle) = self.find_cycle_from(source) {
            self.undo(source, &journal);
            self.set_volatile(source, was_volatile);
            self.prune(&journal.created);
            tracing::debug!(cell = %source, cycle = %format_cycle(&cycle), "rejected cyclic dependency");
            return Err(DagError::CircularDependency { cycle });
        }

        self.invalidate_order();
        self.mark_dirty(source, true);
        Ok(())
    }

    /// Replace every outgoing edge of `source` in one step.
    ///
    /// Either all new edges are in place afterwards, or (on a cycle or an
    /// oversized range) the previous edges are restored unchanged.
    pub fn set_dependencies(
        &mut self,
        source: CellCoordinate,
        dependencies: &[(Dependency, DependencyKind)],
    ) -> Result<(), DagError> {
        for (target, _) in dependencies {
            self.check_range_size(target)?;
        }

        let previous: Vec<(CellCoordinate, DependencyKind)> = self
            .nodes
            .get(&source)
            .map(|node| node.dependencies().collect())
            .unwrap_or_default();
        let was_volatile = self.is_volatile(source);

        self.detach(source);
        let mut journal = EdgeJournal::default();
        for (target, kind) in dependencies {
            self.insert_edges(source, target, *kind, &mut journal);
            if *kind == DependencyKind::Volatile {
                self.set_volatile(source, true);
            }
        }

        if let Some(cycle) = self.find_cycle_from(source) {
            self.detach(source);
            let mut restore = EdgeJournal::default();
            for (target, kind) in previous {
                self.insert_edges(source, &Dependency::Cell(target), kind, &mut restore);
            }
            self.set_volatile(source, was_volatile);
            self.prune(&journal.created);
            tracing::debug!(cell = %source, cycle = %format_cycle(&cycle), "rejected dependency update");
            return Err(DagError::CircularDependency { cycle });
        }

        let stale: Vec<CellCoordinate> = previous.into_iter().map(|(target, _)| target).collect();
        self.prune(&stale);
        self.invalidate_order();
        self.mark_dirty(source, true);
        Ok(())
    }

    /// Remove the edges from `source` to `target`. Returns true if any existed.
    pub fn remove_dependency(
        &mut self,
        source: CellCoordinate,
        target: impl Into<Dependency>,
    ) -> bool {
        let targets = target.into().cells();
        let mut removed = false;
        if let Some(node) = self.nodes.get_mut(&source) {
            for coord in &targets {
                removed |= node.dependencies.shift_remove(coord).is_some();
            }
        }
        for coord in &targets {
            if let Some(node) = self.nodes.get_mut(coord) {
                node.dependents.shift_remove(&source);
            }
        }
        if removed {
            self.invalidate_order();
            self.prune(&targets);
        }
        removed
    }

    /// Drop every outgoing edge of `source`, keeping its dependents.
    pub fn clear_dependencies(&mut self, source: CellCoordinate) {
        let targets: Vec<CellCoordinate> = self
            .nodes
            .get(&source)
            .map(|node| node.dependencies.keys().copied().collect())
            .unwrap_or_default();
        if targets.is_empty() {
            return;
        }
        self.detach(source);
        self.invalidate_order();
        self.prune(&targets);
    }

    /// Remove a node and every edge touching it.
    pub fn remove_cell(&mut self, coord: CellCoordinate) -> bool {
        let Some(node) = self.nodes.shift_remove(&coord) else {
            return false;
        };
        for target in node.dependencies.keys() {
            if let Some(target_node) = self.nodes.get_mut(target) {
                target_node.dependents.shift_remove(&coord);
            }
        }
        for dependent in &node.dependents {
            if let Some(dependent_node) = self.nodes.get_mut(dependent) {
                dependent_node.dependencies.shift_remove(&coord);
            }
        }
        self.dirty.swap_remove(&coord);
        self.volatile.swap_remove(&coord);
        self.invalidate_order();
        true
    }

    /// Mark a cell dirty, optionally with all its transitive dependents.
    ///
    /// Each node is visited at most once per call, so diamonds cost one visit
    /// per node. Returns the number of nodes marked.
    pub fn mark_dirty(&mut self, coord: CellCoordinate, propagate: bool) -> usize {
        if !self.nodes.contains_key(&coord) {
            return 0;
        }
        let mut visited: HashSet<CellCoordinate> = HashSet::from([coord]);
        let mut queue: VecDeque<CellCoordinate> = VecDeque::from([coord]);
        let mut marked = 0;

        while let Some(current) = queue.pop_front() {
            self.set_dirty_flag(current, true);
            marked += 1;
            if !propagate {
                break;
            }
            let Some(node) = self.nodes.get(&current) else {
                continue;
            };
            for dependent in &node.dependents {
                if visited.insert(*dependent) {
                    queue.push_back(*dependent);
                }
            }
        }
        marked
    }

    pub fn mark_clean(&mut self, coord: CellCoordinate) {
        self.set_dirty_flag(coord, false);
    }

    pub fn is_dirty(&self, coord: CellCoordinate) -> bool {
        self.dirty.contains(&coord)
    }

    pub fn dirty_cells(&self) -> Vec<CellCoordinate> {
        self.dirty.iter().copied().collect()
    }

    /// Flag or unflag a cell as volatile (recalculated on every pass).
    pub fn set_volatile(&mut self, coord: CellCoordinate, volatile: bool) {
        if volatile {
            self.nodes.entry(coord).or_default().is_volatile = true;
            self.volatile.insert(coord);
        } else {
            if let Some(node) = self.nodes.get_mut(&coord) {
                node.is_volatile = false;
            }
            self.volatile.swap_remove(&coord);
            self.prune(&[coord]);
        }
    }

    pub fn is_volatile(&self, coord: CellCoordinate) -> bool {
        self.volatile.contains(&coord)
    }

    pub fn volatile_cells(&self) -> Vec<CellCoordinate> {
        self.volatile.iter().copied().collect()
    }

    /// Mark every volatile cell and its dependents dirty.
    pub fn mark_volatile_dirty(&mut self) -> usize {
        let volatile = self.volatile_cells();
        volatile
            .into_iter()
            .map(|coord| self.mark_dirty(coord, true))
            .sum()
    }

    /// Direct dependencies of `coord` (cells it reads).
    pub fn dependencies_of(&self, coord: CellCoordinate) -> Vec<CellCoordinate> {
        self.nodes
            .get(&coord)
            .map(|node| node.dependencies.keys().copied().collect())
            .unwrap_or_default()
    }

    /// Direct dependents of `coord` (cells that read it).
    pub fn dependents_of(&self, coord: CellCoordinate) -> Vec<CellCoordinate> {
        self.nodes
            .get(&coord)
            .map(|node| node.dependents.iter().copied().collect())
            .unwrap_or_default()
    }

    /// Every cell that reads `coord` directly or indirectly, breadth first.
    pub fn transitive_dependents(&self, coord: CellCoordinate) -> Vec<CellCoordinate> {
        let mut visited: HashSet<CellCoordinate> = HashSet::from([coord]);
        let mut queue: VecDeque<CellCoordinate> = VecDeque::from([coord]);
        let mut out = Vec::new();
        while let Some(current) = queue.pop_front() {
            for dependent in self.dependents_of(current) {
                if visited.insert(dependent) {
                    out.push(dependent);
                    queue.push_back(dependent);
                }
            }
        }
        out
    }

    /// Every node in dependency order (dependencies before dependents).
    ///
    /// Kahn's algorithm; ties are broken by node insertion order. The result
    /// is cached until the edge set changes.
    pub fn calculation_order(&mut self) -> Result<Vec<CellCoordinate>, DagError> {
        Ok(self.ensure_order()?.order.clone())
    }

    /// Nodes grouped by dependency depth. Cells within one level never read
    /// each other.
    pub fn calculation_levels(&mut self) -> Result<Vec<Vec<CellCoordinate>>, DagError> {
        let cache = self.ensure_order()?;
        Ok(group_by_level(&cache.order, &cache.levels))
    }

    /// Dirty cells in calculation order, followed by volatile cells not
    /// already included.
    pub fn recalculation_plan(&mut self) -> Result<Vec<CellCoordinate>, DagError> {
        let order = self.ensure_order()?.order.clone();
        let mut plan: Vec<CellCoordinate> = order
            .into_iter()
            .filter(|coord| self.dirty.contains(coord))
            .collect();
        let included: HashSet<CellCoordinate> = plan.iter().copied().collect();
        plan.extend(
            self.volatile
                .iter()
                .filter(|coord| !included.contains(*coord))
                .copied(),
        );
        Ok(plan)
    }

    /// The recalculation plan split into dependency levels.
    pub fn recalculation_batches(&mut self) -> Result<Vec<Vec<CellCoordinate>>, DagError> {
        let plan = self.recalculation_plan()?;
        let cache = self.ensure_order()?;
        Ok(group_by_level(&plan, &cache.levels))
    }

    /// All `(source, target)` edges.
    pub fn edges(&self) -> BTreeSet<(CellCoordinate, CellCoordinate)> {
        self.nodes
            .iter()
            .flat_map(|(source, node)| node.dependencies.keys().map(move |target| (*source, *target)))
            .collect()
    }

    pub fn statistics(&self) -> GraphStatistics {
        GraphStatistics {
            node_count: self.nodes.len(),
            edge_count: self.nodes.values().map(|n| n.dependencies.len()).sum(),
            dirty_count: self.dirty.len(),
            volatile_count: self.volatile.len(),
            max_level: self
                .order
                .as_ref()
                .and_then(|cache| cache.levels.values().copied().max()),
            order_cached: self.order.is_some(),
        }
    }

    pub fn clear(&mut self) {
        self.nodes.clear();
        self.dirty.clear();
        self.volatile.clear();
        self.order = None;
    }

    pub fn export(&self) -> GraphExport {
        GraphExport {
            nodes: self
                .nodes
                .iter()
                .map(|(cell, node)| NodeExport {
                    cell: *cell,
                    dependencies: node
                        .dependencies()
                        .map(|(target, kind)| EdgeExport { target, kind })
                        .collect(),
                    dependents: node.dependents().collect(),
                    is_dirty: node.is_dirty,
                    is_volatile: node.is_volatile,
                    calculation_order: node.calculation_order,
                })
                .collect(),
        }
    }

    /// Serialize the graph to JSON.
    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(&self.export())
    }

    /// Rebuild a graph from an export and validate acyclicity.
    pub fn from_export(export: GraphExport) -> Result<Self, DagError> {
        let mut graph = Self::new();
        for node in &export.nodes {
            graph.nodes.entry(node.cell).or_default();
        }
        for node in export.nodes {
            let mut journal = EdgeJournal::default();
            for edge in node.dependencies {
                graph.insert_edges(node.cell, &Dependency::Cell(edge.target), edge.kind, &mut journal);
            }
            if node.is_dirty {
                graph.set_dirty_flag(node.cell, true);
            }
            if node.is_volatile {
                graph.set_volatile(node.cell, true);
            }
        }
        graph.ensure_order()?;
        Ok(graph)
    }

    fn check_range_size(&self, target: &Dependency) -> Result<(), DagError> {
        let cells = target.cell_count();
        if cells > self.max_range_cells {
            return Err(DagError::RangeTooLarge {
                cells,
                max: self.max_range_cells,
            });
        }
        Ok(())
    }

    fn insert_edges(
        &mut self,
        source: CellCoordinate,
        target: &Dependency,
        kind: DependencyKind,
        journal: &mut EdgeJournal,
    ) {
        if !self.nodes.contains_key(&source) {
            self.nodes.insert(source, DependencyNode::default());
            journal.created.push(source);
        }
        for coord in target.cells() {
            if !self.nodes.contains_key(&coord) {
                self.nodes.insert(coord, DependencyNode::default());
                journal.created.push(coord);
            }
            let Some(node) = self.nodes.get_mut(&source) else {
                continue;
            };
            if node.dependencies.contains_key(&coord) {
                continue;
            }
            node.dependencies.insert(coord, kind);
            if let Some(target_node) = self.nodes.get_mut(&coord) {
                target_node.dependents.insert(source);
            }
            journal.added.push(coord);
        }
    }

    fn undo(&mut self, source: CellCoordinate, journal: &EdgeJournal) {
        if let Some(node) = self.nodes.get_mut(&source) {
            for coord in &journal.added {
                node.dependencies.shift_remove(coord);
            }
        }
        for coord in &journal.added {
            if let Some(node) = self.nodes.get_mut(coord) {
                node.dependents.shift_remove(&source);
            }
        }
    }

    /// Remove every outgoing edge of `source` without pruning.
    fn detach(&mut self, source: CellCoordinate) {
        let Some(node) = self.nodes.get_mut(&source) else {
            return;
        };
        let targets: Vec<CellCoordinate> = node.dependencies.drain(..).map(|(coord, _)| coord).collect();
        for coord in targets {
            if let Some(target_node) = self.nodes.get_mut(&coord) {
                target_node.dependents.shift_remove(&source);
            }
        }
    }

    /// Drop candidates left with no edges and no volatility.
    fn prune(&mut self, candidates: &[CellCoordinate]) {
        for coord in candidates {
            let orphan = self.nodes.get(coord).is_some_and(DependencyNode::is_orphan);
            if orphan {
                self.nodes.shift_remove(coord);
                self.dirty.swap_remove(coord);
                self.invalidate_order();
            }
        }
    }

    fn set_dirty_flag(&mut self, coord: CellCoordinate, dirty: bool) {
        if let Some(node) = self.nodes.get_mut(&coord) {
            node.is_dirty = dirty;
        }
        if dirty {
            self.dirty.insert(coord);
        } else {
            self.dirty.swap_remove(&coord);
        }
    }

    fn invalidate_order(&mut self) {
        self.order = None;
    }

    /// Depth-first search along dependencies looking for a path back onto
    /// the current stack.
    fn find_cycle_from(&self, start: CellCoordinate) -> Option<Vec<CellCoordinate>> {
        // 1 = on the current path, 2 = fully explored
        let mut state: HashMap<CellCoordinate, u8> = HashMap::from([(start, 1)]);
        let mut stack: Vec<(CellCoordinate, usize)> = vec![(start, 0)];

        while let Some(&(current, idx)) = stack.last() {
            let next = self
                .nodes
                .get(&current)
                .and_then(|node| node.dependencies.get_index(idx))
                .map(|(coord, _)| *coord);

            let Some(next) = next else {
                state.insert(current, 2);
                stack.pop();
                continue;
            };
            if let Some(top) = stack.last_mut() {
                top.1 += 1;
            }

            match state.get(&next).copied() {
                Some(1) => {
                    let begin = stack.iter().position(|(coord, _)| *coord == next)?;
                    let mut cycle: Vec<CellCoordinate> =
                        stack[begin..].iter().map(|(coord, _)| *coord).collect();
                    cycle.push(next);
                    return Some(cycle);
                }
                Some(_) => {}
                None => {
                    state.insert(next, 1);
                    stack.push((next, 0));
                }
            }
        }
        None
    }

    fn ensure_order(&mut self) -> Result<&OrderCache, DagError> {
        let cache = match self.order.take() {
            Some(cache) => cache,
            None => {
                let cache = self.topological_sort()?;
                for (idx, coord) in cache.order.iter().enumerate() {
                    if let Some(node) = self.nodes.get_mut(coord) {
                        node.calculation_order = Some(idx);
                    }
                }
                tracing::trace!(nodes = cache.order.len(), "computed calculation order");
                cache
            }
        };
        Ok(self.order.insert(cache))
    }

    fn topological_sort(&self) -> Result<OrderCache, DagError> {
        let mut in_degree: IndexMap<CellCoordinate, usize> = self
            .nodes
            .iter()
            .map(|(coord, node)| (*coord, node.dependencies.len()))
            .collect();
        let mut queue: VecDeque<CellCoordinate> = in_degree
            .iter()
            .filter(|(_, degree)| **degree == 0)
            .map(|(coord, _)| *coord)
            .collect();
        let mut levels: HashMap<CellCoordinate, usize> = HashMap::new();
        let mut order = Vec::with_capacity(self.nodes.len());

        while let Some(current) = queue.pop_front() {
            let level = levels.get(&current).copied().unwrap_or(0);
            levels.insert(current, level);
            order.push(current);

            let Some(node) = self.nodes.get(&current) else {
                continue;
            };
            for dependent in &node.dependents {
                let Some(degree) = in_degree.get_mut(dependent) else {
                    continue;
                };
                *degree -= 1;
                let entry = levels.entry(*dependent).or_insert(0);
                *entry = (*entry).max(level + 1);
                if *degree == 0 {
                    queue.push_back(*dependent);
                }
            }
        }

        if order.len() != self.nodes.len() {
            let cycle = in_degree
                .into_iter()
                .filter(|(_, degree)| *degree > 0)
                .map(|(coord, _)| coord)
                .collect();
            return Err(DagError::CircularDependency { cycle });
        }
        Ok(OrderCache { order, levels })
    }
}

fn group_by_level(
    cells: &[CellCoordinate],
    levels: &HashMap<CellCoordinate, usize>,
) -> Vec<Vec<CellCoordinate>> {
    let mut grouped: BTreeMap<usize, Vec<CellCoordinate>> = BTreeMap::new();
    for coord in cells {
        let level = levels.get(coord).copied().unwrap_or(0);
        grouped.entry(level).or_default().push(*coord);
    }
    grouped.into_values().collect()
}

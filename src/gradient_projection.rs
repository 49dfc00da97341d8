//! Path-based gradient projection with lazy column generation.
//!
//! Every main iteration visits each origin, builds a shortest-path tree under the
//! current link costs, and for each of its destinations
//!
//! 1. adds the tree path as a new column when it undercuts every known path,
//! 2. shifts flow from costlier paths onto the cheapest one with a Newton-scaled,
//!    line-searched step, and
//! 3. refreshes the cost of touched links only.

use std::collections::HashSet;

use log::debug;
use nalgebra::DMatrix;
use serde::Serialize;

use crate::error::{Result, TapError};
use crate::network::{Graph, Network};
use crate::options::SolverConfig;
use crate::paths::PathSet;
use crate::shortest_path::ShortestPathTree;
use crate::solving::Algorithm;

/// Work counters accumulated over one main iteration.
#[derive(Clone, Debug, Default, PartialEq, Serialize)]
pub struct ShiftStatistics {
    /// Total flow moved between paths.
    pub flow_shifted: f64,
    /// Number of donor paths that gave up flow.
    pub path_changes: usize,
    /// Columns added by column generation.
    pub columns_added: usize,
    /// Paths removed after the solve.
    pub paths_dropped: usize,
    /// Paths held across all OD pairs after the iteration.
    pub path_count: usize,
    /// Largest relative cost excess of a flow-carrying path seen during the iteration.
    pub max_path_gap: f64,
    /// OD pairs visited.
    pub od_updates: usize,
}

impl ShiftStatistics {
    /// Mean flow moved per visited OD pair.
    pub fn average_flow_change(&self) -> f64 {
        if self.od_updates == 0 {
            0.0
        } else {
            self.flow_shifted / self.od_updates as f64
        }
    }
}

/// One class's flow column inside a links-by-classes decomposition.
pub(crate) struct ClassColumn<'a> {
    pub matrix: &'a mut DMatrix<f64>,
    pub class: usize,
}

/// A donor path and its Newton step toward the cheapest path.
struct Move {
    index: usize,
    flow: f64,
    excess: f64,
    newton: f64,
    /// Links on the donor path only.
    removed: Vec<usize>,
    /// Links on the cheapest path only.
    added: Vec<usize>,
}

/// Equilibration of one OD pair for one class.
///
/// Link costs are read at aggregate flow; `toll_weight` selects the class's
/// perception of fixed tolls.
pub(crate) struct OdUpdate<'a> {
    graph: &'a mut Graph,
    paths: &'a mut PathSet,
    demand: f64,
    toll_weight: f64,
    column: Option<ClassColumn<'a>>,
}

impl<'a> OdUpdate<'a> {
    pub fn new(graph: &'a mut Graph, paths: &'a mut PathSet, demand: f64, toll_weight: f64) -> Self {
        Self {
            graph,
            paths,
            demand,
            toll_weight,
            column: None,
        }
    }

    pub fn with_column(mut self, column: ClassColumn<'a>) -> Self {
        self.column = Some(column);
        self
    }

    fn shift(&mut self, links: &[usize], delta: f64) {
        self.graph.shift_flow(links, delta);
        if let Some(column) = self.column.as_mut() {
            for &link in links {
                let entry = &mut column.matrix[(link, column.class)];
                *entry = (*entry + delta).max(0.0);
            }
        }
    }

    fn refresh_path_costs(&mut self) {
        for path in self.paths.paths_mut() {
            let cost = self.graph.path_cost(path.links(), self.toll_weight);
            path.set_cost(cost);
        }
    }

    fn local_potential(&self, links: &[usize]) -> f64 {
        links
            .iter()
            .map(|&link| self.graph.link_potential(link, self.toll_weight))
            .sum()
    }

    /// All-or-nothing: the whole demand on `links`. Only valid on an empty path set.
    pub fn seed(&mut self, links: Vec<usize>) {
        debug_assert!(self.paths.is_empty());
        let (index, _) = self.paths.insert(links, self.demand);
        let links = self.paths.paths_mut()[index].links().to_vec();
        self.shift(&links, self.demand);
    }

    /// Adds `links` as a zero-flow column when it is new and strictly cheaper than
    /// every known path. Returns whether the path set grew.
    pub fn generate_column(&mut self, links: Vec<usize>, tolerance: f64) -> bool {
        if self.paths.find(&links).is_some() {
            return false;
        }
        if self.paths.is_empty() {
            self.seed(links);
            return true;
        }
        self.refresh_path_costs();
        let Some((_, current)) = self.paths.min_cost() else {
            return false;
        };
        let cost = self.graph.path_cost(&links, self.toll_weight);
        if cost < current - tolerance {
            self.paths.insert(links, 0.0);
            true
        } else {
            false
        }
    }

    /// Moves flow toward the cheapest path until the OD pair is balanced or the
    /// inner pass bound is hit. Returns the number of line-search trials.
    pub fn equilibrate(
        &mut self,
        config: &SolverConfig,
        step: &mut f64,
        stats: &mut ShiftStatistics,
    ) -> usize {
        let options = &config.gradient;
        let mut trials = 0;

        for inner in 0..config.max_inner_iterations.max(1) {
            self.refresh_path_costs();
            let Some((best, min_cost)) = self.paths.min_cost() else {
                break;
            };
            let moves = self.moves(best, min_cost, options.balance_tolerance);
            if moves.is_empty() {
                break;
            }

            let max_excess = moves.iter().map(|m| m.excess).fold(0.0, f64::max);
            let relative = if min_cost > 0.0 {
                max_excess / min_cost
            } else {
                max_excess
            };
            stats.max_path_gap = stats.max_path_gap.max(relative);
            if inner > 0 && relative < options.inner_convergence {
                break;
            }

            trials += self.line_search(best, &moves, config, step, stats);
        }
        trials
    }

    fn moves(&self, best: usize, min_cost: f64, balance_tolerance: f64) -> Vec<Move> {
        let target_links = self.paths.get(best).map_or(&[][..], |path| path.links());
        let target: HashSet<usize> = target_links.iter().copied().collect();

        self.paths
            .iter()
            .enumerate()
            .filter(|(index, path)| {
                *index != best && path.flow() > 0.0 && path.cost() - min_cost > balance_tolerance
            })
            .map(|(index, path)| {
                let donor: HashSet<usize> = path.links().iter().copied().collect();
                let removed: Vec<usize> = path
                    .links()
                    .iter()
                    .copied()
                    .filter(|link| !target.contains(link))
                    .collect();
                let added: Vec<usize> = target_links
                    .iter()
                    .copied()
                    .filter(|link| !donor.contains(link))
                    .collect();
                let curvature: f64 = removed
                    .iter()
                    .chain(added.iter())
                    .map(|&link| self.graph.link_cost_derivative(link))
                    .sum();
                let excess = path.cost() - min_cost;
                let newton = if curvature > f64::EPSILON {
                    excess / curvature
                } else {
                    f64::INFINITY
                };
                Move {
                    index,
                    flow: path.flow(),
                    excess,
                    newton,
                    removed,
                    added,
                }
            })
            .collect()
    }

    /// Applies the moves with a shrinking step until the local potential does not
    /// increase; the last trial is kept regardless.
    fn line_search(
        &mut self,
        best: usize,
        moves: &[Move],
        config: &SolverConfig,
        step: &mut f64,
        stats: &mut ShiftStatistics,
    ) -> usize {
        let options = &config.gradient;
        let mut touched: Vec<usize> = moves
            .iter()
            .flat_map(|m| m.removed.iter().chain(m.added.iter()).copied())
            .collect();
        touched.sort_unstable();
        touched.dedup();

        let saved_links: Vec<f64> = touched.iter().map(|&l| self.graph.flows()[l]).collect();
        let saved_column: Option<Vec<f64>> = self.column.as_ref().map(|column| {
            touched
                .iter()
                .map(|&l| column.matrix[(l, column.class)])
                .collect()
        });
        let saved_paths: Vec<f64> = self.paths.iter().map(|path| path.flow()).collect();
        let base = self.local_potential(&touched);

        let mut trial = 0;
        loop {
            trial += 1;
            let mut shifted = 0.0;
            for m in moves {
                let delta = (*step * m.newton).min(m.flow);
                if delta <= 0.0 {
                    continue;
                }
                let paths = self.paths.paths_mut();
                paths[m.index].set_flow(m.flow - delta);
                let target = paths[best].flow() + delta;
                paths[best].set_flow(target);
                self.shift(&m.removed, -delta);
                self.shift(&m.added, delta);
                shifted += delta;
            }

            let improved = self.local_potential(&touched) <= base;
            if improved || trial >= config.max_line_search_iterations {
                if improved && trial == 1 {
                    *step = (*step * options.step_growth).min(1.0);
                }
                stats.flow_shifted += shifted;
                stats.path_changes += moves.len();
                return trial;
            }

            for (position, &link) in touched.iter().enumerate() {
                self.graph.set_link_flow(link, saved_links[position]);
            }
            if let (Some(column), Some(saved)) = (self.column.as_mut(), saved_column.as_ref()) {
                for (position, &link) in touched.iter().enumerate() {
                    column.matrix[(link, column.class)] = saved[position];
                }
            }
            for (path, &flow) in self.paths.paths_mut().iter_mut().zip(saved_paths.iter()) {
                path.set_flow(flow);
            }
            *step *= options.step_shrink;
        }
    }

    /// Removes paths carrying less than `epsilon` and hands their flow to the
    /// cheapest survivor. Returns the number of removed paths.
    pub fn drop_paths(&mut self, epsilon: f64) -> usize {
        if !self.paths.iter().any(|path| path.flow() >= epsilon) {
            return 0;
        }
        let removed = self.paths.retain(|path| path.flow() >= epsilon);
        let count = removed.len();
        let residual: Vec<_> = removed.into_iter().filter(|path| path.flow() > 0.0).collect();

        if !residual.is_empty() {
            self.refresh_path_costs();
            if let Some((best, _)) = self.paths.min_cost() {
                let target = self.paths.paths_mut()[best].links().to_vec();
                for path in residual {
                    let flow = path.flow();
                    let paths = self.paths.paths_mut();
                    let total = paths[best].flow() + flow;
                    paths[best].set_flow(total);
                    self.shift(path.links(), -flow);
                    self.shift(&target, flow);
                }
            }
        }
        count
    }
}

/// Single-class gradient projection (the iGP scheme).
#[derive(Clone, Debug)]
pub struct GradientProjection {
    step: f64,
    statistics: ShiftStatistics,
}

impl Default for GradientProjection {
    fn default() -> Self {
        Self::new()
    }
}

impl GradientProjection {
    pub fn new() -> Self {
        Self {
            step: 1.0,
            statistics: ShiftStatistics::default(),
        }
    }

    /// Counters of the most recent main iteration.
    pub fn statistics(&self) -> &ShiftStatistics {
        &self.statistics
    }

    /// Current adaptive step size.
    pub fn step_size(&self) -> f64 {
        self.step
    }

    /// Column generation and flow redistribution for one OD pair.
    ///
    /// `tree` must be rooted at the pair's origin. Returns the number of
    /// line-search trials spent.
    ///
    /// # Errors
    ///
    /// Returns [`TapError::InfeasiblePath`] if the destination is unreachable.
    pub fn update_path_flow_lazy(
        &mut self,
        network: &mut Network,
        tree: &ShortestPathTree,
        od_index: usize,
        config: &SolverConfig,
    ) -> Result<usize> {
        let toll_weight = network.graph().cost_model().toll_weight(1.0);
        let (graph, od_pairs) = network.split_mut();
        let od = &mut od_pairs[od_index];
        let demand = od.demand();
        if demand <= 0.0 {
            return Ok(0);
        }
        let links = tree
            .path_to(graph, od.destination())
            .ok_or(TapError::InfeasiblePath {
                origin: tree.origin(),
                destination: od.destination(),
            })?;

        let mut update = OdUpdate::new(graph, od.paths_mut(), demand, toll_weight);
        if update.generate_column(links, config.gradient.column_tolerance) {
            self.statistics.columns_added += 1;
        }
        self.statistics.od_updates += 1;
        Ok(update.equilibrate(config, &mut self.step, &mut self.statistics))
    }
}

impl Algorithm for GradientProjection {
    fn name(&self) -> &str {
        "gradient projection"
    }

    fn pre_process(&mut self, network: &mut Network, config: &SolverConfig) -> Result<()> {
        if config.reset_on_solve {
            network.clear_assignment();
        }
        let toll_weight = network.graph().cost_model().toll_weight(1.0);
        let mut infeasible = None;

        for o in 0..network.origins().len() {
            let origin = network.origins()[o].clone();
            let tree = network.graph().shortest_path_tree(origin.node(), toll_weight);
            let (graph, od_pairs) = network.split_mut();
            for od in &mut od_pairs[origin.range()] {
                if od.demand() <= 0.0 || !od.paths().is_empty() {
                    continue;
                }
                match tree.path_to(graph, od.destination()) {
                    Some(links) => {
                        let demand = od.demand();
                        OdUpdate::new(graph, od.paths_mut(), demand, toll_weight).seed(links);
                    }
                    None => {
                        infeasible.get_or_insert(TapError::InfeasiblePath {
                            origin: od.origin(),
                            destination: od.destination(),
                        });
                    }
                }
            }
        }

        match infeasible {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }

    fn initialize(&mut self, network: &mut Network, config: &SolverConfig) -> Result<()> {
        self.step = config.gradient.initial_step;
        self.statistics = ShiftStatistics::default();
        network.rebuild_link_flows();
        Ok(())
    }

    fn main_loop(&mut self, network: &mut Network, config: &SolverConfig) -> Result<usize> {
        self.statistics = ShiftStatistics::default();
        let toll_weight = network.graph().cost_model().toll_weight(1.0);
        let mut trials = 0;

        for o in 0..network.origins().len() {
            let origin = network.origins()[o].clone();
            let tree = network.graph().shortest_path_tree(origin.node(), toll_weight);
            for od_index in origin.range() {
                trials += self.update_path_flow_lazy(network, &tree, od_index, config)?;
            }
        }

        self.statistics.path_count = network.path_count();
        debug!(
            "shifted {:.6} over {} paths ({} new columns, {} paths, step {:.3}, max gap {:.3e})",
            self.statistics.flow_shifted,
            self.statistics.path_changes,
            self.statistics.columns_added,
            self.statistics.path_count,
            self.step,
            self.statistics.max_path_gap
        );
        Ok(trials)
    }

    fn post_process(&mut self, network: &mut Network, config: &SolverConfig) -> Result<()> {
        let toll_weight = network.graph().cost_model().toll_weight(1.0);
        let epsilon = config.gradient.path_drop_epsilon;
        let (graph, od_pairs) = network.split_mut();
        let mut dropped = 0;
        for od in od_pairs.iter_mut() {
            let demand = od.demand();
            dropped += OdUpdate::new(graph, od.paths_mut(), demand, toll_weight).drop_paths(epsilon);
        }
        self.statistics.paths_dropped = dropped;
        self.statistics.path_count = network.path_count();
        debug!("dropped {dropped} paths below {epsilon:e}");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::network::{Link, NetworkBuilder};
    use crate::options::{CostModel, LinkCostType};
    use approx::assert_relative_eq;

    /// Two parallel links, `10 + 0.1 x` and `15 + 0.1 x`; equilibrium at 75/25.
    fn parallel_links() -> Network {
        NetworkBuilder::new(2)
            .link(Link::new(0, 1, 10.0, 100.0).with_alpha(1.0))
            .link(Link::new(0, 1, 15.0, 150.0).with_alpha(1.0))
            .demand(0, 1, 100.0)
            .cost_model(CostModel {
                link_type: LinkCostType::Linear,
                ..CostModel::default()
            })
            .build()
            .unwrap()
    }

    #[test]
    fn newton_shift_balances_linear_routes_in_one_pass() {
        let mut network = parallel_links();
        let config = SolverConfig::default();
        let mut step = 1.0;
        let mut stats = ShiftStatistics::default();

        let (graph, od_pairs) = network.split_mut();
        let mut update = OdUpdate::new(graph, od_pairs[0].paths_mut(), 100.0, 0.0);
        update.seed(vec![0]);
        assert!(update.generate_column(vec![1], 1e-12));
        let trials = update.equilibrate(&config, &mut step, &mut stats);
        assert_eq!(trials, 1);

        let paths = network.od_pair(0).paths();
        assert_relative_eq!(paths.get(0).unwrap().flow(), 75.0, epsilon = 1e-9);
        assert_relative_eq!(paths.get(1).unwrap().flow(), 25.0, epsilon = 1e-9);
        assert_relative_eq!(network.graph().flows()[0], 75.0, epsilon = 1e-9);
        assert_relative_eq!(stats.flow_shifted, 25.0, epsilon = 1e-9);
        assert_eq!(stats.path_changes, 1);
    }

    #[test]
    fn column_is_added_only_when_strictly_cheaper() {
        let mut network = parallel_links();
        let (graph, od_pairs) = network.split_mut();
        let mut update = OdUpdate::new(graph, od_pairs[0].paths_mut(), 100.0, 0.0);
        update.seed(vec![1]);
        // Route 0 costs 10 at zero flow, route 1 costs 25 loaded: route 0 helps.
        assert!(update.generate_column(vec![0], 1e-12));
        // Identical link sequences are never duplicated.
        assert!(!update.generate_column(vec![0], 1e-12));
        assert_eq!(network.od_pair(0).paths().len(), 2);

        let mut network = parallel_links();
        let (graph, od_pairs) = network.split_mut();
        let mut update = OdUpdate::new(graph, od_pairs[0].paths_mut(), 100.0, 0.0);
        update.seed(vec![0]);
        // Route 1 at 15 undercuts route 0 at 20, but not by the demanded margin.
        assert!(!update.generate_column(vec![1], 10.0));
        assert_eq!(network.od_pair(0).paths().len(), 1);
    }

    #[test]
    fn balanced_paths_do_not_move() {
        let mut network = parallel_links();
        let config = SolverConfig::default();
        let mut step = 1.0;
        let mut stats = ShiftStatistics::default();
        {
            let (_, od_pairs) = network.split_mut();
            od_pairs[0].paths_mut().insert(vec![0], 75.0);
            od_pairs[0].paths_mut().insert(vec![1], 25.0);
        }
        network.rebuild_link_flows();

        let (graph, od_pairs) = network.split_mut();
        let trials = OdUpdate::new(graph, od_pairs[0].paths_mut(), 100.0, 0.0).equilibrate(
            &config,
            &mut step,
            &mut stats,
        );
        assert_eq!(trials, 0);
        assert_eq!(stats.flow_shifted, 0.0);
        assert_eq!(network.od_pair(0).paths().get(0).unwrap().flow(), 75.0);
    }

    #[test]
    fn dropped_paths_hand_flow_to_cheapest_survivor() {
        let mut network = parallel_links();
        {
            let (_, od_pairs) = network.split_mut();
            od_pairs[0].paths_mut().insert(vec![0], 100.0 - 1e-12);
            od_pairs[0].paths_mut().insert(vec![1], 1e-12);
        }
        network.rebuild_link_flows();

        let (graph, od_pairs) = network.split_mut();
        let dropped = OdUpdate::new(graph, od_pairs[0].paths_mut(), 100.0, 0.0).drop_paths(1e-10);
        assert_eq!(dropped, 1);
        let paths = network.od_pair(0).paths();
        assert_eq!(paths.len(), 1);
        assert_relative_eq!(paths.total_flow(), 100.0, epsilon = 1e-12);
        assert_relative_eq!(network.graph().flows()[1], 0.0, epsilon = 1e-12);
    }

    #[test]
    fn unused_columns_are_dropped_and_counted() {
        let mut network = parallel_links();
        {
            let (_, od_pairs) = network.split_mut();
            od_pairs[0].paths_mut().insert(vec![0], 100.0);
            od_pairs[0].paths_mut().insert(vec![1], 0.0);
        }
        network.rebuild_link_flows();

        let (graph, od_pairs) = network.split_mut();
        let dropped = OdUpdate::new(graph, od_pairs[0].paths_mut(), 100.0, 0.0).drop_paths(1e-10);
        assert_eq!(dropped, 1);
        let paths = network.od_pair(0).paths();
        assert_eq!(paths.len(), 1);
        assert_eq!(paths.get(0).unwrap().links(), &[0]);
        assert_relative_eq!(paths.total_flow(), 100.0, epsilon = 1e-12);
        assert_relative_eq!(network.graph().flows()[0], 100.0, epsilon = 1e-12);
    }

    /// A loaded linear link `10 + 0.1 x` next to a short BPR link with capacity 10.
    /// The Newton step of 190 badly overshoots: full and half steps raise the
    /// potential, a quarter step lowers it.
    fn overshooting_links() -> Network {
        NetworkBuilder::new(2)
            .link(Link::new(0, 1, 10.0, 100.0).with_alpha(1.0).with_beta(1.0))
            .link(Link::new(0, 1, 1.0, 10.0))
            .demand(0, 1, 100.0)
            .build()
            .unwrap()
    }

    #[test]
    fn rejected_trials_restore_flows_and_shrink_the_step() {
        let mut network = overshooting_links();
        let config = SolverConfig::default().with_max_inner_iterations(1);
        let mut step = 1.0;
        let mut stats = ShiftStatistics::default();
        let mut matrix = DMatrix::zeros(2, 1);

        let (graph, od_pairs) = network.split_mut();
        let mut update = OdUpdate::new(graph, od_pairs[0].paths_mut(), 100.0, 0.0)
            .with_column(ClassColumn { matrix: &mut matrix, class: 0 });
        update.seed(vec![0]);
        assert!(update.generate_column(vec![1], 1e-12));
        let trials = update.equilibrate(&config, &mut step, &mut stats);

        assert_eq!(trials, 3);
        assert_relative_eq!(step, 0.25);
        assert_relative_eq!(stats.flow_shifted, 47.5, epsilon = 1e-9);
        let paths = network.od_pair(0).paths();
        assert_relative_eq!(paths.get(0).unwrap().flow(), 52.5, epsilon = 1e-9);
        assert_relative_eq!(paths.get(1).unwrap().flow(), 47.5, epsilon = 1e-9);
        assert_relative_eq!(paths.total_flow(), 100.0, epsilon = 1e-9);
        assert_relative_eq!(network.graph().flows()[0], 52.5, epsilon = 1e-9);
        assert_relative_eq!(network.graph().flows()[1], 47.5, epsilon = 1e-9);
        // Only the accepted trial is left in the class column.
        assert_relative_eq!(matrix[(0, 0)], 52.5, epsilon = 1e-9);
        assert_relative_eq!(matrix[(1, 0)], 47.5, epsilon = 1e-9);
    }

    #[test]
    fn adaptive_step_carries_over_between_od_updates() {
        let mut network = overshooting_links();
        let config = SolverConfig::default().with_max_inner_iterations(1);
        {
            let (graph, od_pairs) = network.split_mut();
            OdUpdate::new(graph, od_pairs[0].paths_mut(), 100.0, 0.0).seed(vec![0]);
        }
        let tree = network.graph().shortest_path_tree(0, 0.0);
        assert_eq!(tree.path_to(network.graph(), 1), Some(vec![1]));

        let mut algorithm = GradientProjection::new();
        let trials = algorithm
            .update_path_flow_lazy(&mut network, &tree, 0, &config)
            .unwrap();
        assert_eq!(trials, 3);
        assert_relative_eq!(algorithm.step_size(), 0.25);
        assert_eq!(algorithm.statistics().columns_added, 1);
        assert_relative_eq!(network.od_pair(0).paths().total_flow(), 100.0, epsilon = 1e-9);
    }

    #[test]
    fn single_trial_budget_conserves_demand() {
        let mut network = parallel_links();
        let config = SolverConfig::default()
            .with_max_line_search_iterations(1)
            .with_max_inner_iterations(1);
        let mut step = 1.0;
        let mut stats = ShiftStatistics::default();
        let (graph, od_pairs) = network.split_mut();
        let mut update = OdUpdate::new(graph, od_pairs[0].paths_mut(), 100.0, 0.0);
        update.seed(vec![0]);
        update.generate_column(vec![1], 0.0);
        let trials = update.equilibrate(&config, &mut step, &mut stats);
        assert_eq!(trials, 1);
        assert_relative_eq!(network.od_pair(0).paths().total_flow(), 100.0, epsilon = 1e-9);
    }
}

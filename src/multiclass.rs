//! Multi-class gradient projection.
//!
//! Classes share the aggregate link flows but keep separate path sets and
//! perceive fixed tolls through their own weight `cost_scalar * toll_factor`.
//! The per-class share of every link flow is kept in a links-by-classes matrix
//! whose row sums are the aggregate flows.

use log::debug;
use nalgebra::{DMatrix, DVector};
use serde::{Deserialize, Serialize};

use crate::error::{Result, TapError};
use crate::evaluation::{beckmann_objective, gap_terms, GapTerms};
use crate::gradient_projection::{ClassColumn, OdUpdate, ShiftStatistics};
use crate::network::{accumulate_link_flows, Network, OdPair};
use crate::options::SolverConfig;
use crate::paths::PathSet;
use crate::report::{self, PathDetail};
use crate::shortest_path::ShortestPathTree;
use crate::solving::Algorithm;

/// How a class's demand is derived from the OD table.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub enum ClassDemand {
    /// Fraction of every OD pair's demand.
    Share(f64),
    /// Demand per OD pair, indexed like [`Network::od_pairs`].
    Explicit(Vec<f64>),
}

/// A group of travelers with its own demand and toll perception.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct TrafficClass {
    name: String,
    toll_factor: f64,
    demand: ClassDemand,
}

impl TrafficClass {
    pub fn new(name: impl Into<String>, demand: ClassDemand) -> Self {
        Self {
            name: name.into(),
            toll_factor: 1.0,
            demand,
        }
    }

    /// Multiplier on the cost scalar applied to fixed tolls.
    pub fn with_toll_factor(mut self, toll_factor: f64) -> Self {
        self.toll_factor = toll_factor;
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn toll_factor(&self) -> f64 {
        self.toll_factor
    }

    pub fn demand(&self) -> &ClassDemand {
        &self.demand
    }

    /// Demand of this class on the OD pair at `index`.
    pub fn demand_for(&self, index: usize, od: &OdPair) -> f64 {
        match &self.demand {
            ClassDemand::Share(share) => share * od.demand(),
            ClassDemand::Explicit(values) => values.get(index).copied().unwrap_or(0.0),
        }
    }

    fn validate(&self, od_count: usize) -> Result<()> {
        if !self.toll_factor.is_finite() || self.toll_factor < 0.0 {
            return Err(TapError::invalid_config(format!(
                "class '{}' has invalid toll factor {}",
                self.name, self.toll_factor
            )));
        }
        match &self.demand {
            ClassDemand::Share(share) => {
                if !share.is_finite() || *share < 0.0 {
                    return Err(TapError::invalid_config(format!(
                        "class '{}' has invalid demand share {share}",
                        self.name
                    )));
                }
            }
            ClassDemand::Explicit(values) => {
                if values.len() != od_count {
                    return Err(TapError::dimension_mismatch(
                        "class demand",
                        od_count,
                        values.len(),
                    ));
                }
                if let Some(bad) = values.iter().find(|v| !v.is_finite() || **v < 0.0) {
                    return Err(TapError::invalid_config(format!(
                        "class '{}' has invalid demand {bad}",
                        self.name
                    )));
                }
            }
        }
        Ok(())
    }
}

/// Gradient projection over several traffic classes.
#[derive(Clone, Debug)]
pub struct MultiClassGradientProjection {
    classes: Vec<TrafficClass>,
    /// Path sets indexed by class, then OD pair.
    paths: Vec<Vec<PathSet>>,
    class_flows: DMatrix<f64>,
    steps: Vec<f64>,
    statistics: ShiftStatistics,
}

impl MultiClassGradientProjection {
    pub fn new(classes: Vec<TrafficClass>) -> Self {
        let count = classes.len();
        Self {
            classes,
            paths: vec![Vec::new(); count],
            class_flows: DMatrix::zeros(0, count),
            steps: vec![1.0; count],
            statistics: ShiftStatistics::default(),
        }
    }

    pub fn classes(&self) -> &[TrafficClass] {
        &self.classes
    }

    /// Path sets of one class, indexed like [`Network::od_pairs`].
    pub fn class_paths(&self, class: usize) -> &[PathSet] {
        &self.paths[class]
    }

    /// Links-by-classes flow decomposition.
    pub fn class_flows(&self) -> &DMatrix<f64> {
        &self.class_flows
    }

    pub fn statistics(&self) -> &ShiftStatistics {
        &self.statistics
    }

    fn toll_weight(&self, network: &Network, class: usize) -> f64 {
        network
            .graph()
            .cost_model()
            .toll_weight(self.classes[class].toll_factor)
    }

    fn validate(&self, network: &Network) -> Result<()> {
        if self.classes.is_empty() {
            return Err(TapError::invalid_config("at least one traffic class is required"));
        }
        let od_count = network.od_pairs().len();
        self.classes
            .iter()
            .try_for_each(|class| class.validate(od_count))
    }

    fn path_count(&self) -> usize {
        self.paths
            .iter()
            .flat_map(|sets| sets.iter())
            .map(PathSet::len)
            .sum()
    }

    /// Recomputes the class decomposition from the path sets and sets aggregate
    /// link flows to its row sums.
    fn rebuild_flows(&mut self, network: &mut Network) {
        let link_count = network.graph().link_count();
        let mut matrix = DMatrix::zeros(link_count, self.classes.len());
        for (class, sets) in self.paths.iter().enumerate() {
            let column = accumulate_link_flows(link_count, sets.iter());
            matrix.set_column(class, &column);
        }
        let aggregate = DVector::from_iterator(link_count, matrix.row_iter().map(|row| row.sum()));
        self.class_flows = matrix;
        network.graph_mut().set_flows(aggregate);
    }

    /// Column generation and flow redistribution for one OD pair of one class.
    ///
    /// `tree` must be rooted at the pair's origin and built with the class's toll
    /// weight.
    ///
    /// # Errors
    ///
    /// Returns [`TapError::InfeasiblePath`] if the destination is unreachable.
    pub fn update_path_flow_lazy(
        &mut self,
        network: &mut Network,
        tree: &ShortestPathTree,
        od_index: usize,
        class: usize,
        config: &SolverConfig,
    ) -> Result<usize> {
        let toll_weight = self.toll_weight(network, class);
        let demand = self.classes[class].demand_for(od_index, network.od_pair(od_index));
        if demand <= 0.0 {
            return Ok(0);
        }
        let (graph, od_pairs) = network.split_mut();
        let destination = od_pairs[od_index].destination();
        let links = tree
            .path_to(graph, destination)
            .ok_or(TapError::InfeasiblePath {
                origin: tree.origin(),
                destination,
            })?;

        let mut update = OdUpdate::new(graph, &mut self.paths[class][od_index], demand, toll_weight)
            .with_column(ClassColumn {
                matrix: &mut self.class_flows,
                class,
            });
        if update.generate_column(links, config.gradient.column_tolerance) {
            self.statistics.columns_added += 1;
        }
        self.statistics.od_updates += 1;
        Ok(update.equilibrate(config, &mut self.steps[class], &mut self.statistics))
    }

    /// Gap terms of every class summed before dividing.
    pub fn multi_class_relative_gap(&self, network: &Network, scale: bool) -> Result<f64> {
        let mut total = GapTerms::default();
        for (class, sets) in self.paths.iter().enumerate() {
            let traffic = &self.classes[class];
            total.accumulate(gap_terms(
                network,
                self.toll_weight(network, class),
                |index, od| traffic.demand_for(index, od),
                |index, _| &sets[index],
            ));
        }
        total.gap(scale)
    }
}

impl Algorithm for MultiClassGradientProjection {
    fn name(&self) -> &str {
        "multi-class gradient projection"
    }

    fn pre_process(&mut self, network: &mut Network, config: &SolverConfig) -> Result<()> {
        self.validate(network)?;
        let od_count = network.od_pairs().len();
        let stale = self.paths.iter().any(|sets| sets.len() != od_count);
        if config.reset_on_solve || stale {
            network.clear_assignment();
            self.paths = (0..self.classes.len())
                .map(|_| (0..od_count).map(|_| PathSet::new()).collect())
                .collect();
        }
        self.rebuild_flows(network);

        let mut infeasible = None;
        for class in 0..self.classes.len() {
            let toll_weight = self.toll_weight(network, class);
            for o in 0..network.origins().len() {
                let origin = network.origins()[o].clone();
                let tree = network.graph().shortest_path_tree(origin.node(), toll_weight);
                for index in origin.range() {
                    let demand = self.classes[class].demand_for(index, network.od_pair(index));
                    if demand <= 0.0 || !self.paths[class][index].is_empty() {
                        continue;
                    }
                    let (graph, od_pairs) = network.split_mut();
                    let destination = od_pairs[index].destination();
                    match tree.path_to(graph, destination) {
                        Some(links) => {
                            OdUpdate::new(graph, &mut self.paths[class][index], demand, toll_weight)
                                .with_column(ClassColumn {
                                    matrix: &mut self.class_flows,
                                    class,
                                })
                                .seed(links);
                        }
                        None => {
                            infeasible.get_or_insert(TapError::InfeasiblePath {
                                origin: origin.node(),
                                destination,
                            });
                        }
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
        self.steps = vec![config.gradient.initial_step; self.classes.len()];
        self.statistics = ShiftStatistics::default();
        self.rebuild_flows(network);
        Ok(())
    }

    fn main_loop(&mut self, network: &mut Network, config: &SolverConfig) -> Result<usize> {
        self.statistics = ShiftStatistics::default();
        let mut trials = 0;

        for class in 0..self.classes.len() {
            let toll_weight = self.toll_weight(network, class);
            for o in 0..network.origins().len() {
                let origin = network.origins()[o].clone();
                let tree = network.graph().shortest_path_tree(origin.node(), toll_weight);
                for od_index in origin.range() {
                    trials += self.update_path_flow_lazy(network, &tree, od_index, class, config)?;
                }
            }
        }

        self.statistics.path_count = self.path_count();
        debug!(
            "shifted {:.6} over {} paths in {} classes ({} new columns, {} paths)",
            self.statistics.flow_shifted,
            self.statistics.path_changes,
            self.classes.len(),
            self.statistics.columns_added,
            self.statistics.path_count
        );
        Ok(trials)
    }

    /// Congestion potential plus each class's fixed-toll expense on its own flow.
    fn objective(&self, network: &Network, _config: &SolverConfig) -> f64 {
        let graph = network.graph();
        let tolls: f64 = (0..self.classes.len())
            .map(|class| {
                let weight = self.toll_weight(network, class);
                graph
                    .links()
                    .iter()
                    .enumerate()
                    .map(|(link, l)| weight * l.toll() * self.class_flows[(link, class)])
                    .sum::<f64>()
            })
            .sum();
        beckmann_objective(graph, false, 0.0) + tolls
    }

    fn convergence_indicator(&self, network: &Network, _config: &SolverConfig) -> Result<f64> {
        self.multi_class_relative_gap(network, true)
    }

    fn post_process(&mut self, network: &mut Network, config: &SolverConfig) -> Result<()> {
        let epsilon = config.gradient.path_drop_epsilon;
        let od_count = network.od_pairs().len();
        // Nothing was assigned when the classes were rejected before seeding.
        if self.paths.iter().any(|sets| sets.len() != od_count) {
            return Ok(());
        }
        let mut dropped = 0;
        for class in 0..self.classes.len() {
            let toll_weight = self.toll_weight(network, class);
            for index in 0..od_count {
                let demand = self.classes[class].demand_for(index, network.od_pair(index));
                dropped += OdUpdate::new(
                    network.graph_mut(),
                    &mut self.paths[class][index],
                    demand,
                    toll_weight,
                )
                .with_column(ClassColumn {
                    matrix: &mut self.class_flows,
                    class,
                })
                .drop_paths(epsilon);
            }
        }
        self.statistics.paths_dropped = dropped;
        self.statistics.path_count = self.path_count();
        debug!("dropped {dropped} class paths below {epsilon:e}");
        Ok(())
    }

    fn path_details(&self, network: &Network, _config: &SolverConfig) -> Vec<PathDetail> {
        (0..self.classes.len())
            .flat_map(|class| {
                report::path_details(
                    network.graph(),
                    class,
                    self.toll_weight(network, class),
                    self.paths[class].iter(),
                )
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gradient_projection::GradientProjection;
    use crate::network::{Link, NetworkBuilder};
    use crate::options::{CostModel, LinkCostType, TollType};
    use crate::solving::{Solver, TerminationState};
    use approx::assert_relative_eq;

    fn parallel_links(toll: f64) -> Network {
        NetworkBuilder::new(2)
            .link(Link::new(0, 1, 10.0, 100.0).with_alpha(1.0).with_toll(toll))
            .link(Link::new(0, 1, 15.0, 150.0).with_alpha(1.0))
            .demand(0, 1, 100.0)
            .cost_model(CostModel {
                link_type: LinkCostType::Linear,
                ..CostModel::default()
            })
            .build()
            .unwrap()
    }

    fn linear_config() -> SolverConfig {
        SolverConfig::default()
            .with_link_type(LinkCostType::Linear)
            .with_convergence(1e-8)
            .with_max_iterations(200)
    }

    #[test]
    fn identical_classes_match_single_class_equilibrium() {
        let classes = vec![
            TrafficClass::new("cars", ClassDemand::Share(0.6)),
            TrafficClass::new("vans", ClassDemand::Share(0.4)),
        ];
        let mut solver = Solver::new(
            parallel_links(0.0),
            linear_config(),
            MultiClassGradientProjection::new(classes),
        );
        assert_eq!(solver.solve().unwrap(), TerminationState::AccuracyReached);

        let flows = solver.network().graph().flows();
        assert_relative_eq!(flows[0], 75.0, epsilon = 1e-4);
        assert_relative_eq!(flows[1], 25.0, epsilon = 1e-4);

        let algorithm = solver.algorithm();
        let matrix = algorithm.class_flows();
        for link in 0..2 {
            assert_relative_eq!(matrix.row(link).sum(), flows[link], epsilon = 1e-9);
        }
        for class in 0..2 {
            let share = [60.0, 40.0][class];
            let total: f64 = algorithm.class_paths(class).iter().map(|s| s.total_flow()).sum();
            assert_relative_eq!(total, share, epsilon = 1e-9);
        }
    }

    #[test]
    fn toll_factor_separates_classes() {
        // Link 0 carries a toll of 10; only the tolled class perceives it.
        let classes = vec![
            TrafficClass::new("free", ClassDemand::Share(0.5)).with_toll_factor(0.0),
            TrafficClass::new("paying", ClassDemand::Share(0.5)),
        ];
        let config = linear_config().with_toll_type(TollType::Fixed);
        let mut solver = Solver::new(
            parallel_links(10.0),
            config,
            MultiClassGradientProjection::new(classes),
        );
        assert_eq!(solver.solve().unwrap(), TerminationState::AccuracyReached);

        let matrix = solver.algorithm().class_flows();
        // The tolled class avoids link 0 entirely while the free class fills it.
        assert_relative_eq!(matrix[(0, 1)], 0.0, epsilon = 1e-6);
        assert!(matrix[(0, 0)] > matrix[(1, 0)]);
        assert!(solver.relative_gap() <= 1e-8);
    }

    #[test]
    fn gap_sums_numerators_and_denominators() {
        let classes = vec![
            TrafficClass::new("a", ClassDemand::Explicit(vec![30.0])),
            TrafficClass::new("b", ClassDemand::Explicit(vec![70.0])),
        ];
        let mut network = parallel_links(0.0);
        let config = linear_config();
        let mut algorithm = MultiClassGradientProjection::new(classes);
        algorithm.pre_process(&mut network, &config).unwrap();
        algorithm.initialize(&mut network, &config).unwrap();

        // Both classes sit on link 0: costs are 20 and 15 for 100 units.
        let gap = algorithm.multi_class_relative_gap(&network, false).unwrap();
        assert_relative_eq!(gap, 500.0, epsilon = 1e-9);
        let scaled = algorithm.multi_class_relative_gap(&network, true).unwrap();
        assert_relative_eq!(scaled, 500.0 / 1500.0, epsilon = 1e-12);
    }

    #[test]
    fn single_class_run_agrees_with_gradient_projection() {
        let mut single = Solver::new(parallel_links(0.0), linear_config(), GradientProjection::new());
        single.solve().unwrap();
        let mut multi = Solver::new(
            parallel_links(0.0),
            linear_config(),
            MultiClassGradientProjection::new(vec![TrafficClass::new("all", ClassDemand::Share(1.0))]),
        );
        multi.solve().unwrap();

        let a = single.network().graph().flows();
        let b = multi.network().graph().flows();
        assert_relative_eq!(a[0], b[0], epsilon = 1e-6);
        assert_relative_eq!(single.objective(), multi.objective(), epsilon = 1e-6);
        assert!(multi.relative_gap() < 1e-6);
    }

    #[test]
    fn invalid_classes_stop_the_run() {
        let classes = vec![TrafficClass::new("short", ClassDemand::Explicit(vec![]))];
        let mut solver = Solver::new(
            parallel_links(0.0),
            linear_config(),
            MultiClassGradientProjection::new(classes),
        );
        assert_eq!(solver.solve().unwrap(), TerminationState::Error);
        assert_eq!(
            solver.last_error(),
            Some(&TapError::dimension_mismatch("class demand", 1, 0))
        );

        let classes = vec![TrafficClass::new("negative", ClassDemand::Share(-0.5))];
        let mut solver = Solver::new(
            parallel_links(0.0),
            linear_config(),
            MultiClassGradientProjection::new(classes),
        );
        assert_eq!(solver.solve().unwrap(), TerminationState::Error);
        assert!(matches!(solver.last_error(), Some(TapError::InvalidConfig { .. })));

        let classes = vec![
            TrafficClass::new("cars", ClassDemand::Share(0.5)),
            TrafficClass::new("undefined", ClassDemand::Share(f64::NAN)),
        ];
        let mut solver = Solver::new(
            parallel_links(0.0),
            linear_config(),
            MultiClassGradientProjection::new(classes),
        );
        assert_eq!(solver.solve().unwrap(), TerminationState::Error);
        assert!(matches!(solver.last_error(), Some(TapError::InvalidConfig { .. })));
        assert_eq!(solver.iteration(), 0);
        let (network, algorithm) = solver.into_parts();
        assert!(network.graph().flows().iter().all(|&flow| flow == 0.0));
        assert_eq!(algorithm.statistics().path_count, 0);
    }
}

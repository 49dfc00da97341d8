//! Network containers: links with congestion functions, OD pairs grouped by origin,
//! and the validating builder that assembles them.

use std::collections::BTreeMap;
use std::ops::Range;

use log::debug;
use nalgebra::DVector;

use crate::error::{Result, TapError};
use crate::options::{CostModel, LinkCostType, TollType};
use crate::paths::PathSet;
use crate::shortest_path::{shortest_path_tree, ShortestPathTree};

/// Default BPR alpha parameter (Bureau of Public Roads).
pub const BPR_ALPHA: f64 = 0.15;

/// Default BPR beta parameter (Bureau of Public Roads).
pub const BPR_BETA: f64 = 4.0;

/// A directed link and its congestion function parameters.
#[derive(Clone, Debug, PartialEq)]
pub struct Link {
    tail: usize,
    head: usize,
    free_flow_time: f64,
    capacity: f64,
    alpha: f64,
    beta: f64,
    toll: f64,
}

impl Link {
    /// Creates an untolled link with the standard BPR parameters.
    ///
    /// A capacity of zero makes the link uncongested.
    pub fn new(tail: usize, head: usize, free_flow_time: f64, capacity: f64) -> Self {
        Self {
            tail,
            head,
            free_flow_time,
            capacity,
            alpha: BPR_ALPHA,
            beta: BPR_BETA,
            toll: 0.0,
        }
    }

    pub fn with_alpha(mut self, alpha: f64) -> Self {
        self.alpha = alpha;
        self
    }

    pub fn with_beta(mut self, beta: f64) -> Self {
        self.beta = beta;
        self
    }

    /// Fixed toll in monetary units.
    pub fn with_toll(mut self, toll: f64) -> Self {
        self.toll = toll;
        self
    }

    pub fn tail(&self) -> usize {
        self.tail
    }

    pub fn head(&self) -> usize {
        self.head
    }

    pub fn free_flow_time(&self) -> f64 {
        self.free_flow_time
    }

    pub fn capacity(&self) -> f64 {
        self.capacity
    }

    pub fn toll(&self) -> f64 {
        self.toll
    }

    fn congested(&self) -> bool {
        self.capacity > 0.0
    }

    /// Travel time at flow `x`.
    pub fn travel_time(&self, kind: LinkCostType, x: f64) -> f64 {
        if !self.congested() {
            return self.free_flow_time;
        }
        let ratio = x / self.capacity;
        match kind {
            LinkCostType::Bpr => self.free_flow_time * (1.0 + self.alpha * ratio.powf(self.beta)),
            LinkCostType::Linear => self.free_flow_time * (1.0 + self.alpha * ratio),
        }
    }

    /// First derivative of the travel time at flow `x`.
    pub fn travel_time_derivative(&self, kind: LinkCostType, x: f64) -> f64 {
        if !self.congested() {
            return 0.0;
        }
        let scale = self.free_flow_time * self.alpha / self.capacity;
        match kind {
            LinkCostType::Bpr => {
                if x <= 0.0 && self.beta < 1.0 {
                    return 0.0;
                }
                scale * self.beta * (x / self.capacity).powf(self.beta - 1.0)
            }
            LinkCostType::Linear => scale,
        }
    }

    /// Second derivative of the travel time at flow `x`.
    pub fn travel_time_second_derivative(&self, kind: LinkCostType, x: f64) -> f64 {
        if !self.congested() {
            return 0.0;
        }
        match kind {
            LinkCostType::Bpr => {
                if x <= 0.0 && self.beta < 2.0 {
                    return 0.0;
                }
                self.free_flow_time * self.alpha * self.beta * (self.beta - 1.0)
                    / (self.capacity * self.capacity)
                    * (x / self.capacity).powf(self.beta - 2.0)
            }
            LinkCostType::Linear => 0.0,
        }
    }

    /// Integral of the travel time from zero to `x`.
    pub fn travel_time_integral(&self, kind: LinkCostType, x: f64) -> f64 {
        if !self.congested() {
            return self.free_flow_time * x;
        }
        let ratio = x / self.capacity;
        match kind {
            LinkCostType::Bpr => {
                self.free_flow_time
                    * (x + self.alpha * self.capacity / (self.beta + 1.0)
                        * ratio.powf(self.beta + 1.0))
            }
            LinkCostType::Linear => self.free_flow_time * (x + 0.5 * self.alpha * x * ratio),
        }
    }

    /// Congestion part of the generalized cost under the given model.
    fn congestion_cost(&self, model: &CostModel, x: f64) -> f64 {
        let time = self.travel_time(model.link_type, x);
        match model.toll_type {
            TollType::MarginalCost => time + x * self.travel_time_derivative(model.link_type, x),
            TollType::Untolled | TollType::Fixed => time,
        }
    }

    fn congestion_derivative(&self, model: &CostModel, x: f64) -> f64 {
        let first = self.travel_time_derivative(model.link_type, x);
        match model.toll_type {
            TollType::MarginalCost => {
                2.0 * first + x * self.travel_time_second_derivative(model.link_type, x)
            }
            TollType::Untolled | TollType::Fixed => first,
        }
    }

    /// Integral of the congestion cost from zero to `x`.
    fn congestion_potential(&self, model: &CostModel, x: f64) -> f64 {
        match model.toll_type {
            TollType::MarginalCost => x * self.travel_time(model.link_type, x),
            TollType::Untolled | TollType::Fixed => {
                self.travel_time_integral(model.link_type, x)
            }
        }
    }

    fn validate(&self, index: usize, node_count: usize) -> Result<()> {
        for node in [self.tail, self.head] {
            if node >= node_count {
                return Err(TapError::UnknownNode { node, node_count });
            }
        }
        for (parameter, value) in [
            ("free-flow time", self.free_flow_time),
            ("capacity", self.capacity),
            ("alpha", self.alpha),
            ("beta", self.beta),
            ("toll", self.toll),
        ] {
            if !value.is_finite() || value < 0.0 {
                return Err(TapError::InvalidLink {
                    link: index,
                    parameter,
                    value,
                });
            }
        }
        Ok(())
    }
}

/// Links, adjacency and the derived link flow and cost vectors.
#[derive(Clone, Debug)]
pub struct Graph {
    node_count: usize,
    links: Vec<Link>,
    outgoing: Vec<Vec<usize>>,
    model: CostModel,
    flows: DVector<f64>,
    costs: DVector<f64>,
}

impl Graph {
    fn new(node_count: usize, links: Vec<Link>, model: CostModel) -> Self {
        let mut outgoing = vec![Vec::new(); node_count];
        for (index, link) in links.iter().enumerate() {
            outgoing[link.tail].push(index);
        }
        let m = links.len();
        let mut graph = Self {
            node_count,
            links,
            outgoing,
            model,
            flows: DVector::zeros(m),
            costs: DVector::zeros(m),
        };
        graph.refresh_all_costs();
        graph
    }

    pub fn node_count(&self) -> usize {
        self.node_count
    }

    pub fn link_count(&self) -> usize {
        self.links.len()
    }

    pub fn links(&self) -> &[Link] {
        &self.links
    }

    pub fn link(&self, index: usize) -> &Link {
        &self.links[index]
    }

    /// Links leaving `node`.
    pub fn outgoing(&self, node: usize) -> &[usize] {
        &self.outgoing[node]
    }

    pub fn cost_model(&self) -> &CostModel {
        &self.model
    }

    /// Aggregate flow on every link.
    pub fn flows(&self) -> &DVector<f64> {
        &self.flows
    }

    /// Congestion part of the generalized cost on every link, excluding tolls.
    pub fn congestion_costs(&self) -> &DVector<f64> {
        &self.costs
    }

    /// Generalized cost of a link as perceived with the given toll weight.
    pub fn link_cost(&self, link: usize, toll_weight: f64) -> f64 {
        self.costs[link] + toll_weight * self.links[link].toll
    }

    /// Derivative of the link cost with respect to its own flow.
    pub fn link_cost_derivative(&self, link: usize) -> f64 {
        self.links[link].congestion_derivative(&self.model, self.flows[link])
    }

    /// Objective contribution of a link at its current flow.
    pub fn link_potential(&self, link: usize, toll_weight: f64) -> f64 {
        let x = self.flows[link];
        self.links[link].congestion_potential(&self.model, x) + toll_weight * self.links[link].toll * x
    }

    /// Generalized cost of a link sequence.
    pub fn path_cost(&self, links: &[usize], toll_weight: f64) -> f64 {
        links
            .iter()
            .map(|&link| self.link_cost(link, toll_weight))
            .sum()
    }

    pub fn shortest_path_tree(&self, origin: usize, toll_weight: f64) -> ShortestPathTree {
        shortest_path_tree(self, origin, toll_weight)
    }

    /// Adds `delta` to the flow of each link in `links` and refreshes their costs.
    pub(crate) fn shift_flow(&mut self, links: &[usize], delta: f64) {
        for &link in links {
            self.flows[link] = (self.flows[link] + delta).max(0.0);
            self.refresh_cost(link);
        }
    }

    pub(crate) fn set_link_flow(&mut self, link: usize, flow: f64) {
        self.flows[link] = flow.max(0.0);
        self.refresh_cost(link);
    }

    /// Replaces every link flow and recomputes every cost.
    pub(crate) fn set_flows(&mut self, flows: DVector<f64>) {
        self.flows = flows.map(|x| x.max(0.0));
        self.refresh_all_costs();
    }

    pub(crate) fn set_cost_model(&mut self, model: CostModel) {
        self.model = model;
        self.refresh_all_costs();
    }

    fn refresh_cost(&mut self, link: usize) {
        self.costs[link] = self.links[link].congestion_cost(&self.model, self.flows[link]);
    }

    pub(crate) fn refresh_all_costs(&mut self) {
        for link in 0..self.links.len() {
            self.refresh_cost(link);
        }
    }
}

/// Demand between one origin and one destination together with its candidate paths.
#[derive(Clone, Debug)]
pub struct OdPair {
    origin: usize,
    destination: usize,
    demand: f64,
    paths: PathSet,
}

impl OdPair {
    pub fn origin(&self) -> usize {
        self.origin
    }

    pub fn destination(&self) -> usize {
        self.destination
    }

    pub fn demand(&self) -> f64 {
        self.demand
    }

    pub fn paths(&self) -> &PathSet {
        &self.paths
    }

    pub(crate) fn paths_mut(&mut self) -> &mut PathSet {
        &mut self.paths
    }
}

/// OD pairs sharing an origin node, stored contiguously.
#[derive(Clone, Debug)]
pub struct Origin {
    node: usize,
    start: usize,
    end: usize,
}

impl Origin {
    pub fn node(&self) -> usize {
        self.node
    }

    /// Range of OD pair indices that start at this origin.
    pub fn range(&self) -> Range<usize> {
        self.start..self.end
    }
}

/// A built network: graph, OD pairs and their path sets.
#[derive(Clone, Debug)]
pub struct Network {
    graph: Graph,
    od_pairs: Vec<OdPair>,
    origins: Vec<Origin>,
}

impl Network {
    pub fn graph(&self) -> &Graph {
        &self.graph
    }

    pub fn od_pairs(&self) -> &[OdPair] {
        &self.od_pairs
    }

    pub fn od_pair(&self, index: usize) -> &OdPair {
        &self.od_pairs[index]
    }

    pub fn origins(&self) -> &[Origin] {
        &self.origins
    }

    /// Index of the OD pair between two nodes, if one was defined.
    pub fn find_od_pair(&self, origin: usize, destination: usize) -> Option<usize> {
        self.od_pairs
            .binary_search_by(|od| (od.origin, od.destination).cmp(&(origin, destination)))
            .ok()
    }

    pub fn total_demand(&self) -> f64 {
        self.od_pairs.iter().map(OdPair::demand).sum()
    }

    /// Number of paths across all OD pairs.
    pub fn path_count(&self) -> usize {
        self.od_pairs.iter().map(|od| od.paths.len()).sum()
    }

    /// Borrows the graph and the OD pairs separately.
    pub(crate) fn split_mut(&mut self) -> (&mut Graph, &mut [OdPair]) {
        (&mut self.graph, &mut self.od_pairs)
    }

    pub(crate) fn graph_mut(&mut self) -> &mut Graph {
        &mut self.graph
    }

    /// Applies a new cost model and re-evaluates every link cost at current flows.
    pub(crate) fn rebuild(&mut self, model: CostModel) {
        debug!("rebuilding link costs with {model:?}");
        self.graph.set_cost_model(model);
    }

    /// Drops every path and zeroes every link flow.
    pub(crate) fn clear_assignment(&mut self) {
        for od in &mut self.od_pairs {
            od.paths.clear();
        }
        self.graph.set_flows(DVector::zeros(self.graph.link_count()));
    }

    /// Recomputes link flows from the OD path sets and refreshes all costs.
    pub(crate) fn rebuild_link_flows(&mut self) {
        let flows = accumulate_link_flows(
            self.graph.link_count(),
            self.od_pairs.iter().map(|od| &od.paths),
        );
        self.graph.set_flows(flows);
    }
}

/// Sums path flows onto links.
pub(crate) fn accumulate_link_flows<'a>(
    link_count: usize,
    path_sets: impl Iterator<Item = &'a PathSet>,
) -> DVector<f64> {
    let mut flows = DVector::zeros(link_count);
    for set in path_sets {
        for path in set.iter() {
            for &link in path.links() {
                flows[link] += path.flow();
            }
        }
    }
    flows
}

/// Builder that validates links and demand before constructing a [`Network`].
#[derive(Debug)]
pub struct NetworkBuilder {
    node_count: usize,
    links: Vec<Link>,
    demand: Vec<(usize, usize, f64)>,
    model: CostModel,
}

impl NetworkBuilder {
    /// Start building a network over `node_count` nodes numbered from zero.
    pub fn new(node_count: usize) -> Self {
        Self {
            node_count,
            links: Vec::new(),
            demand: Vec::new(),
            model: CostModel::default(),
        }
    }

    pub fn link(mut self, link: Link) -> Self {
        self.links.push(link);
        self
    }

    pub fn links(mut self, links: impl IntoIterator<Item = Link>) -> Self {
        self.links.extend(links);
        self
    }

    /// Adds demand between two nodes; repeated pairs accumulate.
    pub fn demand(mut self, origin: usize, destination: usize, demand: f64) -> Self {
        self.demand.push((origin, destination, demand));
        self
    }

    /// Cost model applied to the initial link costs.
    pub fn cost_model(mut self, model: CostModel) -> Self {
        self.model = model;
        self
    }

    /// Finalizes construction after validating link parameters and demand.
    pub fn build(self) -> Result<Network> {
        let n = self.node_count;
        for (index, link) in self.links.iter().enumerate() {
            link.validate(index, n)?;
        }

        let mut merged: BTreeMap<(usize, usize), f64> = BTreeMap::new();
        for (origin, destination, demand) in self.demand {
            for node in [origin, destination] {
                if node >= n {
                    return Err(TapError::UnknownNode {
                        node,
                        node_count: n,
                    });
                }
            }
            if !demand.is_finite() || demand < 0.0 {
                return Err(TapError::InvalidDemand {
                    origin,
                    destination,
                    demand,
                });
            }
            if origin == destination {
                debug!("ignoring intra-zonal demand {demand} at node {origin}");
                continue;
            }
            *merged.entry((origin, destination)).or_insert(0.0) += demand;
        }

        let od_pairs: Vec<OdPair> = merged
            .into_iter()
            .map(|((origin, destination), demand)| OdPair {
                origin,
                destination,
                demand,
                paths: PathSet::new(),
            })
            .collect();

        let mut origins: Vec<Origin> = Vec::new();
        for (index, od) in od_pairs.iter().enumerate() {
            match origins.last_mut() {
                Some(last) if last.node == od.origin => last.end = index + 1,
                _ => origins.push(Origin {
                    node: od.origin,
                    start: index,
                    end: index + 1,
                }),
            }
        }

        Ok(Network {
            graph: Graph::new(n, self.links, self.model),
            od_pairs,
            origins,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    fn bpr() -> Link {
        Link::new(0, 1, 10.0, 100.0)
    }

    #[test]
    fn bpr_derivatives_match_finite_differences() {
        let link = bpr();
        let kind = LinkCostType::Bpr;
        let x = 80.0;
        let h = 1e-4;
        let numeric = (link.travel_time(kind, x + h) - link.travel_time(kind, x - h)) / (2.0 * h);
        assert_relative_eq!(link.travel_time_derivative(kind, x), numeric, epsilon = 1e-6);

        let numeric_second = (link.travel_time_derivative(kind, x + h)
            - link.travel_time_derivative(kind, x - h))
            / (2.0 * h);
        assert_relative_eq!(
            link.travel_time_second_derivative(kind, x),
            numeric_second,
            epsilon = 1e-6
        );
    }

    #[test]
    fn integral_matches_closed_form() {
        let link = Link::new(0, 1, 10.0, 100.0).with_alpha(1.0);
        // t(x) = 10 + 0.1 x  ->  integral = 10 x + 0.05 x^2
        assert_relative_eq!(
            link.travel_time_integral(LinkCostType::Linear, 40.0),
            400.0 + 80.0,
            epsilon = 1e-9
        );
        // BPR with beta = 1 coincides with the linear form.
        let bpr_linear = link.clone().with_beta(1.0);
        assert_relative_eq!(
            bpr_linear.travel_time_integral(LinkCostType::Bpr, 40.0),
            480.0,
            epsilon = 1e-9
        );
    }

    #[test]
    fn zero_capacity_link_is_uncongested() {
        let link = Link::new(0, 1, 3.0, 0.0);
        assert_eq!(link.travel_time(LinkCostType::Bpr, 1e6), 3.0);
        assert_eq!(link.travel_time_derivative(LinkCostType::Bpr, 1e6), 0.0);
        assert_eq!(link.travel_time_integral(LinkCostType::Bpr, 2.0), 6.0);
    }

    #[test]
    fn marginal_cost_potential_is_total_travel_time() {
        let link = bpr();
        let model = CostModel {
            toll_type: TollType::MarginalCost,
            ..CostModel::default()
        };
        let x = 120.0;
        assert_relative_eq!(
            link.congestion_potential(&model, x),
            x * link.travel_time(LinkCostType::Bpr, x),
            epsilon = 1e-9
        );
    }

    #[test]
    fn builder_merges_demand_and_groups_origins() {
        let network = NetworkBuilder::new(3)
            .link(Link::new(0, 1, 1.0, 10.0))
            .link(Link::new(1, 2, 1.0, 10.0))
            .demand(1, 2, 5.0)
            .demand(0, 2, 3.0)
            .demand(0, 1, 1.0)
            .demand(0, 2, 2.0)
            .demand(2, 2, 9.0)
            .build()
            .unwrap();

        assert_eq!(network.od_pairs().len(), 3);
        assert_eq!(network.origins().len(), 2);
        assert_eq!(network.origins()[0].range(), 0..2);
        let od = network.find_od_pair(0, 2).unwrap();
        assert_eq!(network.od_pair(od).demand(), 5.0);
        assert_eq!(network.total_demand(), 11.0);
        assert_eq!(network.graph().outgoing(0), &[0]);
    }

    #[test]
    fn builder_rejects_bad_input() {
        let unknown = NetworkBuilder::new(2).link(Link::new(0, 5, 1.0, 1.0)).build();
        assert!(matches!(unknown, Err(TapError::UnknownNode { node: 5, .. })));

        let negative = NetworkBuilder::new(2)
            .link(Link::new(0, 1, -1.0, 1.0))
            .build();
        assert!(matches!(negative, Err(TapError::InvalidLink { .. })));

        let demand = NetworkBuilder::new(2).demand(0, 1, -3.0).build();
        assert!(matches!(demand, Err(TapError::InvalidDemand { .. })));
    }

    #[test]
    fn rebuild_link_flows_sums_path_flows() {
        let mut network = NetworkBuilder::new(3)
            .link(Link::new(0, 1, 1.0, 10.0))
            .link(Link::new(1, 2, 1.0, 10.0))
            .link(Link::new(0, 2, 4.0, 10.0))
            .demand(0, 2, 10.0)
            .build()
            .unwrap();
        {
            let (_, ods) = network.split_mut();
            ods[0].paths_mut().insert(vec![0, 1], 6.0);
            ods[0].paths_mut().insert(vec![2], 4.0);
        }
        network.rebuild_link_flows();
        let flows = network.graph().flows();
        assert_eq!(flows.as_slice(), &[6.0, 6.0, 4.0]);
        assert!(network.graph().congestion_costs()[0] > 1.0);

        network.clear_assignment();
        assert_eq!(network.path_count(), 0);
        assert_eq!(network.graph().flows().sum(), 0.0);
    }
}

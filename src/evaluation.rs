//! Objective and convergence evaluation.
//!
//! The Beckmann potential is reported for diagnostics; the relative gap is the
//! quantity compared against the convergence criterion.

use rayon::prelude::*;

use crate::error::{Result, TapError};
use crate::network::{Graph, Network, OdPair};
use crate::paths::PathSet;

/// Sum of link potentials at current flows.
///
/// With `include_tolls` the fixed-toll term `toll_weight * toll * x` is added to
/// every link; otherwise the classic Beckmann integral is returned.
pub fn beckmann_objective(graph: &Graph, include_tolls: bool, toll_weight: f64) -> f64 {
    let weight = if include_tolls { toll_weight } else { 0.0 };
    (0..graph.link_count())
        .map(|link| graph.link_potential(link, weight))
        .sum()
}

/// Absolute gap contributions of a set of OD pairs.
#[derive(Clone, Copy, Debug, Default, PartialEq)]
pub struct GapTerms {
    /// `sum_w sum_p f_p * c_p`.
    pub total_cost: f64,
    /// `sum_w d_w * pi_w`.
    pub shortest_cost: f64,
}

impl GapTerms {
    pub fn numerator(&self) -> f64 {
        (self.total_cost - self.shortest_cost).max(0.0)
    }

    /// Relative gap, or the unscaled numerator when `scale` is false or the
    /// denominator is not positive.
    pub fn gap(&self, scale: bool) -> Result<f64> {
        let numerator = self.numerator();
        let gap = if scale && self.shortest_cost > 0.0 {
            numerator / self.shortest_cost
        } else {
            numerator
        };
        if !gap.is_finite() {
            return Err(TapError::numerical("relative gap"));
        }
        Ok(gap)
    }

    pub fn accumulate(&mut self, other: GapTerms) {
        self.total_cost += other.total_cost;
        self.shortest_cost += other.shortest_cost;
    }
}

/// Gap terms for one traffic class.
///
/// `demand_of` and `paths_of` select the class view of every OD pair. Shortest
/// paths are computed per origin in parallel; each origin's terms are collected in
/// origin order and summed sequentially so the result does not depend on the
/// number of worker threads. OD pairs whose destination is unreachable do not
/// contribute.
pub fn gap_terms<'a, D, P>(
    network: &'a Network,
    toll_weight: f64,
    demand_of: D,
    paths_of: P,
) -> GapTerms
where
    D: Fn(usize, &'a OdPair) -> f64 + Sync,
    P: Fn(usize, &'a OdPair) -> &'a PathSet + Sync,
{
    let graph = network.graph();
    let per_origin: Vec<GapTerms> = network
        .origins()
        .par_iter()
        .map(|origin| {
            let tree = graph.shortest_path_tree(origin.node(), toll_weight);
            let mut terms = GapTerms::default();
            for index in origin.range() {
                let od = network.od_pair(index);
                let demand = demand_of(index, od);
                if demand <= 0.0 {
                    continue;
                }
                let Some(shortest) = tree.distance(od.destination()) else {
                    continue;
                };
                terms.shortest_cost += demand * shortest;
                terms.total_cost += paths_of(index, od)
                    .iter()
                    .map(|path| path.flow() * graph.path_cost(path.links(), toll_weight))
                    .sum::<f64>();
            }
            terms
        })
        .collect();

    per_origin
        .into_iter()
        .fold(GapTerms::default(), |mut total, terms| {
            total.accumulate(terms);
            total
        })
}

/// Relative gap of the single-class assignment stored in the network.
pub fn relative_gap(network: &Network, toll_weight: f64, scale: bool) -> Result<f64> {
    gap_terms(
        network,
        toll_weight,
        |_, od| od.demand(),
        |_, od| od.paths(),
    )
    .gap(scale)
}

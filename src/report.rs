//! Serializable read-only snapshots for reporters.

use serde::Serialize;

use crate::history::IterationRecord;
use crate::network::Graph;
use crate::options::SolverConfig;
use crate::paths::PathSet;
use crate::solving::TerminationState;

/// Flow and cost of one link.
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct LinkDetail {
    pub link: usize,
    pub tail: usize,
    pub head: usize,
    pub flow: f64,
    pub cost: f64,
}

/// Flow and cost of one path.
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct PathDetail {
    /// Traffic class; zero for single-class assignments.
    pub class: usize,
    pub od_pair: usize,
    pub links: Vec<usize>,
    pub flow: f64,
    pub cost: f64,
}

/// Summary of the last solve with optional detail sections.
#[derive(Clone, Debug, Serialize)]
pub struct SolveReport {
    pub algorithm: String,
    pub state: TerminationState,
    pub iterations: usize,
    pub objective: f64,
    pub relative_gap: f64,
    pub elapsed_seconds: f64,
    pub history: Option<Vec<IterationRecord>>,
    pub links: Option<Vec<LinkDetail>>,
    pub paths: Option<Vec<PathDetail>>,
}

/// Link flows and costs at the base toll weight.
pub fn link_details(graph: &Graph, config: &SolverConfig) -> Vec<LinkDetail> {
    let weight = config.cost_model().toll_weight(1.0);
    graph
        .links()
        .iter()
        .enumerate()
        .map(|(index, link)| LinkDetail {
            link: index,
            tail: link.tail(),
            head: link.head(),
            flow: graph.flows()[index],
            cost: graph.link_cost(index, weight),
        })
        .collect()
}

/// Paths of one class, costed at current link costs.
pub fn path_details<'a>(
    graph: &Graph,
    class: usize,
    toll_weight: f64,
    path_sets: impl Iterator<Item = &'a PathSet>,
) -> Vec<PathDetail> {
    path_sets
        .enumerate()
        .flat_map(|(od_pair, set)| {
            set.iter().map(move |path| PathDetail {
                class,
                od_pair,
                links: path.links().to_vec(),
                flow: path.flow(),
                cost: graph.path_cost(path.links(), toll_weight),
            })
        })
        .collect()
}

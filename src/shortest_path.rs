//! Label-setting shortest paths over generalized link costs.

use std::cmp::Ordering;
use std::collections::BTreeMap;
use std::ops::Add;

use num_traits::Zero;
use pathfinding::prelude::dijkstra_all;

use crate::network::Graph;

/// Shortest-path tree rooted at one origin.
#[derive(Clone, Debug)]
pub struct ShortestPathTree {
    origin: usize,
    distances: Vec<f64>,
    predecessors: Vec<Option<usize>>,
}

impl ShortestPathTree {
    pub fn origin(&self) -> usize {
        self.origin
    }

    /// Cost of the shortest path to `node`, or `None` when unreachable.
    pub fn distance(&self, node: usize) -> Option<f64> {
        self.distances
            .get(node)
            .copied()
            .filter(|distance| distance.is_finite())
    }

    /// Link sequence of the shortest path to `destination`.
    pub fn path_to(&self, graph: &Graph, destination: usize) -> Option<Vec<usize>> {
        self.distance(destination)?;
        let mut links = Vec::new();
        let mut node = destination;
        while node != self.origin {
            let link = self.predecessors[node]?;
            links.push(link);
            node = graph.link(link).tail();
        }
        links.reverse();
        Some(links)
    }
}

/// Path cost ordered by `f64::total_cmp`, so it can drive `pathfinding`.
#[derive(Clone, Copy, Debug)]
struct Cost(f64);

impl PartialEq for Cost {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for Cost {}

impl PartialOrd for Cost {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Cost {
    fn cmp(&self, other: &Self) -> Ordering {
        self.0.total_cmp(&other.0)
    }
}

impl Add for Cost {
    type Output = Self;

    fn add(self, other: Self) -> Self {
        Cost(self.0 + other.0)
    }
}

impl Zero for Cost {
    fn zero() -> Self {
        Cost(0.0)
    }

    fn is_zero(&self) -> bool {
        self.0 == 0.0
    }
}

/// Cheapest outgoing link of `node` toward each head; the lowest index wins ties.
fn cheapest_links(graph: &Graph, node: usize, toll_weight: f64) -> BTreeMap<usize, (usize, f64)> {
    let mut cheapest: BTreeMap<usize, (usize, f64)> = BTreeMap::new();
    for &link in graph.outgoing(node) {
        let head = graph.link(link).head();
        let cost = graph.link_cost(link, toll_weight);
        match cheapest.get(&head) {
            Some(&(kept, best)) if best < cost || (best == cost && kept < link) => {}
            _ => {
                cheapest.insert(head, (link, cost));
            }
        }
    }
    cheapest
}

/// Dijkstra from `origin` with link costs `cost + toll_weight * toll`.
pub fn shortest_path_tree(graph: &Graph, origin: usize, toll_weight: f64) -> ShortestPathTree {
    let n = graph.node_count();
    let mut distances = vec![f64::INFINITY; n];
    let mut predecessors = vec![None; n];
    distances[origin] = 0.0;

    let parents = dijkstra_all(&origin, |&node| {
        cheapest_links(graph, node, toll_weight)
            .into_iter()
            .map(|(head, (_, cost))| (head, Cost(cost)))
    });

    for (node, (parent, Cost(distance))) in parents {
        if node == origin {
            continue;
        }
        distances[node] = distance;
        predecessors[node] = cheapest_links(graph, parent, toll_weight)
            .get(&node)
            .map(|&(link, _)| link);
    }

    ShortestPathTree {
        origin,
        distances,
        predecessors,
    }
}

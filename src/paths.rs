//! Per-OD path sets: an index-addressed arena with a link-sequence lookup.

use std::collections::HashMap;

use serde::Serialize;

/// A route between an OD pair's origin and destination.
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct Path {
    links: Vec<usize>,
    flow: f64,
    cost: f64,
}

impl Path {
    fn new(links: Vec<usize>, flow: f64) -> Self {
        Self {
            links,
            flow,
            cost: 0.0,
        }
    }

    /// Ordered link identifiers from origin to destination.
    pub fn links(&self) -> &[usize] {
        &self.links
    }

    /// Flow currently assigned to the path.
    pub fn flow(&self) -> f64 {
        self.flow
    }

    /// Generalized cost computed at the last refresh.
    pub fn cost(&self) -> f64 {
        self.cost
    }

    pub(crate) fn set_flow(&mut self, flow: f64) {
        self.flow = flow.max(0.0);
    }

    pub(crate) fn set_cost(&mut self, cost: f64) {
        self.cost = cost;
    }
}

/// Candidate paths of one OD pair.
///
/// Paths are addressed by position. The lookup keyed on the link sequence keeps
/// the set free of duplicates when columns are generated.
#[derive(Clone, Debug, Default)]
pub struct PathSet {
    paths: Vec<Path>,
    lookup: HashMap<Vec<usize>, usize>,
}

impl PathSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.paths.len()
    }

    pub fn is_empty(&self) -> bool {
        self.paths.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Path> {
        self.paths.iter()
    }

    pub fn get(&self, index: usize) -> Option<&Path> {
        self.paths.get(index)
    }

    pub(crate) fn paths_mut(&mut self) -> &mut [Path] {
        &mut self.paths
    }

    /// Returns the position of the path with exactly this link sequence.
    pub fn find(&self, links: &[usize]) -> Option<usize> {
        self.lookup.get(links).copied()
    }

    /// Sum of flows over all paths.
    pub fn total_flow(&self) -> f64 {
        self.paths.iter().map(Path::flow).sum()
    }

    /// Position and cost of the cheapest path; ties resolve to the lowest position.
    pub fn min_cost(&self) -> Option<(usize, f64)> {
        self.paths
            .iter()
            .enumerate()
            .fold(None, |best, (index, path)| match best {
                Some((_, cost)) if cost <= path.cost => best,
                _ => Some((index, path.cost)),
            })
    }

    /// Adds a path unless an identical link sequence is present.
    ///
    /// Returns the position of the path and whether it was newly inserted.
    pub(crate) fn insert(&mut self, links: Vec<usize>, flow: f64) -> (usize, bool) {
        if let Some(index) = self.find(&links) {
            return (index, false);
        }
        let index = self.paths.len();
        self.lookup.insert(links.clone(), index);
        self.paths.push(Path::new(links, flow));
        (index, true)
    }

    /// Removes every path rejected by `keep` and returns the removed paths.
    pub(crate) fn retain(&mut self, mut keep: impl FnMut(&Path) -> bool) -> Vec<Path> {
        let (kept, removed): (Vec<Path>, Vec<Path>) =
            std::mem::take(&mut self.paths).into_iter().partition(|path| keep(path));
        self.paths = kept;
        self.reindex();
        removed
    }

    pub(crate) fn clear(&mut self) {
        self.paths.clear();
        self.lookup.clear();
    }

    fn reindex(&mut self) {
        self.lookup = self
            .paths
            .iter()
            .enumerate()
            .map(|(index, path)| (path.links.clone(), index))
            .collect();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn insert_rejects_identical_link_sequences() {
        let mut set = PathSet::new();
        assert_eq!(set.insert(vec![0, 2], 5.0), (0, true));
        assert_eq!(set.insert(vec![1], 0.0), (1, true));
        assert_eq!(set.insert(vec![0, 2], 0.0), (0, false));
        assert_eq!(set.len(), 2);
        assert_eq!(set.total_flow(), 5.0);
    }

    #[test]
    fn retain_keeps_lookup_consistent() {
        let mut set = PathSet::new();
        set.insert(vec![0], 1e-14);
        set.insert(vec![1], 3.0);
        set.insert(vec![2], 4.0);

        let removed = set.retain(|path| path.flow() > 1e-10);
        assert_eq!(removed.len(), 1);
        assert_eq!(set.find(&[1]), Some(0));
        assert_eq!(set.find(&[2]), Some(1));
        assert_eq!(set.find(&[0]), None);
    }

    #[test]
    fn min_cost_prefers_lowest_position_on_ties() {
        let mut set = PathSet::new();
        set.insert(vec![0], 1.0);
        set.insert(vec![1], 1.0);
        set.paths_mut()[0].set_cost(2.0);
        set.paths_mut()[1].set_cost(2.0);
        assert_eq!(set.min_cost(), Some((0, 2.0)));
    }
}

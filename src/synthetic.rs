//! Seeded synthetic grid networks for tests and benchmarks.

use rand::rngs::SmallRng;
use rand::{Rng, SeedableRng};
use rand_distr::{Distribution, Uniform};
use serde::{Deserialize, Serialize};

use crate::error::{Result, TapError};
use crate::network::{Link, Network, NetworkBuilder};
use crate::options::CostModel;

/// Shape and parameter ranges of a synthetic grid.
///
/// Nodes are numbered row by row; every pair of horizontally or vertically
/// adjacent nodes is joined by one link in each direction, so every OD pair is
/// reachable.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct GridOptions {
    pub rows: usize,
    pub columns: usize,
    /// Inclusive range of link free-flow times.
    pub free_flow_time: (f64, f64),
    /// Inclusive range of link capacities.
    pub capacity: (f64, f64),
    /// Inclusive range of demand per OD draw.
    pub demand: (f64, f64),
    /// Number of OD draws; repeated pairs accumulate.
    pub od_draws: usize,
    /// Probability that a link carries `toll`.
    pub tolled_share: f64,
    pub toll: f64,
}

impl Default for GridOptions {
    fn default() -> Self {
        Self {
            rows: 5,
            columns: 5,
            free_flow_time: (1.0, 5.0),
            capacity: (200.0, 600.0),
            demand: (10.0, 100.0),
            od_draws: 20,
            tolled_share: 0.0,
            toll: 0.0,
        }
    }
}

impl GridOptions {
    pub fn new(rows: usize, columns: usize) -> Self {
        Self {
            rows,
            columns,
            ..Self::default()
        }
    }

    pub fn with_od_draws(mut self, od_draws: usize) -> Self {
        self.od_draws = od_draws;
        self
    }

    pub fn with_capacity(mut self, low: f64, high: f64) -> Self {
        self.capacity = (low, high);
        self
    }

    pub fn with_demand(mut self, low: f64, high: f64) -> Self {
        self.demand = (low, high);
        self
    }

    pub fn with_tolls(mut self, tolled_share: f64, toll: f64) -> Self {
        self.tolled_share = tolled_share;
        self.toll = toll;
        self
    }

    pub fn node_count(&self) -> usize {
        self.rows * self.columns
    }

    /// Number of directed links the grid will contain.
    pub fn link_count(&self) -> usize {
        if self.rows == 0 || self.columns == 0 {
            return 0;
        }
        2 * (self.rows * (self.columns - 1) + self.columns * (self.rows - 1))
    }

    fn validate(&self) -> Result<()> {
        if self.node_count() < 2 {
            return Err(TapError::invalid_config(format!(
                "a {}x{} grid has fewer than two nodes",
                self.rows, self.columns
            )));
        }
        for (name, (low, high)) in [
            ("free-flow time", self.free_flow_time),
            ("capacity", self.capacity),
            ("demand", self.demand),
        ] {
            if !low.is_finite() || !high.is_finite() || low < 0.0 || low > high {
                return Err(TapError::invalid_config(format!(
                    "{name} range [{low}, {high}] is invalid"
                )));
            }
        }
        if !(0.0..=1.0).contains(&self.tolled_share) {
            return Err(TapError::invalid_config(format!(
                "tolled share {} must lie in [0, 1]",
                self.tolled_share
            )));
        }
        if !self.toll.is_finite() || self.toll < 0.0 {
            return Err(TapError::invalid_config(format!("toll {} is invalid", self.toll)));
        }
        Ok(())
    }
}

/// Generates a grid network; the same options and seed always give the same network.
pub fn grid_network(options: &GridOptions, model: CostModel, seed: u64) -> Result<Network> {
    options.validate()?;
    let mut rng = SmallRng::seed_from_u64(seed);
    let free_flow = Uniform::new_inclusive(options.free_flow_time.0, options.free_flow_time.1);
    let capacity = Uniform::new_inclusive(options.capacity.0, options.capacity.1);
    let demand = Uniform::new_inclusive(options.demand.0, options.demand.1);

    let node = |row: usize, column: usize| row * options.columns + column;
    let mut links = Vec::with_capacity(options.link_count());
    for row in 0..options.rows {
        for column in 0..options.columns {
            let here = node(row, column);
            let mut neighbours = Vec::with_capacity(2);
            if column + 1 < options.columns {
                neighbours.push(node(row, column + 1));
            }
            if row + 1 < options.rows {
                neighbours.push(node(row + 1, column));
            }
            for there in neighbours {
                for (tail, head) in [(here, there), (there, here)] {
                    let mut link = Link::new(
                        tail,
                        head,
                        free_flow.sample(&mut rng),
                        capacity.sample(&mut rng),
                    );
                    if options.tolled_share > 0.0 && rng.gen_bool(options.tolled_share) {
                        link = link.with_toll(options.toll);
                    }
                    links.push(link);
                }
            }
        }
    }

    let nodes = Uniform::new(0, options.node_count());
    let mut builder = NetworkBuilder::new(options.node_count())
        .links(links)
        .cost_model(model);
    for _ in 0..options.od_draws {
        let origin = nodes.sample(&mut rng);
        let mut destination = nodes.sample(&mut rng);
        while destination == origin {
            destination = nodes.sample(&mut rng);
        }
        builder = builder.demand(origin, destination, demand.sample(&mut rng));
    }
    builder.build()
}

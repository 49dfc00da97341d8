//! Solver configuration: termination bounds, cost model selection and gradient
//! projection tuning.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{Result, TapError};

/// Lower bound (exclusive) on the CPU budget, in hours.
pub const MIN_CPU_HOURS: f64 = 3e-4;

/// Upper bound (exclusive) on the CPU budget, in hours: one year.
pub const MAX_CPU_HOURS: f64 = 24.0 * 365.0;

/// Functional form applied to every link of the network.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize, Default)]
pub enum LinkCostType {
    /// Bureau of Public Roads: `t0 * (1 + alpha * (x / c)^beta)`.
    #[default]
    Bpr,
    /// Linear congestion: `t0 * (1 + alpha * x / c)`.
    Linear,
}

/// How fixed tolls and the cost scalar enter the generalized link cost.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize, Default)]
pub enum TollType {
    /// Tolls are ignored; the cost is pure travel time.
    #[default]
    Untolled,
    /// Tolls are converted to time units with the cost scalar and added to travel time.
    Fixed,
    /// Marginal social cost pricing: `t(x) + x * t'(x)` plus weighted fixed tolls.
    /// The resulting equilibrium is the system optimum.
    MarginalCost,
}

/// The settings that are baked into link costs when the network is built.
///
/// Changing any of them invalidates the current link costs.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct CostModel {
    pub link_type: LinkCostType,
    pub toll_type: TollType,
    pub cost_scalar: f64,
}

impl CostModel {
    /// Weight applied to fixed tolls for a class with the given toll factor.
    pub fn toll_weight(&self, toll_factor: f64) -> f64 {
        match self.toll_type {
            TollType::Untolled => 0.0,
            TollType::Fixed | TollType::MarginalCost => self.cost_scalar * toll_factor,
        }
    }
}

impl Default for CostModel {
    fn default() -> Self {
        Self {
            link_type: LinkCostType::Bpr,
            toll_type: TollType::Untolled,
            cost_scalar: 1.0,
        }
    }
}

/// Tuning knobs of the path-based gradient projection step.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct GradientProjectionOptions {
    /// Paths whose cost exceeds the minimum by no more than this are treated as balanced.
    pub balance_tolerance: f64,
    /// A generated column must undercut the current minimum path cost by more than this.
    pub column_tolerance: f64,
    /// Inner passes over one OD pair stop once the largest relative path excess drops below this.
    pub inner_convergence: f64,
    /// Step size used by the first trial of the first line search.
    pub initial_step: f64,
    /// Factor applied to the step after a rejected line-search trial.
    pub step_shrink: f64,
    /// Factor applied to the step after a first-trial acceptance, capped at one.
    pub step_growth: f64,
    /// Paths carrying less flow than this are dropped after the solve.
    pub path_drop_epsilon: f64,
}

impl Default for GradientProjectionOptions {
    fn default() -> Self {
        Self {
            balance_tolerance: 1e-10,
            column_tolerance: 1e-12,
            inner_convergence: 1e-3,
            initial_step: 1.0,
            step_shrink: 0.5,
            step_growth: 2.0,
            path_drop_epsilon: 1e-10,
        }
    }
}

/// Aggregated solver configuration, validated once when a solve starts.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SolverConfig {
    /// Relative gap at or below which the run is considered converged.
    pub convergence: f64,
    /// Maximum number of main iterations.
    pub max_iterations: usize,
    /// Maximum number of line-search trials per shift.
    pub max_line_search_iterations: usize,
    /// Maximum number of inner passes over one OD pair per main iteration.
    pub max_inner_iterations: usize,
    /// CPU budget in hours, always inside `(MIN_CPU_HOURS, MAX_CPU_HOURS)`.
    max_cpu_hours: f64,
    /// Scalar converting tolls to time units.
    pub cost_scalar: f64,
    pub toll_type: TollType,
    pub link_type: LinkCostType,
    /// Clear all path sets and link flows at the start of every solve.
    pub reset_on_solve: bool,
    /// Retain an [`IterationRecord`](crate::history::IterationRecord) per iteration.
    pub report_iteration_history: bool,
    pub report_link_detail: bool,
    pub report_path_detail: bool,
    pub gradient: GradientProjectionOptions,
}

impl Default for SolverConfig {
    fn default() -> Self {
        Self {
            convergence: 1e-4,
            max_iterations: 100,
            max_line_search_iterations: 10,
            max_inner_iterations: 15,
            max_cpu_hours: 12.0,
            cost_scalar: 1.0,
            toll_type: TollType::Untolled,
            link_type: LinkCostType::Bpr,
            reset_on_solve: true,
            report_iteration_history: true,
            report_link_detail: false,
            report_path_detail: false,
            gradient: GradientProjectionOptions::default(),
        }
    }
}

impl SolverConfig {
    /// Set the relative gap convergence criterion.
    pub fn with_convergence(mut self, convergence: f64) -> Self {
        self.convergence = convergence;
        self
    }

    /// Set the maximum number of main iterations.
    pub fn with_max_iterations(mut self, max_iterations: usize) -> Self {
        self.max_iterations = max_iterations;
        self
    }

    /// Set the maximum number of line-search trials.
    pub fn with_max_line_search_iterations(mut self, max_line_search_iterations: usize) -> Self {
        self.max_line_search_iterations = max_line_search_iterations;
        self
    }

    /// Set the maximum number of inner passes per OD pair.
    pub fn with_max_inner_iterations(mut self, max_inner_iterations: usize) -> Self {
        self.max_inner_iterations = max_inner_iterations;
        self
    }

    /// Set the CPU budget in hours, clamped into the accepted range.
    pub fn with_max_cpu_hours(mut self, hours: f64) -> Self {
        self.max_cpu_hours = clamp_cpu_hours(hours);
        self
    }

    /// Set the toll-to-time conversion scalar.
    pub fn with_cost_scalar(mut self, cost_scalar: f64) -> Self {
        self.cost_scalar = cost_scalar;
        self
    }

    pub fn with_toll_type(mut self, toll_type: TollType) -> Self {
        self.toll_type = toll_type;
        self
    }

    pub fn with_link_type(mut self, link_type: LinkCostType) -> Self {
        self.link_type = link_type;
        self
    }

    pub fn with_reset_on_solve(mut self, reset: bool) -> Self {
        self.reset_on_solve = reset;
        self
    }

    /// Enable or disable retention of per-iteration records.
    pub fn with_iteration_history(mut self, enabled: bool) -> Self {
        self.report_iteration_history = enabled;
        self
    }

    /// Enable or disable link and path detail in reports.
    pub fn with_detail_reports(mut self, links: bool, paths: bool) -> Self {
        self.report_link_detail = links;
        self.report_path_detail = paths;
        self
    }

    /// Override the gradient projection tuning while preserving other settings.
    pub fn with_gradient(mut self, gradient: GradientProjectionOptions) -> Self {
        self.gradient = gradient;
        self
    }

    /// CPU budget in hours.
    pub fn max_cpu_hours(&self) -> f64 {
        clamp_cpu_hours(self.max_cpu_hours)
    }

    /// CPU budget as a duration.
    pub fn max_cpu_time(&self) -> Duration {
        Duration::from_secs_f64(self.max_cpu_hours() * 3600.0)
    }

    /// The part of the configuration that determines link costs.
    pub fn cost_model(&self) -> CostModel {
        CostModel {
            link_type: self.link_type,
            toll_type: self.toll_type,
            cost_scalar: self.cost_scalar,
        }
    }

    /// Checks the bounds every solve relies on.
    ///
    /// # Errors
    ///
    /// Returns [`TapError::InvalidConfig`] if the convergence criterion is not a
    /// positive finite number, if either iteration bound is zero, if the cost
    /// scalar is negative or non-finite, or if a step factor lies outside its range.
    pub fn validate(&self) -> Result<()> {
        if !self.convergence.is_finite() || self.convergence <= 0.0 {
            return Err(TapError::invalid_config(format!(
                "convergence criterion must be positive, found {}",
                self.convergence
            )));
        }
        if self.max_iterations == 0 {
            return Err(TapError::invalid_config("max_iterations must be at least 1"));
        }
        if self.max_line_search_iterations == 0 {
            return Err(TapError::invalid_config(
                "max_line_search_iterations must be at least 1",
            ));
        }
        if !self.cost_scalar.is_finite() || self.cost_scalar < 0.0 {
            return Err(TapError::invalid_config(format!(
                "cost scalar must be non-negative, found {}",
                self.cost_scalar
            )));
        }

        let gp = &self.gradient;
        if !(gp.initial_step > 0.0 && gp.initial_step <= 1.0) {
            return Err(TapError::invalid_config("initial_step must lie in (0, 1]"));
        }
        if !(gp.step_shrink > 0.0 && gp.step_shrink < 1.0) {
            return Err(TapError::invalid_config("step_shrink must lie in (0, 1)"));
        }
        if !(gp.step_growth >= 1.0 && gp.step_growth.is_finite()) {
            return Err(TapError::invalid_config("step_growth must be at least 1"));
        }
        for (name, value) in [
            ("balance_tolerance", gp.balance_tolerance),
            ("column_tolerance", gp.column_tolerance),
            ("inner_convergence", gp.inner_convergence),
            ("path_drop_epsilon", gp.path_drop_epsilon),
        ] {
            if !value.is_finite() || value < 0.0 {
                return Err(TapError::invalid_config(format!(
                    "{name} must be non-negative, found {value}"
                )));
            }
        }
        Ok(())
    }
}

/// Values outside the open interval are pulled just inside it.
fn clamp_cpu_hours(hours: f64) -> f64 {
    if hours.is_nan() || hours <= MIN_CPU_HOURS {
        MIN_CPU_HOURS * 1.000_001
    } else if hours >= MAX_CPU_HOURS {
        MAX_CPU_HOURS * 0.999_999
    } else {
        hours
    }
}

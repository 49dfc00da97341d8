//! The equilibration driver: algorithm hooks, termination control and the
//! rebuild guard.

use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use log::{debug, info, warn};
use serde::Serialize;

use crate::error::{Result, TapError};
use crate::evaluation::{beckmann_objective, relative_gap};
use crate::history::{IterationHistory, IterationRecord};
use crate::network::Network;
use crate::options::{LinkCostType, SolverConfig, TollType};
use crate::report::{self, PathDetail, SolveReport};

/// Outcome of a solve.
///
/// `Initial` and `Running` are transient; every other state is terminal.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
pub enum TerminationState {
    Initial,
    Running,
    AccuracyReached,
    MaxIterReached,
    MaxCpuReached,
    UserAborted,
    Error,
}

impl TerminationState {
    pub fn is_terminal(&self) -> bool {
        !matches!(self, Self::Initial | Self::Running)
    }
}

impl fmt::Display for TerminationState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            Self::Initial => "initial",
            Self::Running => "running",
            Self::AccuracyReached => "accuracy reached",
            Self::MaxIterReached => "maximum iterations reached",
            Self::MaxCpuReached => "maximum CPU time reached",
            Self::UserAborted => "aborted by user",
            Self::Error => "error",
        };
        f.write_str(label)
    }
}

/// Whether link costs reflect the current cost model.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum NetworkState {
    Built,
    NeedsRebuild,
}

/// Shared flag a caller raises to stop a running solve at its next termination check.
#[derive(Clone, Debug, Default)]
pub struct AbortHandle {
    flag: Arc<AtomicBool>,
}

impl AbortHandle {
    pub fn new() -> Self {
        Self::default()
    }

    /// Requests that the solve stop at its next termination check.
    pub fn request(&self) {
        self.flag.store(true, Ordering::Relaxed);
    }

    pub fn is_requested(&self) -> bool {
        self.flag.load(Ordering::Relaxed)
    }

    pub fn clear(&self) {
        self.flag.store(false, Ordering::Relaxed);
    }
}

/// Hooks an equilibration algorithm supplies to [`Solver::solve`].
///
/// `initialize` and `main_loop` are required. The network handle passed to each
/// hook is owned by the solver for the whole run; algorithm-private state such as
/// per-class path sets lives in the implementing type.
pub trait Algorithm {
    /// Name used in logs and reports.
    fn name(&self) -> &str;

    /// An idle algorithm has no equilibration step and its solve is a zero-length run.
    fn is_idle(&self) -> bool {
        false
    }

    /// Runs once before [`initialize`](Algorithm::initialize), typically to seed a
    /// feasible assignment.
    fn pre_process(&mut self, _network: &mut Network, _config: &SolverConfig) -> Result<()> {
        Ok(())
    }

    /// Resets per-run state.
    fn initialize(&mut self, network: &mut Network, config: &SolverConfig) -> Result<()>;

    /// Performs one equilibration pass and returns the number of line-search trials spent.
    fn main_loop(&mut self, network: &mut Network, config: &SolverConfig) -> Result<usize>;

    /// Objective value at the current assignment.
    fn objective(&self, network: &Network, config: &SolverConfig) -> f64 {
        let weight = config.cost_model().toll_weight(1.0);
        beckmann_objective(network.graph(), true, weight)
    }

    /// Quantity compared against the convergence criterion.
    fn convergence_indicator(&self, network: &Network, config: &SolverConfig) -> Result<f64> {
        relative_gap(network, config.cost_model().toll_weight(1.0), true)
    }

    /// Runs once after the main loop stops.
    fn post_process(&mut self, _network: &mut Network, _config: &SolverConfig) -> Result<()> {
        Ok(())
    }

    /// Path flows and costs for reporting.
    fn path_details(&self, network: &Network, config: &SolverConfig) -> Vec<PathDetail> {
        let weight = config.cost_model().toll_weight(1.0);
        report::path_details(
            network.graph(),
            0,
            weight,
            network.od_pairs().iter().map(|od| od.paths()),
        )
    }
}

/// The undifferentiated algorithm: solving with it performs no iterations.
#[derive(Clone, Copy, Debug, Default)]
pub struct BaseAlgorithm;

impl Algorithm for BaseAlgorithm {
    fn name(&self) -> &str {
        "base"
    }

    fn is_idle(&self) -> bool {
        true
    }

    fn initialize(&mut self, _network: &mut Network, _config: &SolverConfig) -> Result<()> {
        Ok(())
    }

    fn main_loop(&mut self, _network: &mut Network, _config: &SolverConfig) -> Result<usize> {
        Ok(0)
    }
}

/// Owns a network for the duration of its solves and drives an [`Algorithm`].
#[derive(Debug)]
pub struct Solver<A> {
    network: Network,
    config: SolverConfig,
    algorithm: A,
    network_state: NetworkState,
    state: TerminationState,
    iteration: usize,
    objective: f64,
    relative_gap: f64,
    started: Option<Instant>,
    elapsed: Duration,
    history: IterationHistory,
    abort: AbortHandle,
    last_error: Option<TapError>,
}

impl<A: Algorithm> Solver<A> {
    /// Takes ownership of the network and evaluates its link costs under the
    /// configured cost model.
    pub fn new(mut network: Network, config: SolverConfig, algorithm: A) -> Self {
        network.rebuild(config.cost_model());
        Self {
            network,
            config,
            algorithm,
            network_state: NetworkState::Built,
            state: TerminationState::Initial,
            iteration: 0,
            objective: f64::NAN,
            relative_gap: f64::INFINITY,
            started: None,
            elapsed: Duration::ZERO,
            history: IterationHistory::new(),
            abort: AbortHandle::new(),
            last_error: None,
        }
    }

    /// Runs the algorithm until a terminal state is reached.
    ///
    /// Any terminal state is a normal outcome; callers inspect it to decide whether
    /// the assignment is accurate enough. Errors met during the run are reported
    /// through [`TerminationState::Error`] and [`last_error`](Solver::last_error).
    ///
    /// # Errors
    ///
    /// Returns [`TapError::InvalidConfig`] if the configuration fails validation and
    /// [`TapError::StaleNetworkState`] if a cost model change has not been applied
    /// with [`rebuild`](Solver::rebuild). Nothing is mutated in either case.
    pub fn solve(&mut self) -> Result<TerminationState> {
        self.config.validate()?;
        if self.network_state == NetworkState::NeedsRebuild {
            return Err(TapError::StaleNetworkState);
        }
        if self.algorithm.is_idle() {
            debug!("{} performs no equilibration; nothing to solve", self.algorithm.name());
            return Ok(self.state);
        }

        self.history.clear();
        self.iteration = 0;
        self.last_error = None;
        self.objective = f64::NAN;
        self.relative_gap = f64::INFINITY;
        self.state = TerminationState::Running;
        let start = Instant::now();
        self.started = Some(start);

        info!(
            "{}: solving {} OD pairs over {} links",
            self.algorithm.name(),
            self.network.od_pairs().len(),
            self.network.graph().link_count()
        );

        let prepared = self
            .algorithm
            .pre_process(&mut self.network, &self.config)
            .and_then(|()| self.algorithm.initialize(&mut self.network, &self.config));

        match prepared {
            Err(err) => self.fail(err),
            Ok(()) => loop {
                match self.iterate() {
                    Ok(line_searches) => {
                        self.record(line_searches, start);
                        self.iteration += 1;
                    }
                    Err(err) => self.fail(err),
                }
                if self.check_termination().is_terminal() {
                    break;
                }
            },
        }

        if let Err(err) = self.algorithm.post_process(&mut self.network, &self.config) {
            self.fail(err);
        }

        self.elapsed = start.elapsed();
        info!(
            "{}: {} after {} iterations (gap {:.3e}, objective {:.6}, {:.3}s)",
            self.algorithm.name(),
            self.state,
            self.iteration,
            self.relative_gap,
            self.objective,
            self.elapsed.as_secs_f64()
        );
        Ok(self.state)
    }

    /// One main loop pass followed by objective and gap evaluation.
    fn iterate(&mut self) -> Result<usize> {
        let line_searches = self.algorithm.main_loop(&mut self.network, &self.config)?;

        let objective = self.algorithm.objective(&self.network, &self.config);
        if !objective.is_finite() {
            return Err(TapError::numerical("objective evaluation"));
        }
        let gap = self
            .algorithm
            .convergence_indicator(&self.network, &self.config)?;
        if !gap.is_finite() || gap < 0.0 {
            return Err(TapError::numerical("convergence indicator"));
        }
        self.objective = objective;
        self.relative_gap = gap;
        Ok(line_searches)
    }

    fn record(&mut self, line_searches: usize, start: Instant) {
        debug!(
            "iteration {}: objective {:.6}, gap {:.3e}, {} line searches",
            self.iteration, self.objective, self.relative_gap, line_searches
        );
        if !self.config.report_iteration_history {
            return;
        }
        self.history.push(IterationRecord {
            index: self.iteration,
            objective: self.objective,
            relative_gap: self.relative_gap,
            line_searches,
            elapsed: start.elapsed(),
        });
    }

    fn fail(&mut self, err: TapError) {
        warn!("{}: stopping on error: {err}", self.algorithm.name());
        self.last_error = Some(err);
        self.state = TerminationState::Error;
    }

    /// Evaluates the termination conditions in priority order.
    ///
    /// A terminal state is returned unchanged without touching anything else.
    /// An observed abort request is consumed.
    pub fn check_termination(&mut self) -> TerminationState {
        if self.state != TerminationState::Running {
            return self.state;
        }
        let next = if self.last_error.is_some() {
            TerminationState::Error
        } else if self.abort.is_requested() {
            self.abort.clear();
            TerminationState::UserAborted
        } else if self.relative_gap <= self.config.convergence {
            TerminationState::AccuracyReached
        } else if self.iteration >= self.config.max_iterations {
            TerminationState::MaxIterReached
        } else {
            if let Some(start) = self.started {
                self.elapsed = start.elapsed();
            }
            if self.elapsed >= self.config.max_cpu_time() {
                TerminationState::MaxCpuReached
            } else {
                TerminationState::Running
            }
        };
        self.state = next;
        next
    }

    /// Applies `update` to the configuration. Changing the cost scalar, toll type
    /// or link type requires a [`rebuild`](Solver::rebuild) before the next solve.
    pub fn configure(&mut self, update: impl FnOnce(&mut SolverConfig)) {
        let before = self.config.cost_model();
        update(&mut self.config);
        if self.config.cost_model() != before {
            debug!("cost model changed; network needs rebuild");
            self.network_state = NetworkState::NeedsRebuild;
        }
    }

    pub fn set_cost_scalar(&mut self, cost_scalar: f64) {
        self.configure(|config| config.cost_scalar = cost_scalar);
    }

    pub fn set_link_type(&mut self, link_type: LinkCostType) {
        self.configure(|config| config.link_type = link_type);
    }

    pub fn set_toll_type(&mut self, toll_type: TollType) {
        self.configure(|config| config.toll_type = toll_type);
    }

    /// Re-evaluates link costs under the current cost model.
    pub fn rebuild(&mut self) {
        self.network.rebuild(self.config.cost_model());
        self.network_state = NetworkState::Built;
    }

    /// Shares an existing abort flag, e.g. one already handed to another thread.
    pub fn with_abort_handle(mut self, abort: AbortHandle) -> Self {
        self.abort = abort;
        self
    }

    pub fn network_state(&self) -> NetworkState {
        self.network_state
    }

    /// Handle that stays valid across solves.
    pub fn abort_handle(&self) -> AbortHandle {
        self.abort.clone()
    }

    pub fn state(&self) -> TerminationState {
        self.state
    }

    /// Number of completed main iterations in the last solve.
    pub fn iteration(&self) -> usize {
        self.iteration
    }

    pub fn objective(&self) -> f64 {
        self.objective
    }

    pub fn relative_gap(&self) -> f64 {
        self.relative_gap
    }

    /// Duration of the last solve, or the time observed at the last termination check.
    pub fn elapsed(&self) -> Duration {
        self.elapsed
    }

    pub fn history(&self) -> &IterationHistory {
        &self.history
    }

    pub fn last_error(&self) -> Option<&TapError> {
        self.last_error.as_ref()
    }

    pub fn config(&self) -> &SolverConfig {
        &self.config
    }

    pub fn network(&self) -> &Network {
        &self.network
    }

    pub fn algorithm(&self) -> &A {
        &self.algorithm
    }

    /// Read-only snapshot for reporters, honoring the reporting toggles.
    pub fn report(&self) -> SolveReport {
        SolveReport {
            algorithm: self.algorithm.name().to_string(),
            state: self.state,
            iterations: self.iteration,
            objective: self.objective,
            relative_gap: self.relative_gap,
            elapsed_seconds: self.elapsed.as_secs_f64(),
            history: self
                .config
                .report_iteration_history
                .then(|| self.history.records().to_vec()),
            links: self
                .config
                .report_link_detail
                .then(|| report::link_details(self.network.graph(), &self.config)),
            paths: self
                .config
                .report_path_detail
                .then(|| self.algorithm.path_details(&self.network, &self.config)),
        }
    }

    /// Releases the network and the algorithm state.
    pub fn into_parts(self) -> (Network, A) {
        (self.network, self.algorithm)
    }
}

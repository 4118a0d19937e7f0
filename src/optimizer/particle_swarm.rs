//! Constriction-coefficient particle swarm optimization.
//!
//! A derivative-free global search over a box around a starting guess. Each
//! particle carries a position, a velocity and the best position it has seen;
//! the swarm shares the best position any particle has seen. Every iteration
//! pulls each particle toward both:
//!
//! ```text
//! v ← κ · (v + c_p·r_p·(p_best − x) + c_g·r_g·(g_best − x)),   |v| ≤ v_max
//! x ← x + v
//! ```
//!
//! with `r_p, r_g ~ U(0, 1)` drawn per particle and per dimension, and the
//! Clerc–Kennedy constriction coefficient
//!
//! ```text
//! κ = 2 / |2 − φ − √(φ² − 4φ)|,   φ = c_p + c_g > 4
//! ```
//!
//! which keeps trajectories bounded without an explicit inertia schedule.
//!
//! # Angles
//!
//! Displacements toward the personal and global best use the shortest arc on
//! angle dimensions, and every moved particle is wrapped (plus the optional
//! model hook) before it is scored.
//!
//! # Batching
//!
//! The whole swarm is scored in tiles of the evaluator's batch width, so the
//! swarm size must be a whole number of tiles. This is checked when the
//! optimizer is built, before any evaluation.
//!
//! # Termination
//!
//! Every run makes at least one move. After each move the search stops once
//! the swarm has collapsed (the L2 norm of the per-dimension `max − min`
//! extent of all positions drops below `delta_coeff_termination`) or once the
//! iteration count exceeds `max_iterations`, so a run that never collapses
//! makes `max_iterations + 1` moves.
//!
//! # Example
//!
//! ```
//! use nalgebra::{DVector, dvector};
//! use posefit::core::objective::{FnEvaluator, Objective};
//! use posefit::optimizer::particle_swarm::{ParticleSwarm, ParticleSwarmConfig};
//!
//! # fn main() -> Result<(), posefit::PoseFitError> {
//! let evaluator = FnEvaluator::new(|c: &DVector<f64>| (c[0] - 1.0).powi(2) + c[1].powi(2))
//!     .with_batch_width(8);
//! let mut objective = Objective::new(evaluator);
//!
//! let config = ParticleSwarmConfig::new().with_swarm_size(32).with_seed(3);
//! let mut swarm = ParticleSwarm::with_config(config, objective.batch_width())?;
//! let result = swarm.minimize(
//!     &mut objective,
//!     &dvector![0.0, 0.0],
//!     &dvector![2.0, 2.0],
//!     &[false, false],
//!     None,
//! )?;
//! assert!((result.parameters[0] - 1.0).abs() < 1e-2);
//! # Ok(())
//! # }
//! ```
//!
//! # References
//!
//! - Clerc, M. & Kennedy, J. (2002). The particle swarm: explosion, stability,
//!   and convergence in a multidimensional complex space. *IEEE TEC* 6(1).

use crate::{
    core::objective::{Objective, ResidualEvaluator},
    error, manifold,
    manifold::{Renormalize, so2},
    optimizer,
};

use nalgebra::DVector;
use rand::{Rng, SeedableRng, rngs::StdRng};
use std::fmt;
use tracing::debug;
use web_time as time;

/// Summary statistics for a particle swarm run.
#[derive(Debug, Clone)]
pub struct ParticleSwarmSummary {
    /// Objective at the starting guess
    pub initial_cost: f64,
    /// Best objective found
    pub final_cost: f64,
    /// Iterations performed
    pub iterations: usize,
    /// Number of particles
    pub swarm_size: usize,
    /// Coefficient dimension
    pub dimension: usize,
    /// Final swarm extent norm
    pub final_spread: f64,
    /// Objective evaluations performed during the run
    pub cost_evaluations: usize,
    /// Total time elapsed
    pub total_time: time::Duration,
    /// Average time per iteration
    pub average_time_per_iteration: time::Duration,
    /// Per-iteration statistics (collected only at debug level)
    pub iteration_history: Vec<IterationStats>,
    /// Why the run stopped
    pub convergence_status: optimizer::OptimizationStatus,
}

impl fmt::Display for ParticleSwarmSummary {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "Particle Swarm Final Result")?;
        if self.convergence_status.is_converged() {
            writeln!(f, "CONVERGED ({:?})", self.convergence_status)?;
        } else {
            writeln!(f, "STOPPED ({:?})", self.convergence_status)?;
        }
        writeln!(f)?;
        writeln!(f, "Swarm:")?;
        writeln!(f, "  Particles:  {}", self.swarm_size)?;
        writeln!(f, "  Dimension:  {}", self.dimension)?;
        writeln!(f, "  Spread:     {:.2e}", self.final_spread)?;
        writeln!(f)?;
        writeln!(f, "Cost:")?;
        writeln!(f, "  Initial:   {:.6e}", self.initial_cost)?;
        writeln!(f, "  Final:     {:.6e}", self.final_cost)?;
        writeln!(
            f,
            "  Reduction: {:.6e} ({:.2}%)",
            self.initial_cost - self.final_cost,
            optimizer::reduction_percent(self.initial_cost, self.final_cost)
        )?;
        writeln!(f)?;
        writeln!(f, "Iterations:")?;
        writeln!(f, "  Total:       {}", self.iterations)?;
        writeln!(f, "  Evaluations: {}", self.cost_evaluations)?;
        writeln!(f)?;
        writeln!(f, "Performance:")?;
        writeln!(
            f,
            "  Total time:             {:.2}ms",
            self.total_time.as_secs_f64() * 1000.0
        )?;
        writeln!(
            f,
            "  Average per iteration:  {:.2}ms",
            self.average_time_per_iteration.as_secs_f64() * 1000.0
        )?;
        Ok(())
    }
}

/// Per-iteration statistics for detailed logging.
#[derive(Debug, Clone)]
pub struct IterationStats {
    /// Iteration number (0 = initial swarm)
    pub iteration: usize,
    /// Global best objective after this iteration
    pub best_cost: f64,
    /// Improvement of the global best during this iteration
    pub cost_change: f64,
    /// L2 norm of the per-dimension swarm extent
    pub spread: f64,
    /// Particles whose personal best improved
    pub improved_particles: usize,
    /// Time taken for this iteration in milliseconds
    pub iter_time_ms: f64,
    /// Total elapsed time since optimization started in milliseconds
    pub total_time_ms: f64,
}

impl IterationStats {
    /// Print table header
    pub fn print_header() {
        debug!(
            "{:>4}  {:>13}  {:>13}  {:>11}  {:>8}  {:>11}  {:>13}",
            "iter", "best_cost", "cost_change", "spread", "improved", "iter_time", "total_time"
        );
    }

    pub fn print_line(&self) {
        debug!(
            "{:>4}  {:>13.6e}  {:>13.2e}  {:>11.2e}  {:>8}  {:>9.2}ms  {:>11.2}ms",
            self.iteration,
            self.best_cost,
            self.cost_change,
            self.spread,
            self.improved_particles,
            self.iter_time_ms,
            self.total_time_ms
        );
    }
}

/// Configuration parameters for the particle swarm.
///
/// ```
/// use posefit::optimizer::particle_swarm::ParticleSwarmConfig;
///
/// let config = ParticleSwarmConfig::new()
///     .with_swarm_size(128)
///     .with_max_iterations(300)
///     .with_delta_coeff_termination(1e-3);
/// ```
#[derive(Debug, Clone, PartialEq)]
pub struct ParticleSwarmConfig {
    /// Number of particles; must be a multiple of the evaluator batch width
    pub swarm_size: usize,
    /// Maximum number of iterations
    pub max_iterations: usize,
    /// Stop once the swarm extent norm falls below this value
    pub delta_coeff_termination: f64,
    /// Cognitive (personal best) acceleration coefficient
    pub c_p: f64,
    /// Social (global best) acceleration coefficient
    pub c_g: f64,
    /// Seed the random engine is reset to at the start of every run
    pub seed: u64,
}

impl Default for ParticleSwarmConfig {
    fn default() -> Self {
        Self {
            swarm_size: 64,
            max_iterations: 1000,
            delta_coeff_termination: 1e-4,
            c_p: 2.8,
            c_g: 1.3,
            seed: 0,
        }
    }
}

impl ParticleSwarmConfig {
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the number of particles
    pub fn with_swarm_size(mut self, swarm_size: usize) -> Self {
        self.swarm_size = swarm_size;
        self
    }

    /// Set the maximum number of iterations
    pub fn with_max_iterations(mut self, max_iterations: usize) -> Self {
        self.max_iterations = max_iterations;
        self
    }

    /// Set the swarm extent termination threshold
    pub fn with_delta_coeff_termination(mut self, delta_coeff_termination: f64) -> Self {
        self.delta_coeff_termination = delta_coeff_termination;
        self
    }

    /// Set the acceleration coefficients (their sum must exceed 4)
    pub fn with_acceleration(mut self, c_p: f64, c_g: f64) -> Self {
        self.c_p = c_p;
        self.c_g = c_g;
        self
    }

    /// Set the random seed
    pub fn with_seed(mut self, seed: u64) -> Self {
        self.seed = seed;
        self
    }

    /// Print configuration parameters (debug level logging)
    pub fn print_configuration(&self) {
        debug!(
            "\nConfiguration:\n  Solver:             Particle Swarm (constriction)\n  Swarm size:         {}\n  Max iterations:     {}\n  Spread termination: {:.2e}\n  c_p / c_g:          {:.2} / {:.2}\n  Seed:               {}",
            self.swarm_size,
            self.max_iterations,
            self.delta_coeff_termination,
            self.c_p,
            self.c_g,
            self.seed
        );
    }

    fn validate(&self, batch_width: usize) -> optimizer::OptimizerResult<()> {
        if self.swarm_size == 0 || batch_width == 0 || self.swarm_size % batch_width != 0 {
            return Err(optimizer::OptimizerError::InvalidSwarmSize {
                swarm_size: self.swarm_size,
                batch_width,
            }
            .log());
        }
        if !self.delta_coeff_termination.is_finite() || self.delta_coeff_termination < 0.0 {
            return Err(optimizer::OptimizerError::InvalidParameters(format!(
                "delta_coeff_termination must be finite and non-negative, got {}",
                self.delta_coeff_termination
            ))
            .log());
        }
        constriction_coefficient(self.c_p, self.c_g).map(|_| ())
    }
}

/// Clerc–Kennedy constriction coefficient for `φ = c_p + c_g`.
///
/// Fails unless `φ > 4`.
pub fn constriction_coefficient(c_p: f64, c_g: f64) -> optimizer::OptimizerResult<f64> {
    let phi = c_p + c_g;
    if !(phi.is_finite() && phi > 4.0) {
        return Err(optimizer::OptimizerError::InvalidAccelerationCoefficients { phi }.log());
    }
    Ok(2.0 / (2.0 - phi - (phi * phi - 4.0 * phi).sqrt()).abs())
}

/// One particle of the swarm.
#[derive(Debug, Clone)]
pub struct SwarmNode {
    pub position: DVector<f64>,
    pub velocity: DVector<f64>,
    pub residue: f64,
    pub best_position: DVector<f64>,
    pub best_residue: f64,
}

/// Best position any particle has seen.
#[derive(Debug, Clone)]
pub struct GlobalBest {
    pub position: DVector<f64>,
    pub residue: f64,
}

struct Swarm {
    nodes: Vec<SwarmNode>,
    /// Particle indices ordered by current residue, best first
    ranking: Vec<usize>,
    global: GlobalBest,
    vel_max: DVector<f64>,
}

impl Swarm {
    /// Scatter particles uniformly around `start`; particle 0 sits on `start`.
    fn scatter<R: Rng + ?Sized>(
        rng: &mut R,
        swarm_size: usize,
        start: &DVector<f64>,
        radius: &DVector<f64>,
        angle_flags: &[bool],
        renormalize: Option<&dyn Renormalize>,
    ) -> Self {
        let vel_max = radius.abs();
        let dim = start.len();
        let nodes = (0..swarm_size)
            .map(|i| {
                let mut position = if i == 0 {
                    start.clone()
                } else {
                    DVector::from_fn(dim, |d, _| {
                        start[d] + vel_max[d] * (2.0 * rng.random::<f64>() - 1.0)
                    })
                };
                manifold::normalize(&mut position, angle_flags, renormalize);
                let velocity =
                    DVector::from_fn(dim, |d, _| vel_max[d] * (2.0 * rng.random::<f64>() - 1.0));
                SwarmNode {
                    best_position: position.clone(),
                    position,
                    velocity,
                    residue: f64::INFINITY,
                    best_residue: f64::INFINITY,
                }
            })
            .collect();

        Self {
            nodes,
            ranking: (0..swarm_size).collect(),
            global: GlobalBest {
                position: start.clone(),
                residue: f64::INFINITY,
            },
            vel_max,
        }
    }

    /// Stable insertion sort of the ranking by current residue.
    fn rank(&mut self) {
        for i in 1..self.ranking.len() {
            let mut j = i;
            while j > 0
                && self.nodes[self.ranking[j - 1]].residue > self.nodes[self.ranking[j]].residue
            {
                self.ranking.swap(j - 1, j);
                j -= 1;
            }
        }
    }

    /// Velocity and position update for every particle, in ranked order.
    fn advance<R: Rng + ?Sized>(
        &mut self,
        rng: &mut R,
        kappa: f64,
        c_p: f64,
        c_g: f64,
        angle_flags: &[bool],
        renormalize: Option<&dyn Renormalize>,
    ) {
        let global = &self.global.position;
        for &index in &self.ranking {
            let node = &mut self.nodes[index];
            for d in 0..node.position.len() {
                let r_p: f64 = rng.random();
                let r_g: f64 = rng.random();
                let x = node.position[d];
                let (to_personal, to_global) = if angle_flags[d] {
                    (
                        so2::circular_displacement(node.best_position[d], x),
                        so2::circular_displacement(global[d], x),
                    )
                } else {
                    (node.best_position[d] - x, global[d] - x)
                };
                let v = kappa
                    * (node.velocity[d] + c_p * r_p * to_personal + c_g * r_g * to_global);
                node.velocity[d] = v.clamp(-self.vel_max[d], self.vel_max[d]);
            }
            node.position += &node.velocity;
            manifold::normalize(&mut node.position, angle_flags, renormalize);
        }
    }

    /// Score all particles and update personal and global bests.
    ///
    /// Returns the number of particles whose personal best improved.
    fn evaluate<E: ResidualEvaluator>(
        &mut self,
        objective: &mut Objective<E>,
    ) -> error::PoseFitResult<usize> {
        let positions: Vec<DVector<f64>> =
            self.nodes.iter().map(|node| node.position.clone()).collect();
        let residues = objective.evaluate_batch(&positions)?;

        let mut improved = 0;
        for (node, residue) in self.nodes.iter_mut().zip(residues) {
            node.residue = residue;
            if residue < node.best_residue {
                node.best_residue = residue;
                node.best_position.copy_from(&node.position);
                improved += 1;
            }
            if residue < self.global.residue {
                self.global.residue = residue;
                self.global.position.copy_from(&node.position);
            }
        }
        Ok(improved)
    }

    /// Per-dimension `max − min` over current positions.
    fn spread(&self) -> DVector<f64> {
        let positions: Vec<DVector<f64>> =
            self.nodes.iter().map(|node| node.position.clone()).collect();
        optimizer::extent(&positions).unwrap_or_else(|| DVector::zeros(self.vel_max.len()))
    }
}

/// Constriction-coefficient particle swarm optimizer.
///
/// The random engine is owned by the optimizer and reseeded from
/// [`ParticleSwarmConfig::seed`] at the start of every run, so repeated runs
/// from the same inputs are reproducible.
pub struct ParticleSwarm {
    config: ParticleSwarmConfig,
    batch_width: usize,
    kappa: f64,
    rng: StdRng,
    observers: optimizer::OptObserverVec,
}

impl ParticleSwarm {
    /// Create a swarm with default configuration for an evaluator of `batch_width`.
    pub fn new(batch_width: usize) -> optimizer::OptimizerResult<Self> {
        Self::with_config(ParticleSwarmConfig::default(), batch_width)
    }

    /// Create a swarm, validating the configuration against `batch_width`.
    pub fn with_config(
        config: ParticleSwarmConfig,
        batch_width: usize,
    ) -> optimizer::OptimizerResult<Self> {
        config.validate(batch_width)?;
        let kappa = constriction_coefficient(config.c_p, config.c_g)?;
        let rng = StdRng::seed_from_u64(config.seed);
        Ok(Self {
            config,
            batch_width,
            kappa,
            rng,
            observers: optimizer::OptObserverVec::new(),
        })
    }

    pub fn config(&self) -> &ParticleSwarmConfig {
        &self.config
    }

    /// Constriction coefficient κ in use
    pub fn constriction(&self) -> f64 {
        self.kappa
    }

    /// Add an observer notified after every iteration with the global best.
    pub fn add_observer(&mut self, observer: impl optimizer::OptObserver + 'static) {
        self.observers.add(observer);
    }

    /// Minimize `objective` over the box `start ± |radius|`.
    ///
    /// # Arguments
    /// * `objective` - Penalized objective; its batch width must match the swarm's
    /// * `start` - Initial guess, also the position of particle 0
    /// * `radius` - Per-dimension search radius, also the velocity limit
    /// * `angle_flags` - Which dimensions are periodic angles
    /// * `renormalize` - Optional model hook applied after angle wrapping
    ///
    /// # Returns
    /// The global best vector with run statistics. Running out of iterations is
    /// reported through the status, not as an error.
    pub fn minimize<E: ResidualEvaluator>(
        &mut self,
        objective: &mut Objective<E>,
        start: &DVector<f64>,
        radius: &DVector<f64>,
        angle_flags: &[bool],
        renormalize: Option<&dyn Renormalize>,
    ) -> error::PoseFitResult<optimizer::SolverResult<DVector<f64>>> {
        self.check_inputs(objective, start, radius, angle_flags)?;

        let start_time = time::Instant::now();
        let evaluations_before = objective.evaluation_count();
        self.rng = StdRng::seed_from_u64(self.config.seed);

        let ParticleSwarmConfig {
            swarm_size,
            max_iterations,
            delta_coeff_termination,
            c_p,
            c_g,
            ..
        } = self.config;

        let mut swarm = Swarm::scatter(
            &mut self.rng,
            swarm_size,
            start,
            radius,
            angle_flags,
            renormalize,
        );
        swarm.evaluate(objective)?;
        // Particle 0 sits on the start point
        let initial_cost = swarm.nodes[0].residue;

        let debug_enabled = tracing::enabled!(tracing::Level::DEBUG);
        let mut iteration_stats = Vec::new();
        if debug_enabled {
            self.config.print_configuration();
            IterationStats::print_header();
        }

        let mut spread = swarm.spread().norm();
        let mut iterations = 0;
        self.notify(&swarm, spread, 0);

        // At least one move is always made; the limit is tested after it
        let status = loop {
            let iter_start = time::Instant::now();
            let previous_best = swarm.global.residue;

            swarm.rank();
            swarm.advance(
                &mut self.rng,
                self.kappa,
                c_p,
                c_g,
                angle_flags,
                renormalize,
            );
            let improved = swarm.evaluate(objective)?;
            spread = swarm.spread().norm();
            iterations += 1;

            if debug_enabled {
                let stats = IterationStats {
                    iteration: iterations,
                    best_cost: swarm.global.residue,
                    cost_change: previous_best - swarm.global.residue,
                    spread,
                    improved_particles: improved,
                    iter_time_ms: iter_start.elapsed().as_secs_f64() * 1000.0,
                    total_time_ms: start_time.elapsed().as_secs_f64() * 1000.0,
                };
                stats.print_line();
                iteration_stats.push(stats);
            }

            self.notify(&swarm, spread, iterations);

            if spread < delta_coeff_termination {
                break optimizer::OptimizationStatus::SpreadToleranceReached;
            }
            if iterations > max_iterations {
                break optimizer::OptimizationStatus::MaxIterationsReached;
            }
        };

        let elapsed = start_time.elapsed();
        let cost_evaluations = objective.evaluation_count() - evaluations_before;
        if debug_enabled {
            let summary = ParticleSwarmSummary {
                initial_cost,
                final_cost: swarm.global.residue,
                iterations,
                swarm_size,
                dimension: start.len(),
                final_spread: spread,
                cost_evaluations,
                total_time: elapsed,
                average_time_per_iteration: if iterations > 0 {
                    elapsed / iterations as u32
                } else {
                    time::Duration::from_secs(0)
                },
                iteration_history: iteration_stats,
                convergence_status: status.clone(),
            };
            debug!("{}", summary);
        }

        Ok(optimizer::SolverResult {
            parameters: swarm.global.position,
            status,
            initial_cost,
            final_cost: swarm.global.residue,
            iterations,
            elapsed_time: elapsed,
            convergence_info: Some(optimizer::ConvergenceInfo {
                final_swarm_spread: Some(spread),
                cost_evaluations,
                ..Default::default()
            }),
        })
    }

    fn notify(&self, swarm: &Swarm, spread: f64, iteration: usize) {
        if self.observers.is_empty() {
            return;
        }
        self.observers.set_iteration_metrics(
            swarm.global.residue,
            &optimizer::IterationMetrics {
                swarm_spread: Some(spread),
                ..Default::default()
            },
        );
        self.observers.notify(&swarm.global.position, iteration);
    }

    fn check_inputs<E: ResidualEvaluator>(
        &self,
        objective: &Objective<E>,
        start: &DVector<f64>,
        radius: &DVector<f64>,
        angle_flags: &[bool],
    ) -> optimizer::OptimizerResult<()> {
        let dim = start.len();
        if dim == 0 {
            return Err(optimizer::OptimizerError::InvalidParameters(
                "start vector is empty".to_string(),
            )
            .log());
        }
        optimizer::check_dimension("search radius", dim, radius.len())?;
        optimizer::check_dimension("angle flags", dim, angle_flags.len())?;
        if let Some(expected) = objective.dimension() {
            optimizer::check_dimension("objective", expected, dim)?;
        }
        if objective.batch_width() != self.batch_width {
            return Err(optimizer::OptimizerError::InvalidSwarmSize {
                swarm_size: self.config.swarm_size,
                batch_width: objective.batch_width(),
            }
            .log());
        }
        if start.iter().chain(radius.iter()).any(|v| !v.is_finite()) {
            return Err(optimizer::OptimizerError::InvalidParameters(
                "start and radius must be finite".to_string(),
            )
            .log());
        }
        Ok(())
    }
}

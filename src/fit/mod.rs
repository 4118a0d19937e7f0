//! Per-frame pose fitting.
//!
//! [`FitController`] owns everything needed to fit one frame: the penalized
//! [`Objective`], the particle swarm, the constraint table and the search
//! radius. A fit runs the swarm `repeats` times, each time starting from the
//! previous result with the radius shrunk by `radius_decay`, and can finish
//! with a BFGS polish on a central-difference gradient.
//!
//! ```text
//! start ──► swarm(r) ──► swarm(r·d) ──► … ──► swarm(r·d^(k−1)) ──► [BFGS] ──► best
//! ```
//!
//! # Example
//!
//! ```
//! use nalgebra::dvector;
//! use posefit::core::constraints::ConstraintTable;
//! use posefit::core::objective::FnEvaluator;
//! use posefit::fit::{FitConfig, FitController};
//! use posefit::optimizer::ParticleSwarmConfig;
//!
//! # fn main() -> Result<(), posefit::PoseFitError> {
//! let evaluator = FnEvaluator::new(|c: &nalgebra::DVector<f64>| {
//!     (c[0] - 0.5).powi(2) + (c[1] + 0.25).powi(2)
//! })
//! .with_batch_width(16);
//! let constraints = ConstraintTable::unconstrained(&[false, false])?;
//! let config = FitConfig::new().with_swarm(ParticleSwarmConfig::new().with_swarm_size(32));
//!
//! let mut controller = FitController::new(config, evaluator, constraints, dvector![2.0, 2.0])?;
//! let result = controller.fit(&dvector![0.0, 0.0], None)?;
//! assert!(result.objective < 1e-4);
//! # Ok(())
//! # }
//! ```

use crate::{
    core::{
        constraints::ConstraintTable,
        objective::{Objective, ResidualEvaluator},
        penalty::{PenaltyConfig, PenaltyFunction},
    },
    error, manifold,
    manifold::Renormalize,
    optimizer::{
        self, Bfgs, BfgsConfig, OptimizationStatus, ParticleSwarm, ParticleSwarmConfig,
        SolverResult,
        finite_diff::{self, FiniteDifference},
    },
};
use nalgebra::DVector;
use tracing::{debug, info};
use web_time as time;

/// Configuration of a [`FitController`].
#[derive(Debug, Clone)]
pub struct FitConfig {
    /// Swarm settings used for every repeat
    pub swarm: ParticleSwarmConfig,
    /// Number of swarm runs per fit
    pub repeats: usize,
    /// Radius multiplier between consecutive runs
    pub radius_decay: f64,
    /// Penalty composed with the residual
    pub penalty: PenaltyConfig,
    /// Optional BFGS polish after the swarm
    pub refinement: Option<BfgsConfig>,
    /// Central-difference step of the refinement gradient
    pub finite_difference_step: f64,
    /// Per-dimension steps, overriding `finite_difference_step` when set
    pub finite_difference_steps: Option<DVector<f64>>,
    /// Check batched residuals against single evaluations
    pub validate_batches: bool,
}

impl Default for FitConfig {
    fn default() -> Self {
        Self {
            swarm: ParticleSwarmConfig::new()
                .with_max_iterations(300)
                .with_delta_coeff_termination(1e-3),
            repeats: 1,
            radius_decay: 0.5,
            penalty: PenaltyConfig::default(),
            refinement: None,
            finite_difference_step: 1e-3,
            finite_difference_steps: None,
            validate_batches: cfg!(debug_assertions),
        }
    }
}

impl FitConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_swarm(mut self, swarm: ParticleSwarmConfig) -> Self {
        self.swarm = swarm;
        self
    }

    /// Set the number of annealed swarm runs
    pub fn with_repeats(mut self, repeats: usize) -> Self {
        self.repeats = repeats;
        self
    }

    pub fn with_radius_decay(mut self, radius_decay: f64) -> Self {
        self.radius_decay = radius_decay;
        self
    }

    pub fn with_penalty(mut self, penalty: PenaltyConfig) -> Self {
        self.penalty = penalty;
        self
    }

    /// Polish the swarm result with BFGS
    pub fn with_refinement(mut self, refinement: BfgsConfig) -> Self {
        self.refinement = Some(refinement);
        self
    }

    pub fn with_finite_difference_step(mut self, step: f64) -> Self {
        self.finite_difference_step = step;
        self
    }

    /// Use one central-difference step per coefficient
    pub fn with_finite_difference_steps(mut self, steps: DVector<f64>) -> Self {
        self.finite_difference_steps = Some(steps);
        self
    }

    pub fn with_batch_validation(mut self, validate: bool) -> Self {
        self.validate_batches = validate;
        self
    }

    /// Print configuration parameters (debug level logging)
    pub fn print_configuration(&self) {
        debug!(
            "\nFit:\n  Repeats:        {}\n  Radius decay:   {:.2}\n  Refinement:     {}\n  FD step:        {}\n  Batch checks:   {}",
            self.repeats,
            self.radius_decay,
            if self.refinement.is_some() { "BFGS" } else { "none" },
            match &self.finite_difference_steps {
                Some(_) => "per dimension".to_string(),
                None => format!("{:.2e}", self.finite_difference_step),
            },
            self.validate_batches
        );
        self.swarm.print_configuration();
        self.penalty.print_configuration();
        if let Some(refinement) = &self.refinement {
            refinement.print_configuration();
        }
    }

    fn validate(&self) -> optimizer::OptimizerResult<()> {
        if self.repeats == 0 {
            return Err(optimizer::OptimizerError::InvalidParameters(
                "repeats must be at least 1".to_string(),
            )
            .log());
        }
        if !(self.radius_decay.is_finite() && self.radius_decay > 0.0) {
            return Err(optimizer::OptimizerError::InvalidParameters(format!(
                "radius_decay must be positive, got {}",
                self.radius_decay
            ))
            .log());
        }
        if let Some(refinement) = &self.refinement {
            refinement.validate()?;
            match &self.finite_difference_steps {
                Some(steps) => finite_diff::validate_steps(steps)?,
                None => {
                    if !(self.finite_difference_step.is_finite()
                        && self.finite_difference_step > 0.0)
                    {
                        return Err(optimizer::OptimizerError::InvalidParameters(format!(
                            "finite_difference_step must be positive, got {}",
                            self.finite_difference_step
                        ))
                        .log());
                    }
                }
            }
        }
        Ok(())
    }
}

/// Outcome of one [`FitController::fit`] call.
#[derive(Debug, Clone)]
pub struct FitResult {
    /// Best coefficients found
    pub coefficients: DVector<f64>,
    /// Objective at `coefficients`
    pub objective: f64,
    /// Objective at the (normalized) start
    pub initial_objective: f64,
    /// One result per annealed swarm run, in order
    pub swarm_runs: Vec<SolverResult<DVector<f64>>>,
    /// BFGS polish, when configured
    pub refinement: Option<SolverResult<DVector<f64>>>,
    /// Objective evaluations spent by this fit
    pub evaluations: usize,
    /// Total time elapsed
    pub elapsed_time: time::Duration,
}

impl FitResult {
    /// Status of the last optimizer that ran
    pub fn status(&self) -> Option<&OptimizationStatus> {
        self.refinement
            .as_ref()
            .or(self.swarm_runs.last())
            .map(|result| &result.status)
    }
}

/// Fits pose coefficients frame by frame.
pub struct FitController<E> {
    config: FitConfig,
    objective: Objective<E>,
    swarm: ParticleSwarm,
    refiner: Option<Bfgs>,
    search_radius: DVector<f64>,
    difference_steps: DVector<f64>,
    angle_flags: Vec<bool>,
    renormalize: Option<Box<dyn Renormalize + Send>>,
}

impl<E: ResidualEvaluator> FitController<E> {
    /// Build a controller, validating every setting up front.
    ///
    /// # Errors
    /// Any configuration error: radius of the wrong dimension, swarm size
    /// not a multiple of the evaluator's batch width, invalid penalty or
    /// refinement settings.
    pub fn new(
        config: FitConfig,
        evaluator: E,
        constraints: ConstraintTable,
        search_radius: DVector<f64>,
    ) -> error::PoseFitResult<Self> {
        config.validate()?;
        constraints.check_dimension(search_radius.len())?;
        if search_radius.iter().any(|r| !r.is_finite()) {
            return Err(crate::core::CoreError::InvalidInput(
                "search radius must be finite".to_string(),
            )
            .log()
            .into());
        }

        let difference_steps = match &config.finite_difference_steps {
            Some(steps) => {
                constraints.check_dimension(steps.len())?;
                steps.clone()
            }
            None => DVector::from_element(search_radius.len(), config.finite_difference_step),
        };

        let angle_flags = constraints.angle_flags();
        let penalty = PenaltyFunction::new(config.penalty.clone(), constraints)?;
        let objective = Objective::new(evaluator)
            .with_penalty(penalty)
            .with_batch_validation(config.validate_batches);
        let swarm = ParticleSwarm::with_config(config.swarm.clone(), objective.batch_width())?;
        let refiner = config.refinement.clone().map(Bfgs::with_config);

        Ok(Self {
            config,
            objective,
            swarm,
            refiner,
            search_radius,
            difference_steps,
            angle_flags,
            renormalize: None,
        })
    }

    /// Apply `hook` to every candidate after angle wrapping.
    pub fn with_renormalize(mut self, hook: impl Renormalize + Send + 'static) -> Self {
        self.renormalize = Some(Box::new(hook));
        self
    }

    /// Add an observer to the swarm.
    pub fn add_observer(&mut self, observer: impl optimizer::OptObserver + 'static) {
        self.swarm.add_observer(observer);
    }

    pub fn config(&self) -> &FitConfig {
        &self.config
    }

    pub fn objective(&self) -> &Objective<E> {
        &self.objective
    }

    pub fn search_radius(&self) -> &DVector<f64> {
        &self.search_radius
    }

    /// Angle flags derived from the constraint table
    pub fn angle_flags(&self) -> &[bool] {
        &self.angle_flags
    }

    /// Objective evaluations since construction or the last reset
    pub fn evaluation_count(&self) -> usize {
        self.objective.evaluation_count()
    }

    pub fn reset_evaluation_count(&mut self) {
        self.objective.reset_evaluation_count();
    }

    /// Fit one frame starting from `start`.
    ///
    /// `previous` feeds the temporal penalty; without it the temporal term is
    /// inactive for this fit. Either way the cache is overwritten.
    pub fn fit(
        &mut self,
        start: &DVector<f64>,
        previous: Option<&DVector<f64>>,
    ) -> error::PoseFitResult<FitResult> {
        let start_time = time::Instant::now();
        let evaluations_before = self.objective.evaluation_count();
        if tracing::enabled!(tracing::Level::DEBUG) {
            self.config.print_configuration();
        }

        self.objective.set_previous(previous.cloned())?;

        let hook = self.renormalize.as_deref().map(|h| h as &dyn Renormalize);
        let mut current = start.clone();
        manifold::normalize(&mut current, &self.angle_flags, hook);
        let initial_objective = self.objective.evaluate(&current)?;
        info!("Starting objective: {:.6e}", initial_objective);

        let mut best_objective = initial_objective;
        let mut swarm_runs = Vec::with_capacity(self.config.repeats);
        let mut radius = self.search_radius.clone();
        for repeat in 0..self.config.repeats {
            let run = self.swarm.minimize(
                &mut self.objective,
                &current,
                &radius,
                &self.angle_flags,
                hook,
            )?;
            debug!(
                "Swarm run {} of {}: objective {:.6e} ({})",
                repeat + 1,
                self.config.repeats,
                run.final_cost,
                run.status
            );
            current = run.parameters.clone();
            best_objective = run.final_cost;
            swarm_runs.push(run);
            radius *= self.config.radius_decay;
        }

        let refinement = match self.refiner.as_mut() {
            Some(refiner) => {
                let mut problem = FiniteDifference::new(
                    &mut self.objective,
                    self.config.finite_difference_step,
                    &self.angle_flags,
                    hook,
                )
                .with_steps(self.difference_steps.clone());
                let run = refiner.minimize(&mut problem, &current, &self.angle_flags, hook)?;
                debug!(
                    "BFGS refinement: objective {:.6e} ({})",
                    run.final_cost, run.status
                );
                if run.final_cost <= best_objective {
                    current = run.parameters.clone();
                    best_objective = run.final_cost;
                }
                Some(run)
            }
            None => None,
        };

        info!("Final objective: {:.6e}", best_objective);
        Ok(FitResult {
            coefficients: current,
            objective: best_objective,
            initial_objective,
            swarm_runs,
            refinement,
            evaluations: self.objective.evaluation_count() - evaluations_before,
            elapsed_time: start_time.elapsed(),
        })
    }

    /// Score `coeff` once without optimizing.
    ///
    /// The vector is wrapped and renormalized on a copy first. The
    /// previous-frame cache is left as is.
    pub fn query_objective(&mut self, coeff: &DVector<f64>) -> error::PoseFitResult<f64> {
        let mut candidate = coeff.clone();
        let hook = self.renormalize.as_deref().map(|h| h as &dyn Renormalize);
        manifold::normalize(&mut candidate, &self.angle_flags, hook);

        let residual = self.objective.residual(&candidate)?;
        let objective = self.objective.penalty_factor(&candidate) * residual;
        info!(
            "Residual without constraints: {:.6e}, with constraints: {:.6e}",
            residual, objective
        );
        Ok(objective)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::constraints::CoeffConstraint;
    use crate::core::objective::FnEvaluator;
    use crate::core::penalty::TemporalConfig;
    use nalgebra::dvector;

    fn bowl(c: &DVector<f64>) -> f64 {
        (c[0] - 0.5).powi(2) + (c[1] + 0.25).powi(2) + 0.1
    }

    fn small_swarm() -> ParticleSwarmConfig {
        ParticleSwarmConfig::new()
            .with_swarm_size(32)
            .with_max_iterations(200)
            .with_delta_coeff_termination(1e-6)
    }

    fn controller(
        config: FitConfig,
    ) -> error::PoseFitResult<FitController<FnEvaluator<fn(&DVector<f64>) -> f64>>> {
        let evaluator = FnEvaluator::new(bowl as fn(&DVector<f64>) -> f64).with_batch_width(16);
        let constraints = ConstraintTable::unconstrained(&[false, false])?;
        FitController::new(config, evaluator, constraints, dvector![2.0, 2.0])
    }

    #[test]
    fn test_fit_finds_minimum() -> Result<(), Box<dyn std::error::Error>> {
        let mut controller = controller(FitConfig::new().with_swarm(small_swarm()))?;
        let result = controller.fit(&dvector![-1.0, 1.0], None)?;

        assert!((result.coefficients[0] - 0.5).abs() < 1e-3);
        assert!((result.coefficients[1] + 0.25).abs() < 1e-3);
        assert!(result.objective <= result.initial_objective);
        assert_eq!(result.swarm_runs.len(), 1);
        assert!(result.refinement.is_none());
        Ok(())
    }

    #[test]
    fn test_annealed_repeats_never_worsen() -> Result<(), Box<dyn std::error::Error>> {
        let config = FitConfig::new()
            .with_swarm(small_swarm().with_max_iterations(20))
            .with_repeats(4);
        let mut controller = controller(config)?;
        let result = controller.fit(&dvector![1.5, -1.5], None)?;

        assert_eq!(result.swarm_runs.len(), 4);
        for pair in result.swarm_runs.windows(2) {
            assert!(pair[1].final_cost <= pair[0].final_cost);
            assert_eq!(pair[1].initial_cost, pair[0].final_cost);
        }
        assert_eq!(result.objective, result.swarm_runs[3].final_cost);
        Ok(())
    }

    #[test]
    fn test_refinement_polishes_swarm_result() -> Result<(), Box<dyn std::error::Error>> {
        let config = FitConfig::new()
            .with_swarm(small_swarm().with_max_iterations(5))
            .with_refinement(BfgsConfig::new())
            .with_finite_difference_step(1e-4);
        let mut controller = controller(config)?;
        let result = controller.fit(&dvector![1.0, 1.0], None)?;

        let refinement = result.refinement.as_ref().ok_or("refinement missing")?;
        assert!(refinement.final_cost <= result.swarm_runs[0].final_cost);
        assert!((result.coefficients[0] - 0.5).abs() < 1e-2);
        assert!((result.coefficients[1] + 0.25).abs() < 1e-2);
        Ok(())
    }

    #[test]
    fn test_refinement_with_per_dimension_steps() -> Result<(), Box<dyn std::error::Error>> {
        let config = FitConfig::new()
            .with_swarm(small_swarm().with_max_iterations(5))
            .with_refinement(BfgsConfig::new())
            .with_finite_difference_steps(dvector![1e-3, 1e-5]);
        let mut controller = controller(config)?;
        assert_eq!(controller.difference_steps, dvector![1e-3, 1e-5]);

        let result = controller.fit(&dvector![1.0, 1.0], None)?;
        assert!(result.refinement.is_some());
        assert!((result.coefficients[0] - 0.5).abs() < 1e-2);
        assert!((result.coefficients[1] + 0.25).abs() < 1e-2);
        Ok(())
    }

    #[test]
    fn test_finite_difference_steps_are_checked() -> Result<(), Box<dyn std::error::Error>> {
        let uniform = controller(FitConfig::new().with_finite_difference_step(1e-4))?;
        assert_eq!(uniform.difference_steps, dvector![1e-4, 1e-4]);

        let wrong_length = FitConfig::new()
            .with_refinement(BfgsConfig::new())
            .with_finite_difference_steps(dvector![1e-3, 1e-3, 1e-3]);
        assert!(controller(wrong_length).is_err());

        let non_positive = FitConfig::new()
            .with_refinement(BfgsConfig::new())
            .with_finite_difference_steps(dvector![1e-3, 0.0]);
        assert!(controller(non_positive).is_err());
        Ok(())
    }

    #[test]
    fn test_evaluation_count() -> Result<(), Box<dyn std::error::Error>> {
        let mut controller = controller(FitConfig::new().with_swarm(small_swarm()))?;
        assert_eq!(controller.evaluation_count(), 0);

        let result = controller.fit(&dvector![0.0, 0.0], None)?;
        assert!(result.evaluations > 0);
        assert_eq!(controller.evaluation_count(), result.evaluations);

        controller.reset_evaluation_count();
        controller.query_objective(&dvector![0.5, -0.25])?;
        assert_eq!(controller.evaluation_count(), 1);
        Ok(())
    }

    #[test]
    fn test_query_objective_applies_penalty_and_keeps_cache()
    -> Result<(), Box<dyn std::error::Error>> {
        let evaluator = FnEvaluator::new(|_: &DVector<f64>| 2.0).with_batch_width(16);
        let constraints = ConstraintTable::new(vec![
            CoeffConstraint::bounded(0.0, 1.0, 4.0),
            CoeffConstraint::unconstrained(),
        ])?;
        let config = FitConfig::new()
            .with_swarm(small_swarm().with_max_iterations(2))
            .with_penalty(PenaltyConfig::new().with_temporal(TemporalConfig::default()));
        let mut controller =
            FitController::new(config, evaluator, constraints, dvector![0.1, 0.1])?;

        controller.fit(&dvector![0.5, 0.0], Some(&dvector![0.5, 0.0]))?;
        let cached = controller.objective().previous().cloned();
        assert_eq!(cached, Some(dvector![0.5, 0.0]));

        // residual 2, box term 4 · (1 / 2)², temporal excess (1.5 − 0.3)² · 0.001
        let value = controller.query_objective(&dvector![2.0, 0.0])?;
        let expected = 2.0 * (1.0 + 1.0 + 0.001 * 1.2 * 1.2);
        assert!((value - expected).abs() < 1e-12, "got {value}");
        assert_eq!(controller.objective().previous().cloned(), cached);
        Ok(())
    }

    #[test]
    fn test_fit_without_previous_frame_disables_temporal_term()
    -> Result<(), Box<dyn std::error::Error>> {
        let evaluator = FnEvaluator::new(|_: &DVector<f64>| 1.0).with_batch_width(16);
        let constraints = ConstraintTable::new(vec![CoeffConstraint::bounded(0.0, 1.0, 1.0)])?;
        let config = FitConfig::new()
            .with_swarm(small_swarm().with_max_iterations(2))
            .with_penalty(PenaltyConfig::new().with_temporal(TemporalConfig {
                scale: 1.0,
                threshold: 0.1,
            }));
        let mut controller = FitController::new(config, evaluator, constraints, dvector![0.01])?;

        controller.fit(&dvector![0.9], Some(&dvector![0.1]))?;
        assert!(controller.query_objective(&dvector![0.9])? > 1.0);

        // A later fit without a previous frame clears the cache
        controller.fit(&dvector![0.1], None)?;
        assert_eq!(controller.objective().previous(), None);
        assert_eq!(controller.query_objective(&dvector![0.9])?, 1.0);
        Ok(())
    }

    #[test]
    fn test_fit_uses_explicit_previous_frame() -> Result<(), Box<dyn std::error::Error>> {
        let mut controller = controller(FitConfig::new().with_swarm(small_swarm()))?;
        controller.fit(&dvector![0.0, 0.0], Some(&dvector![0.3, 0.3]))?;
        assert_eq!(controller.objective().previous(), Some(&dvector![0.3, 0.3]));
        Ok(())
    }

    #[test]
    fn test_renormalize_hook_reaches_candidates() -> Result<(), Box<dyn std::error::Error>> {
        let mut controller = controller(FitConfig::new().with_swarm(small_swarm()))?
            .with_renormalize(|c: &mut DVector<f64>| c[1] = c[1].max(0.0));
        let result = controller.fit(&dvector![0.0, 1.0], None)?;

        assert!(result.coefficients[1] >= 0.0);
        assert!(result.coefficients[1] < 1e-3);
        Ok(())
    }

    #[test]
    fn test_configuration_errors() -> Result<(), Box<dyn std::error::Error>> {
        let constraints = ConstraintTable::unconstrained(&[false, false])?;
        let build = |config: FitConfig, radius: DVector<f64>| {
            let evaluator = FnEvaluator::new(bowl).with_batch_width(16);
            FitController::new(config, evaluator, constraints.clone(), radius)
        };

        assert!(build(FitConfig::new().with_swarm(small_swarm()), dvector![1.0]).is_err());
        assert!(
            build(
                FitConfig::new().with_swarm(small_swarm().with_swarm_size(24)),
                dvector![1.0, 1.0]
            )
            .is_err()
        );
        assert!(
            build(
                FitConfig::new().with_swarm(small_swarm()).with_repeats(0),
                dvector![1.0, 1.0]
            )
            .is_err()
        );
        assert!(
            build(
                FitConfig::new()
                    .with_swarm(small_swarm())
                    .with_refinement(BfgsConfig::new().with_sufficient_decrease(2.0)),
                dvector![1.0, 1.0]
            )
            .is_err()
        );
        Ok(())
    }
}

//! Observer pattern for optimization monitoring.
//!
//! Observers can be registered with either optimizer and are notified after
//! every iteration with the current best coefficient vector. This keeps
//! progress reporting (overlay rendering, metrics, recording) out of the
//! optimization loops.
//!
//! ```text
//! ┌──────────────────────┐
//! │      Optimizer       │
//! │   (swarm / BFGS)     │
//! └──────────┬───────────┘
//!            │ observers.notify(best, iteration)
//!            ├─────────────┬─────────────┐
//!            ▼             ▼             ▼
//!      ┌──────────┐  ┌──────────┐  ┌──────────┐
//!      │ Overlay  │  │ Metrics  │  │  Custom  │
//!      └──────────┘  └──────────┘  └──────────┘
//! ```
//!
//! # Example
//!
//! ```no_run
//! use nalgebra::DVector;
//! ```

use nalgebra::DVector;

/// Optimizer-specific metrics of one iteration.
///
/// Fields that do not apply to an optimizer are `None` (the swarm has no
/// gradient, BFGS has no spread).
#[derive(Debug, Clone, Default, PartialEq)]
pub struct IterationMetrics {
    /// L2 norm of the gradient (BFGS)
    pub gradient_norm: Option<f64>,
    /// L2 norm of the accepted step (BFGS)
    pub step_norm: Option<f64>,
    /// Accepted line-search step length (BFGS)
    pub step_length: Option<f64>,
    /// L2 norm of the per-dimension swarm extent (swarm)
    pub swarm_spread: Option<f64>,
}

/// Observer trait for monitoring optimization progress.
///
/// Observers must be `Send`; use interior mutability (`Mutex`, atomics) to
/// record state. Keep `on_step` cheap, it runs inside the optimization loop.
pub trait OptObserver: Send {
    /// Called after each iteration with the best vector found so far.
    ///
    /// `iteration` is 0 for the initial state, 1+ after each update.
    fn on_step(&self, best: &DVector<f64>, iteration: usize);

    /// Called before `on_step` with the current best cost and metrics.
    ///
    /// The default implementation does nothing.
    fn set_iteration_metrics(&self, _cost: f64, _metrics: &IterationMetrics) {}
}

/// Collection of observers for optimization monitoring.
#[derive(Default)]
pub struct OptObserverVec {
    observers: Vec<Box<dyn OptObserver>>,
}

impl OptObserverVec {
    /// Create a new empty observer collection.
    pub fn new() -> Self {
        Self {
            observers: Vec::new(),
        }
    }

    /// Add an observer; observers are called in insertion order.
    pub fn add(&mut self, observer: impl OptObserver + 'static) {
        self.observers.push(Box::new(observer));
    }

    /// Set iteration metrics for all observers.
    #[inline]
    pub fn set_iteration_metrics(&self, cost: f64, metrics: &IterationMetrics) {
        for observer in &self.observers {
            observer.set_iteration_metrics(cost, metrics);
        }
    }

    /// Notify all observers with the current best vector.
    #[inline]
    pub fn notify(&self, best: &DVector<f64>, iteration: usize) {
        for observer in &self.observers {
            observer.on_step(best, iteration);
        }
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.observers.is_empty()
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.observers.len()
    }
}

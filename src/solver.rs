//! Smooth minimization over the polyhedral sets that portfolio constraints
//! describe: a box intersected with a budget hyperplane, optional linear
//! inequalities and an optional L1 ball.

use crate::config::SolverSettings;
use crate::error::{EngineError, Result, SolverStatus};
use log::{debug, warn};
use nalgebra::DVector;

const ARMIJO_SLOPE: f64 = 1e-4;
const MIN_STEP: f64 = 1e-30;
const MAX_STEP: f64 = 1e12;
const DYKSTRA_MAX_SWEEPS: usize = 5_000;
const DYKSTRA_TOLERANCE: f64 = 1e-13;
const FEASIBILITY_TOLERANCE: f64 = 1e-7;
const BISECTION_STEPS: usize = 200;

/// Function to minimize with its gradient.
pub trait Objective {
    fn value(&self, weights: &DVector<f64>) -> f64;
    fn gradient(&self, weights: &DVector<f64>) -> DVector<f64>;
}

/// `normal · w <= bound`
#[derive(Debug, Clone)]
pub struct Halfspace {
    pub label: String,
    pub normal: DVector<f64>,
    pub bound: f64,
}

#[derive(Debug, Clone)]
pub struct FeasibleSet {
    lower: DVector<f64>,
    upper: DVector<f64>,
    budget: f64,
    halfspaces: Vec<Halfspace>,
    l1_radius: Option<f64>,
}

impl FeasibleSet {
    pub fn new(lower: DVector<f64>, upper: DVector<f64>, budget: f64) -> Result<Self> {
        if lower.len() != upper.len() || lower.is_empty() {
            return Err(EngineError::validation(
                "feasible set bounds must be non-empty and of equal length",
            ));
        }
        for i in 0..lower.len() {
            if lower[i] > upper[i] {
                return Err(EngineError::numerical(
                    SolverStatus::Infeasible,
                    format!(
                        "lower bound {} exceeds upper bound {} for asset {}",
                        lower[i], upper[i], i
                    ),
                ));
            }
        }
        let (min_sum, max_sum) = (lower.sum(), upper.sum());
        if budget < min_sum - FEASIBILITY_TOLERANCE || budget > max_sum + FEASIBILITY_TOLERANCE {
            return Err(EngineError::numerical(
                SolverStatus::Infeasible,
                format!(
                    "budget {} is outside the reachable range [{}, {}] given position bounds",
                    budget, min_sum, max_sum
                ),
            ));
        }
        Ok(Self {
            lower,
            upper,
            budget,
            halfspaces: Vec::new(),
            l1_radius: None,
        })
    }

    pub fn dimension(&self) -> usize {
        self.lower.len()
    }

    pub fn add_halfspace(&mut self, halfspace: Halfspace) {
        self.halfspaces.push(halfspace);
    }

    pub fn set_l1_radius(&mut self, radius: f64) {
        self.l1_radius = Some(radius);
    }

    /// Euclidean projection onto the intersection of all sets.
    pub fn project(&self, point: &DVector<f64>) -> Result<DVector<f64>> {
        if self.halfspaces.is_empty() && self.l1_radius.is_none() {
            return Ok(self.project_box_budget(point));
        }

        let set_count = self.halfspaces.len() + usize::from(self.l1_radius.is_some()) + 1;
        let mut increments = vec![DVector::zeros(point.len()); set_count];
        let mut x = point.clone();
        for _ in 0..DYKSTRA_MAX_SWEEPS {
            let sweep_start = x.clone();
            for (k, increment) in increments.iter_mut().enumerate() {
                let shifted = &x + &*increment;
                let projected = self.project_onto(k, &shifted);
                *increment = &shifted - &projected;
                x = projected;
            }
            if (&x - &sweep_start).amax() < DYKSTRA_TOLERANCE {
                break;
            }
        }

        if let Some(violation) = self.violation(&x) {
            return Err(EngineError::numerical(
                SolverStatus::Infeasible,
                format!("constraints cannot be satisfied together ({})", violation),
            ));
        }
        Ok(x)
    }

    /// Sets are visited as halfspaces, then the L1 ball, then box and budget
    /// last so the returned point satisfies those exactly.
    fn project_onto(&self, k: usize, point: &DVector<f64>) -> DVector<f64> {
        if k < self.halfspaces.len() {
            return project_halfspace(&self.halfspaces[k], point);
        }
        match (k == self.halfspaces.len(), self.l1_radius) {
            (true, Some(radius)) => project_l1_ball(point, radius),
            _ => self.project_box_budget(point),
        }
    }

    fn project_box_budget(&self, point: &DVector<f64>) -> DVector<f64> {
        let clamp_shifted = |tau: f64| -> DVector<f64> {
            DVector::from_fn(point.len(), |i, _| {
                (point[i] - tau).clamp(self.lower[i], self.upper[i])
            })
        };
        let mut lo = (point - &self.upper).min();
        let mut hi = (point - &self.lower).max();
        for _ in 0..BISECTION_STEPS {
            let mid = 0.5 * (lo + hi);
            let total = clamp_shifted(mid).sum();
            if total > self.budget {
                lo = mid;
            } else {
                hi = mid;
            }
            if hi - lo < 1e-16 {
                break;
            }
        }
        clamp_shifted(0.5 * (lo + hi))
    }

    pub fn violation(&self, x: &DVector<f64>) -> Option<String> {
        if (x.sum() - self.budget).abs() > FEASIBILITY_TOLERANCE {
            return Some(format!("budget {} vs {}", x.sum(), self.budget));
        }
        for i in 0..x.len() {
            if x[i] < self.lower[i] - FEASIBILITY_TOLERANCE
                || x[i] > self.upper[i] + FEASIBILITY_TOLERANCE
            {
                return Some(format!("bounds of asset {}", i));
            }
        }
        for halfspace in &self.halfspaces {
            let lhs = halfspace.normal.dot(x);
            if lhs > halfspace.bound + FEASIBILITY_TOLERANCE {
                return Some(format!(
                    "{}: {:.6} > {:.6}",
                    halfspace.label, lhs, halfspace.bound
                ));
            }
        }
        if let Some(radius) = self.l1_radius {
            let norm = x.lp_norm(1);
            if norm > radius + FEASIBILITY_TOLERANCE {
                return Some(format!("gross exposure {:.6} > {:.6}", norm, radius));
            }
        }
        None
    }
}

fn project_halfspace(halfspace: &Halfspace, point: &DVector<f64>) -> DVector<f64> {
    let excess = halfspace.normal.dot(point) - halfspace.bound;
    let norm_sq = halfspace.normal.norm_squared();
    if excess <= 0.0 || norm_sq <= f64::EPSILON {
        return point.clone();
    }
    point - &halfspace.normal * (excess / norm_sq)
}

/// Projection onto `{w : |w|_1 <= radius}` by soft thresholding.
fn project_l1_ball(point: &DVector<f64>, radius: f64) -> DVector<f64> {
    if point.lp_norm(1) <= radius {
        return point.clone();
    }
    let mut magnitudes: Vec<f64> = point.iter().map(|v| v.abs()).collect();
    magnitudes.sort_by(|a, b| b.partial_cmp(a).unwrap_or(std::cmp::Ordering::Equal));
    let mut cumulative = 0.0;
    let mut theta = 0.0;
    for (i, m) in magnitudes.iter().enumerate() {
        cumulative += m;
        let candidate = (cumulative - radius) / (i as f64 + 1.0);
        if *m > candidate {
            theta = candidate;
        } else {
            break;
        }
    }
    point.map(|v| v.signum() * (v.abs() - theta).max(0.0))
}

#[derive(Debug, Clone)]
pub struct SolverOutcome {
    pub weights: DVector<f64>,
    pub objective: f64,
    pub iterations: usize,
    pub status: SolverStatus,
}

/// Projected gradient descent with Armijo backtracking and an adaptive step.
pub fn minimize<O: Objective + ?Sized>(
    objective: &O,
    set: &FeasibleSet,
    start: &DVector<f64>,
    settings: &SolverSettings,
) -> Result<SolverOutcome> {
    let mut x = set.project(start)?;
    let mut fx = objective.value(&x);
    if !fx.is_finite() {
        return Err(EngineError::numerical(
            SolverStatus::Singular,
            "objective is not finite at the starting point",
        ));
    }
    let mut step = 1.0;

    for iteration in 1..=settings.max_iterations {
        let gradient = objective.gradient(&x);
        if gradient.iter().any(|g| !g.is_finite()) {
            return Err(EngineError::numerical(
                SolverStatus::Singular,
                format!("gradient is not finite at iteration {}", iteration),
            ));
        }

        loop {
            let candidate = set.project(&(&x - &gradient * step))?;
            let direction = &candidate - &x;
            let movement = direction.amax();
            if movement < settings.tolerance {
                debug!(
                    "Solver converged after {} iterations (objective {:.10})",
                    iteration, fx
                );
                return Ok(SolverOutcome {
                    objective: objective.value(&candidate),
                    weights: candidate,
                    iterations: iteration,
                    status: SolverStatus::Optimal,
                });
            }
            let f_candidate = objective.value(&candidate);
            if f_candidate.is_finite()
                && f_candidate <= fx + ARMIJO_SLOPE * gradient.dot(&direction)
            {
                x = candidate;
                fx = f_candidate;
                step = (step * 2.0).min(MAX_STEP);
                break;
            }
            step *= 0.5;
            if step < MIN_STEP {
                warn!(
                    "Solver line search exhausted at iteration {} with movement {:.3e} (objective {:.10})",
                    iteration, movement, fx
                );
                return Ok(SolverOutcome {
                    weights: x,
                    objective: fx,
                    iterations: iteration,
                    status: SolverStatus::Stalled,
                });
            }
        }
    }

    Err(EngineError::numerical(
        SolverStatus::IterationLimit,
        format!(
            "no convergence within {} iterations (objective {:.10})",
            settings.max_iterations, fx
        ),
    ))
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Quadratic {
        target: DVector<f64>,
    }

    impl Objective for Quadratic {
        fn value(&self, weights: &DVector<f64>) -> f64 {
            (weights - &self.target).norm_squared()
        }

        fn gradient(&self, weights: &DVector<f64>) -> DVector<f64> {
            (weights - &self.target) * 2.0
        }
    }

    fn unit_box(n: usize, budget: f64) -> FeasibleSet {
        FeasibleSet::new(DVector::zeros(n), DVector::from_element(n, 1.0), budget).unwrap()
    }

    #[test]
    fn box_budget_projection_is_simplex_projection() {
        let set = unit_box(3, 1.0);
        let projected = set.project(&DVector::from_vec(vec![0.5, 0.5, -1.0])).unwrap();
        assert!((projected[0] - 0.5).abs() < 1e-12);
        assert!((projected[1] - 0.5).abs() < 1e-12);
        assert!(projected[2].abs() < 1e-12);

        let projected = set.project(&DVector::from_vec(vec![2.0, 0.0, 0.0])).unwrap();
        assert!((projected[0] - 1.0).abs() < 1e-12);
        assert!((projected.sum() - 1.0).abs() < 1e-12);
    }

    #[test]
    fn halfspace_is_respected_after_dykstra() {
        let mut set = unit_box(3, 1.0);
        set.add_halfspace(Halfspace {
            label: "cap".to_string(),
            normal: DVector::from_vec(vec![1.0, 1.0, 0.0]),
            bound: 0.4,
        });
        let projected = set.project(&DVector::from_vec(vec![0.6, 0.4, 0.0])).unwrap();
        assert!(projected[0] + projected[1] <= 0.4 + 1e-7);
        assert!((projected.sum() - 1.0).abs() < 1e-9);
        assert!(projected[2] >= 0.6 - 1e-7);
        assert!((projected[0] - 0.3).abs() < 1e-6);
    }

    #[test]
    fn l1_ball_projection_soft_thresholds() {
        let projected = project_l1_ball(&DVector::from_vec(vec![1.0, -1.0, 0.2]), 1.0);
        assert!((projected.lp_norm(1) - 1.0).abs() < 1e-12);
        assert!((projected[0] - 0.5).abs() < 1e-12);
        assert!((projected[1] + 0.5).abs() < 1e-12);
        assert_eq!(projected[2], 0.0);
    }

    #[test]
    fn unreachable_budget_is_infeasible() {
        let err = FeasibleSet::new(
            DVector::zeros(3),
            DVector::from_element(3, 0.2),
            1.0,
        )
        .unwrap_err();
        assert!(matches!(
            err,
            EngineError::Numerical {
                status: SolverStatus::Infeasible,
                ..
            }
        ));
    }

    #[test]
    fn contradictory_halfspace_is_infeasible() {
        let mut set = unit_box(2, 1.0);
        set.add_halfspace(Halfspace {
            label: "sum cap".to_string(),
            normal: DVector::from_vec(vec![1.0, 1.0]),
            bound: 0.5,
        });
        let err = set.project(&DVector::from_vec(vec![0.5, 0.5])).unwrap_err();
        assert!(err.to_string().contains("infeasible"));
    }

    #[test]
    fn minimize_quadratic_over_simplex() {
        let objective = Quadratic {
            target: DVector::from_vec(vec![0.8, 0.6, -0.2]),
        };
        let set = unit_box(3, 1.0);
        let outcome = minimize(
            &objective,
            &set,
            &DVector::from_element(3, 1.0 / 3.0),
            &SolverSettings::default(),
        )
        .unwrap();
        assert_eq!(outcome.status, SolverStatus::Optimal);
        assert!((outcome.weights[0] - 0.6).abs() < 1e-6);
        assert!((outcome.weights[1] - 0.4).abs() < 1e-6);
        assert!(outcome.weights[2].abs() < 1e-6);
    }

    /// Finite only around its start, so every trial step is rejected.
    struct Cliff {
        start: DVector<f64>,
    }

    impl Objective for Cliff {
        fn value(&self, weights: &DVector<f64>) -> f64 {
            if (weights - &self.start).amax() < 1e-12 {
                1.0
            } else {
                f64::INFINITY
            }
        }

        fn gradient(&self, _weights: &DVector<f64>) -> DVector<f64> {
            DVector::from_vec(vec![-1e20, 1e20])
        }
    }

    #[test]
    fn exhausted_line_search_is_not_optimal() {
        let set = unit_box(2, 1.0);
        let start = DVector::from_vec(vec![0.1, 0.9]);
        let objective = Cliff { start: start.clone() };
        let settings = SolverSettings {
            max_iterations: 10,
            tolerance: 1e-12,
        };
        let outcome = minimize(&objective, &set, &start, &settings).unwrap();
        assert_eq!(outcome.status, SolverStatus::Stalled);
        assert_eq!(outcome.iterations, 1);
        assert!((&outcome.weights - &start).amax() < 1e-12);
    }

    #[test]
    fn iteration_limit_is_reported() {
        let objective = Quadratic {
            target: DVector::from_vec(vec![0.9, 0.1]),
        };
        let set = unit_box(2, 1.0);
        let settings = SolverSettings {
            max_iterations: 1,
            tolerance: 1e-300,
        };
        match minimize(&objective, &set, &DVector::from_vec(vec![0.1, 0.9]), &settings) {
            Err(EngineError::Numerical { status, .. }) => {
                assert_eq!(status, SolverStatus::IterationLimit)
            }
            other => panic!("expected iteration limit, got {:?}", other.map(|o| o.iterations)),
        }
    }
}

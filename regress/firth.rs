use crate::regress::model::{FitError, SolverConfig, check_shapes};
use ndarray::{Array1, Array2, ArrayView1, ArrayView2, Axis, Zip};
use ndarray_linalg::{LeastSquaresSvd, QR};

/// Controls for one Newton-Raphson run.
///
/// `penalty_weight` scales the Jeffreys-prior term: `0.5` is the classic Firth
/// penalty and `0.0` turns the routine into plain IRLS logistic regression.
#[derive(Clone, Debug, PartialEq)]
pub struct NewtonOptions {
    pub max_iter: usize,
    pub max_halfstep: usize,
    pub max_step: f64,
    pub xtol: f64,
    pub gtol: f64,
    pub penalty_weight: f64,
}

impl NewtonOptions {
    pub fn firth(config: &SolverConfig) -> Self {
        Self {
            max_iter: config.max_iter,
            max_halfstep: config.max_halfstep,
            max_step: config.max_step,
            xtol: config.xtol,
            gtol: config.gtol,
            penalty_weight: config.penalty_weight,
        }
    }

    pub fn logistic(config: &SolverConfig) -> Self {
        Self {
            penalty_weight: 0.0,
            ..Self::firth(config)
        }
    }
}

impl Default for NewtonOptions {
    fn default() -> Self {
        Self::firth(&SolverConfig::default())
    }
}

/// How a Newton-Raphson run ended.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum NewtonStatus {
    /// The step or the score fell below tolerance.
    Converged,
    /// Ran out of iterations; the last accepted estimate is kept.
    MaxIterationsReached,
    /// Step-halving could not find a non-worse candidate; the previous estimate is kept.
    StepRejected,
}

/// Result of a Newton-Raphson run.
#[derive(Clone, Debug)]
pub struct NewtonFit {
    pub beta: Array1<f64>,
    /// Penalized negative log-likelihood at `beta`.
    pub penalized_nll: f64,
    /// Expected information `XᵀWX` at `beta`.
    pub fisher_information: Array2<f64>,
    pub iterations: usize,
    pub halvings: usize,
    pub status: NewtonStatus,
    /// Objective after every accepted iterate, starting with `β = 0`.
    pub trace: Vec<f64>,
}

impl NewtonFit {
    pub fn converged(&self) -> bool {
        self.status == NewtonStatus::Converged
    }
}

/// Fits a Firth-penalized logistic regression starting from `β = 0`.
pub fn fit_firth(
    x: ArrayView2<f64>,
    y: ArrayView1<f64>,
    options: &NewtonOptions,
) -> Result<NewtonFit, FitError> {
    fit_firth_constrained(x, y, options, &[])
}

/// Same as [`fit_firth`] but holds the coefficients listed in `fixed` at zero.
///
/// The penalty is still evaluated on the full information matrix, which is
/// what the penalized likelihood-ratio test compares against.
pub fn fit_firth_constrained(
    x: ArrayView2<f64>,
    y: ArrayView1<f64>,
    options: &NewtonOptions,
    fixed: &[usize],
) -> Result<NewtonFit, FitError> {
    check_shapes(x.nrows(), x.ncols(), y.len())?;
    let problem = Problem {
        x: x.view(),
        y: y.view(),
        free: (0..x.ncols()).filter(|j| !fixed.contains(j)).collect(),
        penalty_weight: options.penalty_weight,
    };

    let mut state = NewtonState::start(&problem)?;
    if problem.free.is_empty() {
        return Ok(state.finish(NewtonStatus::Converged));
    }
    if options.max_iter == 0 {
        return Ok(state.finish(NewtonStatus::MaxIterationsReached));
    }

    loop {
        match state.step(&problem, options)? {
            Transition::Continue(next) => state = next,
            Transition::Finished(last, status) => {
                log::trace!(
                    "Newton-Raphson finished: {:?} after {} iterations, objective {:.8e}",
                    status,
                    last.iteration,
                    last.eval.penalized_nll
                );
                return Ok(last.finish(status));
            }
        }
    }
}

struct Problem<'a> {
    x: ArrayView2<'a, f64>,
    y: ArrayView1<'a, f64>,
    free: Vec<usize>,
    penalty_weight: f64,
}

/// Everything the solver needs at one coefficient vector.
struct Evaluation {
    pi: Array1<f64>,
    hat: Array1<f64>,
    fisher: Array2<f64>,
    penalized_nll: f64,
}

impl Evaluation {
    fn at(problem: &Problem, beta: ArrayView1<f64>) -> Result<Self, FitError> {
        let (n, p) = problem.x.dim();
        let eta = problem.x.dot(&beta);
        let pi = eta.mapv(sigmoid);
        let root_weights = pi.mapv(|prob| (prob * (1.0 - prob)).sqrt());
        let xw = &problem.x * &root_weights.view().insert_axis(Axis(1));

        // Leverages come from the thin Q factor; the projection matrix is never formed.
        let (q, r) = xw.qr()?;
        let hat = Zip::from(q.rows()).par_map_collect(|row| row.dot(&row));
        let fisher = xw.t().dot(&xw);

        let log_likelihood = Zip::from(&eta)
            .and(&problem.y)
            .fold(0.0, |acc, &e, &yi| {
                acc - yi * softplus(-e) - (1.0 - yi) * softplus(e)
            });
        let penalty = if problem.penalty_weight == 0.0 {
            0.0
        } else {
            problem.penalty_weight * log_det_from_r(&r, n, p)
        };

        Ok(Self {
            pi,
            hat,
            fisher,
            penalized_nll: -(log_likelihood + penalty),
        })
    }

    /// Modified score `Xᵀ(y − π + 2w·h·(½ − π))`.
    fn score(&self, problem: &Problem) -> Array1<f64> {
        let w = problem.penalty_weight;
        let adjusted = Zip::from(&problem.y)
            .and(&self.pi)
            .and(&self.hat)
            .map_collect(|&yi, &pi, &h| yi - pi + 2.0 * w * h * (0.5 - pi));
        problem.x.t().dot(&adjusted)
    }
}

enum Transition {
    Continue(NewtonState),
    Finished(NewtonState, NewtonStatus),
}

struct NewtonState {
    beta: Array1<f64>,
    eval: Evaluation,
    iteration: usize,
    halvings: usize,
    trace: Vec<f64>,
}

impl NewtonState {
    fn start(problem: &Problem) -> Result<Self, FitError> {
        let beta = Array1::zeros(problem.x.ncols());
        let eval = Evaluation::at(problem, beta.view())?;
        let trace = vec![eval.penalized_nll];
        Ok(Self {
            beta,
            eval,
            iteration: 0,
            halvings: 0,
            trace,
        })
    }

    fn step(self, problem: &Problem, options: &NewtonOptions) -> Result<Transition, FitError> {
        let score = self.eval.score(problem);
        let max_score = problem
            .free
            .iter()
            .fold(0.0_f64, |m, &j| m.max(score[j].abs()));
        if max_score < options.gtol {
            return Ok(Transition::Finished(self, NewtonStatus::Converged));
        }

        let mut delta = newton_direction(&self.eval.fisher, &score, &problem.free)?;
        let largest = delta.iter().fold(0.0_f64, |m, d| m.max(d.abs()));
        if largest > options.max_step {
            delta *= options.max_step / largest;
        }

        let mut candidate = &self.beta + &delta;
        let mut trial = Evaluation::at(problem, candidate.view())?;
        let mut halvings = 0;
        while !no_worse(trial.penalized_nll, self.eval.penalized_nll)
            && halvings < options.max_halfstep
        {
            halvings += 1;
            candidate = &self.beta + &((&candidate - &self.beta) * 0.5);
            trial = Evaluation::at(problem, candidate.view())?;
            log::trace!(
                "Step halving #{} | current: {:.8e}, trial: {:.8e}",
                halvings,
                self.eval.penalized_nll,
                trial.penalized_nll
            );
        }
        if !no_worse(trial.penalized_nll, self.eval.penalized_nll) {
            log::debug!(
                "Rejected Newton step after {} halvings at iteration {}",
                halvings,
                self.iteration + 1
            );
            return Ok(Transition::Finished(self, NewtonStatus::StepRejected));
        }

        let change = (&candidate - &self.beta).mapv(|d| d * d).sum().sqrt();
        let mut trace = self.trace;
        trace.push(trial.penalized_nll);
        let next = NewtonState {
            beta: candidate,
            eval: trial,
            iteration: self.iteration + 1,
            halvings: self.halvings + halvings,
            trace,
        };
        log::trace!(
            "Iteration {} | objective: {:.8e} | step: {:.3e} | max |U|: {:.3e}",
            next.iteration,
            next.eval.penalized_nll,
            change,
            max_score
        );

        if change <= options.xtol {
            Ok(Transition::Finished(next, NewtonStatus::Converged))
        } else if next.iteration >= options.max_iter {
            Ok(Transition::Finished(next, NewtonStatus::MaxIterationsReached))
        } else {
            Ok(Transition::Continue(next))
        }
    }

    fn finish(self, status: NewtonStatus) -> NewtonFit {
        NewtonFit {
            beta: self.beta,
            penalized_nll: self.eval.penalized_nll,
            fisher_information: self.eval.fisher,
            iterations: self.iteration,
            halvings: self.halvings,
            status,
            trace: self.trace,
        }
    }
}

/// Minimum-norm solution of `F·Δ = U` over the free coordinates.
fn newton_direction(
    fisher: &Array2<f64>,
    score: &Array1<f64>,
    free: &[usize],
) -> Result<Array1<f64>, FitError> {
    if free.len() == score.len() {
        return Ok(fisher.least_squares(score)?.solution);
    }
    let sub_fisher = fisher.select(Axis(0), free).select(Axis(1), free);
    let sub_score = score.select(Axis(0), free);
    let solution = sub_fisher.least_squares(&sub_score)?.solution;
    let mut delta = Array1::zeros(score.len());
    for (&j, &value) in free.iter().zip(solution.iter()) {
        delta[j] = value;
    }
    Ok(delta)
}

fn no_worse(candidate: f64, current: f64) -> bool {
    !candidate.is_nan() && candidate <= current
}

/// `log det(RᵀR)`; minus infinity when the information matrix is singular.
fn log_det_from_r(r: &Array2<f64>, n: usize, p: usize) -> f64 {
    if n < p {
        return f64::NEG_INFINITY;
    }
    2.0 * r.diag().iter().map(|v| v.abs().ln()).sum::<f64>()
}

fn sigmoid(eta: f64) -> f64 {
    if eta >= 0.0 {
        1.0 / (1.0 + (-eta).exp())
    } else {
        let e = eta.exp();
        e / (1.0 + e)
    }
}

/// `ln(1 + eᵗ)` without overflow.
fn softplus(t: f64) -> f64 {
    t.max(0.0) + (-t.abs()).exp().ln_1p()
}

//! Closed-orbit search on top of a tracking collaborator.
//!
//! A [`ClosedOrbitFinder`] gathers cell-end samples from a
//! [`Tracking`] backend and fits a beam ellipse to them. The fitted
//! centre feeds back as the next seed; the search terminates once the
//! tracking noise outgrows the ellipse, once the fit hits the numerical
//! precision floor, or once the iteration budget runs out.
//! [`ClosedOrbitSearch`] and [`ClosedOrbitScan`] are explicit state
//! objects: both expose a `next_*` operation returning a tagged step,
//! and are restartable only by constructing a fresh instance.

use std::collections::BTreeMap;

use nalgebra::DVector;
use serde::{Deserialize, Serialize};

use crate::ellipse::{fit_ellipse, Ellipse, FitSettings};
use crate::error::{OrbitError, Result};
use crate::hit::HitLike;
use crate::tracking::Tracking;

/// Data following a single pass of the closed-orbit finder: the gathered
/// points plus, on demand, the fitted ellipse and per-point noise.
#[derive(Debug, Clone)]
pub struct ClosedOrbitIteration {
    keys: Vec<String>,
    points: Vec<DVector<f64>>,
    eps_max: f64,
    ellipse: Option<Ellipse>,
    noise: Option<Vec<f64>>,
}

impl ClosedOrbitIteration {
    /// Build without fitting; the ellipse can be computed later with
    /// [`calculate_ellipse`](Self::calculate_ellipse).
    pub fn new(keys: Vec<String>, points: Vec<DVector<f64>>, eps_max: f64) -> Self {
        Self {
            keys,
            points,
            eps_max,
            ellipse: None,
            noise: None,
        }
    }

    /// Build and fit eagerly.
    pub fn fitted(keys: Vec<String>, points: Vec<DVector<f64>>, eps_max: f64) -> Result<Self> {
        let mut iteration = Self::new(keys, points, eps_max);
        iteration.calculate_ellipse()?;
        Ok(iteration)
    }

    pub fn keys(&self) -> &[String] {
        &self.keys
    }

    pub fn points(&self) -> &[DVector<f64>] {
        &self.points
    }

    pub fn eps_max(&self) -> f64 {
        self.eps_max
    }

    /// Fitted ellipse centre, if the fit has run and succeeded.
    pub fn centre(&self) -> Option<&DVector<f64>> {
        self.ellipse.as_ref().map(|ellipse| &ellipse.mean)
    }

    pub fn ellipse(&self) -> Option<&Ellipse> {
        self.ellipse.as_ref()
    }

    pub fn noise(&self) -> Option<&[f64]> {
        self.noise.as_deref()
    }

    /// Fit the beam ellipse and recompute the noise list.
    pub fn calculate_ellipse(&mut self) -> Result<()> {
        let fit = fit_ellipse(&self.points, None, &FitSettings::with_eps_cut(self.eps_max))?;
        let noise = self.noise_against(&fit.ellipse)?;
        self.ellipse = Some(fit.ellipse);
        self.noise = Some(noise);
        Ok(())
    }

    /// Quadratic distance of each point from the given ellipse after
    /// unit-determinant normalisation.
    ///
    /// A NaN or infinite noise value is a hard
    /// [`OrbitError::NoiseDegenerate`]; it is never clamped.
    pub fn noise_against(&self, ellipse: &Ellipse) -> Result<Vec<f64>> {
        if self
            .points
            .first()
            .is_some_and(|point| point.len() != ellipse.dimension())
        {
            return Err(OrbitError::InvalidArgument {
                reason: format!(
                    "ellipse has dimension {}, points have {}",
                    ellipse.dimension(),
                    self.points[0].len()
                ),
            });
        }
        let normalized = ellipse.normalized()?;
        let inverse = match normalized.cov.clone().try_inverse() {
            Some(inverse) => inverse,
            None => {
                return Err(OrbitError::FitSingularity {
                    last_estimate: Some(ellipse.clone()),
                })
            }
        };

        let mut noise = Vec::with_capacity(self.points.len());
        for (index, point) in self.points.iter().enumerate() {
            let delta = point - &normalized.mean;
            let value = delta.dot(&(&inverse * &delta));
            if !value.is_finite() {
                return Err(OrbitError::NoiseDegenerate { index, value });
            }
            noise.push(value);
        }
        Ok(noise)
    }

    fn ensure_noise(&mut self) -> Result<&[f64]> {
        if self.noise.is_none() {
            self.calculate_ellipse()?;
        }
        match self.noise.as_deref() {
            Some(noise) => Ok(noise),
            // calculate_ellipse always fills the noise list on success.
            None => Err(OrbitError::FitSingularity {
                last_estimate: None,
            }),
        }
    }

    /// Arithmetic mean of the noise list, fitting first if needed.
    pub fn mean_noise(&mut self) -> Result<f64> {
        let noise = self.ensure_noise()?;
        Ok(noise.iter().sum::<f64>() / noise.len() as f64)
    }

    /// Population standard deviation of the noise list, clamped to zero
    /// when floating error drives the variance negative.
    pub fn sigma_noise(&mut self) -> Result<f64> {
        let noise = self.ensure_noise()?;
        let count = noise.len() as f64;
        let mean = noise.iter().sum::<f64>() / count;
        let variance = noise.iter().map(|value| value * value).sum::<f64>() / count - mean * mean;
        if variance <= 0.0 {
            Ok(0.0)
        } else {
            Ok(variance.sqrt())
        }
    }

    /// Serializable form of the iteration: raw inputs only. The derived
    /// centre, ellipse and noise are deliberately excluded; the receiver
    /// recomputes them from the restored points.
    pub fn summary(&self) -> IterationSummary {
        IterationSummary {
            points: self
                .points
                .iter()
                .map(|point| point.iter().copied().collect())
                .collect(),
            keys: self.keys.clone(),
            eps_max: self.eps_max,
        }
    }

    pub fn from_summary(summary: IterationSummary) -> Self {
        Self::new(
            summary.keys,
            summary.points.into_iter().map(DVector::from_vec).collect(),
            summary.eps_max,
        )
    }
}

/// Wire form of a [`ClosedOrbitIteration`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IterationSummary {
    pub points: Vec<Vec<f64>>,
    pub keys: Vec<String>,
    pub eps_max: f64,
}

/// Finder configuration. No module-level defaults: everything is carried
/// explicitly by this struct.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct FinderSettings {
    /// Outlier cut handed to the underlying ellipse fit. The default is
    /// high enough to effectively disable rejection.
    pub eps_max: f64,
    /// Include the seed itself as the first gathered point.
    pub use_seed: bool,
}

impl Default for FinderSettings {
    fn default() -> Self {
        Self {
            eps_max: 1e6,
            use_seed: false,
        }
    }
}

/// Why a search stopped successfully.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ConvergenceReason {
    /// The tracking noise outgrew the fitted ellipse
    /// (`mean_noise < sigma_noise`).
    ToleranceReached,
    /// The ellipse fit failed after more than the required number of
    /// points had been gathered; the orbit sits at the numerical
    /// precision floor of the tracking.
    NumericalLimit,
}

/// One step of the closed-orbit search.
#[derive(Debug)]
pub enum SearchStep {
    /// A fitted snapshot; the search continues from its centre.
    Iteration(ClosedOrbitIteration),
    /// Terminal: the orbit converged.
    Converged(ConvergenceReason),
    /// Terminal: the search is over without convergence. Either the
    /// iteration budget ran out or a fatal error was already reported.
    Exhausted,
}

/// Terminal status of a completed search.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SearchStatus {
    Converged(ConvergenceReason),
    ExhaustedIterations,
}

#[derive(Debug, Clone, Copy)]
enum Terminal {
    Status(SearchStatus),
    Failed,
}

/// Result of driving a search to its terminal state.
#[derive(Debug)]
pub struct ClosedOrbitResult {
    /// The last fitted snapshot, if any step completed.
    pub last_iteration: Option<ClosedOrbitIteration>,
    pub status: SearchStatus,
    pub iterations: usize,
}

/// Drives the grid scan and the iterative fixed-point search on top of a
/// tracking backend.
pub struct ClosedOrbitFinder<T: Tracking> {
    tracking: T,
    seed: T::Hit,
    settings: FinderSettings,
}

impl<T: Tracking> ClosedOrbitFinder<T> {
    /// `seed` supplies the starting dynamical variables; non-dynamical
    /// variables (particle species, reference energy, ...) ride along
    /// unchanged on every cloned hit.
    pub fn new(tracking: T, seed: T::Hit, settings: FinderSettings) -> Self {
        Self {
            tracking,
            seed,
            settings,
        }
    }

    pub fn settings(&self) -> &FinderSettings {
        &self.settings
    }

    /// Begin a fixed-point search over the named variables.
    ///
    /// `number_of_points` samples are gathered per step; `max_iterations
    /// = None` iterates until convergence or a fatal error, and bounding
    /// that is explicitly the caller's responsibility.
    pub fn search(
        &mut self,
        keys: &[&str],
        number_of_points: usize,
        max_iterations: Option<usize>,
    ) -> ClosedOrbitSearch<'_, T> {
        ClosedOrbitSearch {
            keys: keys.iter().map(|key| (*key).to_owned()).collect(),
            seed: self.seed.clone(),
            number_of_points,
            max_iterations,
            iterations: 0,
            terminal: None,
            pending: None,
            finder: self,
        }
    }

    /// Run the search to its terminal state and report the outcome.
    pub fn find_closed_orbit(
        &mut self,
        keys: &[&str],
        number_of_points: usize,
        max_iterations: Option<usize>,
    ) -> Result<ClosedOrbitResult> {
        let mut search = self.search(keys, number_of_points, max_iterations);
        let mut last_iteration = None;
        loop {
            match search.next_step()? {
                SearchStep::Iteration(iteration) => last_iteration = Some(iteration),
                SearchStep::Converged(reason) => {
                    return Ok(ClosedOrbitResult {
                        last_iteration,
                        status: SearchStatus::Converged(reason),
                        iterations: search.iterations(),
                    })
                }
                SearchStep::Exhausted => {
                    return Ok(ClosedOrbitResult {
                        last_iteration,
                        status: SearchStatus::ExhaustedIterations,
                        iterations: search.iterations(),
                    })
                }
            }
        }
    }

    /// One-shot diagnostic: does `test_values` sit on the closed orbit?
    ///
    /// Fit failures are swallowed on this path and the returned
    /// iteration simply has no ellipse. Tracking failures still
    /// propagate.
    pub fn check_closed_orbit(
        &mut self,
        test_values: &BTreeMap<String, f64>,
        number_of_points: usize,
    ) -> Result<ClosedOrbitIteration> {
        let mut hit = self.seed.clone();
        let keys: Vec<String> = test_values.keys().cloned().collect();
        for (name, value) in test_values {
            if !hit.set(name, *value) {
                return Err(OrbitError::UnknownVariable { name: name.clone() });
            }
        }
        let points = self.gather_points(&keys, &mut hit, number_of_points)?;
        let mut iteration = ClosedOrbitIteration::new(keys, points, self.settings.eps_max);
        match iteration.calculate_ellipse() {
            Ok(())
            | Err(OrbitError::FitSingularity { .. })
            | Err(OrbitError::NoiseDegenerate { .. }) => Ok(iteration),
            Err(other) => Err(other),
        }
    }

    /// Begin an odometer scan over the named grid. All three maps must
    /// share the same key set; keys advance in sorted order with the
    /// last key least significant.
    pub fn scan(
        &mut self,
        start: &BTreeMap<String, f64>,
        end: &BTreeMap<String, f64>,
        step: &BTreeMap<String, f64>,
    ) -> Result<ClosedOrbitScan<'_, T>> {
        let state = ScanState::new(start, end, step)?;
        Ok(ClosedOrbitScan {
            finder: self,
            state,
        })
    }

    /// Accumulate at least `number_of_points` cell-end samples, feeding
    /// the last sample back through tracking whenever more are needed.
    /// The echoed seed at the head of each tracking result is dropped.
    fn gather_points(
        &mut self,
        keys: &[String],
        seed: &mut T::Hit,
        number_of_points: usize,
    ) -> Result<Vec<DVector<f64>>> {
        let mut hits: Vec<T::Hit> = Vec::new();
        if self.settings.use_seed {
            hits.push(seed.clone());
        }
        while hits.len() < number_of_points {
            let tracked = self.tracking.track_one(seed)?;
            if tracked.len() <= 1 {
                return Err(OrbitError::TrackingExhausted);
            }
            hits.extend(tracked.into_iter().skip(1));
            if let Some(last) = hits.last() {
                *seed = last.clone();
            }
        }
        hits.iter().map(|hit| hit_vector(hit, keys)).collect()
    }
}

fn hit_vector<H: HitLike>(hit: &H, keys: &[String]) -> Result<DVector<f64>> {
    let mut values = Vec::with_capacity(keys.len());
    for key in keys {
        let value = hit
            .get(key)
            .ok_or_else(|| OrbitError::UnknownVariable { name: key.clone() })?;
        values.push(value);
    }
    Ok(DVector::from_vec(values))
}

/// Restartable fixed-point search. Call [`next_step`](Self::next_step)
/// until it reports a terminal step; afterwards it keeps reporting the
/// same terminal without touching the tracking backend. A search that
/// returned an error is likewise finished and reports `Exhausted` from
/// then on. Construct a fresh search to restart.
pub struct ClosedOrbitSearch<'a, T: Tracking> {
    finder: &'a mut ClosedOrbitFinder<T>,
    keys: Vec<String>,
    seed: T::Hit,
    number_of_points: usize,
    max_iterations: Option<usize>,
    iterations: usize,
    terminal: Option<Terminal>,
    pending: Option<SearchStatus>,
}

impl<T: Tracking> ClosedOrbitSearch<'_, T> {
    /// Number of completed tracking-and-fit passes.
    pub fn iterations(&self) -> usize {
        self.iterations
    }

    pub fn next_step(&mut self) -> Result<SearchStep> {
        if let Some(terminal) = self.terminal {
            return Ok(match terminal {
                Terminal::Status(SearchStatus::Converged(reason)) => SearchStep::Converged(reason),
                Terminal::Status(SearchStatus::ExhaustedIterations) | Terminal::Failed => {
                    SearchStep::Exhausted
                }
            });
        }
        if let Some(status) = self.pending.take() {
            self.terminal = Some(Terminal::Status(status));
            return Ok(match status {
                SearchStatus::Converged(reason) => SearchStep::Converged(reason),
                SearchStatus::ExhaustedIterations => SearchStep::Exhausted,
            });
        }
        if let Some(bound) = self.max_iterations {
            if self.iterations >= bound {
                self.terminal = Some(Terminal::Status(SearchStatus::ExhaustedIterations));
                return Ok(SearchStep::Exhausted);
            }
        }

        self.iterations += 1;
        let points = match self
            .finder
            .gather_points(&self.keys, &mut self.seed, self.number_of_points)
        {
            Ok(points) => points,
            Err(error) => {
                self.terminal = Some(Terminal::Failed);
                return Err(error);
            }
        };
        let gathered = points.len();

        let mut iteration =
            ClosedOrbitIteration::new(self.keys.clone(), points, self.finder.settings.eps_max);
        if let Err(error) = iteration.calculate_ellipse() {
            match error {
                OrbitError::FitSingularity { .. } | OrbitError::NoiseDegenerate { .. }
                    if gathered > self.number_of_points =>
                {
                    // More points than requested were gathered before the
                    // fit gave out: the orbit is below the precision of
                    // the tracking itself.
                    let reason = ConvergenceReason::NumericalLimit;
                    self.terminal = Some(Terminal::Status(SearchStatus::Converged(reason)));
                    return Ok(SearchStep::Converged(reason));
                }
                error => {
                    self.terminal = Some(Terminal::Failed);
                    return Err(error);
                }
            }
        }

        let mean = iteration.mean_noise()?;
        let sigma = iteration.sigma_noise()?;
        if mean < sigma {
            // Yield this snapshot first; the terminal is reported on the
            // next call.
            self.pending = Some(SearchStatus::Converged(ConvergenceReason::ToleranceReached));
        } else if let Some(centre) = iteration.centre() {
            for (i, key) in self.keys.iter().enumerate() {
                if !self.seed.set(key, centre[i]) {
                    self.terminal = Some(Terminal::Failed);
                    return Err(OrbitError::UnknownVariable { name: key.clone() });
                }
            }
        }
        Ok(SearchStep::Iteration(iteration))
    }
}

/// Odometer over named grid dimensions, sorted keys with the last key
/// least significant. Carry and exhaustion both trigger on
/// `value >= end`; this boundary policy is a contract.
#[derive(Debug, Clone)]
pub struct ScanState {
    keys: Vec<String>,
    current: Vec<f64>,
    start: Vec<f64>,
    end: Vec<f64>,
    step: Vec<f64>,
    exhausted: bool,
}

impl ScanState {
    pub fn new(
        start: &BTreeMap<String, f64>,
        end: &BTreeMap<String, f64>,
        step: &BTreeMap<String, f64>,
    ) -> Result<Self> {
        if start.is_empty() {
            return Err(OrbitError::InvalidArgument {
                reason: "scan needs at least one dimension".into(),
            });
        }
        let keys: Vec<String> = start.keys().cloned().collect();
        if end.len() != keys.len()
            || step.len() != keys.len()
            || keys.iter().any(|key| !end.contains_key(key) || !step.contains_key(key))
        {
            return Err(OrbitError::InvalidArgument {
                reason: "start, end and step must share the same keys".into(),
            });
        }
        for (key, &size) in step {
            if !(size > 0.0) {
                return Err(OrbitError::InvalidArgument {
                    reason: format!("step for {key:?} must be positive, got {size}"),
                });
            }
        }

        let current: Vec<f64> = keys.iter().map(|key| start[key]).collect();
        let end_values: Vec<f64> = keys.iter().map(|key| end[key]).collect();
        let step_values: Vec<f64> = keys.iter().map(|key| step[key]).collect();
        // A start coordinate already at or past its bound leaves nothing
        // to walk.
        let exhausted = current
            .iter()
            .zip(&end_values)
            .any(|(value, bound)| value >= bound);
        Ok(Self {
            keys,
            start: current.clone(),
            current,
            end: end_values,
            step: step_values,
            exhausted,
        })
    }

    pub fn keys(&self) -> &[String] {
        &self.keys
    }

    pub fn is_exhausted(&self) -> bool {
        self.exhausted
    }

    /// The grid coordinate about to be visited, `None` once exhausted.
    pub fn current(&self) -> Option<&[f64]> {
        if self.exhausted {
            None
        } else {
            Some(&self.current)
        }
    }

    /// Advance one notch. Returns `false` once the most-significant key
    /// has overflowed.
    pub fn advance(&mut self) -> bool {
        if self.exhausted {
            return false;
        }
        let mut index = self.keys.len() - 1;
        self.current[index] += self.step[index];
        while self.current[index] >= self.end[index] {
            if index == 0 {
                self.exhausted = true;
                return false;
            }
            self.current[index] = self.start[index];
            index -= 1;
            self.current[index] += self.step[index];
        }
        true
    }
}

/// One step of a grid scan.
#[derive(Debug)]
pub enum ScanStep {
    /// Samples tracked from one grid point, ellipse not yet fitted.
    Iteration(ClosedOrbitIteration),
    /// Terminal: the grid has been fully walked.
    Exhausted,
}

/// Grid scan state object; one tracked grid point per
/// [`next_point`](Self::next_point) call. The terminal `Exhausted` is
/// sticky.
pub struct ClosedOrbitScan<'a, T: Tracking> {
    finder: &'a mut ClosedOrbitFinder<T>,
    state: ScanState,
}

impl<T: Tracking> ClosedOrbitScan<'_, T> {
    pub fn state(&self) -> &ScanState {
        &self.state
    }

    pub fn next_point(&mut self) -> Result<ScanStep> {
        let coordinate = match self.state.current() {
            Some(coordinate) => coordinate.to_vec(),
            None => return Ok(ScanStep::Exhausted),
        };

        let mut hit = self.finder.seed.clone();
        for (key, value) in self.state.keys.iter().zip(&coordinate) {
            if !hit.set(key, *value) {
                return Err(OrbitError::UnknownVariable { name: key.clone() });
            }
        }
        let tracked = self.finder.tracking.track_one(&hit)?;
        if tracked.is_empty() {
            return Err(OrbitError::TrackingExhausted);
        }
        // The echoed seed stays in: its coordinates mark the grid point.
        let points = tracked
            .iter()
            .map(|hit| hit_vector(hit, &self.state.keys))
            .collect::<Result<Vec<_>>>()?;
        let iteration = ClosedOrbitIteration::new(
            self.state.keys.clone(),
            points,
            self.finder.settings.eps_max,
        );
        self.state.advance();
        Ok(ScanStep::Iteration(iteration))
    }
}

//! Probability distributions used to sample padding delays and lengths.
//!
//! A machine state draws its inter-arrival delays either from a
//! parameterized distribution ([`IatDist`]) or from a token histogram
//! (see [`crate::histogram`]).  Length budgets are drawn from a
//! [`LengthDist`].
//!
//! All sampling goes through a caller-supplied [`Rng`], so tests can
//! inject a seeded generator and get reproducible behavior.

use rand::Rng;
use rand_distr::Distribution;

use crate::err::SpecError;

/// A padding delay, in microseconds.
pub type DelayUsec = u32;

/// A sentinel delay value meaning "never schedule padding".
///
/// Histogram sampling returns this when the infinity bin is selected; the
/// engine maps it to [`PadEvent::Infinity`](crate::PadEvent::Infinity).
/// Parameterized distributions never produce it: their upper clamp is
/// required to be smaller.
pub const DELAY_INFINITE: DelayUsec = DelayUsec::MAX;

/// A parameterized family of probability distributions.
///
/// Each family is described by at most two numeric parameters; the
/// constructors validate the parameters and prepare the distribution for
/// repeated sampling.
#[derive(Clone, Copy, Debug)]
#[non_exhaustive]
pub enum DelayDist {
    /// Uniform over `[low, high]`.
    Uniform(rand::distr::Uniform<f64>),
    /// Geometric with success probability `p` per trial.
    Geometric(rand_distr::Geometric),
    /// Exponential with the given mean.
    Exponential(rand_distr::Exp<f64>),
    /// Log-normal: `exp(N(mu, sigma^2))`.
    LogNormal(rand_distr::LogNormal<f64>),
    /// Weibull with shape `k` and scale `lambda`.
    Weibull(rand_distr::Weibull<f64>),
    /// Pareto with scale `x_m` and shape `alpha`.
    Pareto(rand_distr::Pareto<f64>),
}

impl DelayDist {
    /// Construct a uniform distribution over `[low, high]`.
    pub fn uniform(low: f64, high: f64) -> Result<Self, SpecError> {
        if !(low.is_finite() && high.is_finite()) || low < 0.0 || high < low {
            return Err(SpecError::BadDistribution("uniform bounds"));
        }
        let d = rand::distr::Uniform::new_inclusive(low, high)
            .map_err(|_| SpecError::BadDistribution("uniform bounds"))?;
        Ok(DelayDist::Uniform(d))
    }

    /// Construct a geometric distribution with success probability `p`.
    pub fn geometric(p: f64) -> Result<Self, SpecError> {
        // A success probability of zero would make every sample diverge.
        if !p.is_finite() || p <= 0.0 || p > 1.0 {
            return Err(SpecError::BadDistribution("geometric probability"));
        }
        let d = rand_distr::Geometric::new(p)
            .map_err(|_| SpecError::BadDistribution("geometric probability"))?;
        Ok(DelayDist::Geometric(d))
    }

    /// Construct an exponential distribution with the given mean.
    pub fn exponential(mean: f64) -> Result<Self, SpecError> {
        if !mean.is_finite() || mean <= 0.0 {
            return Err(SpecError::BadDistribution("exponential mean"));
        }
        let d = rand_distr::Exp::new(1.0 / mean)
            .map_err(|_| SpecError::BadDistribution("exponential mean"))?;
        Ok(DelayDist::Exponential(d))
    }

    /// Construct a log-normal distribution from the underlying normal's
    /// `mu` and `sigma`.
    pub fn log_normal(mu: f64, sigma: f64) -> Result<Self, SpecError> {
        if !(mu.is_finite() && sigma.is_finite()) || sigma <= 0.0 {
            return Err(SpecError::BadDistribution("log-normal parameters"));
        }
        let d = rand_distr::LogNormal::new(mu, sigma)
            .map_err(|_| SpecError::BadDistribution("log-normal parameters"))?;
        Ok(DelayDist::LogNormal(d))
    }

    /// Construct a Weibull distribution with shape `k` and scale `lambda`.
    pub fn weibull(k: f64, lambda: f64) -> Result<Self, SpecError> {
        let d = rand_distr::Weibull::new(lambda, k)
            .map_err(|_| SpecError::BadDistribution("weibull parameters"))?;
        Ok(DelayDist::Weibull(d))
    }

    /// Construct a Pareto distribution with scale `x_m` and shape `alpha`.
    pub fn pareto(x_m: f64, alpha: f64) -> Result<Self, SpecError> {
        let d = rand_distr::Pareto::new(x_m, alpha)
            .map_err(|_| SpecError::BadDistribution("pareto parameters"))?;
        Ok(DelayDist::Pareto(d))
    }

    /// Draw one value from this distribution.
    ///
    /// The result is clamped below at zero; the families above can
    /// produce no negative values anyway, but rounding near zero is
    /// made explicit here.
    fn sample_f64<R: Rng + ?Sized>(&self, rng: &mut R) -> f64 {
        let x = match self {
            DelayDist::Uniform(d) => d.sample(rng),
            DelayDist::Geometric(d) => {
                // Geometric yields a trial count; the delay domain is
                // microseconds, so the count is used directly.
                d.sample(rng) as f64
            }
            DelayDist::Exponential(d) => d.sample(rng),
            DelayDist::LogNormal(d) => d.sample(rng),
            DelayDist::Weibull(d) => d.sample(rng),
            DelayDist::Pareto(d) => d.sample(rng),
        };
        if x.is_finite() && x > 0.0 {
            x
        } else {
            0.0
        }
    }
}

/// An inter-arrival timing distribution: a [`DelayDist`] plus an upper
/// clamp and an additive shift.
///
/// Sampling returns a delay in microseconds no greater than
/// `max_delay + shift` (plus the state's RTT estimate, when the state
/// opts into RTT shifting).
#[derive(Clone, Copy, Debug)]
pub struct IatDist {
    /// The underlying distribution.
    dist: DelayDist,
    /// Upper clamp applied to the raw sample, before shifting.
    max_delay: DelayUsec,
    /// Constant added to every sample.
    shift: DelayUsec,
}

impl IatDist {
    /// Construct a new inter-arrival distribution.
    ///
    /// `max_delay` must be strictly less than [`DELAY_INFINITE`]; the
    /// sentinel is reserved for histogram infinity bins.
    pub fn new(dist: DelayDist, max_delay: DelayUsec, shift: DelayUsec) -> Result<Self, SpecError> {
        if max_delay == DELAY_INFINITE {
            return Err(SpecError::BadDistribution("max_delay is the sentinel"));
        }
        Ok(IatDist {
            dist,
            max_delay,
            shift,
        })
    }

    /// Sample a delay, in microseconds.
    ///
    /// `rtt_shift` is the runtime's RTT estimate, or zero when the state
    /// does not use it.  The result is always strictly less than
    /// [`DELAY_INFINITE`].
    pub(crate) fn sample<R: Rng + ?Sized>(&self, rng: &mut R, rtt_shift: DelayUsec) -> DelayUsec {
        let raw = self.dist.sample_f64(rng);
        let clamped = if raw >= f64::from(self.max_delay) {
            self.max_delay
        } else {
            // Truncation is the right rounding here: a sampled 999.9 usec
            // delay must not round up past the clamp.
            raw as DelayUsec
        };
        clamped
            .saturating_add(self.shift)
            .saturating_add(rtt_shift)
            .min(DELAY_INFINITE - 1)
    }
}

/// A distribution for a state's per-visit padding length budget.
#[derive(Clone, Copy, Debug)]
pub struct LengthDist {
    /// The underlying distribution.
    dist: DelayDist,
    /// Upper clamp on the sampled cell count.
    max_len: u64,
}

impl LengthDist {
    /// Construct a new length distribution with the given upper clamp.
    pub fn new(dist: DelayDist, max_len: u64) -> Self {
        LengthDist { dist, max_len }
    }

    /// Sample a padding budget, in cells.
    pub(crate) fn sample<R: Rng + ?Sized>(&self, rng: &mut R) -> u64 {
        let raw = self.dist.sample_f64(rng);
        if raw >= self.max_len as f64 {
            self.max_len
        } else {
            raw as u64
        }
    }
}

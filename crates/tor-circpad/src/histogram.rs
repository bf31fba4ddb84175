//! Token histograms: distributions over inter-arrival delays whose shape
//! can be worn down by the traffic that actually gets sent.
//!
//! A histogram has N ordinary bins covering consecutive half-open delay
//! intervals, plus a final *infinity bin* whose selection means "do not
//! schedule padding from this firing".  Each bin holds a token count;
//! sampling selects a bin weighted by the current counts, and sending a
//! cell removes a token according to the state's removal strategy, so the
//! padding actually achievable converges toward the specified shape.

use rand::{Rng, RngExt};

use crate::dist::{DelayUsec, DELAY_INFINITE};
use crate::err::SpecError;

/// How a state removes histogram tokens when a cell is sent.
///
/// Removal applies to both padding and non-padding sends while a histogram
/// state is active, keyed by the observed inter-arrival delay.  Tokens are
/// never removed when a timer is merely scheduled or cancelled.
#[derive(Copy, Clone, Debug, Default, Eq, PartialEq)]
#[non_exhaustive]
pub enum TokenRemoval {
    /// Do not track tokens; the histogram is read-only.
    #[default]
    None,
    /// Remove from the bin containing the observed delay, if it has any
    /// tokens.
    Exact,
    /// Remove from the non-empty bin nearest the observed delay.
    Closest,
    /// Like `Closest`, but only when the delay falls below the
    /// histogram's lowest edge; otherwise leave the tokens alone.
    ClosestOnUnder,
    /// Remove from the nearest non-empty bin at or above the observed
    /// delay.
    Higher,
    /// Remove from the nearest non-empty bin at or below the observed
    /// delay.
    Lower,
}

/// The outcome of sampling a histogram.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub(crate) enum HistSample {
    /// Schedule padding after this many microseconds.
    Delay(DelayUsec),
    /// The infinity bin was selected: do not schedule.
    Infinity,
    /// There are no tokens left in any bin.
    BinsEmpty,
}

/// Where a delay falls relative to a histogram's ordinary bins.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
enum BinPos {
    /// Below the lowest edge.
    Below,
    /// Within ordinary bin `i`.
    In(usize),
    /// At or above the highest edge.
    Above,
}

/// An immutable histogram description, part of a machine specification.
///
/// The mutable per-circuit copy is a [`TokenBank`]; it is created fresh on
/// every state entry and discarded on exit.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct HistogramSpec {
    /// Bin edges, strictly ascending.  `edges[i]..edges[i+1]` is the
    /// half-open interval of ordinary bin `i`.
    edges: Vec<DelayUsec>,
    /// Token counts: one per ordinary bin, then the infinity bin.
    tokens: Vec<u32>,
}

impl HistogramSpec {
    /// Construct a histogram from caller-supplied bin edges.
    ///
    /// `edges` must be strictly ascending and must stay below the
    /// [`DELAY_INFINITE`] sentinel; `tokens` holds one count per ordinary
    /// bin plus a trailing count for the infinity bin.
    pub fn from_edges(edges: Vec<DelayUsec>, tokens: Vec<u32>) -> Result<Self, SpecError> {
        if edges.len() < 2 {
            return Err(SpecError::BadHistogram("fewer than one bin"));
        }
        if !edges.windows(2).all(|w| w[0] < w[1]) {
            return Err(SpecError::BadHistogram("bin edges not ascending"));
        }
        if *edges.last().expect("nonempty edges") == DELAY_INFINITE {
            return Err(SpecError::BadHistogram("top edge is the sentinel"));
        }
        if tokens.len() != edges.len() {
            return Err(SpecError::BadHistogram("token count mismatch"));
        }
        Ok(HistogramSpec { edges, tokens })
    }

    /// Construct a histogram whose `n_bins` ordinary bins partition
    /// `[low, high)` geometrically: each bin is twice as wide as the one
    /// before it.
    pub fn geometric(
        low: DelayUsec,
        high: DelayUsec,
        n_bins: usize,
        tokens: Vec<u32>,
    ) -> Result<Self, SpecError> {
        if n_bins == 0 || n_bins > 32 {
            return Err(SpecError::BadHistogram("bad bin count"));
        }
        if high <= low {
            return Err(SpecError::BadHistogram("empty delay range"));
        }
        let range = u64::from(high - low);
        let denom: u64 = (1_u64 << n_bins) - 1;
        let mut edges = Vec::with_capacity(n_bins + 1);
        for i in 0..=n_bins {
            let num = (1_u64 << i) - 1;
            let off = range * num / denom;
            edges.push(low + off as DelayUsec);
        }
        // A tiny range can collapse adjacent edges; from_edges catches it.
        Self::from_edges(edges, tokens)
    }

    /// The number of ordinary (non-infinity) bins.
    pub(crate) fn n_bins(&self) -> usize {
        self.edges.len() - 1
    }

    /// The index of the infinity bin.
    fn infinity_bin(&self) -> usize {
        self.n_bins()
    }

    /// The specified token counts, including the infinity bin.
    pub(crate) fn tokens(&self) -> &[u32] {
        &self.tokens
    }

    /// Create a fresh mutable copy of the token counts.
    pub(crate) fn fresh_tokens(&self) -> TokenBank {
        TokenBank {
            counts: self.tokens.clone(),
        }
    }

    /// The half-open delay interval covered by ordinary bin `i`.
    fn bin_interval(&self, i: usize) -> (DelayUsec, DelayUsec) {
        (self.edges[i], self.edges[i + 1])
    }

    /// Locate `d` relative to the ordinary bins.
    fn bin_containing(&self, d: DelayUsec) -> BinPos {
        if d < self.edges[0] {
            return BinPos::Below;
        }
        if d >= *self.edges.last().expect("nonempty edges") {
            return BinPos::Above;
        }
        // partition_point: first edge greater than d; the bin is one back.
        let i = self.edges.partition_point(|e| *e <= d) - 1;
        BinPos::In(i)
    }

    /// Sample a delay, weighted by the token counts in `counts`.
    ///
    /// `counts` is either the spec's own counts (no token removal) or a
    /// runtime [`TokenBank`].
    pub(crate) fn sample<R: Rng + ?Sized>(&self, counts: &[u32], rng: &mut R) -> HistSample {
        let total: u64 = counts.iter().map(|c| u64::from(*c)).sum();
        if total == 0 {
            return HistSample::BinsEmpty;
        }
        let mut pick = rng.random_range(0..total);
        let mut bin = self.infinity_bin();
        for (i, c) in counts.iter().enumerate() {
            let c = u64::from(*c);
            if pick < c {
                bin = i;
                break;
            }
            pick -= c;
        }
        if bin == self.infinity_bin() {
            return HistSample::Infinity;
        }
        let (lo, hi) = self.bin_interval(bin);
        HistSample::Delay(rng.random_range(lo..hi))
    }

    /// Remove one token from `bank` for an observed inter-arrival delay
    /// `d`, according to `strategy`.
    pub(crate) fn remove_token(&self, bank: &mut TokenBank, d: DelayUsec, strategy: TokenRemoval) {
        let pos = self.bin_containing(d);
        let chosen = match strategy {
            TokenRemoval::None => None,
            TokenRemoval::Exact => match pos {
                BinPos::In(i) if bank.counts[i] > 0 => Some(i),
                _ => None,
            },
            TokenRemoval::Closest => self.closest_nonempty(bank, d),
            TokenRemoval::ClosestOnUnder => {
                if matches!(pos, BinPos::Below) {
                    self.closest_nonempty(bank, d)
                } else {
                    None
                }
            }
            TokenRemoval::Higher => {
                let start = match pos {
                    BinPos::Below => Some(0),
                    BinPos::In(i) => Some(i),
                    BinPos::Above => None,
                };
                start.and_then(|s| (s..self.n_bins()).find(|i| bank.counts[*i] > 0))
            }
            TokenRemoval::Lower => {
                let start = match pos {
                    BinPos::Below => None,
                    BinPos::In(i) => Some(i),
                    BinPos::Above => Some(self.n_bins() - 1),
                };
                start.and_then(|s| (0..=s).rev().find(|i| bank.counts[*i] > 0))
            }
        };
        if let Some(i) = chosen {
            bank.counts[i] -= 1;
        }
    }

    /// Find the non-empty ordinary bin whose interval is nearest `d`,
    /// breaking ties toward the lower index.
    fn closest_nonempty(&self, bank: &TokenBank, d: DelayUsec) -> Option<usize> {
        let mut best: Option<(usize, u64)> = None;
        for i in 0..self.n_bins() {
            if bank.counts[i] == 0 {
                continue;
            }
            let (lo, hi) = self.bin_interval(i);
            let dist: u64 = if d < lo {
                u64::from(lo - d)
            } else if d >= hi {
                // hi is exclusive, so the nearest covered delay is hi - 1.
                u64::from(d - (hi - 1))
            } else {
                0
            };
            match best {
                Some((_, b)) if b <= dist => {}
                _ => best = Some((i, dist)),
            }
        }
        best.map(|(i, _)| i)
    }
}

/// A runtime's mutable copy of a histogram's token counts.
///
/// Token counts only ever decrease over the lifetime of one copy; entering
/// a state resets them by taking a fresh copy from the spec.
#[derive(Clone, Debug)]
pub(crate) struct TokenBank {
    /// Current counts, one per ordinary bin plus the infinity bin.
    counts: Vec<u32>,
}

impl TokenBank {
    /// The current counts, in bin order.
    pub(crate) fn counts(&self) -> &[u32] {
        &self.counts
    }
}

//! Host-facing configuration for the padding framework.
//!
//! Everything here is a developer override: the framework runs with
//! sensible defaults when the host passes `PaddingConfig::default()`.
//! Machines themselves are never configured from here; they are
//! compiled-in descriptions (see [`crate::machine`]).

use derive_builder::Builder;
use tor_config::{impl_standard_builder, ConfigBuildError};
use tor_linkspec::RelayIdSet;
use tor_units::Percentage;

use crate::overhead::OverheadLimits;

/// Configuration for circuit padding on one host.
#[derive(Debug, Clone, Builder, Eq, PartialEq)]
#[builder(build_fn(error = "ConfigBuildError"))]
#[non_exhaustive]
pub struct PaddingConfig {
    /// Whether circuit padding is enabled at all.
    ///
    /// When false, no machine matches any circuit, and active machines
    /// are shut down on the next lifecycle event.
    #[builder(default = "true")]
    pub padding_enabled: bool,

    /// Override for the global padding burst allowance.
    #[builder(default)]
    pub override_allowed_burst: Option<u32>,

    /// Override for the global padding percentage cap.
    #[builder(default)]
    pub override_max_percent: Option<Percentage<u32>>,

    /// Middle relays for which the `Padding` subprotocol support check
    /// is bypassed.
    ///
    /// This exists so that padding machines can be tested against relays
    /// whose descriptors do not advertise support yet.  Not for
    /// production use.
    #[builder(default)]
    pub restricted_middles: RelayIdSet,
}
impl_standard_builder! { PaddingConfig: !Deserialize }

impl PaddingConfig {
    /// The global overhead limits, with any overrides applied.
    pub fn overhead_limits(&self) -> OverheadLimits {
        let defaults = OverheadLimits::default();
        OverheadLimits::new(
            self.override_allowed_burst
                .unwrap_or_else(|| defaults.allowed_burst()),
            self.override_max_percent.unwrap_or(defaults.max_percent()),
        )
    }
}

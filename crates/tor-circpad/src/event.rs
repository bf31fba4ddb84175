//! Events that drive padding machine transitions.

/// An event that a padding machine can react to.
///
/// The first four variants describe cells crossing the circuit, as seen
/// from the endpoint running the machine.  The remaining three are raised
/// internally by the engine itself.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Hash)]
#[non_exhaustive]
pub enum PadEvent {
    /// A non-padding cell was sent toward the peer.
    NonPaddingSent,
    /// A non-padding cell arrived from the peer.
    NonPaddingRecv,
    /// A padding cell was sent toward the peer.
    PaddingSent,
    /// A padding cell arrived from the peer.
    PaddingRecv,
    /// The infinity bin was sampled: no padding will be scheduled from
    /// this firing.
    Infinity,
    /// Every bin of the mutable histogram is out of tokens.
    BinsEmpty,
    /// The state's per-visit padding length budget is exhausted.
    LengthCount,
}

impl PadEvent {
    /// The number of distinct events, used to size next-state tables.
    pub(crate) const N_EVENTS: usize = 7;

    /// Return a dense index for this event, suitable for table lookup.
    pub(crate) fn index(self) -> usize {
        match self {
            PadEvent::NonPaddingSent => 0,
            PadEvent::NonPaddingRecv => 1,
            PadEvent::PaddingSent => 2,
            PadEvent::PaddingRecv => 3,
            PadEvent::Infinity => 4,
            PadEvent::BinsEmpty => 5,
            PadEvent::LengthCount => 6,
        }
    }

    /// Return true if this is a machine-internal event rather than a cell
    /// event.
    pub(crate) fn is_internal(self) -> bool {
        matches!(
            self,
            PadEvent::Infinity | PadEvent::BinsEmpty | PadEvent::LengthCount
        )
    }

    /// Return true if this event describes a cell sent by this endpoint.
    pub(crate) fn is_send(self) -> bool {
        matches!(self, PadEvent::NonPaddingSent | PadEvent::PaddingSent)
    }

    /// Iterate over every event, in table order.
    #[cfg(test)]
    pub(crate) fn all() -> impl Iterator<Item = PadEvent> {
        [
            PadEvent::NonPaddingSent,
            PadEvent::NonPaddingRecv,
            PadEvent::PaddingSent,
            PadEvent::PaddingRecv,
            PadEvent::Infinity,
            PadEvent::BinsEmpty,
            PadEvent::LengthCount,
        ]
        .into_iter()
    }
}

impl std::fmt::Display for PadEvent {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            PadEvent::NonPaddingSent => "NONPADDING_SENT",
            PadEvent::NonPaddingRecv => "NONPADDING_RECV",
            PadEvent::PaddingSent => "PADDING_SENT",
            PadEvent::PaddingRecv => "PADDING_RECV",
            PadEvent::Infinity => "INFINITY",
            PadEvent::BinsEmpty => "BINS_EMPTY",
            PadEvent::LengthCount => "LENGTH_COUNT",
        };
        write!(f, "{}", s)
    }
}

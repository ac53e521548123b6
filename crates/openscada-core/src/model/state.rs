// ── Subscription state ──
//
// Disconnected <-> Connected <-> Granted. No other transitions exist; a
// jump across Connected is expanded into two steps.

use serde::{Deserialize, Serialize};

/// State of a subscription as seen by a source or one of its listeners.
#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    Hash,
    Default,
    PartialOrd,
    Ord,
    Serialize,
    Deserialize,
    strum::Display,
    strum::EnumString,
    strum::IntoStaticStr,
)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
#[strum(serialize_all = "SCREAMING_SNAKE_CASE")]
pub enum SubscriptionState {
    /// The source is unknown or unreachable.
    #[default]
    Disconnected,
    /// The source has been seen but is not delivering.
    Connected,
    /// The source is delivering values.
    Granted,
}

impl SubscriptionState {
    /// Returns `true` if `self -> next` is one of the permitted transitions.
    pub fn can_transition_to(self, next: Self) -> bool {
        matches!(
            (self, next),
            (Self::Disconnected, Self::Connected)
                | (Self::Connected, Self::Disconnected | Self::Granted)
                | (Self::Granted, Self::Connected)
        )
    }

    /// The states to pass through, in order, to get from `self` to
    /// `target`. Empty when already there.
    pub fn path_to(self, target: Self) -> Vec<Self> {
        match (self, target) {
            (a, b) if a == b => Vec::new(),
            (Self::Disconnected, Self::Granted) => vec![Self::Connected, Self::Granted],
            (Self::Granted, Self::Disconnected) => vec![Self::Connected, Self::Disconnected],
            (_, b) => vec![b],
        }
    }

    pub fn is_granted(self) -> bool {
        self == Self::Granted
    }
}

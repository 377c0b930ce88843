//! Messenger Lifecycle States
//!
//! A messenger's current state is always exactly one [`MessengerState`]. Waiters
//! and group-membership tests work with [`StateMask`], a set of states, so that a
//! single wait can be satisfied by any of several states.

use bitflags::bitflags;
use core::fmt;
use core::ops::BitOr;
use serde::{Deserialize, Serialize};

// ----------------------------------------------------------------------------
// Messenger State
// ----------------------------------------------------------------------------

/// Lifecycle state of a messenger
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum MessengerState {
    /// Destination not resolved yet; messages may be queued
    Unresolved,
    /// Destination resolved, connection being brought up
    Resolved,
    /// Connected and idle (queue empty)
    Connected,
    /// Queue non-empty, below capacity
    Sending,
    /// Queue at capacity
    SendingSaturated,
    /// Quiescent, nothing in flight
    Idle,
    /// Close requested, queue still draining
    Closing,
    /// Close requested, then the connection was lost before the drain completed
    ReconClosing,
    /// Connection lost while idle or sending
    Reconnecting,
    /// Drained and closed
    Closed,
    /// Connection lost, no recovery possible
    Broken,
    /// Connection died while unresolved, on the way to `Broken`
    Disconnected,
}

impl MessengerState {
    /// Every state, in declaration order
    pub const ALL: [MessengerState; 12] = [
        MessengerState::Unresolved,
        MessengerState::Resolved,
        MessengerState::Connected,
        MessengerState::Sending,
        MessengerState::SendingSaturated,
        MessengerState::Idle,
        MessengerState::Closing,
        MessengerState::ReconClosing,
        MessengerState::Reconnecting,
        MessengerState::Closed,
        MessengerState::Broken,
        MessengerState::Disconnected,
    ];

    /// The single-bit mask for this state
    pub const fn mask(self) -> StateMask {
        match self {
            MessengerState::Unresolved => StateMask::UNRESOLVED,
            MessengerState::Resolved => StateMask::RESOLVED,
            MessengerState::Connected => StateMask::CONNECTED,
            MessengerState::Sending => StateMask::SENDING,
            MessengerState::SendingSaturated => StateMask::SENDING_SATURATED,
            MessengerState::Idle => StateMask::IDLE,
            MessengerState::Closing => StateMask::CLOSING,
            MessengerState::ReconClosing => StateMask::RECON_CLOSING,
            MessengerState::Reconnecting => StateMask::RECONNECTING,
            MessengerState::Closed => StateMask::CLOSED,
            MessengerState::Broken => StateMask::BROKEN,
            MessengerState::Disconnected => StateMask::DISCONNECTED,
        }
    }

    /// Raw bit value of this state
    pub const fn bits(self) -> u16 {
        self.mask().bits()
    }

    /// Whether this state is a member of `mask`
    pub fn matches(self, mask: StateMask) -> bool {
        mask.intersects(self.mask())
    }

    /// A message can still be queued from this state
    pub fn is_usable(self) -> bool {
        self.matches(StateMask::USABLE)
    }

    /// No further transition is possible from this state
    pub fn is_terminal(self) -> bool {
        self.matches(StateMask::TERMINAL)
    }

    /// State name for logging
    pub fn name(self) -> &'static str {
        match self {
            MessengerState::Unresolved => "UNRESOLVED",
            MessengerState::Resolved => "RESOLVED",
            MessengerState::Connected => "CONNECTED",
            MessengerState::Sending => "SENDING",
            MessengerState::SendingSaturated => "SENDINGSATURATED",
            MessengerState::Idle => "IDLE",
            MessengerState::Closing => "CLOSING",
            MessengerState::ReconClosing => "RECONCLOSING",
            MessengerState::Reconnecting => "RECONNECTING",
            MessengerState::Closed => "CLOSED",
            MessengerState::Broken => "BROKEN",
            MessengerState::Disconnected => "DISCONNECTED",
        }
    }
}

impl fmt::Display for MessengerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

// ----------------------------------------------------------------------------
// State Mask
// ----------------------------------------------------------------------------

bitflags! {
    /// A set of messenger states, used for waits and group membership.
    ///
    /// Derived groups are never the current value of a messenger.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct StateMask: u16 {
        const UNRESOLVED = 1 << 0;
        const RESOLVED = 1 << 1;
        const CONNECTED = 1 << 2;
        const SENDING = 1 << 3;
        const SENDING_SATURATED = 1 << 4;
        const IDLE = 1 << 5;
        const CLOSING = 1 << 6;
        const RECON_CLOSING = 1 << 7;
        const RECONNECTING = 1 << 8;
        const CLOSED = 1 << 9;
        const BROKEN = 1 << 10;
        const DISCONNECTED = 1 << 11;

        /// States from which a message can still be queued.
        const USABLE = Self::RESOLVED.bits()
            | Self::CONNECTED.bits()
            | Self::SENDING.bits()
            | Self::SENDING_SATURATED.bits()
            | Self::IDLE.bits()
            | Self::CLOSING.bits()
            | Self::RECON_CLOSING.bits()
            | Self::RECONNECTING.bits();

        /// States from which no transition is possible.
        const TERMINAL = Self::CLOSED.bits() | Self::BROKEN.bits();

        /// States in which nothing is left in flight; what `flush` waits for.
        const QUIESCENT = Self::IDLE.bits()
            | Self::CONNECTED.bits()
            | Self::CLOSED.bits()
            | Self::BROKEN.bits();
    }
}

impl StateMask {
    /// States in this mask, in declaration order
    pub fn states(self) -> impl Iterator<Item = MessengerState> {
        MessengerState::ALL
            .into_iter()
            .filter(move |state| state.matches(self))
    }
}

impl From<MessengerState> for StateMask {
    fn from(state: MessengerState) -> Self {
        state.mask()
    }
}

impl BitOr for MessengerState {
    type Output = StateMask;

    fn bitor(self, rhs: MessengerState) -> StateMask {
        self.mask() | rhs.mask()
    }
}

impl BitOr<MessengerState> for StateMask {
    type Output = StateMask;

    fn bitor(self, rhs: MessengerState) -> StateMask {
        self | rhs.mask()
    }
}

impl Serialize for StateMask {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        self.bits().serialize(serializer)
    }
}

impl<'de> Deserialize<'de> for StateMask {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        let bits = u16::deserialize(deserializer)?;
        Ok(StateMask::from_bits_truncate(bits))
    }
}

// ----------------------------------------------------------------------------
// Tests
// ----------------------------------------------------------------------------

//! Client-side load balancing driven by a remote service-discovery control
//! plane.
//!
//! The centrepiece of this crate is the [`lookaside`] balancer: for each
//! target service it maintains a streaming session to a control-plane
//! endpoint, receives endpoint assignments, and programs a child
//! load-balancing policy that picks a backend for each outgoing call. When
//! the control plane is silent, it deterministically falls back to a simpler
//! policy driven by the addresses supplied by the local name resolver.
//!
//! The supporting modules define the seams the balancer is wired into:
//!
//! - [`balancer`]: the uniform load-balancing policy surface (policies,
//!   builders, pickers, subchannels) and a registry of named policies.
//! - [`discovery`]: the control-plane client and the transport seam it is
//!   built on.
//! - [`resolver`]: address lists as produced by name resolution.
//! - [`load_report`]: the sink populated with per-session load statistics.
//! - [`rt`]: a small runtime abstraction so spawning and timers are
//!   pluggable.

use std::fmt::Display;

pub mod balancer;
pub mod discovery;
pub mod error;
pub mod load_report;
pub mod lookaside;
pub mod resolver;
pub mod rt;

/// The state of a channel or of an individual subchannel within it.
///
/// Channels begin Idle, move to Connecting when a connection is attempted,
/// and to Ready once one is established. TransientFailure indicates that
/// calls would currently fail and reconnection is in progress.
#[derive(Copy, Clone, PartialEq, Eq, Debug, Default)]
pub enum ConnectivityState {
    #[default]
    Idle,
    Connecting,
    Ready,
    TransientFailure,
}

impl Display for ConnectivityState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConnectivityState::Idle => write!(f, "Idle"),
            ConnectivityState::Connecting => write!(f, "Connecting"),
            ConnectivityState::Ready => write!(f, "Ready"),
            ConnectivityState::TransientFailure => write!(f, "TransientFailure"),
        }
    }
}

//! The uniform surface over load-balancing policies.
//!
//! A policy is responsible for creating connections (modeled as
//! [`Subchannel`]s) through the channel it serves, and for producing
//! [`Picker`] instances that select a connection for each RPC. Policies are
//! instantiated from a [`LbPolicyBuilder`] looked up by name in the
//! [`registry`].

pub mod pick_first;
pub mod registry;
pub mod round_robin;

use std::any::Any;
use std::error::Error;
use std::fmt::Display;
use std::sync::Arc;

use serde::de::DeserializeOwned;
use tonic::Status;

use crate::resolver::{Address, ResolverUpdate};
use crate::rt::Runtime;
use crate::ConnectivityState;

/// The channel-side surface a policy operates against.
///
/// Implementations are shared: a policy holds this as an `Arc` for as long
/// as it is open, and parent policies interpose their own implementation
/// between a child and the real channel.
pub trait ClientChannel: Send + Sync {
    /// Creates a new subchannel in Idle state for the given address.
    fn new_subchannel(&self, address: &Address) -> Arc<dyn Subchannel>;

    /// Publishes a new connectivity state and picker for the channel.
    fn update_balancer_state(&self, state: LbState);

    /// Signals the name resolver to attempt re-resolution, typically after
    /// connection failures.
    fn request_resolution(&self);

    /// The target string the channel was created for.
    fn target(&self) -> String;
}

/// A method of communicating with one backend, which may connect and
/// disconnect many times across its lifetime.
///
/// Subchannels are compared by identity: two `Arc<dyn Subchannel>` values
/// are the same subchannel only if they point at the same allocation.
pub trait Subchannel: Send + Sync + Display {
    /// The address this subchannel was created for.
    fn address(&self) -> Address;

    /// Begins connecting, if Idle. State changes are reported through the
    /// policy's `subchannel_update`.
    fn connect(&self);
}

/// A key identifying a subchannel by its allocation, usable in hash maps.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubchannelKey(usize);

impl SubchannelKey {
    pub fn of(subchannel: &Arc<dyn Subchannel>) -> Self {
        SubchannelKey(Arc::as_ptr(subchannel) as *const () as usize)
    }
}

/// The state of one subchannel, as delivered to the policy that created it.
#[derive(Clone, Default)]
pub struct SubchannelState {
    pub connectivity_state: ConnectivityState,
    /// Set when `connectivity_state` is TransientFailure to describe the
    /// most recent connection error.
    pub last_connection_error: Option<Arc<dyn Error + Send + Sync>>,
}

impl Display for SubchannelState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.connectivity_state)
    }
}

/// Data needed by the channel to route a request.
pub struct Pick {
    pub subchannel: Arc<dyn Subchannel>,
}

/// The outcome of asking a picker for a connection.
pub enum PickResult {
    /// Use the given subchannel for the request.
    Pick(Pick),
    /// Queue the request until a new picker is produced.
    Queue,
    /// Fail the request with the given status unless it is wait-for-ready.
    Fail(Status),
    /// Fail the request immediately, even if it is wait-for-ready.
    Drop(Status),
}

/// Per-RPC data handed to a picker.
#[derive(Debug, Default)]
#[non_exhaustive]
pub struct Request {
    /// The full method name of the RPC being routed.
    pub method: String,
}

/// Decides which subchannel to use for a given request. A picker is used at
/// most once per RPC; if it returns `Queue` the channel waits for the policy
/// to produce a new picker and retries on that one.
pub trait Picker: Send + Sync {
    fn pick(&self, request: &Request) -> PickResult;
}

/// A connectivity state paired with the picker in effect for it.
#[derive(Clone)]
pub struct LbState {
    pub connectivity_state: ConnectivityState,
    pub picker: Arc<dyn Picker>,
}

impl LbState {
    /// The generic initial state: Connecting, queueing all picks.
    pub fn initial() -> Self {
        Self {
            connectivity_state: ConnectivityState::Connecting,
            picker: Arc::new(QueuingPicker),
        }
    }
}

/// Always queues. For policies that are actively connecting.
pub struct QueuingPicker;

impl Picker for QueuingPicker {
    fn pick(&self, _request: &Request) -> PickResult {
        PickResult::Queue
    }
}

/// Fails every pick with the recorded error. For policies in
/// TransientFailure.
pub struct FailingPicker {
    pub error: String,
}

impl Picker for FailingPicker {
    fn pick(&self, _request: &Request) -> PickResult {
        PickResult::Fail(Status::unavailable(self.error.clone()))
    }
}

/// An opaque, type-erased policy configuration as produced by
/// [`LbPolicyBuilder::parse_config`].
#[derive(Clone)]
pub struct LbConfig {
    config: Arc<dyn Any + Send + Sync>,
}

impl LbConfig {
    pub fn new(config: impl Any + Send + Sync) -> Self {
        LbConfig {
            config: Arc::new(config),
        }
    }

    /// Recovers the concrete configuration type, or `None` if the wrapped
    /// value is of a different type.
    pub fn convert_to<T: 'static + Send + Sync>(&self) -> Option<Arc<T>> {
        self.config.clone().downcast::<T>().ok()
    }
}

/// A policy configuration still in its JSON form.
#[derive(Debug, Clone)]
pub struct ParsedJsonConfig {
    pub value: serde_json::Value,
}

impl ParsedJsonConfig {
    pub fn from_value(value: serde_json::Value) -> Self {
        Self { value }
    }

    pub fn parse(text: &str) -> Result<Self, serde_json::Error> {
        Ok(Self {
            value: serde_json::from_str(text)?,
        })
    }

    /// Deserializes the JSON into the builder's concrete configuration type.
    pub fn convert_to<T: DeserializeOwned>(&self) -> Result<T, serde_json::Error> {
        serde_json::from_value(self.value.clone())
    }
}

/// Data handed to a builder when constructing a policy instance.
pub struct LbPolicyOptions {
    /// Used by the policy for any background work it needs to schedule.
    pub runtime: Arc<dyn Runtime>,
}

/// A factory producing instances of one named policy.
pub trait LbPolicyBuilder: Send + Sync {
    /// Builds a new policy instance. Must not fail; optional configuration
    /// arrives later through `resolver_update`.
    fn build(&self, channel: Arc<dyn ClientChannel>, options: LbPolicyOptions) -> Box<dyn LbPolicy>;

    /// The name under which this policy is registered.
    fn name(&self) -> &'static str;

    /// Parses a JSON configuration into the internal representation, or
    /// `None` if the policy takes no configuration.
    fn parse_config(
        &self,
        _config: &ParsedJsonConfig,
    ) -> Result<Option<LbConfig>, Box<dyn Error + Send + Sync>> {
        Ok(None)
    }
}

/// A load-balancing policy instance.
///
/// Policies begin in a Connecting state that queues RPCs until their first
/// update. All methods are invoked serially.
pub trait LbPolicy: Send {
    /// Called when the name resolver produces a new address list or the
    /// channel a new configuration.
    fn resolver_update(
        &mut self,
        update: ResolverUpdate,
        config: Option<&LbConfig>,
    ) -> Result<(), Box<dyn Error + Send + Sync>>;

    /// Called when a subchannel created by this policy changes state.
    fn subchannel_update(&mut self, subchannel: &Arc<dyn Subchannel>, state: &SubchannelState);

    /// Terminates the policy. It must release its subchannels and stop
    /// publishing state.
    fn close(&mut self);
}

// Subchannel-and-last-state pairing used for bookkeeping in the leaf
// policies.
pub(crate) struct TrackedSubchannel {
    pub subchannel: Arc<dyn Subchannel>,
    pub state: ConnectivityState,
}

impl TrackedSubchannel {
    pub(crate) fn new(subchannel: Arc<dyn Subchannel>) -> Self {
        Self {
            subchannel,
            state: ConnectivityState::Idle,
        }
    }

    pub(crate) fn is(&self, other: &Arc<dyn Subchannel>) -> bool {
        SubchannelKey::of(&self.subchannel) == SubchannelKey::of(other)
    }
}

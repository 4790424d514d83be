//! Child slots and the channel bridge interposed between each child policy
//! and the real channel.
//!
//! Every subchannel a child creates is attributed to that child's role so
//! state changes can be routed back to it, and each child's balancer-state
//! updates are cached in its bridge so that only the authoritative child's
//! picker reaches the channel.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use crate::balancer::{
    ClientChannel, LbPolicy, LbState, Subchannel, SubchannelKey, SubchannelState,
};
use crate::lookaside::config::PolicySelection;
use crate::lookaside::endpoint_policy::EndpointPolicy;
use crate::resolver::Address;

/// Which child slot a resource belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub(crate) enum ChildRole {
    Endpoint,
    Fallback,
}

/// State shared between the event loop and the bridges it hands out:
/// subchannel ownership and the current authoritative selection.
#[derive(Default)]
pub(crate) struct RoutingState {
    pub(crate) owners: HashMap<SubchannelKey, ChildRole>,
    pub(crate) authoritative: Option<ChildRole>,
}

/// The non-owning back-reference a child holds to the channel.
///
/// Valid only while the child is open; closing the child invalidates the
/// bridge, detaches its subchannels from the routing table, and silences
/// any late updates.
pub(crate) struct ChildBridge {
    role: ChildRole,
    channel: Arc<dyn ClientChannel>,
    routing: Arc<Mutex<RoutingState>>,
    open: AtomicBool,
    created: Mutex<Vec<SubchannelKey>>,
    cached_state: Mutex<Option<LbState>>,
}

impl ChildBridge {
    pub(crate) fn new(
        role: ChildRole,
        channel: Arc<dyn ClientChannel>,
        routing: Arc<Mutex<RoutingState>>,
    ) -> Arc<Self> {
        Arc::new(Self {
            role,
            channel,
            routing,
            open: AtomicBool::new(true),
            created: Mutex::new(Vec::new()),
            cached_state: Mutex::new(None),
        })
    }

    /// Re-sends this child's most recent balancer state to the channel.
    /// Used when the child becomes authoritative.
    pub(crate) fn republish(&self) {
        let cached = self.cached_state.lock().unwrap().clone();
        if let Some(state) = cached {
            self.channel.update_balancer_state(state);
        }
    }

    pub(crate) fn close(&self) {
        self.open.store(false, Ordering::Release);
        let mut routing = self.routing.lock().unwrap();
        for key in self.created.lock().unwrap().drain(..) {
            routing.owners.remove(&key);
        }
    }
}

impl ClientChannel for ChildBridge {
    fn new_subchannel(&self, address: &Address) -> Arc<dyn Subchannel> {
        let subchannel = self.channel.new_subchannel(address);
        if self.open.load(Ordering::Acquire) {
            let key = SubchannelKey::of(&subchannel);
            self.routing.lock().unwrap().owners.insert(key, self.role);
            self.created.lock().unwrap().push(key);
        }
        subchannel
    }

    fn update_balancer_state(&self, state: LbState) {
        if !self.open.load(Ordering::Acquire) {
            return;
        }
        *self.cached_state.lock().unwrap() = Some(state.clone());
        let authoritative = self.routing.lock().unwrap().authoritative;
        if authoritative == Some(self.role) {
            self.channel.update_balancer_state(state);
        }
    }

    fn request_resolution(&self) {
        if self.open.load(Ordering::Acquire) {
            self.channel.request_resolution();
        }
    }

    fn target(&self) -> String {
        self.channel.target()
    }
}

/// The fallback slot: a leaf policy plus the spec it was built from.
pub(crate) struct FallbackChild {
    pub(crate) spec: PolicySelection,
    pub(crate) policy: Box<dyn LbPolicy>,
    pub(crate) bridge: Arc<ChildBridge>,
}

impl FallbackChild {
    pub(crate) fn close(&mut self) {
        self.policy.close();
        self.bridge.close();
    }

    pub(crate) fn subchannel_update(
        &mut self,
        subchannel: &Arc<dyn Subchannel>,
        state: &SubchannelState,
    ) {
        self.policy.subchannel_update(subchannel, state);
    }
}

/// The endpoint slot: the assignment-driven policy plus the child-policy
/// name in effect for it.
pub(crate) struct EndpointChild {
    pub(crate) policy_name: String,
    pub(crate) policy: Box<dyn EndpointPolicy>,
    pub(crate) bridge: Arc<ChildBridge>,
}

impl EndpointChild {
    pub(crate) fn close(&mut self) {
        self.policy.close();
        self.bridge.close();
    }
}

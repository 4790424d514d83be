//! The lookaside balancer: a policy that programs its children from a
//! remote service-discovery control plane.
//!
//! For the configured target it keeps one streaming session open to a
//! control-plane endpoint and forwards the endpoint assignments it receives
//! to an assignment-driven child policy. If the first assignment does not
//! arrive within a startup window, a fallback child driven by the
//! resolver's addresses takes over until the control plane speaks.
//!
//! Four asynchronous inputs feed the balancer: configuration updates from
//! the channel, address updates from the resolver, discovery events from
//! the control-plane session, and subchannel state changes from the
//! transport. Each input handler enqueues a tagged event and returns; a
//! single consumer task applies events to the state machine in order, so
//! state is never touched from outside it.

pub mod config;
pub mod endpoint_policy;

mod child;
#[cfg(test)]
pub(crate) mod test_utils;

use std::error::Error;
use std::mem;
use std::ops::ControlFlow;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::balancer::registry::GLOBAL_POLICY_REGISTRY;
use crate::balancer::{
    ClientChannel, FailingPicker, LbConfig, LbPolicy, LbPolicyBuilder, LbPolicyOptions, LbState,
    ParsedJsonConfig, Subchannel, SubchannelKey, SubchannelState,
};
use crate::discovery::transport::DiscoveryTransport;
use crate::discovery::{DiscoveryClient, DiscoveryEvent, EndpointAssignment};
use crate::error::Error as LookasideError;
use crate::load_report::LoadStore;
use crate::lookaside::child::{ChildBridge, ChildRole, EndpointChild, FallbackChild, RoutingState};
use crate::lookaside::config::{LookasideConfig, PolicySelection};
use crate::lookaside::endpoint_policy::{
    default_endpoint_policy_factory, EndpointPolicyFactory,
};
use crate::resolver::{Address, ResolverUpdate};
use crate::rt::{Runtime, TaskHandle};
use crate::ConnectivityState;

pub static POLICY_NAME: &str = "lookaside";

/// How long to wait for the first assignment before falling back.
pub const DEFAULT_STARTUP_WINDOW: Duration = Duration::from_secs(10);

/// Builds [`LookasideBalancer`] instances.
///
/// The discovery transport is required; the endpoint-child factory and the
/// startup window have production defaults and exist as parameters so tests
/// can substitute fakes and shorten the window.
pub struct LookasideBalancerBuilder {
    transport: Arc<dyn DiscoveryTransport>,
    endpoint_factory: EndpointPolicyFactory,
    startup_window: Duration,
}

impl LookasideBalancerBuilder {
    pub fn new(transport: Arc<dyn DiscoveryTransport>) -> Self {
        Self {
            transport,
            endpoint_factory: default_endpoint_policy_factory(),
            startup_window: DEFAULT_STARTUP_WINDOW,
        }
    }

    pub fn with_endpoint_policy_factory(mut self, factory: EndpointPolicyFactory) -> Self {
        self.endpoint_factory = factory;
        self
    }

    pub fn with_startup_window(mut self, window: Duration) -> Self {
        self.startup_window = window;
        self
    }

    /// Adds this builder to the global policy registry under
    /// [`POLICY_NAME`].
    pub fn register(self) {
        GLOBAL_POLICY_REGISTRY.add_builder(self);
    }
}

impl LbPolicyBuilder for LookasideBalancerBuilder {
    fn build(&self, channel: Arc<dyn ClientChannel>, options: LbPolicyOptions) -> Box<dyn LbPolicy> {
        Box::new(LookasideBalancer::new(
            channel,
            options.runtime,
            self.transport.clone(),
            self.endpoint_factory.clone(),
            self.startup_window,
        ))
    }

    fn name(&self) -> &'static str {
        POLICY_NAME
    }

    fn parse_config(
        &self,
        config: &ParsedJsonConfig,
    ) -> Result<Option<LbConfig>, Box<dyn Error + Send + Sync>> {
        let parsed = config::parse(config)?;
        Ok(Some(LbConfig::new(parsed)))
    }
}

// Inputs to the state machine, applied strictly in order by the consumer.
enum Event {
    Config {
        config: Arc<LookasideConfig>,
        addresses: Vec<Address>,
    },
    Addresses(Vec<Address>),
    Subchannel {
        subchannel: Arc<dyn Subchannel>,
        state: SubchannelState,
    },
    Discovery {
        session: u64,
        event: DiscoveryEvent,
    },
    FallbackElapsed,
    Close,
}

/// The balancer handle installed on a channel. All inputs are enqueued to
/// the consumer task; none of these methods block.
pub struct LookasideBalancer {
    events: mpsc::UnboundedSender<Event>,
    _task: Box<dyn TaskHandle>,
}

impl LookasideBalancer {
    pub fn new(
        channel: Arc<dyn ClientChannel>,
        runtime: Arc<dyn Runtime>,
        transport: Arc<dyn DiscoveryTransport>,
        endpoint_factory: EndpointPolicyFactory,
        startup_window: Duration,
    ) -> Self {
        let (events, mut queue) = mpsc::unbounded_channel();
        let mut inner = Inner {
            channel,
            runtime: runtime.clone(),
            transport,
            endpoint_factory,
            startup_window,
            events: events.clone(),
            config: None,
            endpoint_in_use: None,
            addresses: Vec::new(),
            session: None,
            generation: 0,
            have_assignment: false,
            latest_assignment: None,
            endpoint_child: None,
            fallback_child: None,
            fallback_spec: None,
            routing: Arc::new(Mutex::new(RoutingState::default())),
            timer: FallbackTimer::new(),
            load_store: Arc::new(LoadStore::new()),
        };
        let task = runtime.spawn(Box::pin(async move {
            while let Some(event) = queue.recv().await {
                if inner.apply(event).is_break() {
                    break;
                }
            }
        }));
        Self { events, _task: task }
    }
}

impl LbPolicy for LookasideBalancer {
    fn resolver_update(
        &mut self,
        update: ResolverUpdate,
        config: Option<&LbConfig>,
    ) -> Result<(), Box<dyn Error + Send + Sync>> {
        let event = match config {
            Some(config) => {
                let config = config
                    .convert_to::<LookasideConfig>()
                    .ok_or("received configuration of an unexpected type")?;
                Event::Config {
                    config,
                    addresses: update.addresses,
                }
            }
            None => Event::Addresses(update.addresses),
        };
        if self.events.send(event).is_err() {
            debug!("resolver update received after close; discarding");
        }
        Ok(())
    }

    fn subchannel_update(&mut self, subchannel: &Arc<dyn Subchannel>, state: &SubchannelState) {
        let sent = self.events.send(Event::Subchannel {
            subchannel: subchannel.clone(),
            state: state.clone(),
        });
        if sent.is_err() {
            debug!("subchannel update received after close; discarding");
        }
    }

    fn close(&mut self) {
        let _ = self.events.send(Event::Close);
    }
}

impl Drop for LookasideBalancer {
    fn drop(&mut self) {
        let _ = self.events.send(Event::Close);
    }
}

// An owned control-plane session: the client plus the task forwarding its
// events into the queue, tagged with this session's generation.
struct Session {
    client: DiscoveryClient,
    generation: u64,
    forward: Box<dyn TaskHandle>,
}

impl Session {
    fn close(self) {
        self.client.close();
        self.forward.abort();
    }
}

enum TimerState {
    Idle,
    Armed(Box<dyn TaskHandle>),
    Elapsed,
}

// The startup-window timer. Arming while armed is a no-op (no reset), and
// once elapsed it stays elapsed until an assignment disarms it: later
// configuration updates never restart a window that already ran out.
struct FallbackTimer {
    state: TimerState,
}

impl FallbackTimer {
    fn new() -> Self {
        Self {
            state: TimerState::Idle,
        }
    }

    fn arm(
        &mut self,
        runtime: &Arc<dyn Runtime>,
        window: Duration,
        events: mpsc::UnboundedSender<Event>,
    ) {
        if !matches!(self.state, TimerState::Idle) {
            return;
        }
        let rt = runtime.clone();
        let handle = runtime.spawn(Box::pin(async move {
            rt.sleep(window).await;
            let _ = events.send(Event::FallbackElapsed);
        }));
        self.state = TimerState::Armed(handle);
    }

    // Marks the timer elapsed; false means the firing was stale (the timer
    // had already been disarmed).
    fn record_elapsed(&mut self) -> bool {
        if matches!(self.state, TimerState::Armed(_)) {
            self.state = TimerState::Elapsed;
            return true;
        }
        matches!(self.state, TimerState::Elapsed)
    }

    fn disarm(&mut self) {
        if let TimerState::Armed(handle) = mem::replace(&mut self.state, TimerState::Idle) {
            handle.abort();
        }
    }

    fn has_elapsed(&self) -> bool {
        matches!(self.state, TimerState::Elapsed)
    }
}

// The state machine. Owned by the consumer task; every mutation happens
// there.
struct Inner {
    channel: Arc<dyn ClientChannel>,
    runtime: Arc<dyn Runtime>,
    transport: Arc<dyn DiscoveryTransport>,
    endpoint_factory: EndpointPolicyFactory,
    startup_window: Duration,
    events: mpsc::UnboundedSender<Event>,

    config: Option<Arc<LookasideConfig>>,
    endpoint_in_use: Option<String>,
    addresses: Vec<Address>,
    session: Option<Session>,
    generation: u64,
    have_assignment: bool,
    latest_assignment: Option<EndpointAssignment>,
    endpoint_child: Option<EndpointChild>,
    fallback_child: Option<FallbackChild>,
    // The fallback spec in effect, tracked even while no fallback child is
    // instantiated.
    fallback_spec: Option<PolicySelection>,
    routing: Arc<Mutex<RoutingState>>,
    timer: FallbackTimer,
    load_store: Arc<LoadStore>,
}

impl Inner {
    fn apply(&mut self, event: Event) -> ControlFlow<()> {
        match event {
            Event::Config { config, addresses } => self.handle_config(config, addresses),
            Event::Addresses(addresses) => self.handle_addresses(addresses),
            Event::Subchannel { subchannel, state } => self.handle_subchannel(subchannel, state),
            Event::Discovery { session, event } => self.handle_discovery(session, event),
            Event::FallbackElapsed => self.handle_fallback_elapsed(),
            Event::Close => {
                self.shutdown();
                return ControlFlow::Break(());
            }
        }
        ControlFlow::Continue(())
    }

    fn handle_config(&mut self, config: Arc<LookasideConfig>, addresses: Vec<Address>) {
        let (Some(child_spec), Some(fallback_spec)) = (
            config.child_policy.clone(),
            config.fallback_policy.clone(),
        ) else {
            warn!("configuration names no child or fallback policy; ignoring update");
            if self.routing.lock().unwrap().authoritative.is_none() {
                self.publish_failure("configuration names no usable policies");
            }
            return;
        };

        self.addresses = addresses;
        self.config = Some(config.clone());

        // A changed control-plane endpoint (or the first configuration)
        // replaces the session and opens a fresh startup window, unless a
        // window already ran out and fallback is holding.
        let endpoint = config
            .balancer_name
            .clone()
            .unwrap_or_else(|| self.channel.target());
        if self.endpoint_in_use.as_deref() != Some(endpoint.as_str()) {
            info!(endpoint = %endpoint, "starting control-plane session");
            self.restart_session(endpoint);
            self.have_assignment = false;
            let events = self.events.clone();
            self.timer.arm(&self.runtime, self.startup_window, events);
        }

        // Endpoint child: a changed policy name replaces the child (the new
        // one is built before the old one is closed); the same name only
        // forwards the opaque config.
        let same_endpoint_child = self
            .endpoint_child
            .as_ref()
            .is_some_and(|c| c.policy_name == child_spec.name);
        if same_endpoint_child {
            if let Some(c) = self.endpoint_child.as_mut() {
                c.policy.apply_policy(&child_spec.name, &child_spec.config);
            }
        } else {
            self.create_endpoint_child(child_spec);
        }

        // Fallback: only replace the instantiated child while fallback is
        // actually in effect; otherwise just track the spec.
        let in_fallback =
            self.routing.lock().unwrap().authoritative == Some(ChildRole::Fallback);
        let name_changed = self
            .fallback_spec
            .as_ref()
            .is_none_or(|s| s.name != fallback_spec.name);
        self.fallback_spec = Some(fallback_spec.clone());
        let mut just_built = false;
        if in_fallback && (name_changed || self.fallback_child.is_none()) {
            match self.build_fallback_child(&fallback_spec) {
                Ok(child) => {
                    let previous = self.fallback_child.replace(child);
                    if let Some(mut previous) = previous {
                        previous.close();
                    }
                    just_built = true;
                }
                Err(err) => {
                    warn!(error = %err, "failed to build fallback child");
                    self.report_unknown_child();
                }
            }
        } else if !name_changed {
            if let Some(child) = self.fallback_child.as_mut() {
                child.spec = fallback_spec;
            }
        }

        if !just_built {
            self.deliver_addresses_to_fallback();
        }
    }

    fn handle_addresses(&mut self, addresses: Vec<Address>) {
        self.addresses = addresses;
        self.deliver_addresses_to_fallback();
    }

    fn handle_subchannel(&mut self, subchannel: Arc<dyn Subchannel>, state: SubchannelState) {
        let owner = self
            .routing
            .lock()
            .unwrap()
            .owners
            .get(&SubchannelKey::of(&subchannel))
            .copied();
        match owner {
            Some(ChildRole::Endpoint) => {
                if let Some(child) = self.endpoint_child.as_mut() {
                    child.policy.subchannel_update(&subchannel, &state);
                }
            }
            Some(ChildRole::Fallback) => {
                if let Some(child) = self.fallback_child.as_mut() {
                    child.subchannel_update(&subchannel, &state);
                }
            }
            None => {
                debug!(%subchannel, "dropping state change for unknown subchannel");
            }
        }
    }

    fn handle_discovery(&mut self, session: u64, event: DiscoveryEvent) {
        if self.session.as_ref().map(|s| s.generation) != Some(session) {
            debug!("dropping event from a superseded control-plane session");
            return;
        }
        match event {
            DiscoveryEvent::Assignment(assignment) => self.handle_assignment(assignment),
            DiscoveryEvent::StreamError(err) => {
                warn!(error = %err, "control-plane stream failure");
                self.load_store.record_stream_failure();
                self.after_stream_failure();
            }
            DiscoveryEvent::StreamClosed => {
                debug!("control-plane stream closed");
                self.after_stream_failure();
            }
        }
    }

    fn handle_assignment(&mut self, assignment: EndpointAssignment) {
        self.load_store.record_assignment();
        self.have_assignment = true;
        self.timer.disarm();
        self.latest_assignment = Some(assignment);

        if self.endpoint_child.is_none() {
            // The channel guarantees a configuration precedes any
            // discovery traffic, so the spec is available here.
            let Some(spec) = self.config.as_ref().and_then(|c| c.child_policy.clone()) else {
                warn!("assignment received before any configuration; dropping");
                return;
            };
            self.create_endpoint_child(spec);
        } else if let Some(child) = self.endpoint_child.as_mut() {
            let assignment = self.latest_assignment.as_ref().unwrap();
            child.policy.apply_assignment(assignment);
        }

        self.set_authoritative(ChildRole::Endpoint);
    }

    // A broken stream never evicts a working endpoint child; the client
    // reconnects on its own. Before the first assignment, the startup
    // window decides, and if it already ran out fallback must be holding.
    fn after_stream_failure(&mut self) {
        if self.have_assignment {
            return;
        }
        if self.timer.has_elapsed() {
            self.enter_fallback();
        }
    }

    fn handle_fallback_elapsed(&mut self) {
        if self.have_assignment {
            return;
        }
        if !self.timer.record_elapsed() {
            return;
        }
        info!(
            window = ?self.startup_window,
            "no assignment within the startup window; entering fallback"
        );
        self.enter_fallback();
    }

    fn shutdown(&mut self) {
        if let Some(session) = self.session.take() {
            session.close();
        }
        self.timer.disarm();
        if let Some(mut child) = self.endpoint_child.take() {
            child.close();
        }
        if let Some(mut child) = self.fallback_child.take() {
            child.close();
        }
    }

    fn restart_session(&mut self, endpoint: String) {
        if let Some(session) = self.session.take() {
            session.close();
        }
        self.generation += 1;
        let generation = self.generation;
        let (tx, mut rx) = mpsc::unbounded_channel();
        let client = DiscoveryClient::start(
            self.transport.clone(),
            endpoint.clone(),
            self.runtime.clone(),
            tx,
        );
        let events = self.events.clone();
        let forward = self.runtime.spawn(Box::pin(async move {
            while let Some(event) = rx.recv().await {
                if events
                    .send(Event::Discovery {
                        session: generation,
                        event,
                    })
                    .is_err()
                {
                    break;
                }
            }
        }));
        self.session = Some(Session {
            client,
            generation,
            forward,
        });
        self.endpoint_in_use = Some(endpoint);
    }

    fn create_endpoint_child(&mut self, spec: PolicySelection) {
        let bridge = ChildBridge::new(
            ChildRole::Endpoint,
            self.channel.clone(),
            self.routing.clone(),
        );
        let channel: Arc<dyn ClientChannel> = bridge.clone();
        let mut policy =
            (self.endpoint_factory)(channel, self.load_store.clone(), self.runtime.clone());
        policy.apply_policy(&spec.name, &spec.config);
        // A replacement child would otherwise sit empty until the control
        // plane re-sends; replay the assignment already in hand.
        let mut replayed = false;
        if self.have_assignment {
            if let Some(assignment) = &self.latest_assignment {
                policy.apply_assignment(assignment);
                replayed = true;
            }
        }
        let previous = self.endpoint_child.replace(EndpointChild {
            policy_name: spec.name,
            policy,
            bridge,
        });
        if let Some(mut previous) = previous {
            previous.close();
        }
        // Without an assignment the fresh child cannot hold endpoint
        // authority; queue picks until one arrives.
        if !replayed {
            let demoted = {
                let mut routing = self.routing.lock().unwrap();
                if routing.authoritative == Some(ChildRole::Endpoint) {
                    routing.authoritative = None;
                    true
                } else {
                    false
                }
            };
            if demoted {
                self.channel.update_balancer_state(LbState::initial());
            }
        }
    }

    fn build_fallback_child(
        &mut self,
        spec: &PolicySelection,
    ) -> Result<FallbackChild, LookasideError> {
        let builder = GLOBAL_POLICY_REGISTRY
            .get_policy(&spec.name)
            .ok_or_else(|| LookasideError::UnknownChildName(spec.name.clone()))?;
        let bridge = ChildBridge::new(
            ChildRole::Fallback,
            self.channel.clone(),
            self.routing.clone(),
        );
        let channel: Arc<dyn ClientChannel> = bridge.clone();
        let mut policy = builder.build(
            channel,
            LbPolicyOptions {
                runtime: self.runtime.clone(),
            },
        );
        let config = builder
            .parse_config(&ParsedJsonConfig::from_value(spec.config.clone()))
            .unwrap_or(None);
        // The address list may legitimately be empty here; the child is
        // refreshed as updates arrive.
        if let Err(err) = policy.resolver_update(
            ResolverUpdate::from_addresses(self.addresses.clone()),
            config.as_ref(),
        ) {
            debug!(error = %err, "fallback child rejected initial address list");
        }
        Ok(FallbackChild {
            spec: spec.clone(),
            policy,
            bridge,
        })
    }

    fn deliver_addresses_to_fallback(&mut self) {
        let Some(child) = self.fallback_child.as_mut() else {
            return;
        };
        let config = GLOBAL_POLICY_REGISTRY
            .get_policy(&child.spec.name)
            .and_then(|b| {
                b.parse_config(&ParsedJsonConfig::from_value(child.spec.config.clone()))
                    .unwrap_or(None)
            });
        if let Err(err) = child.policy.resolver_update(
            ResolverUpdate::from_addresses(self.addresses.clone()),
            config.as_ref(),
        ) {
            debug!(error = %err, "fallback child rejected address update");
        }
    }

    fn enter_fallback(&mut self) {
        let already_in_fallback =
            self.routing.lock().unwrap().authoritative == Some(ChildRole::Fallback);
        if already_in_fallback && self.fallback_child.is_some() {
            return;
        }
        if self.fallback_child.is_none() {
            let Some(spec) = self.fallback_spec.clone() else {
                warn!("fallback required but no fallback policy is configured");
                self.report_unknown_child();
                return;
            };
            match self.build_fallback_child(&spec) {
                Ok(child) => self.fallback_child = Some(child),
                Err(err) => {
                    warn!(error = %err, "failed to build fallback child");
                    self.report_unknown_child();
                    return;
                }
            }
        } else {
            // Re-entering fallback with a child retained from an earlier
            // stint: refresh it with the current address list.
            self.deliver_addresses_to_fallback();
        }
        self.set_authoritative(ChildRole::Fallback);
    }

    fn set_authoritative(&mut self, role: ChildRole) {
        {
            let mut routing = self.routing.lock().unwrap();
            if routing.authoritative == Some(role) {
                return;
            }
            routing.authoritative = Some(role);
        }
        info!(?role, "authoritative child changed");
        let bridge = match role {
            ChildRole::Endpoint => self.endpoint_child.as_ref().map(|c| c.bridge.clone()),
            ChildRole::Fallback => self.fallback_child.as_ref().map(|c| c.bridge.clone()),
        };
        if let Some(bridge) = bridge {
            bridge.republish();
        }
    }

    // A failed child instantiation surfaces as transient failure on the
    // channel; internal state is left as it was. The failing picker is only
    // published while no child is authoritative, so a working picker is
    // never displaced by it.
    fn report_unknown_child(&self) {
        if self.routing.lock().unwrap().authoritative.is_some() {
            return;
        }
        self.publish_failure("no usable child policy");
    }

    fn publish_failure(&self, error: &str) {
        self.channel.update_balancer_state(LbState {
            connectivity_state: ConnectivityState::TransientFailure,
            picker: Arc::new(FailingPicker {
                error: error.to_string(),
            }),
        });
    }
}

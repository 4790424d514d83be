//! Fakes shared by the balancer tests: a recording channel, leaf policies
//! that tag their address lists with a sentinel, a recording endpoint-child
//! factory, and scriptable discovery transports.

use std::fmt::{Display, Formatter};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use tokio::sync::mpsc;

use crate::balancer::registry::GLOBAL_POLICY_REGISTRY;
use crate::balancer::{
    ClientChannel, LbConfig, LbPolicy, LbPolicyBuilder, LbPolicyOptions, LbState, Pick, PickResult,
    Picker, QueuingPicker, Request, Subchannel, SubchannelState,
};
use crate::discovery::transport::{DiscoveryStream, DiscoveryTransport, TransportFuture};
use crate::discovery::{
    EndpointAssignment, EndpointHealth, LbEndpoint, Locality, LocalityEndpoints,
};
use crate::error::Error;
use crate::load_report::LoadStore;
use crate::lookaside::endpoint_policy::{EndpointPolicy, EndpointPolicyFactory};
use crate::resolver::{Address, ResolverUpdate};
use crate::rt::Runtime;
use crate::ConnectivityState;

// ---------------------------------------------------------------------------
// Channel fakes

/// Everything a policy under test does to its channel, as observable
/// events.
pub(crate) enum TestEvent {
    NewSubchannel(Arc<dyn Subchannel>),
    UpdatePicker(LbState),
    RequestResolution,
    Connect(Address),
}

impl Display for TestEvent {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::NewSubchannel(sc) => write!(f, "NewSubchannel({})", sc.address()),
            Self::UpdatePicker(state) => write!(f, "UpdatePicker({})", state.connectivity_state),
            Self::RequestResolution => write!(f, "RequestResolution"),
            Self::Connect(addr) => write!(f, "Connect({addr})"),
        }
    }
}

pub(crate) struct TestSubchannel {
    address: Address,
    events: mpsc::UnboundedSender<TestEvent>,
}

impl Subchannel for TestSubchannel {
    fn address(&self) -> Address {
        self.address.clone()
    }

    fn connect(&self) {
        let _ = self.events.send(TestEvent::Connect(self.address.clone()));
    }
}

impl Display for TestSubchannel {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "Subchannel({})", self.address)
    }
}

/// A channel that records the calls made against it.
pub(crate) struct TestChannel {
    events: mpsc::UnboundedSender<TestEvent>,
    target: String,
}

impl TestChannel {
    pub(crate) fn new(events: mpsc::UnboundedSender<TestEvent>, target: &str) -> Self {
        Self {
            events,
            target: target.to_string(),
        }
    }
}

impl ClientChannel for TestChannel {
    fn new_subchannel(&self, address: &Address) -> Arc<dyn Subchannel> {
        let subchannel: Arc<dyn Subchannel> = Arc::new(TestSubchannel {
            address: address.clone(),
            events: self.events.clone(),
        });
        let _ = self.events.send(TestEvent::NewSubchannel(subchannel.clone()));
        subchannel
    }

    fn update_balancer_state(&self, state: LbState) {
        let _ = self.events.send(TestEvent::UpdatePicker(state));
    }

    fn request_resolution(&self) {
        let _ = self.events.send(TestEvent::RequestResolution);
    }

    fn target(&self) -> String {
        self.target.clone()
    }
}

// ---------------------------------------------------------------------------
// Sentinel leaf policies

/// What a sentinel policy saw, keyed by the policy's registered name.
#[derive(Debug)]
pub(crate) enum LeafEvent {
    Addresses {
        policy: &'static str,
        addresses: Vec<String>,
    },
    SubchannelUpdate {
        policy: &'static str,
        address: Address,
        state: ConnectivityState,
    },
    Closed {
        policy: &'static str,
    },
}

/// Registers a leaf policy that, on every address update, creates one
/// subchannel per address plus one for its sentinel address. Subchannel
/// state changes and closure are reported on `events`.
pub(crate) fn reg_sentinel_policy(
    name: &'static str,
    sentinel: &'static str,
    events: mpsc::UnboundedSender<LeafEvent>,
) {
    GLOBAL_POLICY_REGISTRY.add_builder(SentinelPolicyBuilder {
        name,
        sentinel,
        events,
    });
}

struct SentinelPolicyBuilder {
    name: &'static str,
    sentinel: &'static str,
    events: mpsc::UnboundedSender<LeafEvent>,
}

impl LbPolicyBuilder for SentinelPolicyBuilder {
    fn build(&self, channel: Arc<dyn ClientChannel>, _options: LbPolicyOptions) -> Box<dyn LbPolicy> {
        Box::new(SentinelPolicy {
            name: self.name,
            sentinel: Address::new(self.sentinel),
            channel,
            events: self.events.clone(),
        })
    }

    fn name(&self) -> &'static str {
        self.name
    }
}

struct SentinelPolicy {
    name: &'static str,
    sentinel: Address,
    channel: Arc<dyn ClientChannel>,
    events: mpsc::UnboundedSender<LeafEvent>,
}

impl LbPolicy for SentinelPolicy {
    fn resolver_update(
        &mut self,
        update: ResolverUpdate,
        _config: Option<&LbConfig>,
    ) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
        let mut addresses = update.addresses;
        addresses.push(self.sentinel.clone());
        let _ = self.events.send(LeafEvent::Addresses {
            policy: self.name,
            addresses: addresses.iter().map(|a| a.address.clone()).collect(),
        });
        for address in &addresses {
            self.channel.new_subchannel(address);
        }
        self.channel.update_balancer_state(LbState {
            connectivity_state: ConnectivityState::Connecting,
            picker: Arc::new(QueuingPicker),
        });
        Ok(())
    }

    fn subchannel_update(&mut self, subchannel: &Arc<dyn Subchannel>, state: &SubchannelState) {
        let _ = self.events.send(LeafEvent::SubchannelUpdate {
            policy: self.name,
            address: subchannel.address(),
            state: state.connectivity_state,
        });
        if state.connectivity_state == ConnectivityState::Ready {
            self.channel.update_balancer_state(LbState {
                connectivity_state: ConnectivityState::Ready,
                picker: Arc::new(StaticPicker {
                    subchannel: subchannel.clone(),
                }),
            });
        }
    }

    fn close(&mut self) {
        let _ = self.events.send(LeafEvent::Closed { policy: self.name });
    }
}

struct StaticPicker {
    subchannel: Arc<dyn Subchannel>,
}

impl Picker for StaticPicker {
    fn pick(&self, _request: &Request) -> PickResult {
        PickResult::Pick(Pick {
            subchannel: self.subchannel.clone(),
        })
    }
}

// ---------------------------------------------------------------------------
// Endpoint-child fakes

/// What a recording endpoint child saw. `instance` is the creation ordinal
/// of the child the event came from.
#[derive(Debug)]
pub(crate) enum EndpointEvent {
    Assignment {
        instance: usize,
        addresses: Vec<String>,
    },
    Policy {
        instance: usize,
        name: String,
    },
    SubchannelUpdate {
        instance: usize,
        address: Address,
        state: ConnectivityState,
    },
    Closed {
        instance: usize,
    },
}

/// An endpoint-child factory producing recording fakes.
///
/// When `create_subchannels` is set, each applied assignment creates one
/// subchannel for its first address so ownership routing can be exercised.
/// The returned counter reports how many children have been created.
pub(crate) fn recording_endpoint_factory(
    events: mpsc::UnboundedSender<EndpointEvent>,
    create_subchannels: bool,
) -> (EndpointPolicyFactory, Arc<AtomicUsize>) {
    let instances = Arc::new(AtomicUsize::new(0));
    let counter = instances.clone();
    let factory: EndpointPolicyFactory = Arc::new(
        move |channel: Arc<dyn ClientChannel>, _store: Arc<LoadStore>, _rt: Arc<dyn Runtime>| {
            let instance = counter.fetch_add(1, Ordering::SeqCst);
            Box::new(RecordingEndpointPolicy {
                instance,
                channel,
                events: events.clone(),
                create_subchannels,
            }) as Box<dyn EndpointPolicy>
        },
    );
    (factory, instances)
}

struct RecordingEndpointPolicy {
    instance: usize,
    channel: Arc<dyn ClientChannel>,
    events: mpsc::UnboundedSender<EndpointEvent>,
    create_subchannels: bool,
}

impl EndpointPolicy for RecordingEndpointPolicy {
    fn apply_assignment(&mut self, assignment: &EndpointAssignment) {
        let addresses: Vec<String> = assignment
            .localities
            .iter()
            .flat_map(|l| l.endpoints.iter())
            .map(|e| e.address.address.clone())
            .collect();
        let _ = self.events.send(EndpointEvent::Assignment {
            instance: self.instance,
            addresses: addresses.clone(),
        });
        if self.create_subchannels {
            if let Some(first) = addresses.first() {
                self.channel.new_subchannel(&Address::new(first.clone()));
            }
        }
    }

    fn apply_policy(&mut self, name: &str, _config: &serde_json::Value) {
        let _ = self.events.send(EndpointEvent::Policy {
            instance: self.instance,
            name: name.to_string(),
        });
    }

    fn subchannel_update(&mut self, subchannel: &Arc<dyn Subchannel>, state: &SubchannelState) {
        let _ = self.events.send(EndpointEvent::SubchannelUpdate {
            instance: self.instance,
            address: subchannel.address(),
            state: state.connectivity_state,
        });
    }

    fn close(&mut self) {
        let _ = self.events.send(EndpointEvent::Closed {
            instance: self.instance,
        });
    }
}

// ---------------------------------------------------------------------------
// Transport fakes

/// A transport whose every connection attempt is refused, simulating an
/// absent control plane.
pub(crate) struct RefusingTransport;

impl DiscoveryTransport for RefusingTransport {
    fn connect(
        &self,
        _endpoint: &str,
    ) -> TransportFuture<'_, Result<Box<dyn DiscoveryStream>, Error>> {
        Box::pin(async { Err(Error::Connection("connection refused".to_string())) })
    }
}

/// A transport handing each established session to the test, which feeds it
/// assignments or errors. Tracks how many sessions are live at once.
pub(crate) struct TestTransport {
    sessions: mpsc::UnboundedSender<TestSession>,
    pub(crate) active: Arc<AtomicUsize>,
    pub(crate) max_active: Arc<AtomicUsize>,
}

impl TestTransport {
    pub(crate) fn new() -> (Self, mpsc::UnboundedReceiver<TestSession>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (
            Self {
                sessions: tx,
                active: Arc::new(AtomicUsize::new(0)),
                max_active: Arc::new(AtomicUsize::new(0)),
            },
            rx,
        )
    }
}

/// The test's handle to one established session.
pub(crate) struct TestSession {
    pub(crate) endpoint: String,
    tx: mpsc::UnboundedSender<Result<EndpointAssignment, Error>>,
}

impl TestSession {
    pub(crate) fn send(&self, item: Result<EndpointAssignment, Error>) {
        let _ = self.tx.send(item);
    }
}

struct ActiveGuard {
    active: Arc<AtomicUsize>,
}

impl ActiveGuard {
    fn new(active: Arc<AtomicUsize>, max_active: &AtomicUsize) -> Self {
        let now = active.fetch_add(1, Ordering::SeqCst) + 1;
        max_active.fetch_max(now, Ordering::SeqCst);
        Self { active }
    }
}

impl Drop for ActiveGuard {
    fn drop(&mut self) {
        self.active.fetch_sub(1, Ordering::SeqCst);
    }
}

struct TestStream {
    rx: mpsc::UnboundedReceiver<Result<EndpointAssignment, Error>>,
    _guard: ActiveGuard,
}

impl DiscoveryStream for TestStream {
    fn recv(&mut self) -> TransportFuture<'_, Result<Option<EndpointAssignment>, Error>> {
        Box::pin(async move {
            match self.rx.recv().await {
                Some(Ok(assignment)) => Ok(Some(assignment)),
                Some(Err(err)) => Err(err),
                None => Ok(None),
            }
        })
    }
}

impl DiscoveryTransport for TestTransport {
    fn connect(
        &self,
        endpoint: &str,
    ) -> TransportFuture<'_, Result<Box<dyn DiscoveryStream>, Error>> {
        let endpoint = endpoint.to_string();
        let sessions = self.sessions.clone();
        let active = self.active.clone();
        let max_active = self.max_active.clone();
        Box::pin(async move {
            let (tx, rx) = mpsc::unbounded_channel();
            let guard = ActiveGuard::new(active, &max_active);
            let _ = sessions.send(TestSession { endpoint, tx });
            Ok(Box::new(TestStream { rx, _guard: guard }) as Box<dyn DiscoveryStream>)
        })
    }
}

/// One single-locality assignment over the given addresses, all healthy.
pub(crate) fn test_assignment(addresses: &[&str]) -> EndpointAssignment {
    EndpointAssignment {
        cluster_name: "test-cluster".to_string(),
        localities: vec![LocalityEndpoints {
            locality: Locality {
                region: "test-region".to_string(),
                zone: "test-zone".to_string(),
                sub_zone: String::new(),
            },
            lb_weight: 100,
            priority: 0,
            endpoints: addresses
                .iter()
                .map(|a| LbEndpoint {
                    address: Address::new(*a),
                    health: EndpointHealth::Healthy,
                    weight: 1,
                })
                .collect(),
        }],
    }
}

//! The endpoint child: the policy driven by control-plane assignments.
//!
//! The balancer addresses it through [`EndpointPolicy`] and constructs it
//! through an injectable factory, so tests can substitute a fake. The
//! default implementation flattens each assignment into an address list and
//! delegates picking to a registered leaf policy.

use std::sync::Arc;

use tracing::warn;

use crate::balancer::registry::GLOBAL_POLICY_REGISTRY;
use crate::balancer::{
    ClientChannel, FailingPicker, LbConfig, LbPolicy, LbPolicyOptions, LbState, ParsedJsonConfig,
    Subchannel, SubchannelState,
};
use crate::discovery::{EndpointAssignment, EndpointHealth};
use crate::load_report::LoadStore;
use crate::resolver::{Address, ResolverUpdate};
use crate::rt::Runtime;
use crate::ConnectivityState;

/// The surface the balancer drives the endpoint child through.
pub trait EndpointPolicy: Send {
    /// Delivers a new endpoint assignment, replacing the previous one.
    fn apply_assignment(&mut self, assignment: &EndpointAssignment);

    /// Selects or reconfigures the policy used for the assignment's
    /// endpoints.
    fn apply_policy(&mut self, name: &str, config: &serde_json::Value);

    /// Delivers a state change for a subchannel this child created.
    fn subchannel_update(&mut self, subchannel: &Arc<dyn Subchannel>, state: &SubchannelState);

    /// Terminates the child and releases its subchannels.
    fn close(&mut self);
}

/// Constructs endpoint children. The channel handed in is the child's
/// bridge; everything the child creates through it is attributed to it.
pub type EndpointPolicyFactory = Arc<
    dyn Fn(Arc<dyn ClientChannel>, Arc<LoadStore>, Arc<dyn Runtime>) -> Box<dyn EndpointPolicy>
        + Send
        + Sync,
>;

/// The production factory.
pub fn default_endpoint_policy_factory() -> EndpointPolicyFactory {
    Arc::new(|channel, load_store, runtime| {
        Box::new(LocalityPolicy::new(channel, load_store, runtime))
    })
}

/// Flattens assignments into address lists, ordered by locality weight, and
/// drives a leaf policy from the registry with them.
pub struct LocalityPolicy {
    channel: Arc<dyn ClientChannel>,
    load_store: Arc<LoadStore>,
    runtime: Arc<dyn Runtime>,
    leaf: Option<Box<dyn LbPolicy>>,
    leaf_name: String,
    leaf_config: Option<LbConfig>,
    latest_addresses: Option<Vec<Address>>,
}

impl LocalityPolicy {
    pub fn new(
        channel: Arc<dyn ClientChannel>,
        load_store: Arc<LoadStore>,
        runtime: Arc<dyn Runtime>,
    ) -> Self {
        Self {
            channel,
            load_store,
            runtime,
            leaf: None,
            leaf_name: "round_robin".to_string(),
            leaf_config: None,
            latest_addresses: None,
        }
    }

    // Usable endpoints in locality-weight order, each address tagged with
    // the locality it came from. Unhealthy and draining endpoints are
    // excluded; locality order is by descending weight with ties kept
    // stable.
    fn flatten(assignment: &EndpointAssignment) -> Vec<Address> {
        let mut localities: Vec<_> = assignment.localities.iter().collect();
        localities.sort_by(|a, b| b.lb_weight.cmp(&a.lb_weight));
        let mut addresses = Vec::new();
        for locality in localities {
            let tag = format!(
                "{}/{}/{}",
                locality.locality.region, locality.locality.zone, locality.locality.sub_zone
            );
            for endpoint in &locality.endpoints {
                if !matches!(
                    endpoint.health,
                    EndpointHealth::Healthy | EndpointHealth::Unknown
                ) {
                    continue;
                }
                let mut address = endpoint.address.clone();
                address.attributes.set("locality", tag.clone());
                addresses.push(address);
            }
        }
        addresses
    }

    fn ensure_leaf(&mut self) -> bool {
        if self.leaf.is_some() {
            return true;
        }
        let Some(builder) = GLOBAL_POLICY_REGISTRY.get_policy(&self.leaf_name) else {
            warn!(policy = %self.leaf_name, "endpoint policy not registered");
            self.channel.update_balancer_state(LbState {
                connectivity_state: ConnectivityState::TransientFailure,
                picker: Arc::new(FailingPicker {
                    error: format!("no balancer registered under {:?}", self.leaf_name),
                }),
            });
            return false;
        };
        self.leaf = Some(builder.build(
            self.channel.clone(),
            LbPolicyOptions {
                runtime: self.runtime.clone(),
            },
        ));
        true
    }

    fn deliver_addresses(&mut self) {
        let Some(addresses) = self.latest_addresses.clone() else {
            return;
        };
        if !self.ensure_leaf() {
            return;
        }
        let config = self.leaf_config.clone();
        if let Some(leaf) = &mut self.leaf {
            if let Err(err) =
                leaf.resolver_update(ResolverUpdate::from_addresses(addresses), config.as_ref())
            {
                warn!(error = %err, "endpoint leaf policy rejected address update");
            }
        }
    }
}

impl EndpointPolicy for LocalityPolicy {
    fn apply_assignment(&mut self, assignment: &EndpointAssignment) {
        let addresses = Self::flatten(assignment);
        if addresses.is_empty() {
            self.load_store.record_drop("no_healthy_endpoints");
        }
        self.latest_addresses = Some(addresses);
        self.deliver_addresses();
    }

    fn apply_policy(&mut self, name: &str, config: &serde_json::Value) {
        let parsed = GLOBAL_POLICY_REGISTRY.get_policy(name).and_then(|builder| {
            builder
                .parse_config(&ParsedJsonConfig::from_value(config.clone()))
                .unwrap_or_default()
        });
        if name != self.leaf_name {
            if let Some(mut old) = self.leaf.take() {
                old.close();
            }
            self.leaf_name = name.to_string();
            self.leaf_config = parsed;
            self.deliver_addresses();
        } else {
            self.leaf_config = parsed;
        }
    }

    fn subchannel_update(&mut self, subchannel: &Arc<dyn Subchannel>, state: &SubchannelState) {
        if let Some(leaf) = &mut self.leaf {
            leaf.subchannel_update(subchannel, state);
        }
    }

    fn close(&mut self) {
        if let Some(mut leaf) = self.leaf.take() {
            leaf.close();
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::balancer::{pick_first, round_robin};
    use crate::discovery::{LbEndpoint, Locality, LocalityEndpoints};
    use crate::lookaside::test_utils::{TestChannel, TestEvent};
    use crate::rt::default_runtime;
    use tokio::sync::mpsc;

    fn assignment_with_weights() -> EndpointAssignment {
        EndpointAssignment {
            cluster_name: "test-cluster".to_string(),
            localities: vec![
                LocalityEndpoints {
                    locality: Locality {
                        region: "us-east1".to_string(),
                        zone: "b".to_string(),
                        sub_zone: String::new(),
                    },
                    lb_weight: 10,
                    priority: 0,
                    endpoints: vec![LbEndpoint {
                        address: Address::new("10.0.0.1:80"),
                        health: EndpointHealth::Healthy,
                        weight: 1,
                    }],
                },
                LocalityEndpoints {
                    locality: Locality {
                        region: "us-west1".to_string(),
                        zone: "a".to_string(),
                        sub_zone: String::new(),
                    },
                    lb_weight: 90,
                    priority: 0,
                    endpoints: vec![
                        LbEndpoint {
                            address: Address::new("10.0.1.1:80"),
                            health: EndpointHealth::Unknown,
                            weight: 1,
                        },
                        LbEndpoint {
                            address: Address::new("10.0.1.2:80"),
                            health: EndpointHealth::Unhealthy,
                            weight: 1,
                        },
                    ],
                },
            ],
        }
    }

    #[tokio::test]
    async fn flattens_healthy_endpoints_by_locality_weight() {
        round_robin::reg();
        let (tx, mut rx) = mpsc::unbounded_channel();
        let channel = Arc::new(TestChannel::new(tx, "test.service"));
        let mut policy =
            LocalityPolicy::new(channel, Arc::new(LoadStore::new()), default_runtime());

        policy.apply_assignment(&assignment_with_weights());

        // The heavier locality comes first; the unhealthy endpoint is
        // filtered out entirely, and every address carries its locality.
        let mut created = Vec::new();
        while let Ok(event) = rx.try_recv() {
            if let TestEvent::NewSubchannel(sc) = event {
                created.push(sc.address());
            }
        }
        let names: Vec<_> = created.iter().map(|a| a.address.as_str()).collect();
        assert_eq!(names, vec!["10.0.1.1:80", "10.0.0.1:80"]);
        assert_eq!(created[0].attributes.get("locality"), Some("us-west1/a/"));
        assert_eq!(created[1].attributes.get("locality"), Some("us-east1/b/"));
    }

    #[tokio::test]
    async fn switching_leaf_policy_redelivers_addresses() {
        round_robin::reg();
        pick_first::reg();
        let (tx, mut rx) = mpsc::unbounded_channel();
        let channel = Arc::new(TestChannel::new(tx, "test.service"));
        let mut policy =
            LocalityPolicy::new(channel, Arc::new(LoadStore::new()), default_runtime());

        policy.apply_assignment(&assignment_with_weights());
        while rx.try_recv().is_ok() {}

        policy.apply_policy("pick_first", &serde_json::json!({}));
        let mut created = 0;
        while let Ok(event) = rx.try_recv() {
            if matches!(event, TestEvent::NewSubchannel(_)) {
                created += 1;
            }
        }
        assert_eq!(created, 2);
    }
}

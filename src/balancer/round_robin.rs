//! The `round_robin` policy: connect to every address and rotate picks over
//! the Ready subchannels.

use std::error::Error;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Once};

use tracing::debug;

use crate::balancer::registry::GLOBAL_POLICY_REGISTRY;
use crate::balancer::{
    ClientChannel, FailingPicker, LbConfig, LbPolicy, LbPolicyBuilder, LbPolicyOptions, LbState,
    Pick, PickResult, Picker, QueuingPicker, Request, Subchannel, SubchannelState,
    TrackedSubchannel,
};
use crate::resolver::ResolverUpdate;
use crate::ConnectivityState;

pub static POLICY_NAME: &str = "round_robin";

/// Registers the policy in the global registry.
pub fn reg() {
    static REGISTER_ONCE: Once = Once::new();
    REGISTER_ONCE.call_once(|| {
        GLOBAL_POLICY_REGISTRY.add_builder(Builder);
    });
}

struct Builder;

impl LbPolicyBuilder for Builder {
    fn build(&self, channel: Arc<dyn ClientChannel>, _options: LbPolicyOptions) -> Box<dyn LbPolicy> {
        Box::new(RoundRobinPolicy {
            channel,
            subchannels: Vec::new(),
            published_state: None,
        })
    }

    fn name(&self) -> &'static str {
        POLICY_NAME
    }
}

struct RoundRobinPolicy {
    channel: Arc<dyn ClientChannel>,
    subchannels: Vec<TrackedSubchannel>,
    published_state: Option<ConnectivityState>,
}

impl LbPolicy for RoundRobinPolicy {
    fn resolver_update(
        &mut self,
        update: ResolverUpdate,
        _config: Option<&LbConfig>,
    ) -> Result<(), Box<dyn Error + Send + Sync>> {
        if update.addresses.is_empty() {
            self.subchannels.clear();
            self.publish(
                ConnectivityState::TransientFailure,
                Arc::new(FailingPicker {
                    error: "received empty address list from the name resolver".to_string(),
                }),
            );
            self.channel.request_resolution();
            return Err("received empty address list from the name resolver".into());
        }

        self.subchannels = update
            .addresses
            .iter()
            .map(|a| TrackedSubchannel::new(self.channel.new_subchannel(a)))
            .collect();
        for tracked in &mut self.subchannels {
            tracked.subchannel.connect();
            tracked.state = ConnectivityState::Connecting;
        }
        self.published_state = None;
        self.refresh_picker();
        Ok(())
    }

    fn subchannel_update(&mut self, subchannel: &Arc<dyn Subchannel>, state: &SubchannelState) {
        let Some(tracked) = self.subchannels.iter_mut().find(|t| t.is(subchannel)) else {
            debug!(%subchannel, "ignoring update for unknown subchannel");
            return;
        };
        tracked.state = state.connectivity_state;
        if state.connectivity_state == ConnectivityState::Idle {
            tracked.subchannel.connect();
        }
        self.refresh_picker();
    }

    fn close(&mut self) {
        self.subchannels.clear();
    }
}

impl RoundRobinPolicy {
    // Ready wins, then Connecting, then Idle; TransientFailure only when no
    // subchannel is in any healthier state.
    fn aggregate_state(&self) -> ConnectivityState {
        let mut connecting = false;
        let mut idle = false;
        for tracked in &self.subchannels {
            match tracked.state {
                ConnectivityState::Ready => return ConnectivityState::Ready,
                ConnectivityState::Connecting => connecting = true,
                ConnectivityState::Idle => idle = true,
                ConnectivityState::TransientFailure => {}
            }
        }
        if connecting {
            ConnectivityState::Connecting
        } else if idle {
            ConnectivityState::Idle
        } else {
            ConnectivityState::TransientFailure
        }
    }

    fn refresh_picker(&mut self) {
        let state = self.aggregate_state();
        match state {
            ConnectivityState::Ready => {
                let ready: Vec<_> = self
                    .subchannels
                    .iter()
                    .filter(|t| t.state == ConnectivityState::Ready)
                    .map(|t| t.subchannel.clone())
                    .collect();
                self.published_state = Some(state);
                self.channel.update_balancer_state(LbState {
                    connectivity_state: state,
                    picker: Arc::new(RoundRobinPicker {
                        subchannels: ready,
                        next: AtomicUsize::new(0),
                    }),
                });
            }
            ConnectivityState::TransientFailure => {
                if self.published_state != Some(state) {
                    self.publish(
                        state,
                        Arc::new(FailingPicker {
                            error: "all connection attempts failed".to_string(),
                        }),
                    );
                    self.channel.request_resolution();
                }
            }
            _ => self.publish(state, Arc::new(QueuingPicker)),
        }
    }

    fn publish(&mut self, state: ConnectivityState, picker: Arc<dyn Picker>) {
        if self.published_state == Some(state) {
            return;
        }
        self.published_state = Some(state);
        self.channel.update_balancer_state(LbState {
            connectivity_state: state,
            picker,
        });
    }
}

/// Rotates over the Ready subchannels.
struct RoundRobinPicker {
    subchannels: Vec<Arc<dyn Subchannel>>,
    next: AtomicUsize,
}

impl Picker for RoundRobinPicker {
    fn pick(&self, _request: &Request) -> PickResult {
        let idx = self.next.fetch_add(1, Ordering::Relaxed) % self.subchannels.len();
        PickResult::Pick(Pick {
            subchannel: self.subchannels[idx].clone(),
        })
    }
}

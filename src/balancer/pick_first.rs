//! The `pick_first` policy: connect to addresses in order and use the first
//! one that becomes Ready.

use std::collections::HashSet;
use std::error::Error;
use std::sync::{Arc, Once};

use rand::seq::SliceRandom;
use serde::Deserialize;
use tracing::debug;

use crate::balancer::registry::GLOBAL_POLICY_REGISTRY;
use crate::balancer::{
    ClientChannel, FailingPicker, LbConfig, LbPolicy, LbPolicyBuilder, LbPolicyOptions, LbState,
    ParsedJsonConfig, Pick, PickResult, Picker, QueuingPicker, Request, Subchannel, SubchannelKey,
    SubchannelState, TrackedSubchannel,
};
use crate::resolver::{Address, ResolverUpdate};
use crate::ConnectivityState;

pub static POLICY_NAME: &str = "pick_first";

/// Registers the policy in the global registry.
pub fn reg() {
    static REGISTER_ONCE: Once = Once::new();
    REGISTER_ONCE.call_once(|| {
        GLOBAL_POLICY_REGISTRY.add_builder(Builder);
    });
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub(crate) struct PickFirstConfig {
    pub(crate) shuffle_address_list: Option<bool>,
}

struct Builder;

impl LbPolicyBuilder for Builder {
    fn build(&self, channel: Arc<dyn ClientChannel>, _options: LbPolicyOptions) -> Box<dyn LbPolicy> {
        Box::new(PickFirstPolicy {
            channel,
            subchannels: Vec::new(),
            selected: None,
            connectivity_state: ConnectivityState::Connecting,
            last_error: None,
        })
    }

    fn name(&self) -> &'static str {
        POLICY_NAME
    }

    fn parse_config(
        &self,
        config: &ParsedJsonConfig,
    ) -> Result<Option<LbConfig>, Box<dyn Error + Send + Sync>> {
        let cfg: PickFirstConfig = config
            .convert_to()
            .map_err(|e| format!("failed to parse pick_first config: {e}"))?;
        Ok(Some(LbConfig::new(cfg)))
    }
}

struct PickFirstPolicy {
    channel: Arc<dyn ClientChannel>,
    subchannels: Vec<TrackedSubchannel>,
    selected: Option<Arc<dyn Subchannel>>,
    connectivity_state: ConnectivityState,
    last_error: Option<String>,
}

impl LbPolicy for PickFirstPolicy {
    fn resolver_update(
        &mut self,
        update: ResolverUpdate,
        config: Option<&LbConfig>,
    ) -> Result<(), Box<dyn Error + Send + Sync>> {
        let mut addresses = update.addresses;
        let mut seen = HashSet::new();
        addresses.retain(|a| seen.insert(a.clone()));

        if addresses.is_empty() {
            self.subchannels.clear();
            self.selected = None;
            self.move_to_failure("received empty address list from the name resolver".to_string());
            return Err("received empty address list from the name resolver".into());
        }

        if shuffle_requested(config) {
            addresses.shuffle(&mut rand::rng());
        }

        self.selected = None;
        self.subchannels = addresses
            .iter()
            .map(|a| TrackedSubchannel::new(self.channel.new_subchannel(a)))
            .collect();
        self.subchannels[0].subchannel.connect();
        self.move_to_connecting();
        Ok(())
    }

    fn subchannel_update(&mut self, subchannel: &Arc<dyn Subchannel>, state: &SubchannelState) {
        if let Some(selected) = &self.selected {
            if SubchannelKey::of(selected) == SubchannelKey::of(subchannel)
                && state.connectivity_state != ConnectivityState::Ready
            {
                // The connection we were using is gone; start over from the
                // top of the list.
                self.selected = None;
                if let Some(first) = self.subchannels.first() {
                    first.subchannel.connect();
                }
                self.move_to_connecting();
                return;
            }
        }

        let Some(idx) = self.subchannels.iter().position(|t| t.is(subchannel)) else {
            debug!(%subchannel, "ignoring update for unknown subchannel");
            return;
        };
        self.subchannels[idx].state = state.connectivity_state;

        match state.connectivity_state {
            ConnectivityState::Ready => {
                self.selected = Some(subchannel.clone());
                self.connectivity_state = ConnectivityState::Ready;
                self.last_error = None;
                self.channel.update_balancer_state(LbState {
                    connectivity_state: ConnectivityState::Ready,
                    picker: Arc::new(OneSubchannelPicker {
                        subchannel: subchannel.clone(),
                    }),
                });
            }
            ConnectivityState::TransientFailure => {
                if let Some(err) = &state.last_connection_error {
                    self.last_error = Some(err.to_string());
                }
                match self.subchannels.get(idx + 1) {
                    Some(next) => next.subchannel.connect(),
                    None => {
                        let error = self
                            .last_error
                            .clone()
                            .unwrap_or_else(|| "all connection attempts failed".to_string());
                        self.move_to_failure(error);
                    }
                }
            }
            ConnectivityState::Idle => {
                if self.selected.is_none() && idx == 0 {
                    subchannel.connect();
                }
            }
            ConnectivityState::Connecting => {
                if self.connectivity_state != ConnectivityState::TransientFailure {
                    self.move_to_connecting();
                }
            }
        }
    }

    fn close(&mut self) {
        self.subchannels.clear();
        self.selected = None;
    }
}

impl PickFirstPolicy {
    fn move_to_connecting(&mut self) {
        if self.connectivity_state == ConnectivityState::Connecting {
            return;
        }
        self.connectivity_state = ConnectivityState::Connecting;
        self.channel.update_balancer_state(LbState {
            connectivity_state: ConnectivityState::Connecting,
            picker: Arc::new(QueuingPicker),
        });
    }

    fn move_to_failure(&mut self, error: String) {
        self.connectivity_state = ConnectivityState::TransientFailure;
        self.channel.update_balancer_state(LbState {
            connectivity_state: ConnectivityState::TransientFailure,
            picker: Arc::new(FailingPicker { error }),
        });
        self.channel.request_resolution();
    }
}

fn shuffle_requested(config: Option<&LbConfig>) -> bool {
    config
        .and_then(|c| c.convert_to::<PickFirstConfig>())
        .and_then(|c| c.shuffle_address_list)
        .unwrap_or(false)
}

/// Always returns the one selected subchannel.
struct OneSubchannelPicker {
    subchannel: Arc<dyn Subchannel>,
}

impl Picker for OneSubchannelPicker {
    fn pick(&self, _request: &Request) -> PickResult {
        PickResult::Pick(Pick {
            subchannel: self.subchannel.clone(),
        })
    }
}

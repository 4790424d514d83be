//! The control-plane client: one streaming session per configured endpoint,
//! publishing typed events to its owner.

pub mod backoff;
pub mod transport;

use std::sync::Arc;

use tokio::sync::mpsc;
use tracing::{debug, warn};

use crate::discovery::backoff::{BackoffConfig, ExponentialBackoff};
use crate::discovery::transport::DiscoveryTransport;
use crate::error::Error;
use crate::resolver::Address;
use crate::rt::{Runtime, TaskHandle};

/// Identifies the location a group of endpoints is served from.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash)]
pub struct Locality {
    pub region: String,
    pub zone: String,
    pub sub_zone: String,
}

/// Health of one endpoint as reported by the control plane.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum EndpointHealth {
    #[default]
    Unknown,
    Healthy,
    Unhealthy,
    Draining,
}

/// One backend within a locality.
#[derive(Debug, Clone)]
pub struct LbEndpoint {
    pub address: Address,
    pub health: EndpointHealth,
    pub weight: u32,
}

/// All endpoints of one locality, with the locality's own weight and
/// failover priority.
#[derive(Debug, Clone)]
pub struct LocalityEndpoints {
    pub locality: Locality,
    pub lb_weight: u32,
    pub priority: u32,
    pub endpoints: Vec<LbEndpoint>,
}

/// A full endpoint assignment for one cluster, as streamed by the control
/// plane. Consumers treat each assignment as a complete replacement for the
/// previous one.
#[derive(Debug, Clone, Default)]
pub struct EndpointAssignment {
    pub cluster_name: String,
    pub localities: Vec<LocalityEndpoints>,
}

/// Events published by a [`DiscoveryClient`] session.
///
/// For a single session events are totally ordered; a broken stream
/// surfaces as `StreamError` followed by `StreamClosed`. Reconnection is
/// internal and produces no event of its own.
#[derive(Debug)]
pub enum DiscoveryEvent {
    Assignment(EndpointAssignment),
    StreamError(Error),
    StreamClosed,
}

/// Maintains one long-lived streaming session to a control-plane endpoint.
///
/// The client reconnects internally with exponential backoff; its owner
/// only ever observes assignments and the error/closed pair. Dropping or
/// closing the client tears the session down.
pub struct DiscoveryClient {
    task: Box<dyn TaskHandle>,
}

impl DiscoveryClient {
    /// Starts a session against `endpoint`, emitting events on `sink`.
    /// Returns immediately; all work happens in the background.
    pub fn start(
        transport: Arc<dyn DiscoveryTransport>,
        endpoint: String,
        runtime: Arc<dyn Runtime>,
        sink: mpsc::UnboundedSender<DiscoveryEvent>,
    ) -> Self {
        Self::start_with_backoff(transport, endpoint, runtime, sink, BackoffConfig::default())
    }

    /// As [`start`](Self::start), with explicit reconnect backoff
    /// parameters.
    pub fn start_with_backoff(
        transport: Arc<dyn DiscoveryTransport>,
        endpoint: String,
        runtime: Arc<dyn Runtime>,
        sink: mpsc::UnboundedSender<DiscoveryEvent>,
        backoff: BackoffConfig,
    ) -> Self {
        let rt = runtime.clone();
        let task = runtime.spawn(Box::pin(async move {
            run_sessions(transport, endpoint, rt, sink, backoff).await;
        }));
        Self { task }
    }

    /// Tears down the session. The sink stops receiving events; any event
    /// already in flight is identified by the owner through its session
    /// bookkeeping and discarded there.
    pub fn close(self) {
        self.task.abort();
    }
}

async fn run_sessions(
    transport: Arc<dyn DiscoveryTransport>,
    endpoint: String,
    runtime: Arc<dyn Runtime>,
    sink: mpsc::UnboundedSender<DiscoveryEvent>,
    backoff: BackoffConfig,
) {
    let mut backoff = ExponentialBackoff::new(backoff);
    loop {
        match transport.connect(&endpoint).await {
            Ok(mut stream) => {
                debug!(endpoint = %endpoint, "control-plane stream established");
                backoff.reset();
                loop {
                    match stream.recv().await {
                        Ok(Some(assignment)) => {
                            if sink.send(DiscoveryEvent::Assignment(assignment)).is_err() {
                                return;
                            }
                        }
                        Ok(None) => {
                            debug!(endpoint = %endpoint, "control-plane stream closed by peer");
                            if sink.send(DiscoveryEvent::StreamClosed).is_err() {
                                return;
                            }
                            break;
                        }
                        Err(err) => {
                            warn!(endpoint = %endpoint, error = %err, "control-plane stream broke");
                            if sink.send(DiscoveryEvent::StreamError(err)).is_err() {
                                return;
                            }
                            if sink.send(DiscoveryEvent::StreamClosed).is_err() {
                                return;
                            }
                            break;
                        }
                    }
                }
            }
            Err(err) => {
                warn!(endpoint = %endpoint, error = %err, "control-plane connection failed");
                if sink.send(DiscoveryEvent::StreamError(err)).is_err() {
                    return;
                }
                if sink.send(DiscoveryEvent::StreamClosed).is_err() {
                    return;
                }
            }
        }
        runtime.sleep(backoff.next()).await;
    }
}

//! Error types shared across the crate.

use thiserror::Error;

/// Errors produced while parsing configuration, instantiating child
/// policies, or talking to the control plane.
#[derive(Debug, Error)]
pub enum Error {
    /// No entry in a policy preference list names a registered balancer.
    #[error("no registered policy matches any {0} entry")]
    ConfigUnsatisfiable(&'static str),

    /// A configuration blob could not be deserialized.
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    /// A child policy name did not resolve in the registry at apply time.
    #[error("no balancer registered under {0:?}")]
    UnknownChildName(String),

    /// Failed to establish a control-plane session.
    #[error("failed to connect to control plane: {0}")]
    Connection(String),

    /// Error observed on an established control-plane stream.
    #[error("control-plane stream error: {0}")]
    Stream(String),

    /// The control-plane stream terminated without an error.
    #[error("control-plane stream closed")]
    StreamClosed,
}

pub type Result<T> = std::result::Result<T, Error>;

use std::io;

use thiserror::Error;

use crate::api::{DevError, PortId};
use crate::port::{PortState, PortStep};

#[derive(Error, Debug)]
pub enum Error {
    #[error("port {port}: {step} failed: {source}")]
    Port {
        port: PortId,
        step: PortStep,
        #[source]
        source: DevError,
    },
    #[error("port {0} is not a valid port")]
    InvalidPort(PortId),
    #[error("port {port}: {step} not allowed in state {state:?}")]
    InvalidState {
        port: PortId,
        step: PortStep,
        state: PortState,
    },
    #[error("cannot create mbuf pool {name}: {reason}")]
    PoolCreate { name: String, reason: String },
    #[error("invalid forwarding configuration: {0}")]
    Config(String),
    #[error("interface {name}: {source}")]
    Interface {
        name: String,
        #[source]
        source: io::Error,
    },
    #[error("no ports available")]
    NoPorts,
}

impl Error {
    /// Port the error refers to, if any.
    pub fn port(&self) -> Option<PortId> {
        match self {
            Error::Port { port, .. } | Error::InvalidState { port, .. } => Some(*port),
            Error::InvalidPort(port) => Some(*port),
            _ => None,
        }
    }
}

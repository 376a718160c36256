//! Error types for the control surface and external seams.
//!
//! Packet-path failures are not errors in this sense: they end in a
//! [`Verdict`](crate::pipeline::Verdict) and a counter, never a panic.

use std::net::SocketAddrV4;

use flowgate_packet::PacketError;
use thiserror::Error;

use crate::directory::ServiceKey;

/// Errors from service/destination management.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum DirectoryError {
    /// A service with this key is already present.
    #[error("service {0} already exists")]
    ServiceExists(ServiceKey),

    /// No service with this key.
    #[error("service {0} not found")]
    ServiceNotFound(ServiceKey),

    /// Destination already registered under the service.
    #[error("destination {dest} already exists in service {service}")]
    DestinationExists {
        service: ServiceKey,
        dest: SocketAddrV4,
    },

    /// Destination not registered under the service.
    #[error("destination {dest} not found in service {service}")]
    DestinationNotFound {
        service: ServiceKey,
        dest: SocketAddrV4,
    },

    /// Scheduler name does not resolve.
    #[error("unknown scheduler '{0}'")]
    UnknownScheduler(String),

    /// Service configuration is not supported.
    #[error("invalid service configuration: {0}")]
    InvalidService(String),
}

impl DirectoryError {
    /// Returns true for "does not exist" errors.
    pub fn is_not_found(&self) -> bool {
        matches!(
            self,
            DirectoryError::ServiceNotFound(_) | DirectoryError::DestinationNotFound { .. }
        )
    }
}

/// Errors from scheduler and protocol registries.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum RegistryError {
    #[error("'{0}' is already registered")]
    AlreadyRegistered(String),

    #[error("'{0}' is not registered")]
    NotRegistered(String),
}

/// Errors from header rewrite or handing a packet to the I/O layer.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum TransmitError {
    #[error("header rewrite failed: {0}")]
    Rewrite(#[from] PacketError),

    #[error("no route to next hop {0}")]
    NoRoute(SocketAddrV4),

    #[error("transmit queue full")]
    QueueFull,
}

/// Errors raised while building a [`Context`](crate::context::Context).
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum InitError {
    #[error("invalid tunable {name}: {reason}")]
    InvalidTunable { name: &'static str, reason: String },

    #[error("registration failed: {0}")]
    Registry(#[from] RegistryError),
}

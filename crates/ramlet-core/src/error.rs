//! Error types for ramlet

use thiserror::Error;

/// Main error type for ramlet
#[derive(Error, Debug)]
pub enum RamletError {
    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// The requested remote program does not exist on the controlling node
    #[error("Program missing: {0}")]
    ProgramMissing(String),

    /// No combination of nodes could satisfy a thread request
    #[error("Capacity unavailable: requested {requested} threads, granted {granted}")]
    CapacityUnavailable { requested: u32, granted: u32 },

    /// The environment refused to start a process
    #[error("Process start failure: {0}")]
    ProcessStartFailure(String),

    /// Destination channel is full
    #[error("Delivery blocked on port {0}")]
    DeliveryBlocked(u16),

    /// A refresh changed an attribute of an already known node
    #[error("Stale node state for {node}: {attribute}")]
    StaleNodeState { node: String, attribute: String },

    /// Nobody is reading the destination channel any more
    #[error("Channel closed: port {0}")]
    ChannelClosed(u16),

    /// Node is not known to the registry or pool
    #[error("Unknown node: {0}")]
    UnknownNode(String),

    /// Target does not exist or cannot be worked on
    #[error("Invalid target: {0}")]
    InvalidTarget(String),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Serialization error
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// Internal error
    #[error("Internal error: {0}")]
    Internal(String),
}

impl RamletError {
    /// Whether the condition is local and worth retrying later.
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            RamletError::CapacityUnavailable { .. }
                | RamletError::ProcessStartFailure(_)
                | RamletError::DeliveryBlocked(_)
                | RamletError::ChannelClosed(_)
        )
    }
}

/// Result type for ramlet operations
pub type RamletResult<T> = Result<T, RamletError>;

impl From<serde_json::Error> for RamletError {
    fn from(err: serde_json::Error) -> Self {
        RamletError::Serialization(err.to_string())
    }
}

impl From<toml::de::Error> for RamletError {
    fn from(err: toml::de::Error) -> Self {
        RamletError::Config(err.to_string())
    }
}

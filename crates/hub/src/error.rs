//! Error kinds produced by the ingestion engine.
//!
//! None of these abort the sequencer: every operation handles its own
//! failures and the worker moves on to the next queued command.

use std::fmt;

/// Why a first-contact device was not provisioned.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RejectReason {
    /// No baseline sync with the remote store has completed yet.
    NotSynced,
    /// No current user to own the new location.
    NoOwner,
    /// A device with this serial number already exists.
    AlreadyKnown,
    /// None of the reported sensor types exist in reference data.
    NoKnownSensorTypes,
}

impl fmt::Display for RejectReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::NotSynced => write!(f, "baseline sync has not completed"),
            Self::NoOwner => write!(f, "no owner configured"),
            Self::AlreadyKnown => write!(f, "serial number already registered"),
            Self::NoKnownSensorTypes => write!(f, "no known sensor types reported"),
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum HubError {
    /// A reading or history referenced a sensor or sensor type that is not
    /// in the current in-memory set.
    #[error("lookup miss: {0}")]
    LookupMiss(String),

    /// Provisioning preconditions were not met for a device.
    #[error("provisioning rejected for device {serial}: {reason}")]
    ProvisionRejected { serial: String, reason: RejectReason },

    /// The persistence gateway failed to load or commit.
    #[error("persistence failure: {0:#}")]
    Persistence(#[source] anyhow::Error),

    /// A history blob could not be decoded.
    #[error("codec error: {0}")]
    Codec(String),
}

impl HubError {
    pub(crate) fn persistence(err: anyhow::Error) -> Self {
        Self::Persistence(err)
    }
}

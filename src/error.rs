use std::fmt;

use thiserror::Error;

pub type Result<T> = std::result::Result<T, NetError>;

type BoxError = Box<dyn std::error::Error + Send + Sync>;

#[derive(Error, Debug)]
pub enum NetError {
    #[error("No such {kind}: {name}")]
    NotFound { kind: &'static str, name: String },

    #[error("Subnet {subnet} has no free address")]
    AllocationExhausted { subnet: String },

    #[error("Invalid subnet {subnet}: {reason}")]
    InvalidSubnet { subnet: String, reason: String },

    #[error("Persistence error: {message}")]
    Persistence {
        message: String,
        #[source]
        source: Option<BoxError>,
    },

    #[error("Driver error: {message}")]
    Driver {
        message: String,
        #[source]
        source: Option<BoxError>,
    },

    #[error("Namespace error while trying to {step}")]
    Namespace {
        step: NetnsStep,
        #[source]
        source: Option<BoxError>,
    },

    #[error("Port mapping error: {message}")]
    PortMapping { message: String },
}

/// Sub-step of a namespace crossing, reported with [`NetError::Namespace`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NetnsStep {
    Resolve,
    MoveLink,
    Enter,
    SetAddress,
    LinkUp,
    LoopbackUp,
    DefaultRoute,
    Restore,
}

impl fmt::Display for NetnsStep {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let step = match self {
            NetnsStep::Resolve => "resolve the container network namespace",
            NetnsStep::MoveLink => "move the peer link into the namespace",
            NetnsStep::Enter => "enter the container network namespace",
            NetnsStep::SetAddress => "assign the peer address",
            NetnsStep::LinkUp => "bring the peer link up",
            NetnsStep::LoopbackUp => "bring the loopback link up",
            NetnsStep::DefaultRoute => "install the default route",
            NetnsStep::Restore => "restore the original network namespace",
        };
        f.write_str(step)
    }
}

impl NetError {
    pub fn not_found(kind: &'static str, name: &str) -> Self {
        NetError::NotFound {
            kind,
            name: name.to_string(),
        }
    }

    pub fn invalid_subnet(subnet: &str, reason: impl ToString) -> Self {
        NetError::InvalidSubnet {
            subnet: subnet.to_string(),
            reason: reason.to_string(),
        }
    }

    pub fn persistence(message: impl ToString, source: Option<BoxError>) -> Self {
        NetError::Persistence {
            message: message.to_string(),
            source,
        }
    }

    pub fn driver(message: impl ToString, source: Option<BoxError>) -> Self {
        NetError::Driver {
            message: message.to_string(),
            source,
        }
    }

    pub fn namespace(step: NetnsStep, source: impl Into<BoxError>) -> Self {
        NetError::Namespace {
            step,
            source: Some(source.into()),
        }
    }

    /// Turn a device-level failure into a [`NetError::Driver`].
    pub fn from_driver(message: &str, e: anyhow::Error) -> Self {
        NetError::driver(message, Some(e.into()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::error::Error;

    #[test]
    fn test_namespace_error_names_step() {
        let e = NetError::namespace(
            NetnsStep::DefaultRoute,
            std::io::Error::from(std::io::ErrorKind::PermissionDenied),
        );

        assert!(e.to_string().contains("default route"));
        assert!(e.source().is_some());
    }

    #[test]
    fn test_driver_error_keeps_context() {
        let inner = anyhow::anyhow!("Link not found").context("Failed to add veth to bridge");
        let e = NetError::from_driver("connect failed", inner);

        let source = e.source().unwrap().to_string();
        assert_eq!(source, "Failed to add veth to bridge");
    }
}

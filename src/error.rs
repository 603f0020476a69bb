use thiserror::Error;

/// Errors surfaced by the probing engine.
///
/// Validation variants are raised before any packet leaves the host.
/// Per-operation transient failures are normally swallowed by the probe that
/// hit them and turned into sentinel values; they only reach a caller when
/// the operation has nothing sensible to fall back to.
#[derive(Error, Debug)]
pub enum ProbeError {
    #[error("invalid CIDR: {0}")]
    InvalidCidr(String),

    #[error("subnet range too large ({hosts} hosts), maximum allowed is {max}")]
    SubnetTooLarge { hosts: u64, max: u64 },

    #[error("subnet {0} has no usable host addresses")]
    EmptySubnet(String),

    #[error("invalid port list: {0}")]
    InvalidPortList(String),

    #[error("invalid resolver address: {0}")]
    InvalidResolver(String),

    #[error("invalid trace destination: {0:?}")]
    InvalidDestination(String),

    #[error("{0} is already being monitored")]
    DuplicateSession(String),

    #[error("no trace session for {0}")]
    UnknownSession(String),

    #[error("failed to resolve {0}")]
    Resolve(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("vendor database rejected: {0}")]
    VendorData(String),

    #[error("{0} is not supported")]
    Unsupported(String),

    #[error("operation cancelled")]
    Cancelled,
}

impl ProbeError {
    pub fn is_cancelled(&self) -> bool {
        matches!(self, ProbeError::Cancelled)
    }

    /// True for the errors a caller can fix by changing its input.
    pub fn is_validation(&self) -> bool {
        matches!(
            self,
            ProbeError::InvalidCidr(_)
                | ProbeError::SubnetTooLarge { .. }
                | ProbeError::EmptySubnet(_)
                | ProbeError::InvalidPortList(_)
                | ProbeError::InvalidResolver(_)
                | ProbeError::InvalidDestination(_)
                | ProbeError::DuplicateSession(_)
                | ProbeError::UnknownSession(_)
                | ProbeError::Resolve(_)
        )
    }
}

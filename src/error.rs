//! Crate-wide error type.

use thiserror::Error;

/// Errors surfaced by the link management core.
///
/// Most of these map directly onto the error kinds produced by the
/// activation state machine: `Io` through `InvalidArgument` are raised
/// inside the engine and mostly handled there (see the propagation policy
/// in `activation`); only [`Error::NoDriverSupport`] is meant to escape to
/// the caller of `activate_begin`.
#[derive(Error, Debug)]
pub enum Error {
    /// A radio or kernel primitive failed; carries the raw errno when known.
    #[error("I/O error on {iface}: {source}")]
    Io { iface: String, #[source] source: std::io::Error },

    /// Device's driver-support classification is `Unsupported`.
    #[error("device {0} has no driver support")]
    NoDriverSupport(String),

    /// No link after the association pause.
    #[error("association with {essid} failed")]
    AssociationFailed { essid: String },

    /// SharedKey auth produced no link, or DHCP failed after a SharedKey try.
    #[error("authentication with {essid} failed")]
    AuthFailed { essid: String },

    /// Encrypted AP selected with no key material available.
    #[error("key required for {essid}")]
    KeyRequired { essid: String },

    /// The user explicitly cancelled a key prompt.
    #[error("user cancelled key entry for {essid}")]
    UserCancelled { essid: String },

    /// `activation_cancel` was called and the worker unwound.
    #[error("activation on {0} was cancelled")]
    ActivationCancelled(String),

    /// The DHCP collaborator reported failure.
    #[error("DHCP failed on {iface}")]
    DhcpFailed { iface: String },

    /// Caller supplied an invalid argument (e.g. an over-long key or ESSID).
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// No wireless device is present/managed.
    #[error("no wireless device available")]
    NoWirelessDevice,

    #[error("D-Bus error: {0}")]
    Zbus(#[from] zbus::Error),

    #[error("configuration error: {0}")]
    Config(#[from] configory::Error),
}

pub type Result<T> = std::result::Result<T, Error>;

impl Error {
    /// Build an [`Error::Io`] from the current OS error for `iface`.
    pub fn last_os_error(iface: impl Into<String>) -> Self {
        Self::Io { iface: iface.into(), source: std::io::Error::last_os_error() }
    }
}

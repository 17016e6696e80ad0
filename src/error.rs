//! Error taxonomy.
//!
//! Two axes, mirrored directly from the spec: generic core errors and
//! modem-reported "mobile equipment" errors (SIM/PIN family and GPRS/PDN
//! family). Every public operation in this crate resolves its `Result` to
//! [`ModemError`] — no boxed `dyn Error`, no bare `String`.

use thiserror::Error;

/// Convenience alias used throughout the crate.
pub type Result<T, E = ModemError> = std::result::Result<T, E>;

/// Top-level error returned by every public operation.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ModemError {
    #[error(transparent)]
    Core(#[from] CoreError),

    #[error(transparent)]
    Serial(#[from] SerialError),

    #[error(transparent)]
    Me(#[from] MeError),
}

/// Generic core errors, not specific to any transport.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CoreError {
    #[error("invalid arguments: {0}")]
    InvalidArgs(String),

    #[error("operation not supported")]
    Unsupported,

    #[error("not found")]
    NotFound,

    #[error("already exists")]
    AlreadyExists,

    #[error("operation already in progress")]
    InProgress,

    #[error("operation cancelled")]
    Cancelled,

    #[error("operation timed out")]
    Timeout,

    #[error("wrong state for this operation")]
    WrongState,

    #[error("operation failed: {0}")]
    Failed(String),
}

/// Errors specific to [`crate::serial::SerialPort`].
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SerialError {
    #[error("port is not open")]
    PortNotOpen,

    #[error("port was force-closed")]
    PortClosed,

    #[error("port is handed off to an external consumer")]
    PortConnected,

    #[error("failed to send on port: {0}")]
    PortSendFailed(String),

    #[error("serial command timed out")]
    SerialTimeout,

    #[error("failed to open port: {0}")]
    OpenFailed(String),

    #[error("failed to open port: no device")]
    OpenFailedNoDevice,
}

/// SIM PIN/PUK family, reported by the modem.
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum SimLockError {
    #[error("SIM PIN required")]
    SimPin,
    #[error("SIM PUK required")]
    SimPuk,
    #[error("SIM PIN2 required")]
    SimPin2,
    #[error("SIM PUK2 required")]
    SimPuk2,
    #[error("incorrect password")]
    IncorrectPassword,
    #[error("PH-SIM PIN required")]
    PhSimPin,
    #[error("PH-SIM PUK required")]
    PhSimPuk,
    #[error("PH-FSIM PIN required")]
    PhFsimPin,
    #[error("PH-FSIM PUK required")]
    PhFsimPuk,
    #[error("PH-NET PIN required")]
    PhNetPin,
    #[error("PH-NET PUK required")]
    PhNetPuk,
    #[error("PH-NETSUB PIN required")]
    PhNetSubPin,
    #[error("PH-NETSUB PUK required")]
    PhNetSubPuk,
    #[error("PH-SP PIN required")]
    PhSpPin,
    #[error("PH-SP PUK required")]
    PhSpPuk,
    #[error("PH-CORP PIN required")]
    PhCorpPin,
    #[error("PH-CORP PUK required")]
    PhCorpPuk,
}

/// GPRS/PDN network-reported error family.
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum GprsError {
    #[error("IMSI unknown in HLR")]
    ImsiUnknownInHlr,
    #[error("illegal MS")]
    IllegalMs,
    #[error("GPRS not allowed")]
    GprsNotAllowed,
    #[error("PLMN not allowed")]
    PlmnNotAllowed,
    #[error("location area not allowed")]
    LocationNotAllowed,
    #[error("roaming not allowed in this location area")]
    RoamingNotAllowed,
    #[error("no cells in this location area")]
    NoCellsInLocationArea,
    #[error("network failure")]
    NetworkFailure,
    #[error("network congestion")]
    Congestion,
    #[error("insufficient resources")]
    InsufficientResources,
    #[error("missing or unknown APN")]
    MissingOrUnknownApn,
    #[error("unknown PDP address or type")]
    UnknownPdpAddressOrType,
    #[error("user authentication failed")]
    UserAuthenticationFailed,
    #[error("activation rejected by GGSN or gateway")]
    ActivationRejectedByGgsnOrGw,
    #[error("activation rejected, reason unspecified")]
    ActivationRejectedUnspecified,
    #[error("service option not supported")]
    ServiceOptionNotSupported,
    #[error("requested service option not subscribed")]
    ServiceOptionNotSubscribed,
    #[error("service option temporarily out of order")]
    ServiceOptionOutOfOrder,
    #[error("maximum number of PDP contexts reached")]
    MaxNumberPdpContextsReached,
    #[error("requested APN not supported in current RAT and PLMN combination")]
    RequestedApnNotSupported,
    #[error("unknown GPRS error ({0})")]
    GprsUnknown(u32),
}

/// Mobile-equipment errors: SIM lock family plus GPRS/PDN family.
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum MeError {
    #[error(transparent)]
    SimLock(#[from] SimLockError),

    #[error(transparent)]
    Gprs(#[from] GprsError),
}

impl GprsError {
    /// Map a raw MBIM `NwError` field to the stable error taxonomy.
    ///
    /// Mirrors `3GPP TS 24.008` Annex G cause codes as used over MBIM's
    /// `NwError` field. Unknown codes are preserved verbatim rather than
    /// dropped, so the caller can still log/display something useful.
    pub fn from_nw_error(code: u32) -> Option<Self> {
        Some(match code {
            2 => Self::ImsiUnknownInHlr,
            6 => Self::IllegalMs,
            7 => Self::GprsNotAllowed,
            11 => Self::PlmnNotAllowed,
            12 => Self::LocationNotAllowed,
            13 => Self::RoamingNotAllowed,
            15 => Self::NoCellsInLocationArea,
            17 => Self::NetworkFailure,
            22 => Self::Congestion,
            26 => Self::InsufficientResources,
            27 => Self::MissingOrUnknownApn,
            28 => Self::UnknownPdpAddressOrType,
            29 => Self::UserAuthenticationFailed,
            30 => Self::ActivationRejectedByGgsnOrGw,
            31 => Self::ActivationRejectedUnspecified,
            32 => Self::ServiceOptionNotSupported,
            33 => Self::ServiceOptionNotSubscribed,
            34 => Self::ServiceOptionOutOfOrder,
            65 => Self::MaxNumberPdpContextsReached,
            66 => Self::RequestedApnNotSupported,
            0 => return None,
            other => Self::GprsUnknown(other),
        })
    }
}

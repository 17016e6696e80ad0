//! Kernel-exposed modem endpoint abstraction.
//!
//! A [`Port`] carries no I/O of its own — it is the identity and
//! classification record shared by every transport-specific wrapper
//! ([`crate::serial::SerialPort`], [`crate::proto::ProtoPort`]).

use std::fmt;

/// Kernel subsystem a port was enumerated from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Subsystem {
    Tty,
    Net,
    QmiCdev,
    MbimCdev,
    Usb,
}

/// Port role, as classified by plugin probing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PortKind {
    AtPrimary,
    AtSecondary,
    Net,
    Qmi,
    Mbim,
    Qcdm,
    Gps,
    AudioCall,
    Ignored,
}

/// A single kernel-exposed modem endpoint.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Port {
    pub subsystem: Subsystem,
    pub driver: String,
    pub device: String,
    pub kind: PortKind,
    pub physdev_uid: String,
    /// Transient: true while an external consumer (e.g. a PPP/data session)
    /// owns the port for raw data transfer.
    pub connected: bool,
}

impl Port {
    pub fn new(
        subsystem: Subsystem,
        driver: impl Into<String>,
        device: impl Into<String>,
        kind: PortKind,
        physdev_uid: impl Into<String>,
    ) -> Self {
        Self {
            subsystem,
            driver: driver.into(),
            device: device.into(),
            kind,
            physdev_uid: physdev_uid.into(),
            connected: false,
        }
    }

    /// Kernel (subsystem, name) identity pair used to match add/remove
    /// events to a tracked port.
    pub fn identity(&self) -> (Subsystem, &str) {
        (self.subsystem, &self.device)
    }
}

impl fmt::Display for Port {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}:{}", self.subsystem, self.device)
    }
}

/// Validate the "at most one AtPrimary port per modem" invariant.
///
/// Returns `false` if more than one port in `ports` is classified
/// [`PortKind::AtPrimary`].
pub fn at_most_one_primary(ports: &[Port]) -> bool {
    ports.iter().filter(|port| port.kind == PortKind::AtPrimary).count() <= 1
}

#[cfg(test)]
mod tests {
    use super::*;

    fn port(kind: PortKind, name: &str) -> Port {
        Port::new(Subsystem::Tty, "driver", name, kind, "uid-1")
    }

    #[test]
    fn single_primary_is_valid() {
        let ports = vec![port(PortKind::AtPrimary, "ttyUSB0"), port(PortKind::AtSecondary, "ttyUSB1")];
        assert!(at_most_one_primary(&ports));
    }

    #[test]
    fn two_primaries_are_invalid() {
        let ports = vec![port(PortKind::AtPrimary, "ttyUSB0"), port(PortKind::AtPrimary, "ttyUSB1")];
        assert!(!at_most_one_primary(&ports));
    }

    #[test]
    fn identity_pairs_subsystem_and_name() {
        let port = port(PortKind::Net, "wwan0");
        assert_eq!(port.identity(), (Subsystem::Tty, "wwan0"));
    }
}

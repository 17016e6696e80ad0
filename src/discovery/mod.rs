//! Kernel hotplug -> `Device` grouping -> plugin support-check -> [`Modem`].
//!
//! Turns a stream of kernel port add/remove events into at most one
//! [`Modem`] per physical device UID, serializing plugin probing so a
//! device with several ports (a handful of ttys, a net, a cdev) only gets
//! probed once. Plugin support-checking itself is an external collaborator
//! (see module docs on [`SupportChecker`]) — this module only owns the
//! grouping, filtering, and lifecycle bookkeeping around it.

pub mod filter;

use std::cell::RefCell;
use std::collections::HashMap;
use std::rc::Rc;

use tracing::{debug, info};
use udev::Enumerator;

pub use filter::{PortFilter, Rule};

use crate::cancel::CancelToken;
use crate::error::{CoreError, Result};
use crate::modem::{Capabilities, Modem};
use crate::port::{Port, Subsystem};

/// A single kernel port add/remove/change notification.
#[derive(Debug, Clone)]
pub struct HotplugEvent {
    pub action: HotplugAction,
    pub subsystem: Subsystem,
    pub name: String,
    pub driver: String,
    pub uid: String,
    /// Kernel's own `ID_MM_CANDIDATE` udev property.
    pub candidate: bool,
    /// `DEVTYPE=usb_device`, relevant only to USB-subsystem removes: a
    /// configuration switch generates interleaved adds/removes on
    /// interface devices that must not tear the modem down.
    pub usb_device_remove: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HotplugAction {
    Add,
    Remove,
    Change,
}

/// Outcome of an asynchronous plugin support-check.
pub enum SupportOutcome {
    Supported { ports: Vec<Port>, capabilities: Capabilities },
    Unsupported,
}

/// One-shot completion callback for a support-check.
pub type SupportCallback = Box<dyn FnOnce(SupportOutcome)>;

/// External collaborator: probe a device's raw kernel ports and report
/// back whether a plugin claims it, and if so, what the classified
/// [`Port`] set and [`Capabilities`] are. Out of scope for this crate (see
/// `check_support(device) -> Future<Plugin | NotSupported>` in the
/// external-interfaces catalogue) — callers inject their own plugin
/// registry here. The callback may fire synchronously or be deferred to a
/// later calloop iteration; `cancel` is observed either way.
pub type SupportChecker = Box<dyn FnMut(&str, CancelToken, SupportCallback)>;

/// Events crossing the out-of-scope DBus boundary for modem lifecycle.
#[derive(Clone)]
pub enum DiscoveryEvent {
    ModemAdded(Modem),
    ModemRemoved { uid: String },
}

type EventSink = Box<dyn FnMut(DiscoveryEvent)>;

struct Device {
    ports: Vec<(Subsystem, String)>,
    probe_cancel: Option<CancelToken>,
    modem: Option<Modem>,
}

impl Device {
    fn new() -> Self {
        Self { ports: Vec::new(), probe_cancel: None, modem: None }
    }
}

struct Inner {
    devices: HashMap<String, Device>,
    filter: PortFilter,
    make_modem: Box<dyn Fn(String, Vec<Port>, Capabilities) -> Modem>,
}

/// Orchestrates kernel hotplug events into modem lifecycle. See the module
/// docs for the grouping/filtering/probing pipeline.
///
/// `support_checker` lives in its own `RefCell`, separate from `inner`:
/// the checker may complete synchronously, and its completion handler
/// needs to borrow `inner` to attach the new `Modem` — routing both
/// through one `RefCell` would panic on that re-entry.
#[derive(Clone)]
pub struct DeviceDiscoverer {
    inner: Rc<RefCell<Inner>>,
    support_checker: Rc<RefCell<SupportChecker>>,
    events: Rc<RefCell<EventSink>>,
}

impl DeviceDiscoverer {
    pub fn new(
        filter: PortFilter,
        support_checker: SupportChecker,
        make_modem: Box<dyn Fn(String, Vec<Port>, Capabilities) -> Modem>,
        events: EventSink,
    ) -> Self {
        let inner = Rc::new(RefCell::new(Inner { devices: HashMap::new(), filter, make_modem }));
        Self {
            inner,
            support_checker: Rc::new(RefCell::new(support_checker)),
            events: Rc::new(RefCell::new(events)),
        }
    }

    fn emit(&self, event: DiscoveryEvent) {
        (self.events.borrow_mut())(event);
    }

    /// Dispatch one kernel event through the add/remove pipeline.
    pub fn handle_event(&self, event: HotplugEvent) {
        match event.action {
            HotplugAction::Add | HotplugAction::Change => self.handle_add(event),
            HotplugAction::Remove => self.handle_remove(event),
        }
    }

    fn handle_add(&self, event: HotplugEvent) {
        if !event.candidate {
            // Lost-marker removal: a port that used to be a candidate no
            // longer is, treat it the same as a kernel remove.
            self.handle_remove(event);
            return;
        }

        let accepted = self.inner.borrow().filter.accepts(event.subsystem, &event.driver);
        if !accepted {
            debug!(uid = %event.uid, subsystem = ?event.subsystem, driver = %event.driver, "port rejected by filter");
            return;
        }

        let is_new = {
            let mut inner = self.inner.borrow_mut();
            let is_new = !inner.devices.contains_key(&event.uid);
            let device = inner.devices.entry(event.uid.clone()).or_insert_with(Device::new);
            let identity = (event.subsystem, event.name.clone());
            if !device.ports.contains(&identity) {
                device.ports.push(identity);
            }
            is_new
        };

        if is_new {
            info!(uid = %event.uid, "new modem candidate device, starting support check");
            self.start_support_check(event.uid);
        }
    }

    fn start_support_check(&self, uid: String) {
        let cancel = CancelToken::new();
        {
            let mut inner = self.inner.borrow_mut();
            match inner.devices.get_mut(&uid) {
                Some(device) => device.probe_cancel = Some(cancel.clone()),
                None => return,
            }
        }

        let this = self.clone();
        let uid_for_callback = uid.clone();
        let callback: SupportCallback = Box::new(move |outcome| this.finish_support_check(uid_for_callback, outcome));

        (self.support_checker.borrow_mut())(&uid, cancel, callback);
    }

    fn finish_support_check(&self, uid: String, outcome: SupportOutcome) {
        let modem = {
            let mut inner = self.inner.borrow_mut();
            let Some(device) = inner.devices.get_mut(&uid) else { return };
            device.probe_cancel = None;
            match outcome {
                SupportOutcome::Supported { ports, capabilities } => {
                    let modem = (inner.make_modem)(uid.clone(), ports, capabilities);
                    device.modem = Some(modem.clone());
                    Some(modem)
                },
                SupportOutcome::Unsupported => {
                    debug!(uid = %uid, "no plugin claimed device");
                    None
                },
            }
        };
        if let Some(modem) = modem {
            self.emit(DiscoveryEvent::ModemAdded(modem));
        }
    }

    fn handle_remove(&self, event: HotplugEvent) {
        if event.subsystem == Subsystem::Usb && !event.usb_device_remove {
            return;
        }

        let destroyed = {
            let mut inner = self.inner.borrow_mut();
            let Some(device) = inner.devices.get_mut(&event.uid) else { return };
            device.ports.retain(|port| *port != (event.subsystem, event.name.clone()));
            if let Some(modem) = &device.modem {
                modem.remove_port(event.subsystem, &event.name);
            }

            if !device.ports.is_empty() {
                return;
            }
            if let Some(cancel) = device.probe_cancel.take() {
                cancel.cancel();
            }
            inner.devices.remove(&event.uid);
            true
        };

        if destroyed {
            info!(uid = %event.uid, "device emptied, modem destroyed");
            self.emit(DiscoveryEvent::ModemRemoved { uid: event.uid });
        }
    }

    /// Synchronous replay: enumerate tty/net/usb/usbmisc subsystems and
    /// synthesize add events for each, as if freshly plugged in. Used at
    /// startup to pick up devices that were already present.
    pub fn manual_scan(&self) -> Result<()> {
        for subsystem in ["tty", "net", "usb", "usbmisc"] {
            let mut enumerator = Enumerator::new().map_err(|err| CoreError::Failed(err.to_string()))?;
            enumerator.match_subsystem(subsystem).map_err(|err| CoreError::Failed(err.to_string()))?;
            let devices = enumerator.scan_devices().map_err(|err| CoreError::Failed(err.to_string()))?;

            for device in devices {
                if let Some(event) = hotplug_event_from_udev(&device) {
                    self.handle_event(event);
                }
            }
        }
        Ok(())
    }
}

/// Translate a `udev::Device` snapshot into a [`HotplugEvent`] tagged with
/// `action`, for both live monitor events and
/// [`DeviceDiscoverer::manual_scan`] replay (which always synthesizes
/// `Add`).
fn classify_device(device: &udev::Device, action: HotplugAction) -> Option<HotplugEvent> {
    let subsystem = match device.subsystem().and_then(|s| s.to_str()) {
        Some("tty") => Subsystem::Tty,
        Some("net") => Subsystem::Net,
        Some("usbmisc") => {
            match device.property_value("ID_USB_INTERFACE_NUM") {
                Some(_) => Subsystem::QmiCdev,
                None => Subsystem::MbimCdev,
            }
        },
        Some("usb") => Subsystem::Usb,
        _ => return None,
    };

    let name = device.sysname().to_str()?.to_string();
    let driver = device.driver().and_then(|d| d.to_str()).unwrap_or("").to_string();
    // `ID_PATH` is stamped by udev on the physical device and inherited by
    // every port hanging off it, which is exactly the grouping key a
    // multi-port modem needs; fall back to the port's own name for
    // devices udev didn't tag (unit tests, bare dummy ttys).
    let uid = device.property_value("ID_PATH").and_then(|v| v.to_str()).unwrap_or(name.as_str()).to_string();
    let candidate = device.property_value("ID_MM_CANDIDATE").is_some();
    let usb_device_remove = device.property_value("DEVTYPE").and_then(|v| v.to_str()) == Some("usb_device");

    Some(HotplugEvent { action, subsystem, name, driver, uid, candidate, usb_device_remove })
}

fn hotplug_event_from_udev(device: &udev::Device) -> Option<HotplugEvent> {
    classify_device(device, HotplugAction::Add)
}

/// Translate a live `udev::Event` off a `MonitorSocket` into a
/// [`HotplugEvent`]. Returns `None` for event types this daemon doesn't
/// act on (`bind`/`unbind`, vendor-specific `unknown` actions).
pub fn hotplug_event_from_monitor(event: &udev::Event) -> Option<HotplugEvent> {
    let action = match event.event_type() {
        udev::EventType::Add => HotplugAction::Add,
        udev::EventType::Remove => HotplugAction::Remove,
        udev::EventType::Change => HotplugAction::Change,
        _ => return None,
    };
    classify_device(&event.device(), action)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::port::PortKind;

    fn add(uid: &str, subsystem: Subsystem, name: &str) -> HotplugEvent {
        HotplugEvent {
            action: HotplugAction::Add,
            subsystem,
            name: name.into(),
            driver: "option".into(),
            uid: uid.into(),
            candidate: true,
            usb_device_remove: false,
        }
    }

    fn remove(uid: &str, subsystem: Subsystem, name: &str) -> HotplugEvent {
        HotplugEvent {
            action: HotplugAction::Remove,
            subsystem,
            name: name.into(),
            driver: "option".into(),
            uid: uid.into(),
            candidate: true,
            usb_device_remove: subsystem != Subsystem::Usb,
        }
    }

    fn discoverer(events: Rc<RefCell<Vec<DiscoveryEvent>>>) -> DeviceDiscoverer {
        let checks = Rc::new(RefCell::new(0u32));
        let support_checker: SupportChecker = Box::new(move |_uid, _cancel, callback| {
            *checks.borrow_mut() += 1;
            callback(SupportOutcome::Supported {
                ports: vec![Port::new(Subsystem::Tty, "option", "ttyUSB0", PortKind::AtPrimary, "uid-1")],
                capabilities: Capabilities::GSM_UMTS,
            });
        });
        let make_modem = Box::new(|uid: String, ports: Vec<Port>, capabilities: Capabilities| {
            Modem::new(uid, ports, capabilities, Box::new(|_event| {}))
        });
        let events_sink = events.clone();
        DeviceDiscoverer::new(
            PortFilter::default(),
            support_checker,
            make_modem,
            Box::new(move |event| events_sink.borrow_mut().push(event)),
        )
    }

    #[test]
    fn grouping_runs_one_support_check_and_emits_one_modem() {
        let events = Rc::new(RefCell::new(Vec::new()));
        let discoverer = discoverer(events.clone());

        discoverer.handle_event(add("uid-1", Subsystem::Tty, "ttyUSB0"));
        discoverer.handle_event(add("uid-1", Subsystem::Tty, "ttyUSB1"));
        discoverer.handle_event(add("uid-1", Subsystem::Net, "wwan0"));

        let events = events.borrow();
        assert_eq!(events.len(), 1);
        assert!(matches!(events[0], DiscoveryEvent::ModemAdded(_)));
    }

    #[test]
    fn removing_one_of_several_ports_keeps_modem() {
        let events = Rc::new(RefCell::new(Vec::new()));
        let discoverer = discoverer(events.clone());

        discoverer.handle_event(add("uid-1", Subsystem::Tty, "ttyUSB0"));
        discoverer.handle_event(add("uid-1", Subsystem::Tty, "ttyUSB1"));
        discoverer.handle_event(remove("uid-1", Subsystem::Tty, "ttyUSB0"));

        assert!(!events.borrow().iter().any(|event| matches!(event, DiscoveryEvent::ModemRemoved { .. })));
    }

    #[test]
    fn removing_every_port_destroys_modem() {
        let events = Rc::new(RefCell::new(Vec::new()));
        let discoverer = discoverer(events.clone());

        discoverer.handle_event(add("uid-1", Subsystem::Tty, "ttyUSB0"));
        discoverer.handle_event(remove("uid-1", Subsystem::Tty, "ttyUSB0"));

        let events = events.borrow();
        assert!(events.iter().any(|event| matches!(event, DiscoveryEvent::ModemRemoved { uid } if uid == "uid-1")));
    }

    #[test]
    fn usb_interface_remove_without_usb_device_devtype_is_ignored() {
        let events = Rc::new(RefCell::new(Vec::new()));
        let discoverer = discoverer(events.clone());

        discoverer.handle_event(add("uid-1", Subsystem::Usb, "2-1"));
        let mut interface_remove = remove("uid-1", Subsystem::Usb, "2-1");
        interface_remove.usb_device_remove = false;
        discoverer.handle_event(interface_remove);

        assert!(!events.borrow().iter().any(|event| matches!(event, DiscoveryEvent::ModemRemoved { .. })));
    }

    #[test]
    fn non_candidate_add_is_treated_as_removal() {
        let events = Rc::new(RefCell::new(Vec::new()));
        let discoverer = discoverer(events.clone());

        discoverer.handle_event(add("uid-1", Subsystem::Tty, "ttyUSB0"));
        let mut lost_marker = add("uid-1", Subsystem::Tty, "ttyUSB0");
        lost_marker.candidate = false;
        discoverer.handle_event(lost_marker);

        let events = events.borrow();
        assert!(events.iter().any(|event| matches!(event, DiscoveryEvent::ModemRemoved { uid } if uid == "uid-1")));
    }

    #[test]
    fn filtered_driver_never_starts_support_check() {
        let events = Rc::new(RefCell::new(Vec::new()));
        let filter = PortFilter::new(vec![], vec![Rule { subsystem: None, driver: Some("option".into()) }]);
        let support_checker: SupportChecker = Box::new(|_uid, _cancel, _callback| panic!("filtered port reached support check"));
        let make_modem = Box::new(|uid: String, ports: Vec<Port>, capabilities: Capabilities| {
            Modem::new(uid, ports, capabilities, Box::new(|_event| {}))
        });
        let events_sink = events.clone();
        let discoverer = DeviceDiscoverer::new(
            filter,
            support_checker,
            make_modem,
            Box::new(move |event| events_sink.borrow_mut().push(event)),
        );

        discoverer.handle_event(add("uid-1", Subsystem::Tty, "ttyUSB0"));
        assert!(events.borrow().is_empty());
    }
}

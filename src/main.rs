//! Daemon entry point: wires kernel hotplug discovery to a running
//! `calloop` event loop.
//!
//! The DBus/IPC binding layer, the `mmcli`-equivalent CLI, and
//! vendor-specific plugin quirk code all live outside this crate (see the
//! crate-level docs); this binary is a minimal standalone host for the
//! library that logs modem lifecycle events instead of publishing them
//! over DBus, and claims every candidate device with a single generic
//! port classifier instead of a vendor-plugin registry.

use std::env;
use std::os::unix::io::AsRawFd;
use std::path::PathBuf;
use std::process;

use calloop::signals::{Signal, Signals};
use calloop::EventLoop;
use modemd::cancel::CancelToken;
use modemd::config::Config;
use modemd::discovery::{
    hotplug_event_from_monitor, DeviceDiscoverer, DiscoveryEvent, PortFilter, SupportCallback, SupportOutcome,
};
use modemd::modem::{Capabilities, Modem, ModemEvent};
use modemd::port::{Port, PortKind, Subsystem};
use tracing::{debug, error, info, warn};
use tracing_subscriber::EnvFilter;
use udev::MonitorBuilder;

const DEFAULT_CONFIG_PATH: &str = "/etc/modemd.toml";

fn main() {
    let config_path =
        env::args().nth(1).map(PathBuf::from).unwrap_or_else(|| PathBuf::from(DEFAULT_CONFIG_PATH));

    let config = match Config::load(&config_path) {
        Ok(config) => config,
        Err(err) => {
            eprintln!("Error: failed to load config from {}: {err}", config_path.display());
            process::exit(1);
        },
    };

    init_logging(&config);

    if let Err(err) = run(config) {
        error!("daemon exited with error: {err}");
        process::exit(1);
    }
}

fn init_logging(config: &Config) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(config.log_level.as_tracing_level().to_string()));
    tracing_subscriber::fmt().with_env_filter(filter).init();
}

fn run(config: Config) -> modemd::Result<()> {
    let mut event_loop: EventLoop<'static, ()> =
        EventLoop::try_new().map_err(|err| modemd::CoreError::Failed(err.to_string()))?;
    let handle = event_loop.handle();

    // SIGINT/SIGTERM drain the loop gracefully instead of killing the
    // process mid-command, letting in-flight serial writes finish.
    let loop_signal = event_loop.get_signal();
    let signals = Signals::new(&[Signal::SIGINT, Signal::SIGTERM])
        .map_err(|err| modemd::CoreError::Failed(err.to_string()))?;
    handle
        .insert_source(signals, move |_event, _metadata, ()| {
            info!("received shutdown signal");
            loop_signal.stop();
        })
        .map_err(|err| modemd::CoreError::Failed(err.to_string()))?;

    let discoverer = new_discoverer(config.port_filter().clone());

    // udev hotplug monitor, registered as a raw-fd calloop source.
    let monitor = MonitorBuilder::new()
        .map_err(|err| modemd::CoreError::Failed(err.to_string()))?
        .match_subsystem("tty")
        .map_err(|err| modemd::CoreError::Failed(err.to_string()))?
        .match_subsystem("net")
        .map_err(|err| modemd::CoreError::Failed(err.to_string()))?
        .match_subsystem("usb")
        .map_err(|err| modemd::CoreError::Failed(err.to_string()))?
        .match_subsystem("usbmisc")
        .map_err(|err| modemd::CoreError::Failed(err.to_string()))?
        .listen()
        .map_err(|err| modemd::CoreError::Failed(err.to_string()))?;

    let monitor_discoverer = discoverer.clone();
    let monitor_fd = monitor.as_raw_fd();
    let generic = calloop::generic::Generic::new(monitor_fd, calloop::Interest::READ, calloop::Mode::Level);
    let mut monitor = monitor;
    handle
        .insert_source(generic, move |_readiness, _metadata, ()| {
            for event in monitor.by_ref() {
                if let Some(hotplug) = hotplug_event_from_monitor(&event) {
                    monitor_discoverer.handle_event(hotplug);
                }
            }
            Ok(calloop::PostAction::Continue)
        })
        .map_err(|err| modemd::CoreError::Failed(err.to_string()))?;

    // Pick up modems already plugged in before the daemon started.
    discoverer.manual_scan()?;

    info!("modemd started, watching for modem hotplug events");
    event_loop.run(None, &mut (), |_| {}).map_err(|err| modemd::CoreError::Failed(err.to_string()))?;
    info!("modemd shut down");

    Ok(())
}

/// Build a `DeviceDiscoverer` wired to the generic port classifier and an
/// event sink that logs modem lifecycle through `tracing` in place of the
/// out-of-scope DBus publication layer.
fn new_discoverer(filter: PortFilter) -> DeviceDiscoverer {
    let support_checker = Box::new(generic_support_check);
    let make_modem = Box::new(|uid: String, ports: Vec<Port>, capabilities: Capabilities| {
        let uid_for_events = uid.clone();
        Modem::new(
            uid,
            ports,
            capabilities,
            Box::new(move |event| log_modem_event(&uid_for_events, event)),
        )
    });
    let events = Box::new(log_discovery_event);

    DeviceDiscoverer::new(filter, support_checker, make_modem, events)
}

/// Generic classifier standing in for the out-of-scope vendor-plugin
/// registry: every candidate device is claimed, with ports assigned roles
/// purely from their kernel subsystem. Real vendor plugins additionally
/// probe with AT/QMI/MBIM commands to disambiguate secondary ports (GPS,
/// QCDM, audio) and to reject devices no plugin recognizes; that probing
/// is exactly the collaborator this crate treats as external. The checker
/// re-enumerates udev for `uid` since `DeviceDiscoverer` only tracks bare
/// (subsystem, name) identities internally, not full port records.
fn generic_support_check(uid: &str, _cancel: CancelToken, callback: SupportCallback) {
    debug!(uid, "generic classifier claiming device");

    let ports = match ports_for_uid(uid) {
        Ok(ports) => ports,
        Err(err) => {
            warn!(uid, %err, "generic classifier failed to enumerate ports, skipping device");
            callback(SupportOutcome::Unsupported);
            return;
        },
    };

    if ports.is_empty() {
        callback(SupportOutcome::Unsupported);
        return;
    }

    callback(SupportOutcome::Supported { ports, capabilities: Capabilities::GSM_UMTS | Capabilities::LTE });
}

/// Collect and classify every `tty`/`net`/`usbmisc` kernel port sharing
/// `uid`'s `ID_PATH`.
fn ports_for_uid(uid: &str) -> modemd::Result<Vec<Port>> {
    let mut ports = Vec::new();
    let mut has_primary = false;

    for subsystem_name in ["tty", "net", "usbmisc"] {
        let mut enumerator =
            udev::Enumerator::new().map_err(|err| modemd::CoreError::Failed(err.to_string()))?;
        enumerator
            .match_subsystem(subsystem_name)
            .map_err(|err| modemd::CoreError::Failed(err.to_string()))?;

        for device in enumerator.scan_devices().map_err(|err| modemd::CoreError::Failed(err.to_string()))? {
            let device_uid =
                device.property_value("ID_PATH").and_then(|v| v.to_str()).unwrap_or_default();
            if device_uid != uid {
                continue;
            }

            let Some(name) = device.sysname().to_str() else { continue };
            let driver = device.driver().and_then(|d| d.to_str()).unwrap_or("");
            let subsystem = match subsystem_name {
                "tty" => Subsystem::Tty,
                "net" => Subsystem::Net,
                _ if device.property_value("ID_USB_INTERFACE_NUM").is_some() => Subsystem::QmiCdev,
                _ => Subsystem::MbimCdev,
            };

            let port = classify_port(subsystem, driver, name, uid, has_primary);
            has_primary |= port.kind == PortKind::AtPrimary;
            ports.push(port);
        }
    }

    Ok(ports)
}

/// Classify a single kernel port: the first tty seen becomes the primary
/// AT port, subsequent ttys are secondary, net/QMI/MBIM cdevs map
/// straight across.
fn classify_port(subsystem: Subsystem, driver: &str, name: &str, uid: &str, has_primary: bool) -> Port {
    let kind = match subsystem {
        Subsystem::Tty if !has_primary => PortKind::AtPrimary,
        Subsystem::Tty => PortKind::AtSecondary,
        Subsystem::Net => PortKind::Net,
        Subsystem::QmiCdev => PortKind::Qmi,
        Subsystem::MbimCdev => PortKind::Mbim,
        Subsystem::Usb => PortKind::Ignored,
    };
    Port::new(subsystem, driver, name, kind, uid)
}

fn log_discovery_event(event: DiscoveryEvent) {
    match event {
        DiscoveryEvent::ModemAdded(modem) => {
            info!(uid = %modem.uid(), capabilities = ?modem.capabilities(), "modem added");
        },
        DiscoveryEvent::ModemRemoved { uid } => {
            info!(%uid, "modem removed");
        },
    }
}

fn log_modem_event(uid: &str, event: ModemEvent) {
    match event {
        ModemEvent::StateChanged { old, new, reason } => {
            info!(uid, ?old, ?new, %reason, "modem state changed");
        },
        ModemEvent::Sms(event) => {
            warn!(uid, ?event, "sms event");
        },
    }
}

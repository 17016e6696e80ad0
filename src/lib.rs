//! Per-modem runtime for cellular modem control.
//!
//! This crate implements the subsystems that turn a freshly detected pile
//! of kernel ports into an operated cellular modem: the AT command engine
//! ([`serial`]), the QMI/MBIM transport ([`proto`]), the sequenced command
//! runner ([`runner`]), the bearer connection state machine ([`bearer`]),
//! the SMS list and multipart reassembly engine ([`sms`]), and the
//! device-discovery orchestrator ([`discovery`]) that ties them together
//! under a [`modem::Modem`] aggregate root.
//!
//! The DBus/IPC binding layer, the CLI, plugin `.so` loading, and
//! vendor-specific plugin quirk code are out of scope: this crate exposes
//! a typed Rust API and event stream for a binding layer to build on.

pub mod bearer;
pub mod cancel;
pub mod config;
pub mod discovery;
pub mod error;
pub mod mbim;
pub mod modem;
pub mod port;
pub mod proto;
pub mod runner;
pub mod serial;
pub mod sms;

pub use error::{CoreError, MeError, ModemError, Result};
pub use modem::{Modem, ModemEvent};

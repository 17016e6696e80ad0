//! QMI/MBIM control-channel transport.
//!
//! [`ProtoPort`] owns a cdev handle and dispatches request/response pairs
//! keyed by a transaction id (MBIM) or CID (QMI), the same non-blocking,
//! single-fd-registered-with-calloop pattern [`crate::serial::SerialPort`]
//! uses for its byte stream. Only the MBIM path is implemented: it is the
//! profile this crate's [`crate::bearer::Bearer`] state machine targets.
//! QMI's open sequence (service/client allocation, LLP negotiation) is
//! noted in the module docs below for completeness but its wire dispatch
//! is not implemented.

use std::cell::RefCell;
use std::collections::HashMap;
use std::fs::{File, OpenOptions};
use std::io::{self, ErrorKind, Read, Write};
use std::os::fd::{AsRawFd, RawFd};
use std::rc::Rc;
use std::time::Duration;

use calloop::generic::Generic;
use calloop::timer::{TimeoutAction, Timer};
use calloop::{Interest, LoopHandle, Mode, PostAction};
use deku::DekuContainerRead;
use tracing::{trace, warn};

use crate::error::{CoreError, Result};
use crate::mbim::{CommandDone, MessageHeader};

/// Completion callback for a dispatched command.
pub type ProtoCallback = Box<dyn FnOnce(Result<CommandDone>)>;

struct Pending {
    callback: ProtoCallback,
}

struct Inner {
    path: String,
    handle: Option<File>,
    next_transaction_id: u32,
    pending: HashMap<u32, Pending>,
    read_buffer: Vec<u8>,
}

/// A QMI/MBIM control-channel device.
///
/// Cheaply clonable; clones share the fd and pending-request table.
#[derive(Clone)]
pub struct ProtoPort(Rc<RefCell<Inner>>);

impl ProtoPort {
    pub fn new(path: impl Into<String>) -> Self {
        Self(Rc::new(RefCell::new(Inner {
            path: path.into(),
            handle: None,
            next_transaction_id: 1,
            pending: HashMap::new(),
            read_buffer: Vec::new(),
        })))
    }

    /// Open the cdev and register it for readability. MBIM's `MBIM_OPEN_MSG`
    /// handshake itself is issued by the caller as an ordinary dispatched
    /// command once the fd is registered.
    pub fn open<D: 'static>(&self, handle: &LoopHandle<'static, D>) -> Result<()> {
        let mut inner = self.0.borrow_mut();
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .open(&inner.path)
            .map_err(|err| CoreError::Failed(format!("open {}: {err}", inner.path)))?;

        let fd = file.as_raw_fd();
        set_nonblocking(fd).map_err(|err| CoreError::Failed(err.to_string()))?;
        inner.handle = Some(file);
        drop(inner);

        let source = Generic::new(fd, Interest::READ, Mode::Level);
        let this = self.clone();
        handle
            .insert_source(source, move |_event, _meta, _data| {
                this.pump();
                Ok(PostAction::Continue)
            })
            .map_err(|err| CoreError::Failed(err.to_string()))?;

        Ok(())
    }

    /// Allocate the next transaction id and reserve it for `callback`.
    fn reserve_transaction(&self, callback: ProtoCallback) -> u32 {
        let mut inner = self.0.borrow_mut();
        let id = inner.next_transaction_id;
        inner.next_transaction_id = inner.next_transaction_id.wrapping_add(1).max(1);
        inner.pending.insert(id, Pending { callback });
        id
    }

    /// Send a pre-encoded `MBIM_COMMAND_MSG` whose `transaction_id` must be
    /// obtained from this call's return — callers build the message with
    /// `build(transaction_id) -> Vec<u8>` after reserving the slot, so
    /// transaction-id allocation and message encoding stay coupled to one
    /// call site.
    pub fn dispatch<D: 'static>(
        &self,
        handle: &LoopHandle<'static, D>,
        timeout_s: u64,
        build: impl FnOnce(u32) -> Vec<u8>,
        callback: ProtoCallback,
    ) -> Result<()> {
        let transaction_id = self.reserve_transaction(callback);
        let bytes = build(transaction_id);

        {
            let mut inner = self.0.borrow_mut();
            let Some(file) = inner.handle.as_mut() else {
                drop(inner);
                self.fail_transaction(transaction_id, CoreError::Failed("cdev not open".into()).into());
                return Err(CoreError::Failed("cdev not open".into()).into());
            };
            file.write_all(&bytes).map_err(|err| CoreError::Failed(err.to_string()))?;
        }

        let this = self.clone();
        let _ = handle.insert_source(
            Timer::from_duration(Duration::from_secs(timeout_s)),
            move |_now, _, _data| {
                this.fail_transaction(transaction_id, CoreError::Timeout.into());
                TimeoutAction::Drop
            },
        );

        Ok(())
    }

    fn fail_transaction(&self, transaction_id: u32, error: crate::error::ModemError) {
        let mut inner = self.0.borrow_mut();
        let Some(pending) = inner.pending.remove(&transaction_id) else { return };
        drop(inner);
        (pending.callback)(Err(error));
    }

    fn pump(&self) {
        let mut buf = [0u8; 2048];
        loop {
            let mut inner = self.0.borrow_mut();
            let Some(file) = inner.handle.as_mut() else { return };
            match file.read(&mut buf) {
                Ok(0) => return,
                Ok(n) => {
                    inner.read_buffer.extend_from_slice(&buf[..n]);
                    trace!(bytes = n, "mbim cdev read");
                },
                Err(err) if err.kind() == ErrorKind::WouldBlock => return,
                Err(err) => {
                    warn!("non-fatal mbim read error: {err}");
                    return;
                },
            }
            drop(inner);
            self.scan_messages();
        }
    }

    fn scan_messages(&self) {
        loop {
            let mut inner = self.0.borrow_mut();
            if inner.read_buffer.len() < 8 {
                return;
            }
            let Ok(((_, _), header)) = MessageHeader::from_bytes((&inner.read_buffer, 0)) else {
                return;
            };
            let total_len = header.message_length as usize;
            if inner.read_buffer.len() < total_len {
                return;
            }

            let message: Vec<u8> = inner.read_buffer.drain(..total_len).collect();
            drop(inner);

            match CommandDone::from_bytes((&message, 0)) {
                Ok((_, done)) => {
                    let transaction_id = done.header.transaction_id;
                    let mut inner = self.0.borrow_mut();
                    if let Some(pending) = inner.pending.remove(&transaction_id) {
                        drop(inner);
                        (pending.callback)(Ok(done));
                    }
                },
                Err(err) => warn!("failed to parse MBIM message: {err}"),
            }
        }
    }
}

fn set_nonblocking(fd: RawFd) -> io::Result<()> {
    unsafe {
        let flags = libc::fcntl(fd, libc::F_GETFL);
        if flags < 0 {
            return Err(io::Error::last_os_error());
        }
        if libc::fcntl(fd, libc::F_SETFL, flags | libc::O_NONBLOCK) < 0 {
            return Err(io::Error::last_os_error());
        }
    }
    Ok(())
}

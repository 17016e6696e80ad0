//! Byte-stream + AT command queue atop a TTY.
//!
//! [`SerialPort`] carries an ordered stream of AT-style command/response
//! transactions without ever interleaving two commands on the wire, while
//! tolerating modems that are slow, chatty, or drop bytes.
//!
//! There is no async runtime in this crate: the command lifecycle is an
//! explicit state machine advanced by calloop callbacks — fd readability, a
//! per-command timeout timer, and a per-byte send timer — rather than a
//! polled `Future`.

use std::cell::RefCell;
use std::collections::{HashMap, VecDeque};
use std::io::{self, ErrorKind, Read, Write};
use std::os::fd::{AsRawFd, RawFd};
use std::rc::Rc;
use std::time::Duration;

use calloop::generic::Generic;
use calloop::timer::{TimeoutAction, Timer};
use calloop::{Interest, LoopHandle, Mode, PostAction};
use tracing::{debug, trace, warn};

use crate::cancel::CancelToken;
use crate::error::{CoreError, MeError, ModemError, Result, SerialError};
use crate::port::Port;

/// Response buffer size above which `buffer-full` handling kicks in.
const BUF_MAX: usize = 2048;

/// Known unsolicited result code prefixes, scanned for on every buffer
/// change. Vendor-specific URCs are not handled here; this is the common
/// 3GPP subset.
const URC_PREFIXES: &[&[u8]] = &[b"+CRING", b"RING", b"+CMTI:", b"+CREG:", b"+CGREG:", b"+CMT:"];

/// Completion callback for a queued command.
pub type Callback = Box<dyn FnOnce(Result<Vec<u8>>)>;

/// Callback invoked for every unsolicited line observed on the port.
pub type UrcSink = Box<dyn FnMut(Vec<u8>)>;

/// Notifications external observers (plugins, logging) care about.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PortEvent {
    ForcedClose,
    TimedOut { consecutive_timeouts: u32 },
    BufferFull,
}

/// Callback invoked for every [`PortEvent`].
pub type EventSink = Box<dyn FnMut(PortEvent)>;

/// One AT command submission.
pub struct AtCommand {
    pub text: Vec<u8>,
    pub timeout_s: u32,
    pub is_raw: bool,
    pub allow_cached: bool,
    pub cancellable: Option<CancelToken>,
}

impl AtCommand {
    pub fn new(text: impl Into<Vec<u8>>, timeout_s: u32) -> Self {
        Self { text: text.into(), timeout_s, is_raw: false, allow_cached: false, cancellable: None }
    }

    pub fn raw(mut self, is_raw: bool) -> Self {
        self.is_raw = is_raw;
        self
    }

    pub fn cached(mut self, allow_cached: bool) -> Self {
        self.allow_cached = allow_cached;
        self
    }

    pub fn cancellable(mut self, token: CancelToken) -> Self {
        self.cancellable = Some(token);
        self
    }
}

enum SendState {
    /// Whole command written in one shot (`send_delay_us == 0`).
    Bulk,
    /// Byte-by-byte, paced by a per-byte timer.
    Paced { next_byte: usize },
}

struct PendingCommand {
    cmd: AtCommand,
    callback: Option<Callback>,
    send: SendState,
    eagain_budget: u32,
}

/// Terminal reply classification from [`scan_terminal_reply`].
enum Terminal {
    Ok,
    Error(ModemError),
}

struct Inner {
    port: Port,
    path: String,
    baud: u32,
    send_delay_us: u64,
    flash_ok: bool,
    spew_control: bool,

    open_count: u32,
    forced_closed: bool,
    handle: Option<Box<dyn serialport::SerialPort>>,

    queue: VecDeque<PendingCommand>,
    response_buffer: Vec<u8>,
    reply_cache: HashMap<Vec<u8>, Vec<u8>>,
    consecutive_timeouts: u32,

    /// Bumped every time a new head command enters `AwaitingResponse`, so a
    /// stale timer firing after the command already completed is a no-op.
    generation: u64,

    events: EventSink,
    urc_sink: Option<UrcSink>,
}

/// A TTY port with an ordered AT command queue.
///
/// Cheaply clonable; all clones share the same underlying queue/fd state.
#[derive(Clone)]
pub struct SerialPort(Rc<RefCell<Inner>>);

impl SerialPort {
    pub fn new(
        port: Port,
        path: impl Into<String>,
        baud: u32,
        send_delay_us: u64,
        flash_ok: bool,
        spew_control: bool,
        events: EventSink,
    ) -> Self {
        Self(Rc::new(RefCell::new(Inner {
            port,
            path: path.into(),
            baud,
            send_delay_us,
            flash_ok,
            spew_control,
            open_count: 0,
            forced_closed: false,
            handle: None,
            queue: VecDeque::new(),
            response_buffer: Vec::new(),
            reply_cache: HashMap::new(),
            consecutive_timeouts: 0,
            generation: 0,
            events,
            urc_sink: None,
        })))
    }

    pub fn set_urc_sink(&self, sink: UrcSink) {
        self.0.borrow_mut().urc_sink = Some(sink);
    }

    /// Reference-counted open: the first call performs termios
    /// configuration and opens the device; later calls just bump the
    /// refcount. Callers must follow the first `open()` with
    /// [`SerialPort::register`] to start receiving bytes.
    pub fn open<D: 'static>(&self, _handle: &LoopHandle<'static, D>) -> Result<()> {
        let mut inner = self.0.borrow_mut();
        if inner.forced_closed {
            return Err(SerialError::OpenFailed("port was force-closed".into()).into());
        }

        if inner.open_count == 0 {
            let tty = serialport::new(&inner.path, inner.baud)
                .timeout(Duration::from_millis(0))
                .open()
                .map_err(|err| match err.kind() {
                    serialport::ErrorKind::NoDevice => SerialError::OpenFailedNoDevice,
                    _ => SerialError::OpenFailed(err.to_string()),
                })?;

            let fd = tty.as_raw_fd();
            set_nonblocking(fd)?;
            acquire_exclusive(fd)?;

            inner.handle = Some(tty);
        }

        inner.open_count += 1;
        Ok(())
    }

    /// Reference-counted close: only the last close actually releases `fd`.
    pub fn close(&self) {
        let mut inner = self.0.borrow_mut();
        if inner.forced_closed || inner.open_count == 0 {
            return;
        }
        inner.open_count -= 1;
        if inner.open_count == 0 {
            inner.handle = None;
        }
    }

    /// Synchronously empty the queue, fail pending commands with
    /// `PortClosed`, and disallow further opens. Emits `forced-close`
    /// exactly once.
    pub fn force_close(&self) {
        let mut inner = self.0.borrow_mut();
        if inner.forced_closed {
            return;
        }
        inner.forced_closed = true;
        inner.open_count = 0;
        inner.handle = None;
        inner.generation += 1;

        let pending: Vec<PendingCommand> = inner.queue.drain(..).collect();
        (inner.events)(PortEvent::ForcedClose);
        drop(inner);

        for mut cmd in pending {
            if let Some(cb) = cmd.callback.take() {
                cb(Err(SerialError::PortClosed.into()));
            }
        }
    }

    /// Record the current open count, close fully, wait, then reopen the
    /// same number of times.
    pub fn reopen<D: 'static>(&self, after: Duration, handle: &LoopHandle<'static, D>) -> Result<()> {
        let times = self.0.borrow().open_count;
        for _ in 0..times {
            self.close();
        }

        let this = self.clone();
        let handle_clone = handle.clone();
        handle
            .insert_source(Timer::from_duration(after), move |_now, _, _data| {
                for _ in 0..times {
                    let _ = this.open(&handle_clone);
                }
                TimeoutAction::Drop
            })
            .map_err(|err| ModemError::from(CoreError::Failed(err.to_string())))?;
        Ok(())
    }

    /// Briefly drop baud to 0, then restore it. A no-op if `flash_ok` is
    /// false.
    pub fn flash<D: 'static>(&self, duration: Duration, handle: &LoopHandle<'static, D>) -> Result<()> {
        let mut inner = self.0.borrow_mut();
        if !inner.flash_ok {
            return Ok(());
        }
        let Some(tty) = inner.handle.as_mut() else {
            return Err(SerialError::PortNotOpen.into());
        };
        let original = inner.baud;
        let _ = tty.set_baud_rate(0);
        drop(inner);

        let this = self.clone();
        handle
            .insert_source(Timer::from_duration(duration), move |_now, _, _data| {
                if let Some(tty) = this.0.borrow_mut().handle.as_mut() {
                    let _ = tty.set_baud_rate(original);
                }
                TimeoutAction::Drop
            })
            .map_err(|err| ModemError::from(CoreError::Failed(err.to_string())))?;
        Ok(())
    }

    /// Enqueue a command. If `allow_cached` and a cached reply exists, the
    /// callback fires synchronously without touching the wire.
    pub fn queue_command<D: 'static>(
        &self,
        cmd: AtCommand,
        handle: &LoopHandle<'static, D>,
        callback: Callback,
    ) -> Result<()> {
        if cmd.timeout_s == 0 {
            return Err(CoreError::Timeout.into());
        }

        let mut inner = self.0.borrow_mut();
        if inner.forced_closed {
            return Err(SerialError::PortClosed.into());
        }
        if inner.port.connected {
            return Err(SerialError::PortConnected.into());
        }
        if inner.open_count == 0 {
            return Err(SerialError::PortNotOpen.into());
        }

        if cmd.allow_cached {
            if let Some(cached) = inner.reply_cache.get(&cmd.text).cloned() {
                drop(inner);
                callback(Ok(cached));
                return Ok(());
            }
        } else {
            inner.reply_cache.remove(&cmd.text);
        }

        let was_empty = inner.queue.is_empty();
        inner.queue.push_back(PendingCommand {
            cmd,
            callback: Some(callback),
            send: SendState::Bulk,
            eagain_budget: 0,
        });
        drop(inner);

        if was_empty {
            self.advance(handle);
        }
        Ok(())
    }

    /// Start sending the head-of-queue command if it isn't already in
    /// flight.
    fn advance<D: 'static>(&self, handle: &LoopHandle<'static, D>) {
        loop {
            let mut inner = self.0.borrow_mut();
            let Some(head) = inner.queue.front() else { return };

            if head.cmd.cancellable.as_ref().is_some_and(CancelToken::is_cancelled) {
                let mut cmd = inner.queue.pop_front().unwrap();
                drop(inner);
                if let Some(cb) = cmd.callback.take() {
                    cb(Err(CoreError::Cancelled.into()));
                }
                continue;
            }

            let send_delay_us = inner.send_delay_us;
            let eagain_budget_max =
                if send_delay_us == 0 { 1000 } else { (3_000_000 / send_delay_us).max(1) as u32 };
            drop(inner);

            if send_delay_us == 0 {
                self.send_bulk(handle, eagain_budget_max);
            } else {
                self.send_paced_byte(handle, eagain_budget_max);
            }
            return;
        }
    }

    fn send_bulk<D: 'static>(&self, handle: &LoopHandle<'static, D>, eagain_budget_max: u32) {
        let mut inner = self.0.borrow_mut();
        let Some(tty) = inner.handle.as_mut() else {
            drop(inner);
            self.fail_head(SerialError::PortNotOpen.into());
            return;
        };

        let Some(head) = inner.queue.front_mut() else { return };
        match tty.write_all(&head.cmd.text) {
            Ok(()) => {
                drop(inner);
                self.start_awaiting_response(handle);
            },
            Err(err) if err.kind() == ErrorKind::WouldBlock => {
                head.eagain_budget += 1;
                if head.eagain_budget >= eagain_budget_max {
                    drop(inner);
                    self.timeout_head(handle);
                } else {
                    drop(inner);
                    self.retry_send(handle, Duration::from_micros(1));
                }
            },
            Err(err) => {
                drop(inner);
                self.fail_head(SerialError::PortSendFailed(err.to_string()).into());
            },
        }
    }

    fn send_paced_byte<D: 'static>(&self, handle: &LoopHandle<'static, D>, eagain_budget_max: u32) {
        let mut inner = self.0.borrow_mut();
        let send_delay_us = inner.send_delay_us;
        let Some(tty) = inner.handle.as_mut() else {
            drop(inner);
            self.fail_head(SerialError::PortNotOpen.into());
            return;
        };

        let Some(head) = inner.queue.front_mut() else { return };
        let next_byte = match &head.send {
            SendState::Paced { next_byte } => *next_byte,
            SendState::Bulk => 0,
        };

        if next_byte >= head.cmd.text.len() {
            drop(inner);
            self.start_awaiting_response(handle);
            return;
        }

        let byte = [head.cmd.text[next_byte]];
        match tty.write_all(&byte) {
            Ok(()) => {
                head.send = SendState::Paced { next_byte: next_byte + 1 };
                head.eagain_budget = 0;
                drop(inner);
                self.retry_send(handle, Duration::from_micros(send_delay_us));
            },
            Err(err) if err.kind() == ErrorKind::WouldBlock => {
                head.eagain_budget += 1;
                if head.eagain_budget >= eagain_budget_max {
                    drop(inner);
                    self.timeout_head(handle);
                } else {
                    drop(inner);
                    self.retry_send(handle, Duration::from_micros(send_delay_us.max(1)));
                }
            },
            Err(err) => {
                drop(inner);
                self.fail_head(SerialError::PortSendFailed(err.to_string()).into());
            },
        }
    }

    fn retry_send<D: 'static>(&self, handle: &LoopHandle<'static, D>, after: Duration) {
        let this = self.clone();
        let handle_clone = handle.clone();
        let _ = handle.insert_source(Timer::from_duration(after), move |_now, _, _data| {
            let eagain_budget_max = {
                let inner = this.0.borrow();
                let send_delay_us = inner.send_delay_us;
                if send_delay_us == 0 { 1000 } else { (3_000_000 / send_delay_us).max(1) as u32 }
            };
            let send_delay_us = this.0.borrow().send_delay_us;
            if send_delay_us == 0 {
                this.send_bulk(&handle_clone, eagain_budget_max);
            } else {
                this.send_paced_byte(&handle_clone, eagain_budget_max);
            }
            TimeoutAction::Drop
        });
    }

    fn start_awaiting_response<D: 'static>(&self, handle: &LoopHandle<'static, D>) {
        let mut inner = self.0.borrow_mut();
        inner.generation += 1;
        let generation = inner.generation;
        let Some(head) = inner.queue.front() else { return };
        let timeout_s = head.cmd.timeout_s;
        let cancellable = head.cmd.cancellable.clone();
        drop(inner);

        let this = self.clone();
        let handle_clone = handle.clone();
        let _ = handle.insert_source(
            Timer::from_duration(Duration::from_secs(timeout_s as u64)),
            move |_now, _, _data| {
                this.on_timeout(generation, &handle_clone);
                TimeoutAction::Drop
            },
        );

        if let Some(cancellable) = cancellable {
            let this = self.clone();
            let handle_clone = handle.clone();
            cancellable.on_cancel(move || this.on_cancel(generation, &handle_clone));
        }
    }

    fn on_cancel<D: 'static>(&self, generation: u64, handle: &LoopHandle<'static, D>) {
        let mut inner = self.0.borrow_mut();
        if inner.generation != generation {
            return;
        }
        inner.generation += 1;
        let Some(mut cmd) = inner.queue.pop_front() else { return };
        drop(inner);
        if let Some(cb) = cmd.callback.take() {
            cb(Err(CoreError::Cancelled.into()));
        }
        self.advance(handle);
    }

    fn on_timeout<D: 'static>(&self, generation: u64, handle: &LoopHandle<'static, D>) {
        {
            let inner = self.0.borrow();
            if inner.generation != generation {
                return;
            }
        }
        self.timeout_head(handle);
    }

    fn timeout_head<D: 'static>(&self, handle: &LoopHandle<'static, D>) {
        let mut inner = self.0.borrow_mut();
        inner.consecutive_timeouts += 1;
        let consecutive_timeouts = inner.consecutive_timeouts;
        inner.generation += 1;
        // The response buffer is left untouched on timeout — a late
        // response may be misattributed to the next command.
        let mut cmd = match inner.queue.pop_front() {
            Some(cmd) => cmd,
            None => return,
        };
        (inner.events)(PortEvent::TimedOut { consecutive_timeouts });
        drop(inner);

        if let Some(cb) = cmd.callback.take() {
            cb(Err(SerialError::SerialTimeout.into()));
        }
        self.advance(handle);
    }

    fn fail_head(&self, error: ModemError) {
        let mut inner = self.0.borrow_mut();
        let Some(mut cmd) = inner.queue.pop_front() else { return };
        drop(inner);
        if let Some(cb) = cmd.callback.take() {
            cb(Err(error));
        }
    }

    /// Drain whatever is available on the fd, process terminal replies and
    /// URCs. Called from the registered `Generic` source.
    fn pump<D: 'static>(&self, handle: &LoopHandle<'static, D>) {
        let mut buf = [0u8; 512];
        loop {
            let mut inner = self.0.borrow_mut();
            let Some(tty) = inner.handle.as_mut() else { return };
            match tty.read(&mut buf) {
                Ok(0) => {
                    drop(inner);
                    self.force_close();
                    return;
                },
                Ok(n) => {
                    inner.response_buffer.extend_from_slice(&buf[..n]);
                    trace!(bytes = n, "serial port read");
                },
                Err(err) if err.kind() == ErrorKind::WouldBlock => return,
                Err(err) => {
                    warn!("non-fatal serial read error: {err}");
                    return;
                },
            }
            drop(inner);
            self.scan_buffer(handle);
        }
    }

    fn scan_buffer<D: 'static>(&self, handle: &LoopHandle<'static, D>) {
        loop {
            let mut inner = self.0.borrow_mut();

            if let Some((consumed, line)) = next_urc_line(&inner.response_buffer) {
                let line = line.to_vec();
                inner.response_buffer.drain(..consumed);
                if let Some(sink) = inner.urc_sink.as_mut() {
                    sink(line);
                }
                continue;
            }

            let terminal = inner.queue.front().and_then(|_| scan_terminal_reply(&inner.response_buffer));
            let Some((end, terminal)) = terminal else {
                if inner.response_buffer.len() > BUF_MAX {
                    if inner.spew_control {
                        let half = inner.response_buffer.len() / 2;
                        inner.response_buffer.drain(..half);
                        (inner.events)(PortEvent::BufferFull);
                    }
                    // else: grow unbounded, per the documented boundary test.
                }
                return;
            };

            let slice: Vec<u8> = inner.response_buffer.drain(..end).collect();
            inner.consecutive_timeouts = 0;
            inner.generation += 1;
            let mut cmd = match inner.queue.pop_front() {
                Some(cmd) => cmd,
                None => return,
            };
            if cmd.cmd.allow_cached {
                if let Terminal::Ok = terminal {
                    inner.reply_cache.insert(cmd.cmd.text.clone(), slice.clone());
                }
            }
            drop(inner);

            let result = match terminal {
                Terminal::Ok => Ok(slice),
                Terminal::Error(err) => Err(err),
            };
            if let Some(cb) = cmd.callback.take() {
                cb(result);
            }
            self.advance(handle);
        }
    }

    /// Register this port's fd for readability with the event loop. Must
    /// be called once, after the first [`SerialPort::open`].
    pub fn register<D: 'static>(&self, handle: &LoopHandle<'static, D>) -> Result<()> {
        let fd = {
            let inner = self.0.borrow();
            let Some(tty) = inner.handle.as_ref() else {
                return Err(SerialError::PortNotOpen.into());
            };
            tty.as_raw_fd()
        };

        let source = Generic::new(fd, Interest::READ, Mode::Level);
        let this = self.clone();
        let handle_clone = handle.clone();
        handle
            .insert_source(source, move |_event, _meta, _data| {
                this.pump(&handle_clone);
                Ok(PostAction::Continue)
            })
            .map_err(|err| ModemError::from(CoreError::Failed(err.to_string())))?;
        Ok(())
    }

    pub fn port(&self) -> Port {
        self.0.borrow().port.clone()
    }

    pub fn is_open(&self) -> bool {
        self.0.borrow().open_count > 0
    }

    pub fn open_count(&self) -> u32 {
        self.0.borrow().open_count
    }

    pub fn set_connected(&self, connected: bool) {
        self.0.borrow_mut().port.connected = connected;
    }
}

fn set_nonblocking(fd: RawFd) -> Result<()> {
    unsafe {
        let flags = libc::fcntl(fd, libc::F_GETFL);
        if flags < 0 {
            return Err(SerialError::OpenFailed(io::Error::last_os_error().to_string()).into());
        }
        if libc::fcntl(fd, libc::F_SETFL, flags | libc::O_NONBLOCK) < 0 {
            return Err(SerialError::OpenFailed(io::Error::last_os_error().to_string()).into());
        }
    }
    Ok(())
}

fn acquire_exclusive(fd: RawFd) -> Result<()> {
    unsafe {
        if libc::ioctl(fd, libc::TIOCEXCL) < 0 {
            debug!("TIOCEXCL not supported on this fd");
        }
    }
    Ok(())
}

/// Find the next complete, CRLF-terminated unsolicited line at the start of
/// the buffer. Returns `(bytes consumed including CRLF, line without CRLF)`.
fn next_urc_line(buffer: &[u8]) -> Option<(usize, &[u8])> {
    let matches_prefix = URC_PREFIXES.iter().any(|p| buffer.starts_with(p));
    if !matches_prefix {
        return None;
    }
    let end = buffer.windows(2).position(|w| w == b"\r\n")?;
    Some((end + 2, &buffer[..end]))
}

/// Scan for a terminal AT reply (`OK`, `ERROR`, `+CME ERROR: n`,
/// `+CMS ERROR: n`) and classify it. Returns `(bytes consumed, Terminal)`.
fn scan_terminal_reply(buffer: &[u8]) -> Option<(usize, Terminal)> {
    const OK: &[u8] = b"OK\r\n";
    const ERROR: &[u8] = b"ERROR\r\n";

    if let Some(pos) = find_subslice(buffer, OK) {
        return Some((pos + OK.len(), Terminal::Ok));
    }
    if let Some(pos) = find_cme_error(buffer, b"+CME ERROR:") {
        return Some(pos);
    }
    if let Some(pos) = find_cme_error(buffer, b"+CMS ERROR:") {
        return Some(pos);
    }
    if let Some(pos) = find_subslice(buffer, ERROR) {
        return Some((pos + ERROR.len(), Terminal::Error(CoreError::Failed("ERROR".into()).into())));
    }
    None
}

fn find_cme_error(buffer: &[u8], prefix: &[u8]) -> Option<(usize, Terminal)> {
    let start = find_subslice(buffer, prefix)?;
    let rest = &buffer[start + prefix.len()..];
    let end = rest.windows(2).position(|w| w == b"\r\n")?;
    let code_str = String::from_utf8_lossy(&rest[..end]);
    let code: u32 = code_str.trim().parse().ok()?;
    let error = crate::error::GprsError::from_nw_error(code)
        .map(MeError::from)
        .map(ModemError::from)
        .unwrap_or_else(|| CoreError::Failed(format!("ME error {code}")).into());
    Some((start + prefix.len() + end + 2, Terminal::Error(error)))
}

fn find_subslice(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    haystack.windows(needle.len()).position(|w| w == needle)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn scans_ok() {
        let buf = b"\r\nOK\r\n".to_vec();
        let (end, terminal) = scan_terminal_reply(&buf).unwrap();
        assert_eq!(end, buf.len());
        assert!(matches!(terminal, Terminal::Ok));
    }

    #[test]
    fn scans_cme_error() {
        let buf = b"\r\n+CME ERROR: 30\r\n".to_vec();
        let (_, terminal) = scan_terminal_reply(&buf).unwrap();
        assert!(matches!(terminal, Terminal::Error(_)));
    }

    #[test]
    fn no_terminal_reply_yet() {
        let buf = b"\r\n+CSQ: 20,99\r\n".to_vec();
        assert!(scan_terminal_reply(&buf).is_none());
    }

    #[test]
    fn urc_prefix_detected() {
        let buf = b"+CMTI: \"ME\",3\r\n+CSQ: 1,2\r\n".to_vec();
        let (consumed, line) = next_urc_line(&buf).unwrap();
        assert_eq!(line, b"+CMTI: \"ME\",3");
        assert_eq!(consumed, line.len() + 2);
    }
}

//! Sequenced AT command execution.
//!
//! A [`CommandRunner`] drives an ordered list of `(AtCommand, Processor)`
//! pairs against a [`SerialPort`], one at a time, threading an optional
//! shared context through every step.

use std::rc::Rc;

use calloop::LoopHandle;

use crate::error::{ModemError, Result};
use crate::serial::{AtCommand, SerialPort};

/// Outcome of inspecting one step's response.
pub enum Step<T> {
    /// Keep running the sequence.
    Continue,
    /// Stop the sequence and resolve with this value.
    Done(T),
    /// Stop the sequence and resolve with this error.
    Abort(ModemError),
}

/// Inspects a command's raw response (or transport error) and decides
/// whether the sequence continues.
pub type Processor<T> = Box<dyn Fn(Result<Vec<u8>>) -> Step<T>>;

/// Return the response decoded as a lossy UTF-8 string; any transport
/// error aborts the sequence.
pub fn string() -> Processor<String> {
    Box::new(|result| match result {
        Ok(bytes) => Step::Done(String::from_utf8_lossy(&bytes).into_owned()),
        Err(err) => Step::Abort(err),
    })
}

/// Ignore the response; a transport error aborts the sequence.
pub fn no_result() -> Processor<()> {
    Box::new(|result| match result {
        Ok(_) => Step::Continue,
        Err(err) => Step::Abort(err),
    })
}

/// Ignore the response and any error — always continue. Used for
/// best-effort housekeeping commands.
pub fn no_result_continue() -> Processor<()> {
    Box::new(|_result| Step::Continue)
}

/// Swallow errors and continue; only a *successful* response stops the
/// sequence (used to probe for a feature by trying a command).
pub fn continue_on_error() -> Processor<Vec<u8>> {
    Box::new(|result| match result {
        Ok(bytes) => Step::Done(bytes),
        Err(_) => Step::Continue,
    })
}

/// One step of a command sequence.
pub struct CommandStep<T> {
    pub command: AtCommand,
    pub processor: Processor<T>,
}

/// Runs an ordered AT command sequence against a [`SerialPort`].
///
/// Halts on the first `Done` (resolving with its value) or `Abort`
/// (resolving with its error); reaching the end with only `Continue`s
/// resolves with `None`.
pub struct CommandRunner;

impl CommandRunner {
    /// Run `steps` in order against `port`, invoking `on_done` exactly
    /// once with the sequence's outcome.
    pub fn run<T: 'static, D: 'static>(
        port: SerialPort,
        steps: Vec<CommandStep<T>>,
        handle: LoopHandle<'static, D>,
        on_done: impl FnOnce(Result<Option<T>>) + 'static,
    ) {
        Self::run_from(port, steps, 0, handle, Rc::new(RefCellOnDone::new(on_done)));
    }

    fn run_from<T: 'static, D: 'static>(
        port: SerialPort,
        mut steps: Vec<CommandStep<T>>,
        index: usize,
        handle: LoopHandle<'static, D>,
        on_done: Rc<RefCellOnDone<T>>,
    ) {
        if index >= steps.len() {
            on_done.fire(Ok(None));
            return;
        }

        let step = steps.remove(index);
        let CommandStep { command, processor } = step;

        let port_clone = port.clone();
        let handle_clone = handle.clone();
        let queued = port.queue_command(
            command,
            &handle,
            Box::new(move |result| match processor(result) {
                Step::Continue => {
                    Self::run_from(port_clone, steps, index, handle_clone, on_done);
                },
                Step::Done(value) => on_done.fire(Ok(Some(value))),
                Step::Abort(error) => on_done.fire(Err(error)),
            }),
        );

        if let Err(error) = queued {
            on_done.fire(Err(error));
        }
    }
}

/// A `FnOnce` callback that must actually run exactly once but is shared
/// across several owned closures created per recursive step; `RefCell`
/// guards the `Option` so a double-fire (which would be a logic bug) panics
/// loudly instead of silently dropping the second result.
struct RefCellOnDone<T> {
    inner: std::cell::RefCell<Option<Box<dyn FnOnce(Result<Option<T>>)>>>,
}

impl<T> RefCellOnDone<T> {
    fn new(f: impl FnOnce(Result<Option<T>>) + 'static) -> Self {
        Self { inner: std::cell::RefCell::new(Some(Box::new(f))) }
    }

    fn fire(&self, result: Result<Option<T>>) {
        let callback = self.inner.borrow_mut().take().expect("CommandRunner resolved twice");
        callback(result);
    }
}

#[cfg(test)]
mod tests {
    use std::cell::RefCell;

    use calloop::EventLoop;

    use super::*;
    use crate::port::{Port, PortKind, Subsystem};

    fn test_port() -> SerialPort {
        let port = Port::new(Subsystem::Tty, "test", "ttyTest0", PortKind::AtPrimary, "uid-1");
        SerialPort::new(port, "/dev/null", 115200, 0, false, true, Box::new(|_event| {}))
    }

    #[test]
    fn empty_sequence_resolves_none() {
        let event_loop: EventLoop<'static, ()> = EventLoop::try_new().unwrap();
        let port = test_port();
        let result = Rc::new(RefCell::new(None));
        let result_clone = result.clone();

        let steps: Vec<CommandStep<String>> = Vec::new();
        CommandRunner::run(port, steps, event_loop.handle(), move |res| {
            *result_clone.borrow_mut() = Some(res);
        });

        assert!(matches!(*result.borrow(), Some(Ok(None))));
    }
}

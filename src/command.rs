//! Single-flight request/response correlation for one link.
//!
//! The protocol carries no correlation id. While a request is outstanding the next
//! inbound frame is taken as its response; with nothing outstanding a frame is
//! unsolicited telemetry. At most one request is in flight, a second one is refused
//! with [`Error::Busy`] rather than queued.
//!
//! The session does no I/O itself. [`CommandSession::issue`] hands back the frame to
//! write and [`CommandSession::deadline`] tells the owner when to call
//! [`CommandSession::on_timeout`].

use crate::error::{DecodeError, Error, Result};
use crate::protocol::{self, CommandDescriptor, FunctionCode, REQUEST_LENGTH};
use crate::registers::{RegisterValues, TELEMETRY_BASE};
use std::time::Duration;
use tokio::sync::oneshot;
use tokio::time::Instant;

/// Default time to wait for the response to a request.
pub const DEFAULT_COMMAND_TIMEOUT: Duration = Duration::from_secs(5);

/// Where the outcome of a request is delivered.
pub type Completion = oneshot::Sender<Result<RegisterValues>>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CommandState {
    Idle,
    AwaitingResponse,
    /// The link went away. Requests are refused until a new session is created.
    Closed,
}

#[derive(Debug)]
struct Pending {
    descriptor: CommandDescriptor,
    issued_at: Instant,
    deadline: Instant,
    completion: Completion,
}

impl Pending {
    fn reject(self, error: Error) {
        log::debug!(
            "Request {:04X}+{} failed after {:?}: {error}",
            self.descriptor.start_register,
            self.descriptor.register_count,
            self.issued_at.elapsed()
        );
        reject(self.completion, error);
    }
}

fn reject(completion: Completion, error: Error) {
    if completion.send(Err(error)).is_err() {
        log::trace!("Requester went away before the request failed");
    }
}

#[derive(Debug)]
enum State {
    Idle,
    AwaitingResponse(Pending),
    Closed,
}

/// Resolves the request a response frame answered.
#[derive(Debug)]
pub struct Responder(Completion);

impl Responder {
    pub fn resolve(self, values: RegisterValues) {
        if self.0.send(Ok(values)).is_err() {
            log::trace!("Requester went away before its response arrived");
        }
    }
}

/// What an inbound frame turned out to be.
#[derive(Debug)]
pub enum Delivery {
    /// The response to the outstanding request.
    Response {
        values: RegisterValues,
        responder: Responder,
    },
    /// Telemetry the device sent on its own.
    Unsolicited(RegisterValues),
}

#[derive(Debug)]
pub struct CommandSession {
    state: State,
    timeout: Duration,
}

impl CommandSession {
    pub fn new(timeout: Duration) -> Self {
        Self {
            state: State::Idle,
            timeout,
        }
    }

    pub fn state(&self) -> CommandState {
        match self.state {
            State::Idle => CommandState::Idle,
            State::AwaitingResponse(_) => CommandState::AwaitingResponse,
            State::Closed => CommandState::Closed,
        }
    }

    /// When the outstanding request times out, if there is one.
    pub fn deadline(&self) -> Option<Instant> {
        match &self.state {
            State::AwaitingResponse(pending) => Some(pending.deadline),
            _ => None,
        }
    }

    pub fn expected_function(&self) -> Option<FunctionCode> {
        match &self.state {
            State::AwaitingResponse(pending) => Some(pending.descriptor.function),
            _ => None,
        }
    }

    /// Start a request and return the frame to write.
    ///
    /// If the request cannot start, `completion` is rejected right away with
    /// [`Error::Busy`] or [`Error::Disconnected`] and `None` is returned.
    pub fn issue(
        &mut self,
        descriptor: CommandDescriptor,
        completion: Completion,
    ) -> Option<[u8; REQUEST_LENGTH]> {
        match self.state {
            State::Closed => {
                reject(completion, Error::Disconnected);
                None
            }
            State::AwaitingResponse(_) => {
                log::debug!(
                    "Refusing request {:04X}+{}, another one is in flight",
                    descriptor.start_register,
                    descriptor.register_count
                );
                reject(completion, Error::Busy);
                None
            }
            State::Idle => {
                let issued_at = Instant::now();
                self.state = State::AwaitingResponse(Pending {
                    descriptor,
                    issued_at,
                    deadline: issued_at + self.timeout,
                    completion,
                });
                Some(descriptor.encode())
            }
        }
    }

    /// React to one inbound frame.
    ///
    /// A decode failure rejects the outstanding request. Without one, the frame is
    /// unsolicited and a decode failure is only logged.
    pub fn on_frame(&mut self, rx_buffer: &[u8]) -> Option<Delivery> {
        match std::mem::replace(&mut self.state, State::Idle) {
            State::AwaitingResponse(pending) => match decode_response(&pending, rx_buffer) {
                Ok(values) => {
                    log::debug!(
                        "Request {:04X}+{} answered after {:?}",
                        pending.descriptor.start_register,
                        pending.descriptor.register_count,
                        pending.issued_at.elapsed()
                    );
                    Some(Delivery::Response {
                        values,
                        responder: Responder(pending.completion),
                    })
                }
                Err(err) => {
                    pending.reject(err);
                    None
                }
            },
            State::Idle => match protocol::decode_registers(rx_buffer, TELEMETRY_BASE) {
                Ok(values) => Some(Delivery::Unsolicited(values)),
                Err(err) => {
                    log::warn!("Dropping unsolicited frame {rx_buffer:02X?}: {err}");
                    None
                }
            },
            State::Closed => {
                self.state = State::Closed;
                log::trace!("Ignoring frame on closed session: {rx_buffer:02X?}");
                None
            }
        }
    }

    /// Fail the outstanding request with [`Error::Timeout`] if its deadline has passed.
    ///
    /// Returns whether a request timed out.
    pub fn on_timeout(&mut self, now: Instant) -> bool {
        match self.deadline() {
            Some(deadline) if now >= deadline => {
                if let Some(pending) = self.take_pending() {
                    pending.reject(Error::Timeout);
                }
                true
            }
            _ => false,
        }
    }

    /// Fail the outstanding request with `error`, e.g. when writing it failed.
    pub fn fail(&mut self, error: Error) {
        match self.take_pending() {
            Some(pending) => pending.reject(error),
            None => log::trace!("No request to fail: {error}"),
        }
    }

    // Clears the pending slot, leaving Idle. Closed stays closed.
    fn take_pending(&mut self) -> Option<Pending> {
        if !matches!(self.state, State::AwaitingResponse(_)) {
            return None;
        }
        match std::mem::replace(&mut self.state, State::Idle) {
            State::AwaitingResponse(pending) => Some(pending),
            _ => None,
        }
    }

    /// Close the session, rejecting any outstanding request with [`Error::Disconnected`].
    pub fn disconnect(&mut self) {
        let previous = std::mem::replace(&mut self.state, State::Closed);
        if let State::AwaitingResponse(pending) = previous {
            pending.reject(Error::Disconnected);
        }
    }
}

fn decode_response(pending: &Pending, rx_buffer: &[u8]) -> Result<RegisterValues> {
    let frame = protocol::decode(rx_buffer)?;
    if frame.function != pending.descriptor.function {
        log::warn!(
            "Response function {:?} does not match request function {:?}",
            frame.function,
            pending.descriptor.function
        );
        return Err(DecodeError::Unsupported(frame.function as u8).into());
    }
    Ok(RegisterValues::decode(
        pending.descriptor.start_register,
        &frame.payload,
    ))
}

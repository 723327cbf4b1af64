//! The task that owns an open link.
//!
//! Inbound frames, the request deadline and caller requests are handled one at a time
//! in that priority order, so a frame that arrived before a new request is never taken
//! as its response.

use crate::command::{CommandSession, Completion, Delivery};
use crate::protocol::CommandDescriptor;
use crate::session::Shared;
use crate::transport::{Inbound, Transport};
use std::ops::ControlFlow;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::time::{sleep_until, Instant};
use uuid::Uuid;

#[derive(Debug)]
pub(crate) enum Request {
    Issue {
        descriptor: CommandDescriptor,
        completion: Completion,
    },
    Close,
}

pub(crate) struct Link<T> {
    transport: T,
    write_characteristic: Uuid,
    inbound: Inbound,
    commands: CommandSession,
    shared: Arc<Shared>,
}

impl<T: Transport> Link<T> {
    pub(crate) fn new(
        transport: T,
        write_characteristic: Uuid,
        inbound: Inbound,
        commands: CommandSession,
        shared: Arc<Shared>,
    ) -> Self {
        Self {
            transport,
            write_characteristic,
            inbound,
            commands,
            shared,
        }
    }

    /// Serve the link until it is closed or lost, then hand the transport back.
    pub(crate) async fn run(mut self, mut requests: mpsc::Receiver<Request>) -> T {
        loop {
            let deadline = self.commands.deadline();
            tokio::select! {
                biased;
                frame = self.inbound.recv() => match frame {
                    Some(rx_buffer) => self.on_frame(&rx_buffer),
                    None => {
                        log::info!("Notification stream ended, link lost");
                        self.commands.disconnect();
                        self.shared.set_disconnected();
                        break;
                    }
                },
                () = sleep_until(deadline.unwrap_or_else(Instant::now)), if deadline.is_some() => {
                    if self.commands.on_timeout(Instant::now()) {
                        log::warn!("Request timed out");
                    }
                }
                request = requests.recv() => match request {
                    Some(Request::Issue { descriptor, completion }) => {
                        let flow = self.issue(descriptor, completion, &mut requests).await;
                        if flow.is_break() {
                            break;
                        }
                    }
                    Some(Request::Close) | None => {
                        log::debug!("Closing link");
                        self.commands.disconnect();
                        break;
                    }
                },
            }
        }
        self.transport
    }

    /// Write a request. A close arriving while the write is in progress ends the link
    /// right away, and other requests are refused as busy.
    async fn issue(
        &mut self,
        descriptor: CommandDescriptor,
        completion: Completion,
        requests: &mut mpsc::Receiver<Request>,
    ) -> ControlFlow<()> {
        let Some(tx_buffer) = self.commands.issue(descriptor, completion) else {
            return ControlFlow::Continue(());
        };
        let deadline = self.commands.deadline().unwrap_or_else(Instant::now);
        log::trace!("write bytes: {tx_buffer:02X?}");
        let write = tokio::time::timeout_at(
            deadline,
            self.transport.write(self.write_characteristic, &tx_buffer),
        );
        tokio::pin!(write);
        loop {
            tokio::select! {
                biased;
                result = &mut write => {
                    match result {
                        Ok(Ok(())) => {}
                        Ok(Err(err)) => {
                            log::warn!("Writing request failed: {err}");
                            self.commands.fail(err.into());
                        }
                        Err(_) => {
                            log::warn!("Writing request did not complete before its deadline");
                            self.commands.on_timeout(Instant::now());
                        }
                    }
                    return ControlFlow::Continue(());
                }
                request = requests.recv() => match request {
                    Some(Request::Issue { descriptor, completion }) => {
                        // the request being written is outstanding, so this one is busy
                        let refused = self.commands.issue(descriptor, completion);
                        debug_assert!(refused.is_none());
                    }
                    Some(Request::Close) | None => {
                        log::debug!("Closing link while a write is in progress");
                        self.commands.disconnect();
                        return ControlFlow::Break(());
                    }
                },
            }
        }
    }

    fn on_frame(&mut self, rx_buffer: &[u8]) {
        log::trace!("receive bytes: {rx_buffer:02X?}");
        match self.commands.on_frame(rx_buffer) {
            Some(Delivery::Response { values, responder }) => {
                self.shared.merge(&values);
                responder.resolve(values);
            }
            Some(Delivery::Unsolicited(values)) => {
                log::debug!("Unsolicited telemetry: {values:?}");
                self.shared.merge(&values);
            }
            None => {}
        }
    }
}

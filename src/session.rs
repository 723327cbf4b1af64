//! Connection lifecycle of one device and the domain reads on top of it.
//!
//! A [`DeviceSession`] is driven from the outside by `connect`/`disconnect` and the
//! `read_*` operations. While connected, a spawned task owns the transport and the
//! [`CommandSession`]; the session talks to it through a request channel. Every
//! method takes `&self`, so one session can be shared by several tasks. A second
//! read issued while one is in flight fails with [`Error::Busy`].

use crate::command::CommandSession;
use crate::config::SessionConfig;
use crate::error::{DecodeError, Error, Result};
use crate::link::{Link, Request};
use crate::registers::{ChargingStatus, IdentityLookup, Query, RegisterValues};
use crate::snapshot::{DeviceIdentity, Snapshot, Telemetry};
use crate::transport::{Inbound, Transport, TransportError};
use serde::Serialize;
use std::fmt;
use std::sync::{Arc, Mutex, PoisonError};
use tokio::sync::{broadcast, mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tokio::time::timeout;

const REQUEST_CHANNEL_CAPACITY: usize = 8;
const EVENT_CHANNEL_CAPACITY: usize = 64;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    DiscoveringServices,
    Subscribing,
    Ready,
    Closing,
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            ConnectionState::Disconnected => write!(f, "disconnected"),
            ConnectionState::Connecting => write!(f, "connecting"),
            ConnectionState::DiscoveringServices => write!(f, "discovering services"),
            ConnectionState::Subscribing => write!(f, "subscribing"),
            ConnectionState::Ready => write!(f, "ready"),
            ConnectionState::Closing => write!(f, "closing"),
        }
    }
}

/// Notifications for whoever presents the session.
#[derive(Debug, Clone, PartialEq)]
pub enum SessionEvent {
    StateChanged(ConnectionState),
    /// The snapshot was replaced, the new one is attached.
    SnapshotUpdated(Arc<Snapshot>),
    /// The link was closed or lost.
    Disconnected,
}

/// Result of [`DeviceSession::read_power_triad`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct PowerTriad {
    /// Input power in W
    pub power_input: u16,
    /// Output power in W
    pub power_output: u16,
    pub charging_status: ChargingStatus,
}

/// State shared between the session and its link task.
pub(crate) struct Shared {
    state: watch::Sender<ConnectionState>,
    snapshot: watch::Sender<Arc<Snapshot>>,
    events: broadcast::Sender<SessionEvent>,
    lookup: Arc<dyn IdentityLookup>,
}

impl Shared {
    fn new(lookup: Arc<dyn IdentityLookup>) -> Self {
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        Self {
            state: watch::Sender::new(ConnectionState::Disconnected),
            snapshot: watch::Sender::new(Arc::new(Snapshot::default())),
            events,
            lookup,
        }
    }

    fn state(&self) -> ConnectionState {
        *self.state.borrow()
    }

    fn set_state(&self, state: ConnectionState) {
        let previous = self.state.send_replace(state);
        if previous != state {
            log::debug!("Connection state {previous} -> {state}");
            self.emit(SessionEvent::StateChanged(state));
        }
    }

    fn emit(&self, event: SessionEvent) {
        // no receivers is fine
        let _ = self.events.send(event);
    }

    /// Replace the snapshot with one that includes `values`.
    pub(crate) fn merge(&self, values: &RegisterValues) {
        if values.is_empty() {
            return;
        }
        let current = self.snapshot.borrow().clone();
        let next = Arc::new(current.merged(values, self.lookup.as_ref(), chrono::Utc::now()));
        self.snapshot.send_replace(next.clone());
        self.emit(SessionEvent::SnapshotUpdated(next));
    }

    /// Move to [`ConnectionState::Disconnected`] and announce it, once.
    ///
    /// Returns whether the state changed.
    pub(crate) fn set_disconnected(&self) -> bool {
        if self.state() == ConnectionState::Disconnected {
            return false;
        }
        self.set_state(ConnectionState::Disconnected);
        self.emit(SessionEvent::Disconnected);
        true
    }
}

struct Lifecycle<T> {
    /// Present while no link task owns it.
    transport: Option<T>,
    task: Option<JoinHandle<T>>,
}

pub struct DeviceSession<T: Transport> {
    config: SessionConfig,
    shared: Arc<Shared>,
    lifecycle: tokio::sync::Mutex<Lifecycle<T>>,
    requests: Mutex<Option<mpsc::Sender<Request>>>,
}

impl<T: Transport> DeviceSession<T> {
    /// Create a disconnected session. Identity codes are named by `config.identity`.
    pub fn new(transport: T, config: SessionConfig) -> Self {
        let lookup = Arc::new(config.identity.clone());
        Self::with_lookup(transport, config, lookup)
    }

    /// Create a disconnected session with a custom identity lookup.
    pub fn with_lookup(
        transport: T,
        config: SessionConfig,
        lookup: Arc<dyn IdentityLookup>,
    ) -> Self {
        Self {
            config,
            shared: Arc::new(Shared::new(lookup)),
            lifecycle: tokio::sync::Mutex::new(Lifecycle {
                transport: Some(transport),
                task: None,
            }),
            requests: Mutex::new(None),
        }
    }

    pub fn config(&self) -> &SessionConfig {
        &self.config
    }

    pub fn state(&self) -> ConnectionState {
        self.shared.state()
    }

    /// The last known snapshot. Never blocks.
    pub fn current_snapshot(&self) -> Arc<Snapshot> {
        self.shared.snapshot.borrow().clone()
    }

    pub fn watch_snapshot(&self) -> watch::Receiver<Arc<Snapshot>> {
        self.shared.snapshot.subscribe()
    }

    pub fn subscribe(&self) -> broadcast::Receiver<SessionEvent> {
        self.shared.events.subscribe()
    }

    /// Open the link, find the characteristics, subscribe and read the identity.
    ///
    /// Reading the identity is best effort: if it fails the session is still
    /// [`ConnectionState::Ready`] with the identity left unknown. Connecting a session
    /// that is already connected does nothing.
    pub async fn connect(&self) -> Result<()> {
        {
            let mut lifecycle = self.lifecycle.lock().await;
            if lifecycle.task.is_some() {
                let lost = self.state() == ConnectionState::Disconnected
                    || lifecycle.task.as_ref().is_some_and(JoinHandle::is_finished);
                if !lost {
                    log::debug!("Already connected");
                    return Ok(());
                }
                // release the lost link before opening a new one
                self.shutdown(&mut lifecycle).await?;
            }

            let mut transport = lifecycle
                .transport
                .take()
                .ok_or(TransportError::Unavailable)?;
            let inbound = match self.establish(&mut transport).await {
                Ok(inbound) => inbound,
                Err(err) => {
                    log::warn!("Connecting failed: {err}");
                    if let Err(close_err) = transport.close().await {
                        log::warn!("Closing the link failed: {close_err}");
                    }
                    lifecycle.transport = Some(transport);
                    self.shared.set_state(ConnectionState::Disconnected);
                    return Err(err);
                }
            };

            let (requests, requests_rx) = mpsc::channel(REQUEST_CHANNEL_CAPACITY);
            let link = Link::new(
                transport,
                self.config.gatt.write_characteristic,
                inbound,
                CommandSession::new(self.config.command_timeout),
                self.shared.clone(),
            );
            self.shared.set_state(ConnectionState::Ready);
            lifecycle.task = Some(tokio::spawn(link.run(requests_rx)));
            *self.lock_requests() = Some(requests);
            log::info!("Session ready");
        }

        match self.read_identity().await {
            Ok(identity) => log::info!("Device identity: {identity:?}"),
            Err(err) => log::warn!("Could not read device identity: {err}"),
        }
        Ok(())
    }

    async fn establish(&self, transport: &mut T) -> Result<Inbound> {
        let gatt = self.config.gatt;

        self.shared.set_state(ConnectionState::Connecting);
        timeout(self.config.connect_timeout, transport.open())
            .await
            .map_err(|_| Error::ConnectTimeout)??;

        self.shared.set_state(ConnectionState::DiscoveringServices);
        let characteristics =
            match timeout(self.config.discover_timeout, transport.discover(gatt.service)).await {
                Ok(Ok(Some(characteristics))) => characteristics,
                Ok(Ok(None)) => return Err(Error::ServiceNotFound(gatt.service)),
                Ok(Err(err)) => {
                    log::warn!("Service discovery failed: {err}");
                    return Err(Error::ServiceNotFound(gatt.service));
                }
                Err(_) => {
                    log::warn!("Service discovery timed out");
                    return Err(Error::ServiceNotFound(gatt.service));
                }
            };
        for required in [gatt.write_characteristic, gatt.notify_characteristic] {
            if !characteristics.contains(&required) {
                return Err(Error::CharacteristicNotFound(required));
            }
        }

        self.shared.set_state(ConnectionState::Subscribing);
        let notify = gatt.notify_characteristic;
        match timeout(self.config.subscribe_timeout, transport.subscribe(notify)).await {
            Ok(Ok(inbound)) => Ok(inbound),
            Ok(Err(err)) => {
                log::warn!("Subscribing failed: {err}");
                Err(Error::SubscribeFailed(notify))
            }
            Err(_) => {
                log::warn!("Subscribing timed out");
                Err(Error::SubscribeFailed(notify))
            }
        }
    }

    /// Close the link. A pending read fails with [`Error::Disconnected`].
    ///
    /// Calling this on a disconnected session does nothing.
    pub async fn disconnect(&self) -> Result<()> {
        let mut lifecycle = self.lifecycle.lock().await;
        self.shutdown(&mut lifecycle).await
    }

    async fn shutdown(&self, lifecycle: &mut Lifecycle<T>) -> Result<()> {
        let requests = self.lock_requests().take();
        let Some(task) = lifecycle.task.take() else {
            log::debug!("Already disconnected");
            return Ok(());
        };

        if self.shared.state() != ConnectionState::Disconnected {
            self.shared.set_state(ConnectionState::Closing);
        }
        if let Some(requests) = requests {
            // fails if the link task is already gone
            let _ = requests.send(Request::Close).await;
        }

        let result = match task.await {
            Ok(mut transport) => {
                if let Err(err) = transport.close().await {
                    log::warn!("Closing the link failed: {err}");
                }
                lifecycle.transport = Some(transport);
                Ok(())
            }
            Err(err) => {
                log::error!("Link task failed: {err}");
                Err(TransportError::Unavailable.into())
            }
        };

        // the link task may have announced a lost link already
        if self.shared.set_disconnected() {
            log::info!("Disconnected");
        }
        result
    }

    fn lock_requests(&self) -> std::sync::MutexGuard<'_, Option<mpsc::Sender<Request>>> {
        self.requests.lock().unwrap_or_else(PoisonError::into_inner)
    }

    async fn query(&self, query: Query) -> Result<RegisterValues> {
        let requests = self.lock_requests().clone().ok_or(Error::Disconnected)?;
        let (completion, response) = oneshot::channel();
        let descriptor = query.descriptor(self.config.function);
        requests
            .send(Request::Issue {
                descriptor,
                completion,
            })
            .await
            .map_err(|_| Error::Disconnected)?;
        // the link task dropped the request on its way out
        response.await.map_err(|_| Error::Disconnected)?
    }

    /// State of charge in %.
    pub async fn read_battery(&self) -> Result<u16> {
        let values = self.query(Query::Battery).await?;
        values
            .battery_level
            .ok_or_else(|| DecodeError::Truncated.into())
    }

    pub async fn read_power_triad(&self) -> Result<PowerTriad> {
        let values = self.query(Query::PowerTriad).await?;
        match (values.power_input, values.power_output, values.charging_status) {
            (Some(power_input), Some(power_output), Some(charging_status)) => Ok(PowerTriad {
                power_input,
                power_output,
                charging_status,
            }),
            _ => Err(DecodeError::Truncated.into()),
        }
    }

    /// Model, serial number and firmware version, named through the identity lookup.
    pub async fn read_identity(&self) -> Result<DeviceIdentity> {
        let values = self.query(Query::Identity).await?;
        Ok(DeviceIdentity::from_values(&values, self.shared.lookup.as_ref()))
    }

    /// Read all telemetry registers and return the updated telemetry.
    ///
    /// Fails with [`DecodeError::Truncated`] if the response left any quantity out.
    pub async fn read_all(&self) -> Result<Telemetry> {
        let values = self.query(Query::All).await?;
        let complete = values.battery_level.is_some()
            && values.power_input.is_some()
            && values.power_output.is_some()
            && values.charging_status.is_some();
        if !complete {
            return Err(DecodeError::Truncated.into());
        }
        Ok(self.current_snapshot().telemetry.clone())
    }
}

//! [`Transport`] over Bluetooth Low Energy, built on `bluest`.
//!
//! Each GATT notification is forwarded as one frame.

use crate::transport::{Inbound, Transport, TransportError};
use async_trait::async_trait;
use bluest::{Adapter, Characteristic, Device};
use futures_util::StreamExt;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::timeout;
use uuid::Uuid;

pub struct BleTransport {
    adapter: Adapter,
    device: Device,
    characteristics: Vec<Characteristic>,
    notifications: Option<JoinHandle<()>>,
}

impl BleTransport {
    pub fn new(adapter: Adapter, device: Device) -> Self {
        Self {
            adapter,
            device,
            characteristics: Vec::new(),
            notifications: None,
        }
    }

    /// Scan on the default adapter for a device called `name` advertising `service`.
    pub async fn find_by_name(
        name: &str,
        service: Uuid,
        scan_timeout: Duration,
    ) -> Result<Self, TransportError> {
        let adapter = Adapter::default()
            .await
            .ok_or_else(|| TransportError::Link("no Bluetooth adapter found".to_string()))?;
        adapter.wait_available().await?;

        log::info!("Scanning for {name}");
        let device = timeout(scan_timeout, Self::scan_for(&adapter, name, service))
            .await
            .map_err(|_| TransportError::Link(format!("device {name} not found")))??;
        log::info!("Found {name} ({:?})", device.id());
        Ok(Self::new(adapter, device))
    }

    async fn scan_for(
        adapter: &Adapter,
        name: &str,
        service: Uuid,
    ) -> Result<Device, TransportError> {
        let mut advertisements = adapter.scan(&[service]).await?;
        while let Some(advertisement) = advertisements.next().await {
            match advertisement.device.name_async().await {
                Ok(device_name) if device_name == name => return Ok(advertisement.device),
                Ok(device_name) => log::debug!("Skipping {device_name}"),
                Err(err) => log::debug!("Skipping unnamed device: {err}"),
            }
        }
        Err(TransportError::Link(format!("scan ended before {name} was seen")))
    }

    fn characteristic(&self, uuid: Uuid) -> Result<&Characteristic, TransportError> {
        self.characteristics
            .iter()
            .find(|c| c.uuid() == uuid)
            .ok_or(TransportError::UnknownCharacteristic(uuid))
    }
}

#[async_trait]
impl Transport for BleTransport {
    async fn open(&mut self) -> Result<(), TransportError> {
        if self.device.is_connected().await {
            log::debug!("Device already connected");
            return Ok(());
        }
        self.adapter.connect_device(&self.device).await?;
        Ok(())
    }

    async fn discover(&mut self, service: Uuid) -> Result<Option<Vec<Uuid>>, TransportError> {
        let services = self.device.discover_services_with_uuid(service).await?;
        let Some(service) = services.first() else {
            return Ok(None);
        };
        self.characteristics = service.discover_characteristics().await?;
        Ok(Some(self.characteristics.iter().map(Characteristic::uuid).collect()))
    }

    async fn subscribe(&mut self, characteristic: Uuid) -> Result<Inbound, TransportError> {
        let characteristic = self.characteristic(characteristic)?.clone();
        let (inbound_tx, inbound) = mpsc::unbounded_channel();
        let (ready_tx, ready) = oneshot::channel();

        let task = tokio::spawn(async move {
            let mut notifications = match characteristic.notify().await {
                Ok(notifications) => {
                    let _ = ready_tx.send(Ok(()));
                    notifications
                }
                Err(err) => {
                    let _ = ready_tx.send(Err(err));
                    return;
                }
            };
            while let Some(notification) = notifications.next().await {
                match notification {
                    Ok(data) => {
                        if inbound_tx.send(data).is_err() {
                            break;
                        }
                    }
                    Err(err) => {
                        log::warn!("Notification error: {err}");
                        break;
                    }
                }
            }
            log::debug!("Notification stream ended");
        });

        match ready.await {
            Ok(Ok(())) => {
                self.notifications = Some(task);
                Ok(inbound)
            }
            Ok(Err(err)) => Err(err.into()),
            Err(_) => Err(TransportError::Link("notification task ended".to_string())),
        }
    }

    async fn write(&mut self, characteristic: Uuid, frame: &[u8]) -> Result<(), TransportError> {
        self.characteristic(characteristic)?.write(frame).await?;
        Ok(())
    }

    async fn close(&mut self) -> Result<(), TransportError> {
        if let Some(task) = self.notifications.take() {
            task.abort();
        }
        self.characteristics.clear();
        if self.device.is_connected().await {
            self.adapter.disconnect_device(&self.device).await?;
        }
        Ok(())
    }
}

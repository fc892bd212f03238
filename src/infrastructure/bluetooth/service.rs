//! Note Sync Service
//!
//! Drives a whole session: connect or register through the device registry,
//! then download, decode and delete every stored note in order.

use crate::domain::models::{
    AppEvent, ConnectionStatus, DeviceUuid, Drawing, MessageSeverity, ProtocolVariant,
    StatusMessage,
};
use crate::domain::settings::ProtocolSettings;
use crate::domain::strokes;
use crate::infrastructure::bluetooth::connection::{NotificationRouter, Transport};
use crate::infrastructure::bluetooth::engine::{DeviceSession, RegistrationFlow};
use crate::infrastructure::bluetooth::protocol::ProtocolError;
use crate::infrastructure::registry::{DeviceRegistry, RegistryEntry};
use thiserror::Error;
use tokio::sync::mpsc;
use tracing::{error, info, warn};

#[derive(Debug, Error)]
pub enum SyncError {
    #[error("device {0} is not registered")]
    NotRegistered(String),
    #[error(transparent)]
    Protocol(#[from] ProtocolError),
}

/// A note that was downloaded but could not be turned into a drawing
#[derive(Debug, Clone)]
pub struct SkippedFile {
    pub index: usize,
    pub reason: String,
    pub data: Vec<u8>,
}

#[derive(Debug, Default)]
pub struct SyncReport {
    pub drawings: Vec<Drawing>,
    pub downloaded: usize,
    pub skipped: Vec<SkippedFile>,
}

pub struct NoteSyncService<R: DeviceRegistry> {
    registry: R,
    settings: ProtocolSettings,
    event_sender: mpsc::UnboundedSender<AppEvent>,
}

impl<R: DeviceRegistry> NoteSyncService<R> {
    pub fn new(
        registry: R,
        settings: ProtocolSettings,
        event_sender: mpsc::UnboundedSender<AppEvent>,
    ) -> Self {
        Self {
            registry,
            settings,
            event_sender,
        }
    }

    pub fn registry(&self) -> &R {
        &self.registry
    }

    fn send_status(&self, status: ConnectionStatus) {
        let _ = self.event_sender.send(AppEvent::ConnectionStatus(status));
    }

    fn send_log(&self, message: impl Into<String>, severity: MessageSeverity) {
        let _ = self.event_sender.send(AppEvent::LogMessage(StatusMessage {
            message: message.into(),
            severity,
        }));
    }

    /// Open a session with a device that was registered before
    pub async fn connect<T: Transport>(
        &self,
        address: &str,
        transport: T,
        router: NotificationRouter,
    ) -> Result<DeviceSession<T>, SyncError> {
        let entry = self
            .registry
            .lookup(address)
            .ok_or_else(|| SyncError::NotRegistered(address.to_string()))?;

        self.send_status(ConnectionStatus::Connecting);
        let mut session =
            DeviceSession::new(transport, router, self.settings.clone(), entry.variant);
        match session.connect(entry.uuid).await {
            Ok(()) => {
                info!("Connected to {} ({})", address, entry.variant);
                self.send_status(ConnectionStatus::Connected);
                Ok(session)
            }
            Err(e) => {
                error!("Connection to {} failed: {}", address, e);
                self.send_log(format!("Connection failed: {}", e), MessageSeverity::Error);
                self.send_status(ConnectionStatus::Error);
                Err(e.into())
            }
        }
    }

    /// Register `uuid` with a device and remember the negotiated variant
    pub async fn register<T: Transport>(
        &mut self,
        address: &str,
        uuid: DeviceUuid,
        flow: RegistrationFlow,
        transport: T,
        router: NotificationRouter,
    ) -> Result<DeviceSession<T>, SyncError> {
        self.send_status(ConnectionStatus::Registering);
        self.send_log(
            "Press the button on the device to confirm registration",
            MessageSeverity::Info,
        );

        let variant = match flow {
            RegistrationFlow::UuidPrompt => ProtocolVariant::Spark,
            RegistrationFlow::ButtonConfirm => ProtocolVariant::Slate,
        };
        let mut session = DeviceSession::new(transport, router, self.settings.clone(), variant);

        let variant = match session.register(uuid, flow).await {
            Ok(variant) => variant,
            Err(e) => {
                error!("Registration with {} failed: {}", address, e);
                self.send_log(format!("Registration failed: {}", e), MessageSeverity::Error);
                self.send_status(ConnectionStatus::Error);
                return Err(e.into());
            }
        };

        self.registry.store(address, RegistryEntry { uuid, variant });
        self.send_log(
            format!("Registered {} as {}", address, variant),
            MessageSeverity::Success,
        );
        self.send_status(ConnectionStatus::Connected);
        Ok(session)
    }

    /// Download every stored note, oldest first.
    ///
    /// Enumeration and transfer failures abort; a note that fails to decode is
    /// reported as skipped and still deleted from the device.
    pub async fn download_all<T: Transport>(
        &self,
        session: &DeviceSession<T>,
    ) -> Result<SyncReport, SyncError> {
        let mut report = SyncReport::default();

        match session.set_paper_mode().await {
            Ok(()) => {}
            Err(ProtocolError::NoPendingData) => {
                info!("Device has no pending notes");
                self.send_log("No notes to download", MessageSeverity::Info);
                return Ok(report);
            }
            Err(e) => return Err(e.into()),
        }

        let total = session.get_file_count().await? as usize;
        info!("{} note(s) stored on the device", total);

        for index in 0..total {
            let _ = self.event_sender.send(AppEvent::FileProgress {
                index: index + 1,
                total,
            });

            let file_info = session.get_oldest_file_info().await?;
            let data = session.download_oldest_file().await?;
            report.downloaded += 1;

            if data.len() < self.settings.min_file_size {
                report.skipped.push(SkippedFile {
                    index,
                    reason: format!("file too small ({} bytes)", data.len()),
                    data,
                });
            } else {
                match strokes::decode_container(&data, session.variant(), file_info) {
                    Ok(drawing) => {
                        info!(
                            "Note {}/{}: {} stroke(s)",
                            index + 1,
                            total,
                            drawing.strokes.len()
                        );
                        let _ = self.event_sender.send(AppEvent::DrawingReady(drawing.clone()));
                        report.drawings.push(drawing);
                    }
                    Err(e) => {
                        warn!("Note {}/{} could not be decoded: {}", index + 1, total, e);
                        report.skipped.push(SkippedFile {
                            index,
                            reason: e.to_string(),
                            data,
                        });
                    }
                }
            }

            session.delete_oldest_file().await?;
        }

        let severity = if report.skipped.is_empty() {
            MessageSeverity::Success
        } else {
            MessageSeverity::Warning
        };
        self.send_log(
            format!(
                "Downloaded {} note(s), {} skipped",
                report.drawings.len(),
                report.skipped.len()
            ),
            severity,
        );
        Ok(report)
    }
}

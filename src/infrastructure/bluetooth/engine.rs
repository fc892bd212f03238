//! Protocol Engine
//!
//! Implements the tablet's operations on top of the reply correlator. Every
//! operation registers its reply opcodes before sending the command, so a
//! fast reply can never slip past its waiter.

use crate::domain::models::{DeviceUuid, FileInfo, ProtocolVariant};
use crate::domain::settings::ProtocolSettings;
use crate::infrastructure::bluetooth::connection::{NotificationRouter, Transport};
use crate::infrastructure::bluetooth::protocol::{
    self, opcode, Command, DeviceMode, Envelope, ProtocolError, Result, StatusCode,
    TRANSFER_END, TRANSFER_START,
};
use chrono::Utc;
use std::future::Future;
use std::time::Duration;
use tracing::{debug, info, warn};

/// How authentication ended
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuthOutcome {
    /// The device confirmed the UUID
    Authenticated,
    /// No reply, accepted because the device family stays quiet
    Silent,
    /// The device does not know this UUID
    NeedsRegistration,
}

/// Registration handshake family
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RegistrationFlow {
    /// Prompt without UUID, button reply selects the variant, then complete
    ButtonConfirm,
    /// Prompt carrying the UUID, then time and channel setup
    UuidPrompt,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BatteryState {
    pub percent: u8,
    pub charging: bool,
}

/// One connected tablet
pub struct DeviceSession<T: Transport> {
    transport: T,
    router: NotificationRouter,
    settings: ProtocolSettings,
    variant: ProtocolVariant,
    uuid: Option<DeviceUuid>,
}

impl<T: Transport> DeviceSession<T> {
    /// Create a session. `router` must be the one the adapter feeds.
    pub fn new(
        transport: T,
        router: NotificationRouter,
        settings: ProtocolSettings,
        variant: ProtocolVariant,
    ) -> Self {
        Self {
            transport,
            router,
            settings,
            variant,
            uuid: None,
        }
    }

    pub fn variant(&self) -> ProtocolVariant {
        self.variant
    }

    pub fn uuid(&self) -> Option<DeviceUuid> {
        self.uuid
    }

    async fn send(&self, command: Command<'_>) -> Result<()> {
        let bytes = command.to_envelope().encode()?;
        debug!("Sending {:02X?}", bytes);
        self.transport.write(&bytes).await?;
        Ok(())
    }

    /// Send a command and wait for one of `replies`
    async fn request(
        &self,
        command: Command<'_>,
        replies: &[u8],
        timeout: Duration,
    ) -> Result<Envelope> {
        let mut pending = self.router.correlator().expect(replies)?;
        self.send(command).await?;
        Envelope::decode(&pending.wait(timeout).await?)
    }

    /// Send a command answered by a `0xB3` acknowledgement
    async fn ack(&self, command: Command<'_>, timeout: Duration) -> Result<StatusCode> {
        self.request(command, &[opcode::ACK], timeout).await?.status()
    }

    fn require_success(op: u8, status: StatusCode) -> Result<()> {
        match status {
            StatusCode::Success => Ok(()),
            status => Err(ProtocolError::DeviceStatus { opcode: op, status }),
        }
    }

    /// Run a step whose failure must not end the session
    async fn optional<R>(step: &str, fut: impl Future<Output = Result<R>>) -> Option<R> {
        match fut.await {
            Ok(value) => Some(value),
            Err(e) => {
                warn!("Optional step '{}' failed: {}", step, e);
                None
            }
        }
    }

    /// Present the UUID to the device
    pub async fn authenticate(&self, uuid: &DeviceUuid, allow_silent: bool) -> Result<AuthOutcome> {
        let replies = [opcode::AUTH_SUCCESS, opcode::AUTH_FAILURE, opcode::ACK];
        let reply = match self
            .request(
                Command::Connect(uuid.as_bytes()),
                &replies,
                self.settings.reply_timeout(),
            )
            .await
        {
            Ok(reply) => reply,
            Err(e) if e.is_retryable() && allow_silent => {
                debug!("No authentication reply, treating silence as success");
                return Ok(AuthOutcome::Silent);
            }
            Err(e) => return Err(e),
        };

        match reply.opcode {
            opcode::AUTH_SUCCESS => Ok(AuthOutcome::Authenticated),
            opcode::AUTH_FAILURE => match reply.payload.first() {
                Some(0x01) => Err(ProtocolError::DeviceNotReady),
                _ => Ok(AuthOutcome::NeedsRegistration),
            },
            _ => match reply.status()? {
                StatusCode::Success => Ok(AuthOutcome::Authenticated),
                status => {
                    debug!("Authentication refused with {}", status);
                    Ok(AuthOutcome::NeedsRegistration)
                }
            },
        }
    }

    /// Authenticate with a registered UUID and run the optional setup steps
    pub async fn connect(&mut self, uuid: DeviceUuid) -> Result<()> {
        info!("Authenticating as {} ({})", uuid, self.variant);
        match self.authenticate(&uuid, self.variant.allows_silent_auth()).await? {
            AuthOutcome::NeedsRegistration => return Err(ProtocolError::AuthorizationMismatch),
            outcome => debug!("Authentication outcome: {:?}", outcome),
        }
        self.uuid = Some(uuid);

        if self.variant != ProtocolVariant::Spark {
            Self::optional("select transfer channel", self.select_transfer_channel()).await;
        }
        self.sync_time().await;
        Ok(())
    }

    async fn sync_time(&self) {
        Self::optional("set time", self.set_time(Utc::now())).await;
        if let Some(device_time) = Self::optional("read time", self.read_time()).await {
            debug!("Device clock offset: {}s", device_time - Utc::now().timestamp());
        }
    }

    /// Register `uuid` with the device and negotiate the protocol variant
    pub async fn register(
        &mut self,
        uuid: DeviceUuid,
        flow: RegistrationFlow,
    ) -> Result<ProtocolVariant> {
        info!("Registering {} using {:?}", uuid, flow);

        let variant = match flow {
            RegistrationFlow::ButtonConfirm => {
                match self.authenticate(&uuid, false).await {
                    Ok(outcome) => debug!("Pre-registration authentication: {:?}", outcome),
                    Err(e) if e.is_retryable() => debug!("No pre-registration reply"),
                    Err(e) => return Err(e),
                }

                let variant = self.wait_for_button().await?;

                let status = self
                    .ack(Command::RegisterComplete, self.settings.reply_timeout())
                    .await?;
                if status != StatusCode::Success {
                    warn!("Registration completion refused: {}", status);
                    return Err(ProtocolError::RegistrationRejected);
                }
                variant
            }
            RegistrationFlow::UuidPrompt => {
                let status = self
                    .ack(
                        Command::PressButtonWithUuid(uuid.as_bytes()),
                        self.settings.button_timeout(),
                    )
                    .await?;
                if status != StatusCode::Success {
                    warn!("Registration prompt refused: {}", status);
                    return Err(ProtocolError::RegistrationRejected);
                }

                self.variant = ProtocolVariant::Spark;
                self.sync_time().await;
                Self::optional("select transfer channel", self.select_transfer_channel()).await;
                ProtocolVariant::Spark
            }
        };

        self.variant = variant;
        self.uuid = Some(uuid);
        info!("Registration complete, protocol variant {}", variant);
        Ok(variant)
    }

    /// Prompt for the button press; the reply opcode identifies the variant
    async fn wait_for_button(&self) -> Result<ProtocolVariant> {
        info!("Press the button on the device to confirm");
        let reply = self
            .request(
                Command::PressButton,
                &[opcode::BUTTON_SLATE, opcode::BUTTON_INTUOS_PRO],
                self.settings.button_timeout(),
            )
            .await?;
        Ok(match reply.opcode {
            opcode::BUTTON_INTUOS_PRO => ProtocolVariant::IntuosPro,
            _ => ProtocolVariant::Slate,
        })
    }

    pub async fn set_mode(&self, mode: DeviceMode) -> Result<()> {
        let status = self
            .ack(Command::SetMode(mode), self.settings.reply_timeout())
            .await?;
        match status {
            StatusCode::Success => Ok(()),
            StatusCode::InvalidState if mode == DeviceMode::Paper => {
                Err(ProtocolError::NoPendingData)
            }
            status => Err(ProtocolError::DeviceStatus {
                opcode: opcode::SET_MODE,
                status,
            }),
        }
    }

    pub async fn set_paper_mode(&self) -> Result<()> {
        self.set_mode(DeviceMode::Paper).await
    }

    pub async fn select_transfer_channel(&self) -> Result<()> {
        let status = self
            .ack(Command::SelectTransferChannel, self.settings.reply_timeout())
            .await?;
        Self::require_success(opcode::SELECT_TRANSFER_CHANNEL, status)
    }

    pub async fn set_time(&self, time: chrono::DateTime<Utc>) -> Result<()> {
        let bcd = protocol::encode_device_time(time);
        let status = self
            .ack(Command::SetTime(&bcd), self.settings.reply_timeout())
            .await?;
        Self::require_success(opcode::TIME, status)
    }

    /// Device clock in Unix seconds
    pub async fn read_time(&self) -> Result<i64> {
        let reply = self
            .request(
                Command::ReadTime,
                &[opcode::CURRENT_TIME],
                self.settings.reply_timeout(),
            )
            .await?;
        protocol::decode_device_time(&reply.payload)
            .ok_or_else(|| ProtocolError::Desync(format!("bad device time {:02X?}", reply.payload)))
    }

    pub async fn get_battery(&self) -> Result<BatteryState> {
        let reply = self
            .request(
                Command::GetBattery,
                &[opcode::BATTERY],
                self.settings.reply_timeout(),
            )
            .await?;
        let payload = reply.payload_at_least(2)?;
        Ok(BatteryState {
            percent: payload[0],
            charging: payload[1] == 1,
        })
    }

    pub async fn get_name(&self) -> Result<String> {
        let reply = self
            .request(Command::GetName, &[opcode::NAME], self.settings.reply_timeout())
            .await?;
        Ok(String::from_utf8_lossy(&reply.payload)
            .trim_end_matches('\0')
            .to_string())
    }

    /// Firmware version as `<high>-<low>` hex strings
    pub async fn get_firmware_version(&self) -> Result<String> {
        let mut parts = Vec::with_capacity(2);
        for part in [0u8, 1] {
            let reply = self
                .request(
                    Command::GetFirmware(part),
                    &[opcode::FIRMWARE],
                    self.settings.reply_timeout(),
                )
                .await?;
            let hex: String = reply
                .payload
                .iter()
                .skip(1)
                .map(|b| format!("{:02x}", b))
                .collect();
            parts.push(hex);
            tokio::time::sleep(protocol::COMMAND_DELAY).await;
        }
        Ok(parts.join("-"))
    }

    pub async fn get_file_count(&self) -> Result<u16> {
        let reply = self
            .request(
                Command::GetFileCount,
                &[opcode::FILE_COUNT],
                self.settings.reply_timeout(),
            )
            .await?;
        let payload = reply.payload_at_least(2)?;
        Ok(u16::from_le_bytes([payload[0], payload[1]]))
    }

    /// Stroke count and timestamp of the oldest file; both replies are optional
    pub async fn get_oldest_file_info(&self) -> Result<FileInfo> {
        let correlator = self.router.correlator();
        let mut count_reply = correlator.expect(&[opcode::STROKE_COUNT])?;
        let mut time_reply = correlator.expect(&[opcode::FILE_TIMESTAMP])?;
        self.send(Command::GetOldestFileInfo).await?;

        let stroke_count = match count_reply
            .wait(self.settings.optional_reply_timeout())
            .await
        {
            Ok(bytes) => {
                let reply = Envelope::decode(&bytes)?;
                let p = reply.payload_at_least(4)?;
                u32::from_be_bytes([p[0], p[1], p[2], p[3]])
            }
            Err(e) if e.is_retryable() => {
                debug!("No stroke count reply, assuming 0");
                0
            }
            Err(e) => return Err(e),
        };

        let timestamp = match time_reply
            .wait(self.settings.optional_reply_timeout())
            .await
        {
            Ok(bytes) => {
                let reply = Envelope::decode(&bytes)?;
                protocol::decode_device_time(reply.payload_at_least(6)?).unwrap_or_else(|| {
                    warn!("Unreadable file timestamp {:02X?}", reply.payload);
                    Utc::now().timestamp()
                })
            }
            Err(e) if e.is_retryable() => {
                debug!("No file timestamp reply, using the current time");
                Utc::now().timestamp()
            }
            Err(e) => return Err(e),
        };

        Ok(FileInfo {
            stroke_count,
            timestamp,
        })
    }

    /// Download the oldest file and return its raw bytes.
    ///
    /// An empty or tiny file is logged but returned; the caller decides what
    /// to do with it.
    pub async fn download_oldest_file(&self) -> Result<Vec<u8>> {
        let transfer = self.router.transfer();
        transfer.reset();

        let start = self
            .request(
                Command::DownloadOldestFile,
                &[opcode::TRANSFER],
                self.settings.reply_timeout(),
            )
            .await?;
        match start.payload_at_least(1)?[0] {
            TRANSFER_START => {
                let mut end = self.router.correlator().expect(&[opcode::TRANSFER])?;
                // the end marker may already have passed the router
                if !transfer.is_complete() {
                    let reply = Envelope::decode(&end.wait(self.settings.transfer_timeout()).await?)?;
                    let marker = reply.payload_at_least(1)?[0];
                    if marker != TRANSFER_END {
                        return Err(ProtocolError::Desync(format!(
                            "expected end of transfer, got marker {:#04x}",
                            marker
                        )));
                    }
                }
            }
            TRANSFER_END => debug!("Transfer ended without a start marker"),
            other => {
                return Err(ProtocolError::Desync(format!(
                    "expected start of transfer, got marker {:#04x}",
                    other
                )))
            }
        }

        tokio::time::sleep(self.settings.settle_delay()).await;
        let data = transfer.take();
        if data.len() < self.settings.min_file_size {
            warn!("Downloaded file is suspiciously small: {} bytes", data.len());
        } else {
            info!("Downloaded {} bytes", data.len());
        }
        Ok(data)
    }

    /// Delete the oldest file. "Already gone" answers count as success.
    pub async fn delete_oldest_file(&self) -> Result<()> {
        let status = match self
            .ack(Command::DeleteOldestFile, self.settings.reply_timeout())
            .await
        {
            Ok(status) => status,
            Err(e) if e.is_retryable() && self.variant.allows_silent_delete() => {
                debug!("Delete not acknowledged, assuming success");
                return Ok(());
            }
            Err(e) => return Err(e),
        };

        match status {
            StatusCode::Success => Ok(()),
            StatusCode::GeneralError | StatusCode::InvalidState => {
                debug!("Delete answered {}, treating file as already deleted", status);
                Ok(())
            }
            status => Err(ProtocolError::DeviceStatus {
                opcode: opcode::DELETE_OLDEST,
                status,
            }),
        }
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::infrastructure::bluetooth::connection::{Channel, TransportError};
    use std::collections::{HashMap, VecDeque};
    use std::sync::{Arc, Mutex};

    pub(crate) const UUID: DeviceUuid = DeviceUuid([1, 2, 3, 4, 5, 6]);

    /// A notification the fake device sends in response to a command
    #[derive(Clone)]
    pub(crate) struct Reply {
        pub channel: Channel,
        pub bytes: Vec<u8>,
        pub delay_ms: u64,
    }

    pub(crate) fn cmd(bytes: &[u8]) -> Reply {
        Reply {
            channel: Channel::CommandNotify,
            bytes: bytes.to_vec(),
            delay_ms: 0,
        }
    }

    pub(crate) fn bulk(bytes: &[u8]) -> Reply {
        Reply {
            channel: Channel::BulkTransferNotify,
            bytes: bytes.to_vec(),
            delay_ms: 0,
        }
    }

    pub(crate) fn later(mut reply: Reply, delay_ms: u64) -> Reply {
        reply.delay_ms = delay_ms;
        reply
    }

    /// Scripted device: each written opcode pops the next batch of replies
    #[derive(Clone, Default)]
    pub(crate) struct FakeDevice {
        router: NotificationRouter,
        script: Arc<Mutex<HashMap<u8, VecDeque<Vec<Reply>>>>>,
        written: Arc<Mutex<Vec<Vec<u8>>>>,
    }

    impl FakeDevice {
        pub(crate) fn new(router: &NotificationRouter) -> Self {
            Self {
                router: router.clone(),
                ..Default::default()
            }
        }

        pub(crate) fn on(&self, op: u8, replies: Vec<Reply>) -> &Self {
            self.script
                .lock()
                .unwrap()
                .entry(op)
                .or_default()
                .push_back(replies);
            self
        }

        pub(crate) fn written(&self) -> Vec<Vec<u8>> {
            self.written.lock().unwrap().clone()
        }

        pub(crate) fn written_opcodes(&self) -> Vec<u8> {
            self.written().iter().map(|w| w[0]).collect()
        }
    }

    impl Transport for FakeDevice {
        async fn write(&self, bytes: &[u8]) -> std::result::Result<(), TransportError> {
            self.written.lock().unwrap().push(bytes.to_vec());
            let replies = self
                .script
                .lock()
                .unwrap()
                .get_mut(&bytes[0])
                .and_then(|queue| queue.pop_front())
                .unwrap_or_default();
            for reply in replies {
                if reply.delay_ms == 0 {
                    self.router.on_notification(reply.channel, &reply.bytes);
                } else {
                    let router = self.router.clone();
                    tokio::spawn(async move {
                        tokio::time::sleep(Duration::from_millis(reply.delay_ms)).await;
                        router.on_notification(reply.channel, &reply.bytes);
                    });
                }
            }
            Ok(())
        }
    }

    struct BrokenTransport;

    impl Transport for BrokenTransport {
        async fn write(&self, _bytes: &[u8]) -> std::result::Result<(), TransportError> {
            Err(TransportError::NotConnected)
        }
    }

    pub(crate) fn fast_settings() -> ProtocolSettings {
        ProtocolSettings {
            reply_timeout_ms: 100,
            optional_reply_timeout_ms: 50,
            button_timeout_ms: 200,
            transfer_timeout_ms: 300,
            settle_delay_ms: 5,
            min_file_size: 8,
        }
    }

    fn session(variant: ProtocolVariant) -> (DeviceSession<FakeDevice>, FakeDevice) {
        let router = NotificationRouter::new();
        let device = FakeDevice::new(&router);
        let session = DeviceSession::new(device.clone(), router, fast_settings(), variant);
        (session, device)
    }

    #[tokio::test]
    async fn test_get_file_count() {
        let (session, device) = session(ProtocolVariant::Slate);
        device.on(0xC1, vec![cmd(&[0xC2, 0x02, 0x05, 0x00])]);
        assert_eq!(session.get_file_count().await.unwrap(), 5);
        assert_eq!(device.written(), vec![vec![0xC1, 0x01, 0x00]]);
    }

    #[tokio::test]
    async fn test_short_reply_is_desync() {
        let (session, device) = session(ProtocolVariant::Slate);
        device.on(0xC1, vec![cmd(&[0xC2, 0x01, 0x05])]);
        assert!(matches!(
            session.get_file_count().await,
            Err(ProtocolError::Desync(_))
        ));
    }

    #[tokio::test]
    async fn test_transport_failure_surfaces() {
        let session = DeviceSession::new(
            BrokenTransport,
            NotificationRouter::new(),
            fast_settings(),
            ProtocolVariant::Slate,
        );
        assert!(matches!(
            session.get_file_count().await,
            Err(ProtocolError::Transport(TransportError::NotConnected))
        ));
    }

    #[tokio::test]
    async fn test_authenticate_outcomes() {
        let (session, device) = session(ProtocolVariant::Slate);
        device
            .on(0xE6, vec![cmd(&[0x50, 0x00])])
            .on(0xE6, vec![cmd(&[0x51, 0x01, 0x00])])
            .on(0xE6, vec![cmd(&[0x51, 0x01, 0x01])])
            .on(0xE6, vec![cmd(&[0xB3, 0x01, 0x00])]);

        assert_eq!(
            session.authenticate(&UUID, false).await.unwrap(),
            AuthOutcome::Authenticated
        );
        assert_eq!(
            session.authenticate(&UUID, false).await.unwrap(),
            AuthOutcome::NeedsRegistration
        );
        assert!(matches!(
            session.authenticate(&UUID, false).await,
            Err(ProtocolError::DeviceNotReady)
        ));
        assert_eq!(
            session.authenticate(&UUID, false).await.unwrap(),
            AuthOutcome::Authenticated
        );
        // silence
        assert_eq!(
            session.authenticate(&UUID, true).await.unwrap(),
            AuthOutcome::Silent
        );
        assert!(session.authenticate(&UUID, false).await.unwrap_err().is_retryable());
        assert_eq!(device.written()[0], vec![0xE6, 0x06, 1, 2, 3, 4, 5, 6]);
    }

    #[tokio::test]
    async fn test_connect_rejects_unknown_uuid() {
        let (mut session, device) = session(ProtocolVariant::Slate);
        device.on(0xE6, vec![cmd(&[0x51, 0x01, 0x00])]);
        assert!(matches!(
            session.connect(UUID).await,
            Err(ProtocolError::AuthorizationMismatch)
        ));
        assert_eq!(session.uuid(), None);
    }

    #[tokio::test]
    async fn test_connect_survives_optional_failures() {
        let (mut session, device) = session(ProtocolVariant::Slate);
        device
            .on(0xE6, vec![cmd(&[0x50, 0x00])])
            .on(0xEC, vec![cmd(&[0xB3, 0x01, 0x07])]);
        // no time replies at all
        session.connect(UUID).await.unwrap();
        assert_eq!(session.uuid(), Some(UUID));
        assert_eq!(device.written_opcodes(), vec![0xE6, 0xEC, 0xB6, 0xB6]);
    }

    #[tokio::test]
    async fn test_spark_connect_allows_silence() {
        let (mut session, device) = session(ProtocolVariant::Spark);
        session.connect(UUID).await.unwrap();
        // spark skips the transfer channel selection
        assert_eq!(device.written_opcodes(), vec![0xE6, 0xB6, 0xB6]);
    }

    #[tokio::test]
    async fn test_paper_mode_no_pending_data() {
        let (session, device) = session(ProtocolVariant::Slate);
        device
            .on(0xB1, vec![cmd(&[0xB3, 0x01, 0x00])])
            .on(0xB1, vec![cmd(&[0xB3, 0x01, 0x02])])
            .on(0xB1, vec![cmd(&[0xB3, 0x01, 0x01])]);
        session.set_paper_mode().await.unwrap();
        assert!(matches!(
            session.set_paper_mode().await,
            Err(ProtocolError::NoPendingData)
        ));
        assert!(matches!(
            session.set_paper_mode().await,
            Err(ProtocolError::DeviceStatus {
                opcode: 0xB1,
                status: StatusCode::GeneralError
            })
        ));
    }

    #[tokio::test]
    async fn test_time_round_trip() {
        let (session, device) = session(ProtocolVariant::Slate);
        device
            .on(0xB6, vec![cmd(&[0xB3, 0x01, 0x00])])
            .on(0xB6, vec![cmd(&[0xBD, 0x06, 0x24, 0x01, 0x02, 0x03, 0x04, 0x05])]);
        session.set_time(Utc::now()).await.unwrap();
        let time = session.read_time().await.unwrap();
        assert_eq!(time, protocol::decode_device_time(&[0x24, 1, 2, 3, 4, 5]).unwrap());
        assert_eq!(device.written()[0].len(), 8);
        assert_eq!(device.written()[1], vec![0xB6, 0x00]);
    }

    #[tokio::test]
    async fn test_oldest_file_info() {
        let (session, device) = session(ProtocolVariant::Slate);
        device.on(
            0xC5,
            vec![
                cmd(&[0xC7, 0x04, 0x00, 0x00, 0x01, 0x02]),
                cmd(&[0xCD, 0x06, 0x23, 0x12, 0x31, 0x23, 0x59, 0x59]),
            ],
        );
        let info = session.get_oldest_file_info().await.unwrap();
        assert_eq!(info.stroke_count, 0x0102);
        assert_eq!(
            info.timestamp,
            protocol::decode_device_time(&[0x23, 0x12, 0x31, 0x23, 0x59, 0x59]).unwrap()
        );
    }

    #[tokio::test]
    async fn test_oldest_file_info_defaults() {
        let (session, _device) = session(ProtocolVariant::Slate);
        let before = Utc::now().timestamp();
        let info = session.get_oldest_file_info().await.unwrap();
        assert_eq!(info.stroke_count, 0);
        assert!(info.timestamp >= before);
    }

    #[tokio::test]
    async fn test_missing_file_info_uses_short_timeout() {
        let router = NotificationRouter::new();
        let device = FakeDevice::new(&router);
        let settings = ProtocolSettings {
            reply_timeout_ms: 2000,
            optional_reply_timeout_ms: 20,
            ..fast_settings()
        };
        let session = DeviceSession::new(device, router, settings, ProtocolVariant::Slate);
        let started = std::time::Instant::now();
        let info = session.get_oldest_file_info().await.unwrap();
        assert_eq!(info.stroke_count, 0);
        // both replies are optional, so neither wait may use the full reply timeout
        assert!(started.elapsed() < Duration::from_millis(1000));
    }

    #[tokio::test]
    async fn test_download_with_immediate_end_marker() {
        let (session, device) = session(ProtocolVariant::Slate);
        device.on(
            0xC3,
            vec![
                cmd(&[0xC8, 0x01, 0xBE]),
                bulk(&[0x62, 0x38, 0x62, 0x74]),
                bulk(&[0xFF; 9]),
                cmd(&[0xC8, 0x01, 0xED]),
            ],
        );
        let data = session.download_oldest_file().await.unwrap();
        assert_eq!(data.len(), 13);
        assert!(session.router.transfer().is_empty());
    }

    #[tokio::test]
    async fn test_download_with_late_data() {
        let (session, device) = session(ProtocolVariant::Slate);
        device.on(
            0xC3,
            vec![
                cmd(&[0xC8, 0x01, 0xBE]),
                later(bulk(&[1, 2, 3, 4, 5]), 10),
                later(bulk(&[6, 7, 8, 9]), 20),
                later(cmd(&[0xC8, 0x01, 0xED]), 30),
            ],
        );
        let data = session.download_oldest_file().await.unwrap();
        assert_eq!(data, vec![1, 2, 3, 4, 5, 6, 7, 8, 9]);
    }

    #[tokio::test]
    async fn test_download_clears_stale_bytes() {
        let (session, device) = session(ProtocolVariant::Slate);
        session.router.transfer().append(&[0xAA; 4]);
        device.on(0xC3, vec![cmd(&[0xC8, 0x01, 0xBE]), cmd(&[0xC8, 0x01, 0xED])]);
        assert!(session.download_oldest_file().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_download_bad_marker() {
        let (session, device) = session(ProtocolVariant::Slate);
        device.on(0xC3, vec![cmd(&[0xC8, 0x01, 0x42])]);
        assert!(matches!(
            session.download_oldest_file().await,
            Err(ProtocolError::Desync(_))
        ));
    }

    #[tokio::test]
    async fn test_download_end_timeout() {
        let (session, device) = session(ProtocolVariant::Slate);
        device.on(0xC3, vec![cmd(&[0xC8, 0x01, 0xBE])]);
        let err = session.download_oldest_file().await.unwrap_err();
        assert!(err.is_retryable());
    }

    #[tokio::test]
    async fn test_delete_tolerance() {
        let (session, device) = session(ProtocolVariant::Slate);
        device
            .on(0xCA, vec![cmd(&[0xB3, 0x01, 0x00])])
            .on(0xCA, vec![cmd(&[0xB3, 0x01, 0x01])])
            .on(0xCA, vec![cmd(&[0xB3, 0x01, 0x02])])
            .on(0xCA, vec![cmd(&[0xB3, 0x01, 0x07])]);
        session.delete_oldest_file().await.unwrap();
        session.delete_oldest_file().await.unwrap();
        session.delete_oldest_file().await.unwrap();
        assert!(matches!(
            session.delete_oldest_file().await,
            Err(ProtocolError::DeviceStatus { .. })
        ));
        // slate must acknowledge
        assert!(session.delete_oldest_file().await.unwrap_err().is_retryable());
    }

    #[tokio::test]
    async fn test_spark_delete_without_ack() {
        let (session, _device) = session(ProtocolVariant::Spark);
        session.delete_oldest_file().await.unwrap();
    }

    #[tokio::test]
    async fn test_register_intuos_pro() {
        let (mut session, device) = session(ProtocolVariant::Slate);
        device
            .on(0xE6, vec![cmd(&[0x51, 0x01, 0x00])])
            .on(0xE3, vec![later(cmd(&[0x53, 0x00]), 20)])
            .on(0xE5, vec![cmd(&[0xB3, 0x01, 0x00])]);
        let variant = session
            .register(UUID, RegistrationFlow::ButtonConfirm)
            .await
            .unwrap();
        assert_eq!(variant, ProtocolVariant::IntuosPro);
        assert_eq!(session.variant(), ProtocolVariant::IntuosPro);
        assert_eq!(session.uuid(), Some(UUID));
        assert_eq!(device.written_opcodes(), vec![0xE6, 0xE3, 0xE5]);
    }

    #[tokio::test]
    async fn test_register_slate() {
        let (mut session, device) = session(ProtocolVariant::IntuosPro);
        device
            .on(0xE6, vec![cmd(&[0x51, 0x01, 0x00])])
            .on(0xE3, vec![cmd(&[0xE4, 0x00])])
            .on(0xE5, vec![cmd(&[0xB3, 0x01, 0x00])]);
        let variant = session
            .register(UUID, RegistrationFlow::ButtonConfirm)
            .await
            .unwrap();
        assert_eq!(variant, ProtocolVariant::Slate);
    }

    #[tokio::test]
    async fn test_register_button_timeout() {
        let (mut session, device) = session(ProtocolVariant::Slate);
        device.on(0xE6, vec![cmd(&[0x51, 0x01, 0x00])]);
        let err = session
            .register(UUID, RegistrationFlow::ButtonConfirm)
            .await
            .unwrap_err();
        assert!(err.is_retryable());
        assert_eq!(session.uuid(), None);
    }

    #[tokio::test]
    async fn test_register_complete_refused() {
        let (mut session, device) = session(ProtocolVariant::Slate);
        device
            .on(0xE3, vec![cmd(&[0xE4, 0x00])])
            .on(0xE5, vec![cmd(&[0xB3, 0x01, 0x01])]);
        assert!(matches!(
            session.register(UUID, RegistrationFlow::ButtonConfirm).await,
            Err(ProtocolError::RegistrationRejected)
        ));
    }

    #[tokio::test]
    async fn test_register_spark_ignores_finalize_failures() {
        let (mut session, device) = session(ProtocolVariant::Slate);
        device.on(0xE7, vec![later(cmd(&[0xB3, 0x01, 0x00]), 20)]);
        let variant = session
            .register(UUID, RegistrationFlow::UuidPrompt)
            .await
            .unwrap();
        assert_eq!(variant, ProtocolVariant::Spark);
        assert_eq!(device.written_opcodes(), vec![0xE7, 0xB6, 0xB6, 0xEC]);
        assert_eq!(&device.written()[0][2..], &UUID.0[..]);
    }

    #[tokio::test]
    async fn test_device_info_queries() {
        let (session, device) = session(ProtocolVariant::Slate);
        device
            .on(0xB9, vec![cmd(&[0xBA, 0x02, 87, 0x01])])
            .on(0xBB, vec![cmd(&[0xBC, 0x06, b'S', b'l', b'a', b't', b'e', 0])])
            .on(0xB7, vec![cmd(&[0xB8, 0x03, 0x00, 0x01, 0x02])])
            .on(0xB7, vec![cmd(&[0xB8, 0x03, 0x01, 0x0A, 0x0B])]);
        assert_eq!(
            session.get_battery().await.unwrap(),
            BatteryState {
                percent: 87,
                charging: true
            }
        );
        assert_eq!(session.get_name().await.unwrap(), "Slate");
        assert_eq!(session.get_firmware_version().await.unwrap(), "0102-0a0b");
    }
}

//! The device session state machine: GATT lifecycle, command transmission,
//! notification demultiplexing, and the inactivity watchdog. See §4.4, §4.5.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;

use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;
use tokio::time::sleep;
use tracing::{debug, info, trace, warn};

use crate::error::KjError;
use crate::framer::{FrameAssembler, FrameEvent};
use crate::protocol::{CommandName, ProtocolSpec, ResponseDecoder, ResponseKind};
use crate::record::{CachedRecord, DecodedRecord};
use crate::transport::{Characteristic, ConnectedHandle, DeviceIdentity, Transport, TransportEvent};

/// Internal key names partitioned out of every decoded record before it
/// reaches a consumer — frame plumbing, not BMS data. A protocol author
/// supplies its own set; `jk::INTERNAL_KEYS` is the worked default.
pub type InternalKeys = &'static [&'static str];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionStatus {
    Disconnected,
    Scanning,
    Connecting,
    Connected,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, strum_macros::Display)]
#[strum(serialize_all = "lowercase")]
pub enum DisconnectReason {
    User,
    External,
    Inactivity,
    Error,
}

/// The consumer-supplied callback set (§6), modeled as a single observer
/// interface with default no-op methods — the "callback bag" of §9.
pub trait SessionObserver: Send + Sync {
    fn on_status_change(&self, _status: SessionStatus) {}
    fn on_connected(&self, _identity: &DeviceIdentity) {}
    fn on_disconnected(&self, _reason: DisconnectReason) {}
    fn on_request_device_error(&self, _error: &KjError) {}
    fn on_previous_unavailable(&self, _device: Option<&DeviceIdentity>) {}
    fn on_data_received(&self, _kind: &ResponseKind, _record: &DecodedRecord) {}
    fn on_error(&self, _error: &KjError) {}
}

/// A no-op observer, useful as a placeholder or in tests that only care
/// about the session's own state.
pub struct NullObserver;
impl SessionObserver for NullObserver {}

const DISCONNECT_SETTLE: std::time::Duration = std::time::Duration::from_millis(100);

struct Live {
    identity: DeviceIdentity,
    characteristic: Box<dyn Characteristic>,
}

/// Owns the GATT connection lifecycle, command transmission, notification
/// demultiplexing, and the decoded-record cache for one device at a time.
///
/// Single-threaded cooperative concurrency (§5): `connect`/`disconnect`/
/// `send_command` are meant to be awaited one at a time by the host; the
/// `Mutex`es here guard state shared with the watchdog and event-drain
/// tasks, not a general-purpose concurrent API.
pub struct DeviceSession<T: Transport> {
    transport: Arc<T>,
    protocol: ProtocolSpec,
    decoder: ResponseDecoder,
    observer: Arc<dyn SessionObserver>,
    internal_keys: InternalKeys,

    status: Mutex<SessionStatus>,
    live: Mutex<Option<Live>>,
    events: Mutex<Option<mpsc::Receiver<TransportEvent>>>,
    assembler: Mutex<FrameAssembler>,
    cache: Mutex<HashMap<ResponseKind, CachedRecord>>,
    last_activity: Mutex<Instant>,
    watchdog: Mutex<Option<JoinHandle<()>>>,
}

impl<T: Transport + 'static> DeviceSession<T> {
    pub fn new(
        transport: Arc<T>,
        decoder: ResponseDecoder,
        observer: Arc<dyn SessionObserver>,
        internal_keys: InternalKeys,
    ) -> Arc<Self> {
        let protocol = decoder.protocol().clone();
        let assembler = FrameAssembler::new(protocol.segment_header.clone());
        Arc::new(Self {
            transport,
            protocol,
            decoder,
            observer,
            internal_keys,
            status: Mutex::new(SessionStatus::Disconnected),
            live: Mutex::new(None),
            events: Mutex::new(None),
            assembler: Mutex::new(assembler),
            cache: Mutex::new(HashMap::new()),
            last_activity: Mutex::new(Instant::now()),
            watchdog: Mutex::new(None),
        })
    }

    pub async fn status(&self) -> SessionStatus {
        *self.status.lock().await
    }

    pub async fn cached(&self, kind: &ResponseKind) -> Option<CachedRecord> {
        self.cache.lock().await.get(kind).cloned()
    }

    /// When the most recent record of `kind` was cached, for a consumer
    /// that wants staleness without retaining the record itself.
    pub async fn last_seen(&self, kind: &ResponseKind) -> Option<std::time::SystemTime> {
        self.cache.lock().await.get(kind).map(|cached| cached.timestamp)
    }

    async fn set_status(&self, status: SessionStatus) {
        *self.status.lock().await = status;
        self.observer.on_status_change(status);
    }

    /// Connect, optionally to a previously paired `identity`. See §4.5.
    pub async fn connect(self: &Arc<Self>, previous: Option<&DeviceIdentity>) -> Result<(), KjError> {
        self.set_status(SessionStatus::Scanning).await;

        let chosen = match previous {
            Some(identity) if self.transport.supports_previous_device_reconnect() => {
                match self.await_previous(identity).await {
                    Some(identity) => identity,
                    None => {
                        self.set_status(SessionStatus::Disconnected).await;
                        return Ok(());
                    }
                }
            }
            Some(_) | None => match self.request_interactive().await {
                Ok(identity) => identity,
                Err(err) => {
                    self.set_status(SessionStatus::Disconnected).await;
                    return Err(err);
                }
            },
        };

        self.set_status(SessionStatus::Connecting).await;
        match self.establish(chosen.clone()).await {
            Ok(()) => {
                self.set_status(SessionStatus::Connected).await;
                self.observer.on_connected(&chosen);
                self.spawn_watchdog().await;
                self.run_bootstrap().await;
                Ok(())
            }
            Err(err) => {
                self.observer.on_request_device_error(&err);
                self.disconnect(DisconnectReason::Error).await?;
                Err(err)
            }
        }
    }

    /// Wait for `identity` to advertise, or time out. Returns `Some` if a
    /// previously paired device is known and advertises in time.
    async fn await_previous(&self, identity: &DeviceIdentity) -> Option<DeviceIdentity> {
        let known = self.transport.list_known_devices().await.unwrap_or_default();
        let matched = known.into_iter().find(|d| d.id == identity.id);
        let Some(matched) = matched else {
            self.observer.on_previous_unavailable(None);
            return None;
        };

        let watch = match self.transport.watch_advertisement(&matched.id).await {
            Ok(watch) => watch,
            Err(err) => {
                self.observer.on_error(&err);
                self.observer.on_previous_unavailable(Some(&matched));
                return None;
            }
        };

        let timeout = self.protocol.connect_previous_timeout;
        // The watch is always driven to completion on one branch or the
        // other — either it resolves, or the race drops it, which cancels
        // the underlying watcher. Abortable, single owner, per §9.
        tokio::select! {
            seen = watch.wait() => {
                if seen.is_some() {
                    Some(matched)
                } else {
                    self.observer.on_previous_unavailable(Some(&matched));
                    None
                }
            }
            _ = sleep(timeout) => {
                self.observer.on_previous_unavailable(Some(&matched));
                None
            }
        }
    }

    async fn request_interactive(&self) -> Result<DeviceIdentity, KjError> {
        self.transport.request_device(&self.protocol.service_uuid).await.inspect_err(|err| {
            self.observer.on_request_device_error(err);
        })
    }

    async fn establish(&self, identity: DeviceIdentity) -> Result<(), KjError> {
        let ConnectedHandle { mut characteristic, events } = self
            .transport
            .connect(&identity, &self.protocol.service_uuid, &self.protocol.characteristic_uuid)
            .await?;

        characteristic.start_notifications().await?;
        self.assembler.lock().await.reset();
        *self.events.lock().await = Some(events);
        *self.live.lock().await = Some(Live { identity, characteristic });
        self.register_activity().await;

        Ok(())
    }

    async fn run_bootstrap(&self) {
        for command in [crate::jk::get_settings(), crate::jk::get_device_info()] {
            if let Err(err) = self.send_command(&command, &[]).await {
                warn!(%command, ?err, "bootstrap command failed");
                self.observer.on_error(&err);
            }
        }
    }

    /// Drain transport events (notifications, unsolicited disconnects) until
    /// the session leaves `Connected`. Call this in a loop alongside
    /// `connect`; it returns once the status changes so the host can decide
    /// whether to reconnect.
    ///
    /// Takes the receiver out of `self.events` for the duration of the
    /// drain so the mutex is never held across `recv().await` — otherwise a
    /// concurrent `disconnect` (the watchdog firing, or an external
    /// disconnect racing this loop) would block forever on
    /// `*self.events.lock().await = None` while this task is parked waiting
    /// for the next notification.
    pub async fn drain_events(self: &Arc<Self>) -> Result<(), KjError> {
        let Some(mut receiver) = self.events.lock().await.take() else {
            return Ok(());
        };

        loop {
            match receiver.recv().await {
                Some(event) => self.handle_transport_event(event).await?,
                None => return Ok(()),
            }
            if self.status().await != SessionStatus::Connected {
                return Ok(());
            }
        }
    }

    async fn handle_transport_event(self: &Arc<Self>, event: TransportEvent) -> Result<(), KjError> {
        self.register_activity().await;
        match event {
            TransportEvent::CharacteristicValueChanged(bytes) => self.handle_notification(&bytes).await,
            TransportEvent::GattServerDisconnected => {
                self.disconnect(DisconnectReason::External).await?;
                Ok(())
            }
        }
    }

    async fn handle_notification(&self, bytes: &[u8]) -> Result<(), KjError> {
        let outcome = self.assembler.lock().await.feed(bytes, &self.protocol);
        match outcome {
            FrameEvent::Pending | FrameEvent::OrphanDropped => {}
            FrameEvent::UnknownSegmentType(byte) => {
                debug!(byte, "segment type not recognized by any response definition");
            }
            FrameEvent::ChecksumFailure => {
                trace!("checksum failure, buffer flushed");
            }
            FrameEvent::Ready(segment) => {
                let header_len = self.protocol.segment_header.len();
                let signature = &segment[header_len..header_len + 1];
                match self.decoder.decode(signature, &segment) {
                    Ok((kind, record)) => self.dispatch(kind, record).await,
                    Err(err) => {
                        // §7: DecodeFailure is logged, not necessarily surfaced —
                        // later frames may still decode successfully.
                        warn!(?err, "decode failed, buffer flushed");
                    }
                }
            }
        }
        Ok(())
    }

    async fn dispatch(&self, kind: ResponseKind, record: DecodedRecord) {
        let (public, _internal) = record.partition_by_keys(self.internal_keys);

        let mut cache = self.cache.lock().await;
        let time_since_last = cache
            .get(&kind)
            .and_then(|previous| std::time::SystemTime::now().duration_since(previous.timestamp).ok());
        cache.insert(
            kind.clone(),
            CachedRecord {
                record: public.clone(),
                timestamp: std::time::SystemTime::now(),
                time_since_last,
            },
        );
        drop(cache);

        self.observer.on_data_received(&kind, &public);
    }

    /// Send a command by name with an optional payload. See §4.4.
    pub async fn send_command(&self, name: &CommandName, payload: &[u8]) -> Result<(), KjError> {
        self.register_activity().await;

        let command = self.protocol.get_command_by_name(name).ok_or_else(|| KjError::UnknownCommand(name.clone()))?;

        let mut wire = Vec::with_capacity(self.protocol.command_length);
        wire.extend_from_slice(&self.protocol.command_header);
        wire.extend_from_slice(&command.code);
        wire.extend_from_slice(payload);

        let limit = self.protocol.command_length;
        if wire.len() > limit {
            return Err(KjError::CommandOverflow { actual: wire.len(), limit });
        }
        wire.resize(limit, 0);

        let checksum = crate::hex::additive_checksum(&wire[..limit - 1]);
        *wire.last_mut().unwrap() = checksum;

        let timeout = command.timeout;
        let post_send_wait = command.post_send_wait;
        let with_response = !payload.is_empty();

        let write = async {
            let mut guard = self.live.lock().await;
            let Some(live) = guard.as_mut() else { return Err(KjError::NotConnected) };
            if with_response {
                live.characteristic.write_with_response(&wire).await
            } else {
                live.characteristic.write_without_response(&wire).await
            }
        };

        tokio::select! {
            result = write => result?,
            _ = sleep(timeout) => return Err(KjError::CommandTimeout(timeout)),
        }

        if !post_send_wait.is_zero() {
            sleep(post_send_wait).await;
        }

        Ok(())
    }

    /// `toggleCharging`/`toggleDischarging` — §4.5 settings writes. Always
    /// re-requests `GET_SETTINGS` afterward, regardless of the write's outcome.
    async fn write_setting(&self, command: CommandName, enabled: bool) -> Result<(), KjError> {
        let payload = [if enabled { 0x01 } else { 0x00 }];
        let result = self.send_command(&command, &payload).await;
        let refresh = self.send_command(&crate::jk::get_settings(), &[]).await;
        result.and(refresh)
    }

    pub async fn toggle_charging(&self, enabled: bool) -> Result<(), KjError> {
        self.write_setting(crate::jk::toggle_charging(), enabled).await
    }

    pub async fn toggle_discharging(&self, enabled: bool) -> Result<(), KjError> {
        self.write_setting(crate::jk::toggle_discharging(), enabled).await
    }

    /// Rearm the inactivity watchdog: record this moment as the latest
    /// activity. The watchdog task (see `spawn_watchdog`) reads this on
    /// every wakeup and recomputes its deadline from it.
    async fn register_activity(&self) {
        *self.last_activity.lock().await = Instant::now();
    }

    /// Start the single-shot, restartable inactivity watchdog for this
    /// connection. A single owner: any previous watchdog task (there
    /// shouldn't be one, since `establish` only runs from `Disconnected`) is
    /// aborted first, and this one is aborted on every `disconnect`.
    async fn spawn_watchdog(self: &Arc<Self>) {
        let session = Arc::clone(self);
        let handle = tokio::spawn(async move {
            let timeout = session.protocol.inactivity_timeout;
            loop {
                if session.status().await != SessionStatus::Connected {
                    return;
                }
                let deadline = *session.last_activity.lock().await + timeout;
                let now = Instant::now();
                if now >= deadline {
                    info!("inactivity watchdog fired");
                    let _ = session.disconnect(DisconnectReason::Inactivity).await;
                    return;
                }
                sleep(deadline - now).await;
            }
        });

        if let Some(old) = self.watchdog.lock().await.replace(handle) {
            old.abort();
        }
    }

    /// Tear down the connection. Idempotent (§5, §8 property 7): calling
    /// this while already disconnected is a no-op that logs a warning.
    pub async fn disconnect(&self, reason: DisconnectReason) -> Result<(), KjError> {
        if self.status().await == SessionStatus::Disconnected {
            warn!("disconnect called while already disconnected, ignoring");
            return Ok(());
        }

        let result = self.run_disconnect(reason).await;

        if let Err(err) = &result {
            warn!(?err, "disconnect failed, requesting host reload as last resort");
            self.transport.request_host_reload().await;
            return Err(KjError::DisconnectWhileDisconnecting(err.to_string()));
        }

        Ok(())
    }

    async fn run_disconnect(&self, reason: DisconnectReason) -> Result<(), KjError> {
        if let Some(handle) = self.watchdog.lock().await.take() {
            handle.abort();
        }

        let mut guard = self.live.lock().await;
        if let Some(live) = guard.as_mut() {
            if reason != DisconnectReason::External {
                if let Err(err) = live.characteristic.stop_notifications().await {
                    warn!(?err, "stop_notifications failed during disconnect, continuing");
                }
                sleep(DISCONNECT_SETTLE).await;
                self.transport.disconnect(&live.identity).await?;
                sleep(DISCONNECT_SETTLE).await;
            }
        }
        drop(guard);

        *self.live.lock().await = None;
        *self.events.lock().await = None;
        self.assembler.lock().await.reset();
        self.cache.lock().await.clear();

        self.set_status(SessionStatus::Disconnected).await;
        self.observer.on_disconnected(reason);
        info!(%reason, "session disconnected");
        Ok(())
    }
}

//! Black-box session-level scenarios (§8 E, F, G) against a fake transport.
//! Frame reassembly and decode scenarios (A-D, H) live as unit tests
//! alongside `framer.rs`/`decoder.rs`/`record.rs` since they don't need the
//! session or a transport at all.

use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;

use jk_bms_core::protocol::{CompactCommand, CompactProtocol, CompactResponse, CommandName, ResponseDecoder, ResponseKind};
use jk_bms_core::session::{DeviceSession, DisconnectReason, NullObserver, SessionObserver, SessionStatus};
use jk_bms_core::transport::{
    Advertisement, AdvertisementWatch, ConnectedHandle, DeviceIdentity, Characteristic, Transport, TransportEvent,
};
use jk_bms_core::KjError;
use tokio::sync::mpsc;

fn test_protocol() -> CompactProtocol {
    CompactProtocol {
        service_uuid: "svc".into(),
        characteristic_uuid: "chr".into(),
        segment_header: vec![0x55, 0xAA, 0xEB, 0x90],
        command_header: vec![0xAA, 0x55, 0x90, 0xEB],
        command_length: 8,
        inactivity_timeout: Duration::from_millis(120),
        connect_previous_timeout: Duration::from_millis(80),
        commands: vec![
            CompactCommand {
                name: CommandName::new("GET_SETTINGS"),
                code: vec![0x97],
                timeout: Duration::from_millis(200),
                post_send_wait: Duration::from_millis(1),
            },
            CompactCommand {
                name: CommandName::new("GET_DEVICE_INFO"),
                code: vec![0x96],
                timeout: Duration::from_millis(200),
                post_send_wait: Duration::from_millis(1),
            },
            CompactCommand {
                name: CommandName::new("TOO_BIG"),
                code: vec![0x01, 0x02, 0x03, 0x04, 0x05, 0x06, 0x07, 0x08],
                timeout: Duration::from_millis(200),
                post_send_wait: Duration::ZERO,
            },
        ],
        responses: vec![CompactResponse {
            kind: ResponseKind::new("CELL_INFO"),
            signature: vec![0x02],
            length: 0,
            items: vec![],
        }],
    }
}

struct MockCharacteristic {
    writes: mpsc::UnboundedSender<Vec<u8>>,
}

#[async_trait::async_trait]
impl Characteristic for MockCharacteristic {
    async fn start_notifications(&mut self) -> Result<(), KjError> {
        Ok(())
    }
    async fn stop_notifications(&mut self) -> Result<(), KjError> {
        Ok(())
    }
    async fn write_with_response(&mut self, bytes: &[u8]) -> Result<(), KjError> {
        let _ = self.writes.send(bytes.to_vec());
        Ok(())
    }
    async fn write_without_response(&mut self, bytes: &[u8]) -> Result<(), KjError> {
        let _ = self.writes.send(bytes.to_vec());
        Ok(())
    }
}

struct MockTransport {
    known: Vec<DeviceIdentity>,
    advertises: bool,
    supports_previous: bool,
    fail_request: bool,
    writes_tx: mpsc::UnboundedSender<Vec<u8>>,
}

impl MockTransport {
    fn new(known: Vec<DeviceIdentity>, advertises: bool, supports_previous: bool) -> (Arc<Self>, mpsc::UnboundedReceiver<Vec<u8>>) {
        Self::with_options(known, advertises, supports_previous, false)
    }

    fn with_options(
        known: Vec<DeviceIdentity>,
        advertises: bool,
        supports_previous: bool,
        fail_request: bool,
    ) -> (Arc<Self>, mpsc::UnboundedReceiver<Vec<u8>>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let transport = Arc::new(Self {
            known,
            advertises,
            supports_previous,
            fail_request,
            writes_tx: tx,
        });
        (transport, rx)
    }
}

#[async_trait::async_trait]
impl Transport for MockTransport {
    async fn list_known_devices(&self) -> Result<Vec<DeviceIdentity>, KjError> {
        Ok(self.known.clone())
    }

    async fn request_device(&self, _service_uuid: &str) -> Result<DeviceIdentity, KjError> {
        if self.fail_request {
            return Err(KjError::TransportFailure("no device selected".into()));
        }
        Ok(DeviceIdentity {
            id: "interactive-device".into(),
            name: "JK-BD".into(),
        })
    }

    async fn watch_advertisement(&self, _id: &str) -> Result<AdvertisementWatch, KjError> {
        let (tx, rx) = mpsc::channel(1);
        if self.advertises {
            let _ = tx.try_send(Advertisement { rssi: -50 });
        }
        // If not advertising, `tx` is dropped here and the watch's receiver
        // simply closes without ever yielding — `wait()` resolves `None`,
        // same as a transport-side cancellation.
        Ok(AdvertisementWatch::new(rx))
    }

    async fn connect(
        &self,
        _device: &DeviceIdentity,
        _service_uuid: &str,
        _characteristic_uuid: &str,
    ) -> Result<ConnectedHandle, KjError> {
        let (_events_tx, events_rx) = mpsc::channel(8);
        Ok(ConnectedHandle {
            characteristic: Box::new(MockCharacteristic {
                writes: self.writes_tx.clone(),
            }),
            events: events_rx,
        })
    }

    async fn disconnect(&self, _device: &DeviceIdentity) -> Result<(), KjError> {
        Ok(())
    }

    fn supports_previous_device_reconnect(&self) -> bool {
        self.supports_previous
    }

    async fn request_host_reload(&self) {}
}

fn observer() -> Arc<dyn SessionObserver> {
    Arc::new(NullObserver)
}

fn decoder() -> ResponseDecoder {
    ResponseDecoder::new(test_protocol()).unwrap()
}

/// Route the session's `tracing` spans to the test harness's captured
/// output instead of stdout, so `cargo test -- --nocapture` shows lifecycle
/// logging alongside assertion failures. Safe to call from every test;
/// `try_init` is a no-op once a global subscriber is already set.
fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

#[tokio::test]
async fn command_overflow_is_fatal_and_does_not_write() {
    init_tracing();
    let (transport, mut writes) = MockTransport::new(vec![], false, true);
    let session = DeviceSession::new(transport, decoder(), observer(), &[]);

    session.connect(None).await.unwrap();
    assert_eq!(session.status().await, SessionStatus::Connected);

    // Drain the two bootstrap writes (GET_SETTINGS, GET_DEVICE_INFO).
    writes.recv().await.unwrap();
    writes.recv().await.unwrap();

    let err = session.send_command(&CommandName::new("TOO_BIG"), &[]).await.unwrap_err();
    assert!(matches!(err, KjError::CommandOverflow { .. }));
    assert!(writes.try_recv().is_err(), "overflowing command must never reach the wire");
}

#[tokio::test]
async fn reconnect_to_previous_times_out_when_not_advertising() {
    init_tracing();
    let previous = DeviceIdentity {
        id: "paired-1".into(),
        name: "JK-BD".into(),
    };
    let (transport, _writes) = MockTransport::new(vec![previous.clone()], false, true);
    let session = DeviceSession::new(transport, decoder(), observer(), &[]);

    let started = std::time::Instant::now();
    session.connect(Some(&previous)).await.unwrap();
    let elapsed = started.elapsed();

    assert_eq!(session.status().await, SessionStatus::Disconnected);
    assert!(elapsed >= Duration::from_millis(80), "must wait out connectPreviousTimeout, elapsed {elapsed:?}");
    assert!(elapsed < Duration::from_secs(2), "must not hang well past the timeout, elapsed {elapsed:?}");
}

#[tokio::test]
async fn reconnect_to_previous_succeeds_when_advertising() {
    init_tracing();
    let previous = DeviceIdentity {
        id: "paired-1".into(),
        name: "JK-BD".into(),
    };
    let (transport, mut writes) = MockTransport::new(vec![previous.clone()], true, true);
    let session = DeviceSession::new(transport, decoder(), observer(), &[]);

    session.connect(Some(&previous)).await.unwrap();
    assert_eq!(session.status().await, SessionStatus::Connected);

    // Bootstrap commands went out.
    writes.recv().await.unwrap();
    writes.recv().await.unwrap();
}

#[tokio::test]
async fn platform_without_previous_reconnect_support_goes_interactive() {
    init_tracing();
    let previous = DeviceIdentity {
        id: "paired-1".into(),
        name: "JK-BD".into(),
    };
    // `advertises: false` would normally time out, but `supports_previous:
    // false` must skip that path entirely and go straight to interactive.
    let (transport, mut writes) = MockTransport::new(vec![previous.clone()], false, false);
    let session = DeviceSession::new(transport, decoder(), observer(), &[]);

    let started = std::time::Instant::now();
    session.connect(Some(&previous)).await.unwrap();
    let elapsed = started.elapsed();

    assert_eq!(session.status().await, SessionStatus::Connected);
    assert!(elapsed < Duration::from_millis(80), "must not wait for connectPreviousTimeout on this platform");
    writes.recv().await.unwrap();
    writes.recv().await.unwrap();
}

#[tokio::test]
async fn inactivity_watchdog_disconnects_exactly_once() {
    init_tracing();
    struct CountingObserver {
        disconnects: StdMutex<u32>,
    }
    impl SessionObserver for CountingObserver {
        fn on_disconnected(&self, reason: DisconnectReason) {
            assert_eq!(reason, DisconnectReason::Inactivity);
            *self.disconnects.lock().unwrap() += 1;
        }
    }

    let (transport, mut writes) = MockTransport::new(vec![], false, true);
    let observer = Arc::new(CountingObserver {
        disconnects: StdMutex::new(0),
    });
    let session = DeviceSession::new(transport, decoder(), observer.clone(), &[]);

    session.connect(None).await.unwrap();
    writes.recv().await.unwrap();
    writes.recv().await.unwrap();

    // inactivityTimeout is 120ms; wait past it with no further commands or
    // notifications and the watchdog must tear the connection down.
    tokio::time::sleep(Duration::from_millis(300)).await;

    assert_eq!(session.status().await, SessionStatus::Disconnected);
    assert_eq!(*observer.disconnects.lock().unwrap(), 1);
}

#[tokio::test]
async fn disconnect_is_idempotent() {
    init_tracing();
    let (transport, mut writes) = MockTransport::new(vec![], false, true);
    let session = DeviceSession::new(transport, decoder(), observer(), &[]);

    session.connect(None).await.unwrap();
    writes.recv().await.unwrap();
    writes.recv().await.unwrap();

    session.disconnect(DisconnectReason::User).await.unwrap();
    assert_eq!(session.status().await, SessionStatus::Disconnected);
    // Second call is a documented no-op, not an error.
    session.disconnect(DisconnectReason::User).await.unwrap();
    assert_eq!(session.status().await, SessionStatus::Disconnected);
}

#[tokio::test]
async fn interactive_connect_failure_reverts_to_disconnected() {
    init_tracing();
    let (transport, _writes) = MockTransport::with_options(vec![], false, true, true);
    let session = DeviceSession::new(transport, decoder(), observer(), &[]);

    let err = session.connect(None).await.unwrap_err();
    assert!(matches!(err, KjError::TransportFailure(_)));
    assert_eq!(session.status().await, SessionStatus::Disconnected);
}

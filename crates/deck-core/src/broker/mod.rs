//! Session broker - sole owner of the transport.
//!
//! Multiplexes many client sessions onto one dispatcher, one tracker and
//! one event bus. Sessions never touch the transport directly.

mod link;
pub mod session;

use std::sync::Arc;

use parking_lot::{Mutex, RwLock};
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{info, instrument, warn};

use crate::config::BrokerConfig;
use crate::dispatcher::CommandDispatcher;
use crate::events::{EventBus, TracingObserver};
use crate::protocol::Command;
use crate::state::{DeviceState, StateTracker, TrackerDiagnostics};
use crate::transport::{DeckTransport, TransportError};

pub use link::LinkStatus;
pub use session::{EventStream, Session, SessionError, SessionId, SessionPhase};

use link::{LinkSupervisor, ReloadReply};
use session::SessionRegistry;

/// Point-in-time view of the broker.
#[derive(Debug, Clone)]
pub struct BrokerDiagnostics {
    pub link: LinkStatus,
    pub tracker: TrackerDiagnostics,
    pub sessions: usize,
    pub listeners: usize,
}

pub struct Broker {
    config: RwLock<BrokerConfig>,
    transport: Arc<dyn DeckTransport>,
    reloads: mpsc::Sender<ReloadReply>,
    tracker: Arc<StateTracker>,
    dispatcher: CommandDispatcher,
    registry: Arc<SessionRegistry>,
    link: watch::Receiver<LinkStatus>,
    shutdown: CancellationToken,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl Broker {
    /// Open the transport and start the read loop and write lane.
    ///
    /// Failing to open the transport here is fatal. Later failures only
    /// put the broker into degraded mode.
    #[instrument(skip_all, fields(transport = %transport.describe()))]
    pub async fn start(
        config: BrokerConfig,
        transport: Arc<dyn DeckTransport>,
    ) -> Result<Self, TransportError> {
        let (reader, writer) = transport.open()?;

        let bus = Arc::new(
            EventBus::new(config.queue_capacity).with_observer(Arc::new(TracingObserver)),
        );
        let tracker = Arc::new(StateTracker::new(bus));
        let (dispatcher, lane) = CommandDispatcher::spawn(tracker.clone());
        let (status_tx, status_rx) = watch::channel(LinkStatus::Disconnected);
        let shutdown = CancellationToken::new();
        let (reloads, reload_rx) = mpsc::channel(1);

        let supervisor = LinkSupervisor {
            transport: transport.clone(),
            tracker: tracker.clone(),
            dispatcher: dispatcher.clone(),
            status: status_tx,
            shutdown: shutdown.clone(),
            reconnect_interval: config.reconnect_interval(),
            enable_reporting: config.enable_reporting,
            reloads: reload_rx,
        };
        let link = supervisor.bring_up(writer).await;
        let read_loop = tokio::spawn(supervisor.run(reader, link));

        info!(socket = %config.socket_path.display(), "Broker started");

        Ok(Self {
            config: RwLock::new(config),
            transport,
            reloads,
            tracker,
            dispatcher,
            registry: Arc::new(SessionRegistry::default()),
            link: status_rx,
            shutdown,
            tasks: Mutex::new(vec![read_loop, lane]),
        })
    }

    /// Current configuration, including anything applied by [`Broker::reload`].
    pub fn config(&self) -> BrokerConfig {
        self.config.read().clone()
    }

    /// Point the transport at `config`'s port and baud rate and reopen it.
    ///
    /// Sessions stay connected; subscribers see `TransportLost` followed by
    /// `TransportRestored`. The access policy (`command_uids`) is replaced
    /// too. Socket, queue and reporting settings only apply at start.
    pub async fn reload(&self, config: BrokerConfig) -> Result<(), TransportError> {
        self.transport.reconfigure(&config.port, config.baud_rate);
        {
            let mut current = self.config.write();
            current.port = config.port;
            current.baud_rate = config.baud_rate;
            current.command_uids = config.command_uids;
        }
        let (reply, done) = oneshot::channel();
        self.reloads
            .send(reply)
            .await
            .map_err(|_| TransportError::Disconnected)?;
        done.await.map_err(|_| TransportError::Disconnected)?
    }

    /// Create a session. `may_command` comes from the IPC layer's access policy.
    pub fn open_session(&self, may_command: bool) -> Arc<Session> {
        self.registry.open(self.dispatcher.clone(), may_command)
    }

    pub fn state(&self) -> DeviceState {
        self.tracker.current()
    }

    pub fn link_status(&self) -> LinkStatus {
        *self.link.borrow()
    }

    /// Watch link status changes.
    pub fn watch_link(&self) -> watch::Receiver<LinkStatus> {
        self.link.clone()
    }

    pub fn session_count(&self) -> usize {
        self.registry.len()
    }

    pub fn diagnostics(&self) -> BrokerDiagnostics {
        BrokerDiagnostics {
            link: self.link_status(),
            tracker: self.tracker.diagnostics(),
            sessions: self.registry.len(),
            listeners: self.tracker.bus().listener_count(),
        }
    }

    /// Resolves once shutdown has begun.
    pub async fn stopped(&self) {
        self.shutdown.cancelled().await
    }

    /// Disconnect every session, switch reporting off and stop background tasks.
    pub async fn shutdown(&self) {
        if self.shutdown.is_cancelled() {
            return;
        }
        for session in self.registry.live() {
            session.disconnect();
        }
        if self.config.read().enable_reporting
            && self.link_status() == LinkStatus::Connected
            && let Err(e) = self.dispatcher.send(Command::Down).await
        {
            warn!(error = %e, "Failed to disable status reporting");
        }

        self.shutdown.cancel();
        let tasks: Vec<_> = self.tasks.lock().drain(..).collect();
        let mut tasks = tasks.into_iter();
        if let Some(read_loop) = tasks.next() {
            let _ = read_loop.await;
        }
        for task in tasks {
            task.abort();
        }
        info!("Broker stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dispatcher::DispatchError;
    use crate::events::DeckEvent;
    use crate::transport::{MockDevice, MockHarness, MockTransport};
    use std::time::Duration;

    async fn start(enable_reporting: bool) -> (Broker, MockHarness, MockDevice) {
        let (transport, mut harness) = MockTransport::new();
        let config = BrokerConfig {
            enable_reporting,
            reconnect_interval_ms: 20,
            ..Default::default()
        };
        let broker = Broker::start(config, Arc::new(transport)).await.unwrap();
        let device = harness.next_device().await;
        (broker, harness, device)
    }

    async fn next_state(stream: &mut EventStream) -> DeviceState {
        loop {
            let event = tokio::time::timeout(Duration::from_secs(2), stream.next())
                .await
                .expect("no event in time")
                .expect("stream ended");
            if let DeckEvent::StateChanged(change) = event {
                return change.current;
            }
        }
    }

    #[tokio::test]
    async fn test_start_fails_without_device() {
        let (transport, harness) = MockTransport::new();
        harness.set_available(false);
        let result = Broker::start(BrokerConfig::default(), Arc::new(transport)).await;
        assert!(matches!(result, Err(TransportError::OpenFailed { .. })));
    }

    #[tokio::test]
    async fn test_start_enables_reporting() {
        let (broker, _harness, mut device) = start(true).await;
        assert_eq!(device.next_command().await, Some(Command::Up));
        assert_eq!(broker.link_status(), LinkStatus::Connected);
        assert_eq!(broker.state(), DeviceState::Unknown);
    }

    #[tokio::test]
    async fn test_eject_then_expect_ejected() {
        let (broker, _harness, mut device) = start(false).await;
        let session = broker.open_session(true);

        session.command(Command::Eject).await.unwrap();
        assert_eq!(device.next_byte().await, Some(0x08));

        let waiter = tokio::spawn({
            let session = session.clone();
            async move {
                session
                    .expect_state(DeviceState::Ejected, Some(Duration::from_millis(500)))
                    .await
            }
        });
        device.emit(&[0x32, 0x32, 0x3C, 0x3C]).await;
        assert_eq!(waiter.await.unwrap().unwrap(), DeviceState::Ejected);
        assert_eq!(session.get_state().unwrap(), DeviceState::Ejected);
    }

    #[tokio::test]
    async fn test_expect_times_out_without_status() {
        let (broker, _harness, _device) = start(false).await;
        let session = broker.open_session(true);
        let err = session
            .expect_state(DeviceState::PlayingB, Some(Duration::from_millis(100)))
            .await
            .unwrap_err();
        assert!(matches!(err, SessionError::Timeout { timeout_ms: 100 }));
    }

    #[tokio::test]
    async fn test_up_then_ready_then_stopped() {
        let (broker, _harness, mut device) = start(false).await;
        let session = broker.open_session(true);
        let mut stream = session.subscribe().unwrap();

        session.command(Command::Up).await.unwrap();
        assert_eq!(device.next_command().await, Some(Command::Up));
        device.emit(&[0x15, 0x15, 0x15, 0x32, 0x32]).await;

        assert_eq!(next_state(&mut stream).await, DeviceState::Ready);
        assert_eq!(next_state(&mut stream).await, DeviceState::Stopped);
    }

    #[tokio::test]
    async fn test_subscribers_see_same_order() {
        let (broker, _harness, mut device) = start(false).await;
        let a = broker.open_session(false);
        let b = broker.open_session(false);
        let mut stream_a = a.subscribe().unwrap();
        let mut stream_b = b.subscribe().unwrap();

        device.emit(&[0x0A, 0x0C, 0x0A, 0x32]).await;

        let expected = [
            DeviceState::PlayingA,
            DeviceState::PausedA,
            DeviceState::PlayingA,
            DeviceState::Stopped,
        ];
        for state in expected {
            assert_eq!(next_state(&mut stream_a).await, state);
            assert_eq!(next_state(&mut stream_b).await, state);
        }
    }

    #[tokio::test]
    async fn test_disconnect_cancels_only_that_session() {
        let (broker, _harness, mut device) = start(false).await;
        let leaving = broker.open_session(true);
        let staying = broker.open_session(true);

        let spawn_wait = |session: Arc<Session>| {
            tokio::spawn(async move {
                session
                    .expect_state(DeviceState::Stopped, Some(Duration::from_secs(2)))
                    .await
            })
        };
        let cancelled = spawn_wait(leaving.clone());
        let resolved = spawn_wait(staying.clone());
        while broker.diagnostics().listeners < 2 {
            tokio::task::yield_now().await;
        }

        leaving.disconnect();
        assert!(matches!(
            cancelled.await.unwrap(),
            Err(SessionError::Cancelled)
        ));
        assert_eq!(broker.session_count(), 1);

        device.emit(&[0x32]).await;
        assert_eq!(resolved.await.unwrap().unwrap(), DeviceState::Stopped);
    }

    #[tokio::test]
    async fn test_transport_loss_degrades_then_recovers() {
        let (broker, mut harness, device) = start(true).await;
        let session = broker.open_session(true);
        let mut stream = session.subscribe().unwrap();
        let mut link = broker.watch_link();

        harness.set_available(false);
        device.unplug();

        let lost = tokio::time::timeout(Duration::from_secs(2), stream.next())
            .await
            .unwrap()
            .unwrap();
        assert!(matches!(lost, DeckEvent::TransportLost { .. }));
        link.wait_for(|s| *s == LinkStatus::Disconnected).await.unwrap();

        let err = session.command(Command::PlaySideA).await.unwrap_err();
        assert!(matches!(
            err,
            SessionError::Dispatch(DispatchError::Transport(TransportError::Disconnected))
        ));

        harness.set_available(true);
        let mut device = harness.next_device().await;
        assert_eq!(device.next_command().await, Some(Command::Up));
        link.wait_for(|s| *s == LinkStatus::Connected).await.unwrap();

        let restored = tokio::time::timeout(Duration::from_secs(2), stream.next())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(restored, DeckEvent::TransportRestored);

        session.command(Command::PlaySideA).await.unwrap();
        assert_eq!(device.next_command().await, Some(Command::PlaySideA));
        assert!(harness.open_count() >= 2);
    }

    #[tokio::test]
    async fn test_transport_loss_resets_known_state() {
        let (broker, _harness, mut device) = start(false).await;
        let session = broker.open_session(false);
        device.emit(&[0x14]).await;
        session
            .expect_state(DeviceState::PlayingB, Some(Duration::from_secs(1)))
            .await
            .unwrap();

        let mut stream = session.subscribe().unwrap();
        device.unplug();
        let mut saw_lost = false;
        loop {
            match tokio::time::timeout(Duration::from_secs(2), stream.next())
                .await
                .unwrap()
                .unwrap()
            {
                DeckEvent::TransportLost { .. } => saw_lost = true,
                DeckEvent::StateChanged(change) => {
                    assert!(saw_lost);
                    assert_eq!(change.previous, DeviceState::PlayingB);
                    assert_eq!(change.current, DeviceState::Unknown);
                    break;
                }
                DeckEvent::TransportRestored => {}
            }
        }
    }

    #[tokio::test]
    async fn test_shutdown_disables_reporting_and_disconnects_sessions() {
        let (broker, _harness, mut device) = start(true).await;
        assert_eq!(device.next_command().await, Some(Command::Up));
        let session = broker.open_session(true);
        let waiter = tokio::spawn({
            let session = session.clone();
            async move {
                session
                    .expect_state(DeviceState::Ejected, Some(Duration::from_secs(5)))
                    .await
            }
        });
        while broker.diagnostics().listeners == 0 {
            tokio::task::yield_now().await;
        }

        broker.shutdown().await;
        assert_eq!(device.next_command().await, Some(Command::Down));
        assert!(matches!(waiter.await.unwrap(), Err(SessionError::Cancelled)));
        assert_eq!(session.phase(), SessionPhase::Disconnected);
        assert_eq!(broker.session_count(), 0);
    }

    #[tokio::test]
    async fn test_expect_without_deadline() {
        let (broker, _harness, mut device) = start(false).await;
        let session = broker.open_session(false);
        let waiter = tokio::spawn({
            let session = session.clone();
            async move { session.expect_state(DeviceState::Stopped, None).await }
        });
        while broker.diagnostics().listeners == 0 {
            tokio::task::yield_now().await;
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
        device.emit(&[0x32]).await;
        assert_eq!(waiter.await.unwrap().unwrap(), DeviceState::Stopped);
    }

    #[tokio::test]
    async fn test_reload_reopens_on_new_endpoint() {
        let (broker, mut harness, _old) = start(false).await;
        let session = broker.open_session(true);
        let mut stream = session.subscribe().unwrap();

        let config = BrokerConfig {
            port: "/dev/ttyS7".into(),
            baud_rate: 19200,
            command_uids: vec![1000],
            ..broker.config()
        };
        broker.reload(config).await.unwrap();
        assert_eq!(harness.endpoint(), "mock:/dev/ttyS7 @ 19200 baud");
        assert_eq!(harness.open_count(), 2);
        assert_eq!(broker.config().port, "/dev/ttyS7");
        assert_eq!(broker.config().command_uids, vec![1000]);
        assert_eq!(broker.link_status(), LinkStatus::Connected);

        match stream.next().await {
            Some(DeckEvent::TransportLost { reason }) => assert_eq!(reason, "reloading"),
            other => panic!("expected TransportLost, got {other:?}"),
        }
        loop {
            match stream.next().await {
                Some(DeckEvent::TransportRestored) => break,
                Some(_) => {}
                None => panic!("stream ended"),
            }
        }

        let mut device = harness.next_device().await;
        session.command(Command::Stop).await.unwrap();
        assert_eq!(device.next_command().await, Some(Command::Stop));
        assert_eq!(session.phase(), SessionPhase::Active);
    }

    #[tokio::test]
    async fn test_reload_failure_falls_back_to_reconnect() {
        let (broker, mut harness, _device) = start(false).await;
        harness.set_available(false);
        let err = broker.reload(broker.config()).await.unwrap_err();
        assert!(matches!(err, TransportError::OpenFailed { .. }));
        assert_eq!(broker.link_status(), LinkStatus::Disconnected);

        harness.set_available(true);
        let mut link = broker.watch_link();
        let mut device = harness.next_device().await;
        link.wait_for(|s| *s == LinkStatus::Connected).await.unwrap();

        let session = broker.open_session(true);
        session.command(Command::Eject).await.unwrap();
        assert_eq!(device.next_command().await, Some(Command::Eject));
    }
}

//! Unix-socket binding of broker sessions.
//!
//! Each accepted connection becomes one session. Requests on a connection
//! are served concurrently, so a pending `expect` never holds up a
//! `get_state`. Closing the connection disconnects the session.

use std::io;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::unix::OwnedWriteHalf;
use tokio::net::{UnixListener, UnixStream};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use super::protocol::{Operation, Reply, Request};
use crate::broker::{Broker, EventStream, Session, SessionError};
use crate::config::BrokerConfig;
use crate::dispatcher::DispatchError;
use crate::events::SubscriptionId;

/// Replies buffered per connection before request tasks wait on the client.
const OUTBOUND_DEPTH: usize = 64;

pub struct IpcServer {
    broker: Arc<Broker>,
    listener: UnixListener,
    path: PathBuf,
    config_file: Option<Arc<PathBuf>>,
}

impl IpcServer {
    /// Bind the broker's configured socket, replacing a stale one.
    pub fn bind(broker: Arc<Broker>) -> io::Result<Self> {
        let path = broker.config().socket_path.clone();
        Self::bind_to(broker, path)
    }

    pub fn bind_to(broker: Arc<Broker>, path: impl Into<PathBuf>) -> io::Result<Self> {
        let path = path.into();
        if let Some(parent) = path.parent()
            && !parent.as_os_str().is_empty()
        {
            std::fs::create_dir_all(parent)?;
        }
        if path.exists() {
            std::fs::remove_file(&path)?;
        }
        let listener = UnixListener::bind(&path)?;
        // Anyone may connect; who may send commands is decided per peer uid.
        std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o666))?;
        info!(socket = %path.display(), "IPC listening");
        Ok(Self {
            broker,
            listener,
            path,
            config_file: None,
        })
    }

    /// Config file re-read by `reload`. Without one, reload reopens the
    /// transport with the broker's current settings.
    pub fn with_config_file(mut self, path: impl Into<PathBuf>) -> Self {
        self.config_file = Some(Arc::new(path.into()));
        self
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Accept connections until the broker shuts down.
    pub async fn run(self) -> io::Result<()> {
        loop {
            tokio::select! {
                _ = self.broker.stopped() => break,
                accepted = self.listener.accept() => match accepted {
                    Ok((stream, _addr)) => {
                        let broker = self.broker.clone();
                        let config_file = self.config_file.clone();
                        tokio::spawn(async move { serve_connection(broker, config_file, stream).await });
                    }
                    Err(e) => {
                        warn!(error = %e, "Accept failed");
                        tokio::time::sleep(Duration::from_millis(100)).await;
                    }
                },
            }
        }
        let _ = std::fs::remove_file(&self.path);
        info!(socket = %self.path.display(), "IPC stopped");
        Ok(())
    }
}

async fn serve_connection(broker: Arc<Broker>, config_file: Option<Arc<PathBuf>>, stream: UnixStream) {
    let uid = stream.peer_cred().ok().map(|cred| cred.uid());
    let session = broker.open_session(broker.config().may_command(uid));
    let (read, write) = stream.into_split();
    let (out, out_rx) = mpsc::channel(OUTBOUND_DEPTH);
    let writer = tokio::spawn(write_replies(write, out_rx));

    let mut lines = BufReader::new(read).lines();
    let mut forwarder: Option<(SubscriptionId, JoinHandle<()>)> = None;

    loop {
        let line = tokio::select! {
            _ = broker.stopped() => break,
            line = lines.next_line() => line,
        };
        let line = match line {
            Ok(Some(line)) => line,
            Ok(None) => break,
            Err(e) => {
                debug!(session = %session.id(), error = %e, "Connection read failed");
                break;
            }
        };
        if line.trim().is_empty() {
            continue;
        }

        let request = match Request::parse(&line) {
            Ok(request) => request,
            Err(reply) => {
                let _ = out.send(reply).await;
                continue;
            }
        };

        match request.op {
            Operation::Subscribe => {
                // A forwarder that finished on its own lost its stream to overflow.
                if let Some((id, task)) = forwarder.take_if(|(_, task)| task.is_finished()) {
                    let _ = task.await;
                    session.unsubscribe(id);
                }
                if forwarder.is_none() {
                    match session.subscribe() {
                        Ok(stream) => {
                            let _ = out.send(Reply::Ok { id: request.id, state: None }).await;
                            let id = stream.id();
                            forwarder = Some((id, tokio::spawn(forward_events(stream, out.clone()))));
                        }
                        Err(e) => {
                            let _ = out.send(Reply::from_result(request.id, Err(e))).await;
                        }
                    }
                } else {
                    let _ = out.send(Reply::Ok { id: request.id, state: None }).await;
                }
            }
            Operation::Unsubscribe => {
                if let Some((id, task)) = forwarder.take() {
                    task.abort();
                    session.unsubscribe(id);
                }
                let _ = out.send(Reply::Ok { id: request.id, state: None }).await;
            }
            Operation::Reload => {
                let reload = reload(broker.clone(), session.clone(), config_file.clone(), request.id);
                let out = out.clone();
                tokio::spawn(async move {
                    let _ = out.send(reload.await).await;
                });
            }
            op => {
                tokio::spawn(serve_request(session.clone(), request.id, op, out.clone()));
            }
        }
    }

    session.disconnect();
    if let Some((_, task)) = forwarder.take() {
        task.abort();
    }
    drop(out);
    let _ = writer.await;
}

async fn serve_request(session: Arc<Session>, id: u64, op: Operation, out: mpsc::Sender<Reply>) {
    let result = match op {
        Operation::Command { command } => session.command(command).await.map(|_| None),
        Operation::GetState => session.get_state().map(Some),
        Operation::Expect { state, timeout_ms } => {
            let timeout = (timeout_ms > 0).then(|| Duration::from_millis(timeout_ms));
            session.expect_state(state, timeout).await.map(Some)
        }
        Operation::Subscribe | Operation::Unsubscribe | Operation::Reload => return,
    };
    let _ = out.send(Reply::from_result(id, result)).await;
}

async fn reload(
    broker: Arc<Broker>,
    session: Arc<Session>,
    config_file: Option<Arc<PathBuf>>,
    id: u64,
) -> Reply {
    if !session.may_command() {
        return Reply::from_result(id, Err(SessionError::NotPermitted));
    }
    let config = match config_file.as_deref() {
        Some(path) => match BrokerConfig::load_from_file(path) {
            Ok(config) => config.with_env_overrides(),
            Err(e) => {
                warn!(config = %path.display(), error = %e, "Reload could not read config");
                return Reply::Error {
                    id: Some(id),
                    kind: "config".to_string(),
                    message: format!("{e:#}"),
                };
            }
        },
        None => broker.config(),
    };
    info!(session = %session.id(), port = %config.port, "Reload requested");
    let result = broker
        .reload(config)
        .await
        .map(|()| None)
        .map_err(|e| SessionError::Dispatch(DispatchError::Transport(e)));
    Reply::from_result(id, result)
}

async fn forward_events(mut stream: EventStream, out: mpsc::Sender<Reply>) {
    while let Some(event) = stream.next().await {
        if out.send(Reply::Event { event }).await.is_err() {
            return;
        }
    }
    // Reaching here without being aborted means the bus dropped us.
    let _ = out
        .send(Reply::Error {
            id: None,
            kind: "stream_closed".to_string(),
            message: "Event stream closed".to_string(),
        })
        .await;
}

async fn write_replies(mut write: OwnedWriteHalf, mut replies: mpsc::Receiver<Reply>) {
    while let Some(reply) = replies.recv().await {
        let mut line = match serde_json::to_string(&reply) {
            Ok(line) => line,
            Err(e) => {
                warn!(error = %e, "Failed to serialize reply");
                continue;
            }
        };
        line.push('\n');
        if write.write_all(line.as_bytes()).await.is_err() {
            return;
        }
    }
}

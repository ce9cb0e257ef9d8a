//! The cook daemon's intake transport: newline-delimited JSON over the
//! configured api socket. Connected orchestrators submit build requests and
//! receive the daemon's build/artifact event stream.

use std::sync::Mutex;

use chef_common::settings::ApiAddress;
use chef_common::{ArtifactEvent, ArtifactKind, BuildEvent, BuildStatus};
use futures_util::SinkExt;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc::{unbounded_channel, UnboundedSender};
use tokio_stream::StreamExt;
use tokio_util::codec::{Framed, LinesCodec};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::collaborators::Notifier;
use crate::queue::{BuildRequest, QueueHandle};

#[derive(Debug, Deserialize)]
#[serde(tag = "op", rename_all = "lowercase")]
enum CookRequest {
    Build(BuildRequest),
}

#[derive(Debug, Serialize)]
struct CookReply {
    ok: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    error: Option<String>,
}

#[derive(Debug, Serialize)]
#[serde(tag = "event", rename_all = "lowercase")]
enum WireEvent {
    Build(BuildEvent),
    Artifact(ArtifactEvent),
}

/// Notifier that fans build events out to every connected orchestrator.
#[derive(Default)]
pub struct WireNotifier {
    subscribers: Mutex<Vec<UnboundedSender<String>>>,
}

impl WireNotifier {
    pub fn subscribe(&self) -> tokio::sync::mpsc::UnboundedReceiver<String> {
        let (tx, rx) = unbounded_channel();
        if let Ok(mut subscribers) = self.subscribers.lock() {
            subscribers.push(tx);
        }
        rx
    }

    fn broadcast(&self, event: WireEvent) {
        let line = match serde_json::to_string(&event) {
            Ok(line) => line,
            Err(e) => {
                warn!(error = %e, "unencodable wire event");
                return;
            }
        };
        if let Ok(mut subscribers) = self.subscribers.lock() {
            subscribers.retain(|subscriber| subscriber.send(line.clone()).is_ok());
        }
    }
}

impl Notifier for WireNotifier {
    fn build_status(&self, id: &str, status: BuildStatus) {
        self.broadcast(WireEvent::Build(BuildEvent {
            id: id.to_string(),
            status,
        }));
    }

    fn artifact_ready(&self, id: &str, kind: ArtifactKind, uri: &str) {
        self.broadcast(WireEvent::Artifact(ArtifactEvent {
            id: id.to_string(),
            kind,
            uri: uri.to_string(),
        }));
    }
}

/// Either flavor of api listener from the config.
pub enum ApiListener {
    Unix(tokio::net::UnixListener),
    Tcp(tokio::net::TcpListener),
}

/// Bind the configured api address and register it with the runtime.
pub fn bind_api_socket(address: &ApiAddress) -> anyhow::Result<ApiListener> {
    use anyhow::Context;
    use chef_common::net::StdApiListener;

    let listener = chef_common::net::bind_api_listener(address)
        .with_context(|| format!("binding api address {address}"))?;
    match listener {
        StdApiListener::Unix(listener) => {
            listener.set_nonblocking(true)?;
            Ok(ApiListener::Unix(tokio::net::UnixListener::from_std(
                listener,
            )?))
        }
        StdApiListener::Tcp(listener) => {
            listener.set_nonblocking(true)?;
            Ok(ApiListener::Tcp(tokio::net::TcpListener::from_std(
                listener,
            )?))
        }
    }
}

/// Accept orchestrator connections until shutdown.
pub async fn serve(
    listener: ApiListener,
    queue: QueueHandle,
    notifier: std::sync::Arc<WireNotifier>,
    shutdown: CancellationToken,
) -> anyhow::Result<()> {
    info!("cook api listening");
    loop {
        tokio::select! {
            _ = shutdown.cancelled() => {
                info!("cook api shutting down");
                return Ok(());
            }
            accepted = accept(&listener) => {
                match accepted {
                    Ok(stream) => {
                        let queue = queue.clone();
                        let notifier = std::sync::Arc::clone(&notifier);
                        let shutdown = shutdown.clone();
                        tokio::task::spawn_local(async move {
                            if let Err(e) = handle_connection(stream, queue, notifier, shutdown).await {
                                debug!(error = %e, "orchestrator connection ended");
                            }
                        });
                    }
                    Err(e) => warn!(error = %e, "accept failed"),
                }
            }
        }
    }
}

/// A unified stream type for both listener flavors.
pub enum ApiStream {
    Unix(tokio::net::UnixStream),
    Tcp(tokio::net::TcpStream),
}

async fn accept(listener: &ApiListener) -> std::io::Result<ApiStream> {
    match listener {
        ApiListener::Unix(listener) => {
            let (stream, _) = listener.accept().await?;
            Ok(ApiStream::Unix(stream))
        }
        ApiListener::Tcp(listener) => {
            let (stream, _) = listener.accept().await?;
            Ok(ApiStream::Tcp(stream))
        }
    }
}

async fn handle_connection(
    stream: ApiStream,
    queue: QueueHandle,
    notifier: std::sync::Arc<WireNotifier>,
    shutdown: CancellationToken,
) -> anyhow::Result<()> {
    match stream {
        ApiStream::Unix(stream) => {
            drive(Framed::new(stream, LinesCodec::new()), queue, notifier, shutdown).await
        }
        ApiStream::Tcp(stream) => {
            drive(Framed::new(stream, LinesCodec::new()), queue, notifier, shutdown).await
        }
    }
}

async fn drive<T>(
    mut framed: Framed<T, LinesCodec>,
    queue: QueueHandle,
    notifier: std::sync::Arc<WireNotifier>,
    shutdown: CancellationToken,
) -> anyhow::Result<()>
where
    T: tokio::io::AsyncRead + tokio::io::AsyncWrite + Unpin,
{
    let mut events = notifier.subscribe();
    loop {
        tokio::select! {
            _ = shutdown.cancelled() => return Ok(()),
            event = events.recv() => {
                let Some(event) = event else { return Ok(()) };
                framed.send(event).await?;
            }
            line = framed.next() => {
                let Some(line) = line else { return Ok(()) };
                let line = line?;
                let reply = handle_line(&line, &queue, &notifier);
                framed.send(serde_json::to_string(&reply)?).await?;
            }
        }
    }
}

fn handle_line(
    line: &str,
    queue: &QueueHandle,
    notifier: &WireNotifier,
) -> CookReply {
    match serde_json::from_str::<CookRequest>(line) {
        Ok(CookRequest::Build(request)) => {
            let id = request.id.clone();
            match queue.enqueue(request) {
                Ok(()) => {
                    notifier.build_status(&id, BuildStatus::Queued);
                    CookReply {
                        ok: true,
                        error: None,
                    }
                }
                Err(e) => CookReply {
                    ok: false,
                    error: Some(e.to_string()),
                },
            }
        }
        Err(e) => CookReply {
            ok: false,
            error: Some(format!("malformed request: {e}")),
        },
    }
}

//! The container daemon's api loop: newline-delimited JSON over the
//! configured socket, dispatched on the single event-loop thread.

use std::cell::RefCell;
use std::rc::Rc;

use chef_common::settings::ApiAddress;
use futures_util::SinkExt;
use tokio_stream::StreamExt;
use tokio_util::codec::{Framed, LinesCodec};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::protocol::{CvdRequest, CvdResponse};
use crate::service::CvdService;

pub enum ApiListener {
    Unix(tokio::net::UnixListener),
    Tcp(tokio::net::TcpListener),
}

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

/// Accept and serve until shutdown. Container operations run synchronously
/// on this thread; concurrent clients are multiplexed between requests.
pub async fn serve(
    listener: ApiListener,
    service: Rc<RefCell<CvdService>>,
    shutdown: CancellationToken,
) -> anyhow::Result<()> {
    info!("container api listening");
    loop {
        tokio::select! {
            _ = shutdown.cancelled() => {
                info!("container api shutting down");
                return Ok(());
            }
            accepted = accept(&listener) => {
                match accepted {
                    Ok(stream) => {
                        let service = Rc::clone(&service);
                        let shutdown = shutdown.clone();
                        tokio::task::spawn_local(async move {
                            if let Err(e) = handle_connection(stream, service, shutdown).await {
                                debug!(error = %e, "client connection ended");
                            }
                        });
                    }
                    Err(e) => warn!(error = %e, "accept failed"),
                }
            }
        }
    }
}

enum ApiStream {
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
    service: Rc<RefCell<CvdService>>,
    shutdown: CancellationToken,
) -> anyhow::Result<()> {
    match stream {
        ApiStream::Unix(stream) => {
            drive(Framed::new(stream, LinesCodec::new()), service, shutdown).await
        }
        ApiStream::Tcp(stream) => {
            drive(Framed::new(stream, LinesCodec::new()), service, shutdown).await
        }
    }
}

async fn drive<T>(
    mut framed: Framed<T, LinesCodec>,
    service: Rc<RefCell<CvdService>>,
    shutdown: CancellationToken,
) -> anyhow::Result<()>
where
    T: tokio::io::AsyncRead + tokio::io::AsyncWrite + Unpin,
{
    loop {
        tokio::select! {
            _ = shutdown.cancelled() => return Ok(()),
            line = framed.next() => {
                let Some(line) = line else { return Ok(()) };
                let line = line?;
                let response = match serde_json::from_str::<CvdRequest>(&line) {
                    Ok(request) => service.borrow_mut().handle(request),
                    Err(e) => CvdResponse::Error {
                        kind: "invalid-argument".to_string(),
                        message: format!("malformed request: {e}"),
                    },
                };
                framed.send(serde_json::to_string(&response)?).await?;
            }
        }
    }
}

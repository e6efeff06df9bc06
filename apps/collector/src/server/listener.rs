use std::net::SocketAddr;
use std::time::Duration;

use axum::Router;
use axum::extract::ConnectInfo;
use axum::http::Request;
use hyper::body::Incoming;
use hyper::server::conn::http1;
use hyper_util::rt::{TokioIo, TokioTimer};
use hyper_util::service::TowerToHyperService;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::watch;
use tower::ServiceExt as _;

use crate::server::ServeError;

pub async fn bind(addr: SocketAddr) -> Result<TcpListener, ServeError> {
    TcpListener::bind(addr)
        .await
        .map_err(|source| ServeError::Bind { addr, source })
}

/// Handle to a running accept loop.
pub struct CollectorServer {
    pub local_addr: SocketAddr,
    shutdown: watch::Sender<bool>,
    join: tokio::task::JoinHandle<()>,
}

impl CollectorServer {
    /// Stops accepting, asks open connections to finish their current
    /// request, and waits for the accept loop to exit.
    pub async fn close(self) -> Result<(), ServeError> {
        let _ = self.shutdown.send(true);
        self.join
            .await
            .map_err(|error| ServeError::Io(std::io::Error::other(error.to_string())))
    }
}

pub fn spawn_server(
    listener: TcpListener,
    router: Router,
    inactivity_timeout: Duration,
) -> Result<CollectorServer, ServeError> {
    let local_addr = listener.local_addr()?;
    let (shutdown, shutdown_rx) = watch::channel(false);
    let join = tokio::spawn(accept_loop(listener, router, inactivity_timeout, shutdown_rx));
    tracing::info!(addr = %local_addr, "collector listening");
    Ok(CollectorServer {
        local_addr,
        shutdown,
        join,
    })
}

async fn accept_loop(
    listener: TcpListener,
    router: Router,
    inactivity_timeout: Duration,
    mut shutdown: watch::Receiver<bool>,
) {
    loop {
        tokio::select! {
            accepted = listener.accept() => match accepted {
                Ok((stream, peer)) => {
                    tokio::spawn(serve_connection(
                        stream,
                        peer,
                        router.clone(),
                        inactivity_timeout,
                        shutdown.clone(),
                    ));
                }
                Err(error) => {
                    tracing::warn!(reason = %error, "accept failed");
                    tokio::time::sleep(Duration::from_millis(50)).await;
                }
            },
            _ = shutdown.changed() => break,
        }
    }
    tracing::info!("collector listener stopped");
}

// One task per connection. Requests on a connection are answered strictly in
// order; the connection closes once no request header arrives within the
// inactivity window.
async fn serve_connection(
    stream: TcpStream,
    peer: SocketAddr,
    router: Router,
    inactivity_timeout: Duration,
    mut shutdown: watch::Receiver<bool>,
) {
    tracing::debug!(peer = %peer, "connection opened");
    let service = router.map_request(move |mut request: Request<Incoming>| {
        request.extensions_mut().insert(ConnectInfo(peer));
        request
    });

    let mut builder = http1::Builder::new();
    builder
        .keep_alive(true)
        .timer(TokioTimer::new())
        .header_read_timeout(inactivity_timeout);
    let connection =
        builder.serve_connection(TokioIo::new(stream), TowerToHyperService::new(service));
    tokio::pin!(connection);

    let mut draining = false;
    loop {
        tokio::select! {
            result = connection.as_mut() => {
                if let Err(error) = result {
                    tracing::debug!(peer = %peer, reason = %error, "connection ended with error");
                }
                break;
            }
            _ = shutdown.changed(), if !draining => {
                draining = true;
                connection.as_mut().graceful_shutdown();
            }
        }
    }
    tracing::debug!(peer = %peer, "connection closed");
}

//! TCP accept loop and per-connection handling.
//!
//! One lightweight task per inbound connection; a semaphore bounds how many
//! run at once, and a cancellation token drives graceful shutdown. The
//! transport peer address is injected into request extensions so the
//! service can derive the client identity.

use std::convert::Infallible;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use http_body::Body;
use http_body_util::BodyExt;
use hyper::body::Incoming;
use hyper::{Request, Response};
use hyper_util::rt::{TokioExecutor, TokioIo};
use hyper_util::server::conn::auto;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::Semaphore;
use tokio_util::sync::CancellationToken;
use tower::{Service, ServiceBuilder};
use tracing::{debug, error, info, warn};

use crate::config::ProxyConfig;
use crate::logging_layer::logging_layer;
use crate::proxy_service::{ClientAddr, ProxyService};

/// Run the proxy on an already-bound listener until the token fires.
///
/// Split out of the binary so integration tests can drive a real listener
/// on an ephemeral port.
pub async fn run(
    listener: TcpListener,
    service: ProxyService,
    config: Arc<ProxyConfig>,
    shutdown: CancellationToken,
) -> std::io::Result<()> {
    let service_stack = ServiceBuilder::new()
        .layer(logging_layer())
        .service(service);

    let semaphore = Arc::new(Semaphore::new(config.max_concurrent_connections));

    info!(
        addr = %listener.local_addr()?,
        max_concurrent = config.max_concurrent_connections,
        "CalGate listening"
    );

    loop {
        tokio::select! {
            result = listener.accept() => {
                match result {
                    Ok((stream, peer_addr)) => {
                        let permit = match semaphore.clone().try_acquire_owned() {
                            Ok(permit) => permit,
                            Err(_) => {
                                warn!(
                                    peer = %peer_addr,
                                    max = config.max_concurrent_connections,
                                    "Rejected connection: concurrency limit reached"
                                );
                                tokio::spawn(async move {
                                    let _ = send_503_response(stream).await;
                                });
                                continue;
                            }
                        };

                        if let Err(e) = configure_tcp_stream(&stream, &config) {
                            warn!(error = %e, "Failed to configure socket");
                        }

                        let service_stack = service_stack.clone();
                        let conn_shutdown = shutdown.clone();

                        tokio::spawn(async move {
                            if let Err(e) =
                                handle_connection(stream, peer_addr, service_stack, conn_shutdown)
                                    .await
                            {
                                debug!(peer = %peer_addr, error = %e, "Connection ended with error");
                            }
                            drop(permit);
                        });
                    }
                    Err(e) => {
                        error!(error = %e, "Failed to accept connection");
                    }
                }
            }

            _ = shutdown.cancelled() => {
                info!("Shutdown signal received, stopping accept loop");
                break;
            }
        }
    }

    Ok(())
}

/// Serve one connection, injecting the peer address into every request.
async fn handle_connection<S, B>(
    stream: TcpStream,
    peer_addr: SocketAddr,
    service: S,
    shutdown: CancellationToken,
) -> Result<(), Box<dyn std::error::Error + Send + Sync>>
where
    S: Service<Request<Incoming>, Response = Response<B>, Error = Infallible>
        + Clone
        + Send
        + 'static,
    S::Future: Send + 'static,
    B: Body<Data = Bytes> + Send + Sync + 'static,
    B::Error: Into<Box<dyn std::error::Error + Send + Sync>>,
{
    let io = TokioIo::new(stream);

    let svc_fn = hyper::service::service_fn(move |mut req: Request<Incoming>| {
        let mut svc = service.clone();
        req.extensions_mut().insert(ClientAddr(peer_addr));
        async move {
            let result: Result<_, Infallible> = match svc.call(req).await {
                Ok(response) => Ok(response.map(|body| {
                    body.map_err(|e| -> Box<dyn std::error::Error + Send + Sync> { e.into() })
                        .boxed()
                })),
                Err(infallible) => match infallible {},
            };
            result
        }
    });

    let builder = auto::Builder::new(TokioExecutor::new());
    let conn = builder.serve_connection(io, svc_fn);
    tokio::pin!(conn);

    tokio::select! {
        result = &mut conn => {
            result?;
        }
        _ = shutdown.cancelled() => {
            debug!("Gracefully closing connection");
            conn.as_mut().graceful_shutdown();
            let _ = tokio::time::timeout(Duration::from_secs(5), conn).await;
        }
    }

    Ok(())
}

/// Apply socket options to an accepted stream.
fn configure_tcp_stream(stream: &TcpStream, config: &ProxyConfig) -> std::io::Result<()> {
    stream.set_nodelay(config.tcp_nodelay)?;

    let socket = socket2::SockRef::from(stream);
    let keepalive = socket2::TcpKeepalive::new()
        .with_time(Duration::from_secs(config.tcp_keepalive_secs));
    socket.set_tcp_keepalive(&keepalive)?;

    Ok(())
}

/// Flat 503 for connections rejected before HTTP handling starts.
async fn send_503_response(mut stream: TcpStream) -> std::io::Result<()> {
    use tokio::io::AsyncWriteExt;

    let body = "service is at its concurrency limit, retry shortly";
    let response = format!(
        "HTTP/1.1 503 Service Unavailable\r\n\
         Content-Type: text/plain\r\n\
         Content-Length: {}\r\n\
         Connection: close\r\n\
         Retry-After: 1\r\n\
         \r\n\
         {}",
        body.len(),
        body
    );

    stream.write_all(response.as_bytes()).await?;
    stream.flush().await?;
    Ok(())
}

//! Inbound HTTP server.
//!
//! Accept loop with one task per connection; connections are served by the
//! hyper auto builder (HTTP/1 and HTTP/2) and drained gracefully when the
//! shutdown token fires.

use std::convert::Infallible;

use hyper_util::rt::{TokioExecutor, TokioIo};
use hyper_util::server::conn::auto;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

use crate::handler::PolicyHandler;

/// Serve `handler` on `listener` until `shutdown` is cancelled.
///
/// # Errors
///
/// Returns the I/O error that broke the accept loop, if any.
pub async fn serve(
    handler: PolicyHandler,
    listener: TcpListener,
    shutdown: CancellationToken,
) -> std::io::Result<()> {
    loop {
        tokio::select! {
            accepted = listener.accept() => {
                let (stream, peer_addr) = match accepted {
                    Ok(accepted) => accepted,
                    Err(e) => {
                        error!(error = %e, "Failed to accept connection");
                        continue;
                    }
                };
                debug!(peer = %peer_addr, "Accepted connection");

                let handler = handler.clone();
                let conn_shutdown = shutdown.clone();
                tokio::spawn(async move {
                    serve_connection(stream, handler, conn_shutdown).await;
                });
            }

            _ = shutdown.cancelled() => {
                info!("Shutdown signal received, stopping accept loop");
                return Ok(());
            }
        }
    }
}

async fn serve_connection(
    stream: tokio::net::TcpStream,
    handler: PolicyHandler,
    shutdown: CancellationToken,
) {
    let io = TokioIo::new(stream);
    let service = hyper::service::service_fn(move |request| {
        let handler = handler.clone();
        async move { Ok::<_, Infallible>(handler.handle(request).await) }
    });

    let builder = auto::Builder::new(TokioExecutor::new());
    let connection = builder.serve_connection(io, service);
    tokio::pin!(connection);

    tokio::select! {
        result = connection.as_mut() => {
            if let Err(e) = result {
                debug!(error = %e, "Connection closed with error");
            }
        }
        _ = shutdown.cancelled() => {
            connection.as_mut().graceful_shutdown();
            let _ = connection.await;
        }
    }
}

//! Provider-side RPC harness
//!
//! Turns a [`Provider`] implementation into a running plugin. Three entry
//! points exist:
//!
//! - [`serve_managed`]: the plugin was launched by the engine. Binds a
//!   loopback port, prints the handshake line on stdout and serves until
//!   SIGTERM / Ctrl-C.
//! - [`serve_unmanaged`]: the plugin runs on its own (debugging, tests). Binds
//!   a loopback port and returns the [`ReattachManifest`] the engine needs to
//!   attach to it.
//! - [`serve_listener`]: the accept loop both of the above share.
//!
//! Requests on one connection are handled sequentially. Fetches honour the
//! deadline forwarded by the caller, so an abandoned fetch stops working on
//! the provider side too.

use std::io;
use std::sync::Arc;
use std::time::Duration;

use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::manifest::{Endpoint, ReattachManifest};
use crate::protocol::{
    encode_line, FailureCode, Request, RequestEnvelope, Response, ResponseEnvelope, RpcFailure,
};
use crate::provider::Provider;

/// Capacity of the channel between a running fetch and the connection writer
const PROGRESS_BUFFER: usize = 64;

/// Serve a provider that was launched by the engine
///
/// Prints the handshake line on stdout, which the engine is waiting for, then
/// serves until the process receives SIGTERM or Ctrl-C.
pub async fn serve_managed(provider: Arc<dyn Provider>) -> io::Result<()> {
    let listener = TcpListener::bind("127.0.0.1:0").await?;
    let endpoint = Endpoint::tcp(listener.local_addr()?.to_string());
    let line = endpoint.to_handshake().map_err(io::Error::other)?;

    let mut stdout = tokio::io::stdout();
    stdout.write_all(line.as_bytes()).await?;
    stdout.write_all(b"\n").await?;
    stdout.flush().await?;

    info!(
        "Provider '{}' {} serving on {}",
        provider.name(),
        provider.version(),
        endpoint.address
    );

    let shutdown = CancellationToken::new();
    let trigger = shutdown.clone();
    tokio::spawn(async move {
        shutdown_signal().await;
        trigger.cancel();
    });

    serve_listener(listener, provider, shutdown).await
}

/// Serve a provider outside the engine's control
///
/// Returns the manifest to hand to the engine's discovery source together
/// with the handle of the accept loop. The loop stops when `shutdown` fires.
pub async fn serve_unmanaged(
    provider: Arc<dyn Provider>,
    shutdown: CancellationToken,
) -> io::Result<(ReattachManifest, JoinHandle<io::Result<()>>)> {
    let listener = TcpListener::bind("127.0.0.1:0").await?;
    let endpoint = Endpoint::tcp(listener.local_addr()?.to_string());
    let manifest = ReattachManifest::single(provider.name(), endpoint);

    info!(
        "Provider '{}' serving unmanaged on {}",
        provider.name(),
        listener.local_addr()?
    );

    let handle = tokio::spawn(serve_listener(listener, provider, shutdown));
    Ok((manifest, handle))
}

/// Accept connections until `shutdown` fires
pub async fn serve_listener(
    listener: TcpListener,
    provider: Arc<dyn Provider>,
    shutdown: CancellationToken,
) -> io::Result<()> {
    loop {
        tokio::select! {
            _ = shutdown.cancelled() => {
                debug!("Provider '{}' accept loop stopped", provider.name());
                return Ok(());
            }
            accepted = listener.accept() => {
                let (stream, peer) = accepted?;
                debug!("Accepted connection from {}", peer);
                spawn_connection(stream, Arc::clone(&provider), shutdown.clone());
            }
        }
    }
}

/// Accept connections on a unix socket until `shutdown` fires
#[cfg(unix)]
pub async fn serve_unix_listener(
    listener: tokio::net::UnixListener,
    provider: Arc<dyn Provider>,
    shutdown: CancellationToken,
) -> io::Result<()> {
    loop {
        tokio::select! {
            _ = shutdown.cancelled() => return Ok(()),
            accepted = listener.accept() => {
                let (stream, _) = accepted?;
                spawn_connection(stream, Arc::clone(&provider), shutdown.clone());
            }
        }
    }
}

fn spawn_connection<S>(stream: S, provider: Arc<dyn Provider>, shutdown: CancellationToken)
where
    S: AsyncRead + AsyncWrite + Send + Unpin + 'static,
{
    tokio::spawn(async move {
        if let Err(e) = handle_connection(stream, provider, shutdown).await {
            // Usually the engine dropping the connection after a deadline.
            debug!("Connection closed with error: {}", e);
        }
    });
}

async fn handle_connection<S>(
    stream: S,
    provider: Arc<dyn Provider>,
    shutdown: CancellationToken,
) -> io::Result<()>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let (read, mut write) = tokio::io::split(stream);
    let mut lines = BufReader::new(read).lines();

    loop {
        let line = tokio::select! {
            _ = shutdown.cancelled() => break,
            line = lines.next_line() => line?,
        };
        let Some(line) = line else { break };
        if line.trim().is_empty() {
            continue;
        }

        let envelope: RequestEnvelope = match serde_json::from_str(&line) {
            Ok(envelope) => envelope,
            Err(e) => {
                warn!("Rejecting malformed request: {}", e);
                let failure = RpcFailure::new(FailureCode::InvalidRequest, e.to_string());
                write_response(&mut write, 0, Response::Error { error: failure }).await?;
                continue;
            }
        };

        debug!("Handling {} (id {})", envelope.request.method(), envelope.id);
        dispatch(&mut write, provider.as_ref(), envelope).await?;
    }

    Ok(())
}

async fn dispatch<W>(writer: &mut W, provider: &dyn Provider, envelope: RequestEnvelope) -> io::Result<()>
where
    W: AsyncWrite + Unpin,
{
    let id = envelope.id;
    let result = match envelope.request {
        Request::GetSchema => provider.schema().await.map(|schema| Response::Schema { schema }),
        Request::GetConfiguration => provider
            .configuration()
            .await
            .map(|configuration| Response::Configuration { configuration }),
        Request::Configure { request } => {
            provider.configure(request).await.map(|()| Response::Configured)
        }
        Request::Fetch {
            resources,
            deadline_ms,
        } => return fetch(writer, provider, id, resources, deadline_ms).await,
    };

    let response = result.unwrap_or_else(|e| Response::Error {
        error: RpcFailure::from(&e),
    });
    write_response(writer, id, response).await
}

async fn fetch<W>(
    writer: &mut W,
    provider: &dyn Provider,
    id: u64,
    resources: Vec<String>,
    deadline_ms: Option<u64>,
) -> io::Result<()>
where
    W: AsyncWrite + Unpin,
{
    let (tx, mut rx) = mpsc::channel(PROGRESS_BUFFER);
    let mut work = provider.fetch(resources, tx);

    let deadline = deadline_ms.map(|ms| Instant::now() + Duration::from_millis(ms));
    let expiry = async move {
        match deadline {
            Some(deadline) => tokio::time::sleep_until(deadline).await,
            None => std::future::pending::<()>().await,
        }
    };
    tokio::pin!(expiry);

    let outcome = loop {
        tokio::select! {
            biased;
            Some(progress) = rx.recv() => {
                write_response(writer, id, Response::Progress { progress }).await?;
            }
            result = &mut work => break Some(result),
            _ = &mut expiry => break None,
        }
    };

    // Flush whatever the provider reported just before finishing.
    while let Ok(progress) = rx.try_recv() {
        write_response(writer, id, Response::Progress { progress }).await?;
    }

    let response = match outcome {
        Some(Ok(summary)) => Response::FetchComplete { summary },
        Some(Err(e)) => Response::Error {
            error: RpcFailure::from(&e),
        },
        None => Response::Error {
            error: RpcFailure::new(FailureCode::DeadlineExceeded, "fetch deadline exceeded"),
        },
    };
    write_response(writer, id, response).await
}

async fn write_response<W>(writer: &mut W, id: u64, response: Response) -> io::Result<()>
where
    W: AsyncWrite + Unpin,
{
    let line = encode_line(&ResponseEnvelope { id, response }).map_err(io::Error::other)?;
    writer.write_all(&line).await?;
    writer.flush().await
}

async fn shutdown_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        match signal(SignalKind::terminate()) {
            Ok(mut terminate) => {
                tokio::select! {
                    _ = terminate.recv() => {}
                    _ = tokio::signal::ctrl_c() => {}
                }
            }
            Err(e) => {
                warn!("Failed to install SIGTERM handler: {}", e);
                let _ = tokio::signal::ctrl_c().await;
            }
        }
    }

    #[cfg(not(unix))]
    {
        let _ = tokio::signal::ctrl_c().await;
    }
}

//! Connection worker.
//!
//! Runs one [`SessionController`] against one connection. The connection
//! starts as a request/response exchange framed by [`RequestCodec`]; once
//! the stream is started the framing is dropped and the remaining bytes are
//! raw encrypted frames.
//!
//! The worker checks the shutdown token and the idle deadline at every
//! read. Closing the connection is bounded by [`CLOSE_GRACE_PERIOD`].

use std::time::Duration;

use futures::{SinkExt, StreamExt};
use protocol::PairingState;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio_util::codec::{Framed, FramedParts};
use tokio_util::sync::CancellationToken;

use super::controller::{SessionController, SessionError};
use crate::server::http::{HttpError, RequestCodec, Response};

/// Longest wait for a peer to accept the connection close.
pub const CLOSE_GRACE_PERIOD: Duration = Duration::from_secs(2);

/// Read size while streaming.
const READ_CHUNK_SIZE: usize = 64 * 1024;

/// How a connection ended without error.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionEnd {
    /// The device tore the session down.
    Closed,
    /// The device went away.
    Disconnected,
    /// The receiver is shutting down.
    Shutdown,
    /// The session was refused (failed pairing, full registry).
    Rejected { reason: String },
}

/// Serves one connection until it ends.
pub async fn serve_connection<S>(
    io: S,
    mut controller: SessionController,
    shutdown: CancellationToken,
    max_request_size: usize,
) -> Result<SessionEnd, SessionError>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let mut framed = Framed::new(io, RequestCodec::new(max_request_size));
    let idle_timeout = controller.idle_timeout();

    while !controller.is_streaming() {
        let next = tokio::select! {
            _ = shutdown.cancelled() => {
                controller.close();
                close_gracefully(framed.get_mut()).await;
                return Ok(SessionEnd::Shutdown);
            }
            _ = tokio::time::sleep(idle_timeout) => {
                controller.close();
                close_gracefully(framed.get_mut()).await;
                return Err(SessionError::IdleTimeout(idle_timeout));
            }
            next = framed.next() => next,
        };

        let request = match next {
            Some(Ok(request)) => request,
            Some(Err(HttpError::Io(e))) => {
                controller.close();
                return Err(SessionError::Io(e));
            }
            Some(Err(e)) => {
                let status = match e {
                    HttpError::TooLarge { .. } => 413,
                    _ => 400,
                };
                controller.fail(&e);
                if let Err(send_err) = framed
                    .send(Response::text(status, &e.to_string()).closing())
                    .await
                {
                    tracing::debug!(error = %send_err, "Failed to send error reply");
                }
                close_gracefully(framed.get_mut()).await;
                return Err(SessionError::Http(e));
            }
            None => {
                controller.close();
                return Ok(SessionEnd::Disconnected);
            }
        };

        tracing::debug!(
            session_id = %controller.id(),
            method = %request.method,
            path = %request.path,
            "Received request"
        );
        let (returned, response) =
            on_blocking_pool(controller, move |c| c.handle(&request)).await?;
        controller = returned;
        let close = response.close;
        framed.send(response).await?;

        if close {
            close_gracefully(framed.get_mut()).await;
            return Ok(match controller.state() {
                PairingState::Failed => SessionEnd::Rejected {
                    reason: controller
                        .failure_reason()
                        .unwrap_or("session failed")
                        .to_string(),
                },
                _ => SessionEnd::Closed,
            });
        }
    }

    let FramedParts { mut io, read_buf, .. } = framed.into_parts();
    if !read_buf.is_empty() {
        let (returned, ingested) =
            on_blocking_pool(controller, move |c| c.ingest_stream(&read_buf)).await?;
        controller = returned;
        if let Err(e) = ingested {
            close_gracefully(&mut io).await;
            return Err(e);
        }
    }

    stream_frames(io, controller, shutdown).await
}

async fn stream_frames<S>(
    mut io: S,
    mut controller: SessionController,
    shutdown: CancellationToken,
) -> Result<SessionEnd, SessionError>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let mut buf = vec![0u8; READ_CHUNK_SIZE];

    loop {
        let Some(deadline) = controller.idle_deadline() else {
            close_gracefully(&mut io).await;
            return Ok(SessionEnd::Closed);
        };

        tokio::select! {
            _ = shutdown.cancelled() => {
                controller.close();
                close_gracefully(&mut io).await;
                return Ok(SessionEnd::Shutdown);
            }
            _ = tokio::time::sleep_until(deadline.into()) => {
                if let Err(e) = controller.check_idle(std::time::Instant::now()) {
                    close_gracefully(&mut io).await;
                    return Err(e);
                }
            }
            read = io.read(&mut buf) => {
                let n = match read {
                    Ok(n) => n,
                    Err(e) => {
                        controller.close();
                        return Err(SessionError::Io(e));
                    }
                };
                if n == 0 {
                    controller.close();
                    return Ok(SessionEnd::Disconnected);
                }
                let data = buf[..n].to_vec();
                let (returned, ingested) =
                    on_blocking_pool(controller, move |c| c.ingest_stream(&data)).await?;
                controller = returned;
                if let Err(e) = ingested {
                    close_gracefully(&mut io).await;
                    return Err(e);
                }
            }
        }
    }
}

/// Runs synchronous controller work (SRP, frame decode, trust store writes)
/// on the blocking pool and hands the controller back.
async fn on_blocking_pool<T, F>(
    mut controller: SessionController,
    work: F,
) -> Result<(SessionController, T), SessionError>
where
    F: FnOnce(&mut SessionController) -> T + Send + 'static,
    T: Send + 'static,
{
    let output = tokio::task::spawn_blocking(move || {
        let output = work(&mut controller);
        (controller, output)
    })
    .await?;
    Ok(output)
}

/// Shuts down the write half, giving up after [`CLOSE_GRACE_PERIOD`].
async fn close_gracefully<S: AsyncWrite + Unpin>(io: &mut S) {
    match tokio::time::timeout(CLOSE_GRACE_PERIOD, io.shutdown()).await {
        Ok(Ok(())) => {}
        Ok(Err(e)) => tracing::debug!(error = %e, "Connection shutdown failed"),
        Err(_) => tracing::debug!("Connection shutdown timed out"),
    }
}

//! Unix socket server

use sandpit_core::ExecutionEngine;
use sandpit_core::protocol::{self, ExecuteResponse, ProtocolError, Request, Response};
use std::future::Future;
use std::sync::Arc;
use tokio::net::{UnixListener, UnixStream};
use tokio::task::JoinSet;

/// Serve connections until `shutdown` resolves, then abort in-flight ones.
///
/// Aborting a connection schedules background reaps for its sandboxes. Run
/// [`ExecutionEngine::cleanup_all_sandboxes`] afterwards; it waits for them.
pub async fn run(
    listener: UnixListener,
    engine: Arc<ExecutionEngine>,
    max_frame_bytes: usize,
    shutdown: impl Future<Output = ()>,
) -> std::io::Result<()> {
    let mut connections = JoinSet::new();
    tokio::pin!(shutdown);

    loop {
        tokio::select! {
            () = &mut shutdown => break,
            accepted = listener.accept() => {
                let (stream, _) = accepted?;
                let engine = Arc::clone(&engine);
                connections.spawn(async move {
                    if let Err(e) = handle_connection(stream, &engine, max_frame_bytes).await {
                        tracing::error!(error = %e, "connection error");
                    }
                });
            }
            Some(_) = connections.join_next(), if !connections.is_empty() => {}
        }
    }

    if !connections.is_empty() {
        tracing::info!(count = connections.len(), "aborting in-flight connections");
    }
    connections.shutdown().await;
    Ok(())
}

/// Handle a single client connection
async fn handle_connection(
    mut stream: UnixStream,
    engine: &ExecutionEngine,
    max_frame_bytes: usize,
) -> Result<(), ProtocolError> {
    loop {
        let request: Request = match protocol::recv(&mut stream, max_frame_bytes).await {
            Ok(Some(request)) => request,
            // client disconnected
            Ok(None) => break,
            Err(ProtocolError::Decode(e)) => {
                let response = Response::Error {
                    message: format!("malformed request: {e}"),
                };
                protocol::send(&mut stream, &response).await?;
                continue;
            }
            Err(e) => return Err(e),
        };
        tracing::debug!(?request, "received request");

        let response = handle_request(request, engine).await;
        protocol::send(&mut stream, &response).await?;
    }

    Ok(())
}

/// Handle a single request
pub async fn handle_request(request: Request, engine: &ExecutionEngine) -> Response {
    match request {
        Request::Execute(req) => {
            let outcome = match req.into_request() {
                Ok(request) => engine.execute_code(&request).await,
                Err(e) => Err(e),
            };
            if let Err(e) = &outcome {
                tracing::warn!(kind = ?e.kind(), error = %e, "execution rejected");
            }
            Response::Execute(ExecuteResponse::from_outcome(&outcome))
        }
        Request::Status => Response::Status {
            active: engine.active_sandbox_count(),
        },
        Request::Cleanup => Response::Cleanup {
            reaped: engine.cleanup_all_sandboxes().await,
        },
        Request::Ping => Response::Pong,
    }
}

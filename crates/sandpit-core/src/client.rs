//! Async client for the sandpit daemon

use crate::protocol::{
    self, ExecuteRequest, ExecuteResponse, MAX_FRAME_BYTES, ProtocolError, Request, Response,
};
use std::path::Path;
use tokio::net::UnixStream;

/// One connection to the daemon; requests are answered in order
#[derive(Debug)]
pub struct Client {
    stream: UnixStream,
    max_frame_bytes: usize,
}

impl Client {
    pub async fn connect(socket: impl AsRef<Path>) -> Result<Self, ProtocolError> {
        let stream = UnixStream::connect(socket.as_ref()).await?;
        Ok(Self::from_stream(stream))
    }

    #[must_use]
    pub const fn from_stream(stream: UnixStream) -> Self {
        Self {
            stream,
            max_frame_bytes: MAX_FRAME_BYTES,
        }
    }

    /// Send one request and wait for its response.
    pub async fn call(&mut self, request: &Request) -> Result<Response, ProtocolError> {
        protocol::send(&mut self.stream, request).await?;
        protocol::recv(&mut self.stream, self.max_frame_bytes)
            .await?
            .ok_or_else(|| ProtocolError::UnexpectedResponse("connection closed".into()))
    }

    pub async fn execute(&mut self, request: ExecuteRequest) -> Result<ExecuteResponse, ProtocolError> {
        match self.call(&Request::Execute(request)).await? {
            Response::Execute(response) => Ok(response),
            other => Err(unexpected(other)),
        }
    }

    /// Number of live sandboxes on the daemon.
    pub async fn status(&mut self) -> Result<usize, ProtocolError> {
        match self.call(&Request::Status).await? {
            Response::Status { active } => Ok(active),
            other => Err(unexpected(other)),
        }
    }

    /// Ask the daemon to reap every live sandbox.
    pub async fn cleanup(&mut self) -> Result<usize, ProtocolError> {
        match self.call(&Request::Cleanup).await? {
            Response::Cleanup { reaped } => Ok(reaped),
            other => Err(unexpected(other)),
        }
    }

    pub async fn ping(&mut self) -> Result<(), ProtocolError> {
        match self.call(&Request::Ping).await? {
            Response::Pong => Ok(()),
            other => Err(unexpected(other)),
        }
    }
}

fn unexpected(response: Response) -> ProtocolError {
    match response {
        Response::Error { message } => ProtocolError::UnexpectedResponse(message),
        other => ProtocolError::UnexpectedResponse(format!("{other:?}")),
    }
}

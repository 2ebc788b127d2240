//! Wire protocol for daemon communication
//!
//! Each message is a MessagePack body behind a 4-byte big-endian length
//! prefix.

use crate::error::ErrorKind;
use crate::{EngineError, ExecutionRequest, ExecutionResult, Language};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

/// Default ceiling on a single frame
pub const MAX_FRAME_BYTES: usize = 4 * 1024 * 1024;

#[derive(Error, Debug)]
pub enum ProtocolError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("encode error: {0}")]
    Encode(#[from] rmp_serde::encode::Error),

    #[error("decode error: {0}")]
    Decode(#[from] rmp_serde::decode::Error),

    #[error("frame too large: {len} bytes (limit {limit})")]
    FrameTooLarge { len: usize, limit: usize },

    #[error("unexpected response: {0}")]
    UnexpectedResponse(String),
}

/// Request to execute code
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecuteRequest {
    pub code: String,
    /// Language name or alias; unknown names are rejected by the engine,
    /// not by the decoder
    pub language: String,
    pub input: Option<String>,
    pub timeout_ms: Option<u64>,
    /// Memory limit such as `64m`
    pub memory_limit: Option<String>,
    pub cpu_limit: Option<f64>,
}

impl ExecuteRequest {
    /// Resolve into an engine request.
    pub fn into_request(self) -> Result<ExecutionRequest, EngineError> {
        let language: Language = self
            .language
            .parse()
            .map_err(|e: crate::UnsupportedLanguage| EngineError::security(e.to_string()))?;
        Ok(ExecutionRequest {
            code: self.code,
            language,
            input: self.input,
            timeout_ms: self.timeout_ms,
            memory_limit: self.memory_limit,
            cpu_limit: self.cpu_limit,
        })
    }
}

impl From<ExecutionRequest> for ExecuteRequest {
    fn from(request: ExecutionRequest) -> Self {
        Self {
            code: request.code,
            language: request.language.to_string(),
            input: request.input,
            timeout_ms: request.timeout_ms,
            memory_limit: request.memory_limit,
            cpu_limit: request.cpu_limit,
        }
    }
}

/// Categorised engine failure
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WireError {
    pub kind: ErrorKind,
    pub message: String,
}

impl From<&EngineError> for WireError {
    fn from(err: &EngineError) -> Self {
        Self {
            kind: err.kind(),
            message: err.to_string(),
        }
    }
}

/// Response from execution; exactly one of `result` and `error` is set
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecuteResponse {
    pub result: Option<ExecutionResult>,
    pub error: Option<WireError>,
}

impl ExecuteResponse {
    #[must_use]
    pub fn from_outcome(outcome: &Result<ExecutionResult, EngineError>) -> Self {
        match outcome {
            Ok(result) => Self {
                result: Some(result.clone()),
                error: None,
            },
            Err(e) => Self {
                result: None,
                error: Some(WireError::from(e)),
            },
        }
    }
}

/// Request types
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum Request {
    /// Execute code
    Execute(ExecuteRequest),
    /// Count live sandboxes
    Status,
    /// Reap every live sandbox
    Cleanup,
    Ping,
}

/// Response types
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum Response {
    Execute(ExecuteResponse),
    Status { active: usize },
    Cleanup { reaped: usize },
    Pong,
    Error { message: String },
}

/// Encode a message to msgpack
pub fn encode<T: Serialize>(msg: &T) -> Result<Vec<u8>, rmp_serde::encode::Error> {
    rmp_serde::to_vec_named(msg)
}

/// Decode a message from msgpack
pub fn decode<'a, T: Deserialize<'a>>(data: &'a [u8]) -> Result<T, rmp_serde::decode::Error> {
    rmp_serde::from_slice(data)
}

/// Read one length-prefixed frame. `Ok(None)` means the peer closed the
/// connection cleanly between frames.
pub async fn read_frame<R>(reader: &mut R, limit: usize) -> Result<Option<Vec<u8>>, ProtocolError>
where
    R: AsyncRead + Unpin,
{
    let mut len_bytes = [0u8; 4];
    match reader.read_exact(&mut len_bytes).await {
        Ok(_) => {}
        Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(e) => return Err(e.into()),
    }

    let len = u32::from_be_bytes(len_bytes) as usize;
    if len > limit {
        return Err(ProtocolError::FrameTooLarge { len, limit });
    }

    let mut body = vec![0u8; len];
    reader.read_exact(&mut body).await?;
    Ok(Some(body))
}

/// Write one length-prefixed frame.
pub async fn write_frame<W>(writer: &mut W, body: &[u8]) -> Result<(), ProtocolError>
where
    W: AsyncWrite + Unpin,
{
    let len = u32::try_from(body.len()).map_err(|_| ProtocolError::FrameTooLarge {
        len: body.len(),
        limit: u32::MAX as usize,
    })?;
    writer.write_all(&len.to_be_bytes()).await?;
    writer.write_all(body).await?;
    writer.flush().await?;
    Ok(())
}

/// Encode `msg` and write it as a frame.
pub async fn send<W, T>(writer: &mut W, msg: &T) -> Result<(), ProtocolError>
where
    W: AsyncWrite + Unpin,
    T: Serialize,
{
    write_frame(writer, &encode(msg)?).await
}

/// Read a frame and decode it.
pub async fn recv<R, T>(reader: &mut R, limit: usize) -> Result<Option<T>, ProtocolError>
where
    R: AsyncRead + Unpin,
    T: for<'de> Deserialize<'de>,
{
    match read_frame(reader, limit).await? {
        Some(body) => Ok(Some(decode(&body)?)),
        None => Ok(None),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn frames_survive_a_pipe() {
        let (mut client, mut server) = tokio::io::duplex(1024);

        let request = Request::Execute(ExecuteRequest {
            code: "print(1)".into(),
            language: "py".into(),
            input: Some("x".into()),
            timeout_ms: Some(5000),
            memory_limit: None,
            cpu_limit: Some(0.25),
        });
        send(&mut client, &request).await.unwrap();
        send(&mut client, &Request::Ping).await.unwrap();
        drop(client);

        let first: Request = recv(&mut server, MAX_FRAME_BYTES).await.unwrap().unwrap();
        assert_eq!(first, request);
        let second: Request = recv(&mut server, MAX_FRAME_BYTES).await.unwrap().unwrap();
        assert_eq!(second, Request::Ping);
        let end: Option<Request> = recv(&mut server, MAX_FRAME_BYTES).await.unwrap();
        assert!(end.is_none());
    }

    #[tokio::test]
    async fn oversized_frame_is_rejected() {
        let (mut client, mut server) = tokio::io::duplex(64);
        write_frame(&mut client, &[0u8; 32]).await.unwrap();

        let err = read_frame(&mut server, 16).await.unwrap_err();
        assert!(matches!(err, ProtocolError::FrameTooLarge { len: 32, limit: 16 }));
    }

    #[test]
    fn unknown_language_is_a_security_error() {
        let request = ExecuteRequest {
            code: "x".into(),
            language: "cobol".into(),
            input: None,
            timeout_ms: None,
            memory_limit: None,
            cpu_limit: None,
        };
        let err = request.into_request().unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Security);
    }

    #[test]
    fn engine_errors_keep_their_kind() {
        let outcome = Err(EngineError::resource_limit("docker is down"));
        let response = ExecuteResponse::from_outcome(&outcome);
        let error = response.error.unwrap();
        assert_eq!(error.kind, ErrorKind::ResourceLimit);
        assert!(error.message.contains("docker is down"));
        assert!(response.result.is_none());
    }
}

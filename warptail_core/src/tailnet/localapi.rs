//! Control-socket protocol for the tailnet daemon.
//!
//! Messages are length-prefixed JSON: a 4-byte big-endian length followed by
//! the encoded request or response.

use std::io;
use std::path::{Path, PathBuf};

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::UnixStream;

use super::{TailnetPeer, TailnetStatus};

pub const LENGTH_PREFIX_SIZE: usize = 4;
pub const MAX_MESSAGE_SIZE: usize = 1024 * 1024;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum LocalApiRequest {
    Up { auth_key: String, hostname: String },
    Down,
    Status,
    Peers,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "result", rename_all = "snake_case")]
pub enum LocalApiResponse {
    Ok,
    Status { status: TailnetStatus },
    Peers { peers: Vec<TailnetPeer> },
    Error { message: String },
}

pub async fn write_frame<W, T>(writer: &mut W, message: &T) -> io::Result<()>
where
    W: AsyncWrite + Unpin,
    T: Serialize,
{
    let body = serde_json::to_vec(message)?;
    if body.len() > MAX_MESSAGE_SIZE {
        return Err(io::Error::new(io::ErrorKind::InvalidData, "message too large"));
    }
    writer.write_all(&(body.len() as u32).to_be_bytes()).await?;
    writer.write_all(&body).await?;
    writer.flush().await
}

pub async fn read_frame<R, T>(reader: &mut R) -> io::Result<T>
where
    R: AsyncRead + Unpin,
    T: DeserializeOwned,
{
    let mut prefix = [0u8; LENGTH_PREFIX_SIZE];
    reader.read_exact(&mut prefix).await?;
    let len = u32::from_be_bytes(prefix) as usize;
    if len > MAX_MESSAGE_SIZE {
        return Err(io::Error::new(io::ErrorKind::InvalidData, "message too large"));
    }
    let mut body = vec![0u8; len];
    reader.read_exact(&mut body).await?;
    serde_json::from_slice(&body).map_err(io::Error::from)
}

/// One-shot request/response client against the daemon socket.
#[derive(Debug, Clone)]
pub struct LocalApiClient {
    path: PathBuf,
}

impl LocalApiClient {
    pub fn new(path: impl AsRef<Path>) -> Self {
        LocalApiClient {
            path: path.as_ref().to_path_buf(),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub async fn call(&self, request: &LocalApiRequest) -> io::Result<LocalApiResponse> {
        let mut stream = UnixStream::connect(&self.path).await?;
        write_frame(&mut stream, request).await?;
        read_frame(&mut stream).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn frames_round_trip() {
        let (mut a, mut b) = tokio::io::duplex(4096);
        let request = LocalApiRequest::Up {
            auth_key: "tskey-abc".to_string(),
            hostname: "gateway".to_string(),
        };

        write_frame(&mut a, &request).await.unwrap();
        let decoded: LocalApiRequest = read_frame(&mut b).await.unwrap();
        match decoded {
            LocalApiRequest::Up { auth_key, hostname } => {
                assert_eq!(auth_key, "tskey-abc");
                assert_eq!(hostname, "gateway");
            }
            other => panic!("unexpected request: {:?}", other),
        }
    }

    #[tokio::test]
    async fn oversized_frame_is_rejected() {
        let (mut a, mut b) = tokio::io::duplex(64);
        let prefix = ((MAX_MESSAGE_SIZE + 1) as u32).to_be_bytes();
        tokio::io::AsyncWriteExt::write_all(&mut a, &prefix).await.unwrap();

        let err = read_frame::<_, LocalApiResponse>(&mut b).await.unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::InvalidData);
    }
}

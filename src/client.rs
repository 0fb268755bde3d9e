use serde_json::Value;
use tokio::net::{TcpStream, ToSocketAddrs};

use crate::protocol::{
    read_frame, write_frame, ProtocolError, Request, Response, DEFAULT_MAX_FRAME_SIZE,
};

/// Minimal client for the framed protocol: one request, one response.
pub struct Client {
    stream: TcpStream,
    max_frame_size: usize,
}

impl Client {
    pub async fn connect(addr: impl ToSocketAddrs) -> Result<Self, ProtocolError> {
        let stream = TcpStream::connect(addr).await?;
        stream.set_nodelay(true)?;
        Ok(Self {
            stream,
            max_frame_size: DEFAULT_MAX_FRAME_SIZE,
        })
    }

    pub async fn call(&mut self, action: &str, params: Value) -> Result<Response, ProtocolError> {
        self.send(&Request::new(action, params)).await
    }

    pub async fn send(&mut self, request: &Request) -> Result<Response, ProtocolError> {
        write_frame(&mut self.stream, &request.encode()?).await?;
        self.read_response().await
    }

    pub async fn read_response(&mut self) -> Result<Response, ProtocolError> {
        match read_frame(&mut self.stream, self.max_frame_size).await? {
            Some(payload) => Response::decode(&payload),
            None => Err(ProtocolError::Io(std::io::Error::new(
                std::io::ErrorKind::UnexpectedEof,
                "server closed the connection",
            ))),
        }
    }

    #[cfg(test)]
    pub fn stream_mut(&mut self) -> &mut TcpStream {
        &mut self.stream
    }
}

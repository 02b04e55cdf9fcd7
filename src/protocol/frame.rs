//! Buffered frame I/O over a TCP stream

use bytes::BytesMut;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;

use crate::error::Result;
use super::codec::{decode_request, encode_response};
use super::message::{Request, Response};

const READ_CHUNK: usize = 8 * 1024;

/// Reads request frames and writes response frames on one connection
pub struct FrameIO {
    stream: TcpStream,
    read_buf: BytesMut,
    write_buf: BytesMut,
}

impl FrameIO {
    pub fn new(stream: TcpStream) -> Self {
        Self {
            stream,
            read_buf: BytesMut::with_capacity(READ_CHUNK),
            write_buf: BytesMut::new(),
        }
    }

    /// Read the next request.
    ///
    /// Returns `Ok(None)` on a clean end of stream. A malformed frame comes
    /// back as `Err(DfsError::Protocol)` with the offending bytes already
    /// consumed, so the caller can report it and keep reading.
    pub async fn read_request(&mut self) -> Result<Option<Request>> {
        loop {
            if let Some(request) = decode_request(&mut self.read_buf)? {
                return Ok(Some(request));
            }

            self.read_buf.reserve(READ_CHUNK);
            let n = self.stream.read_buf(&mut self.read_buf).await?;
            if n == 0 {
                if !self.read_buf.is_empty() {
                    log::debug!(
                        "Connection closed with {} bytes of an incomplete frame",
                        self.read_buf.len()
                    );
                }
                return Ok(None);
            }
        }
    }

    /// Encode and send responses in order, then flush
    pub async fn write_responses(&mut self, responses: &[Response]) -> Result<()> {
        if responses.is_empty() {
            return Ok(());
        }
        self.write_buf.clear();
        for response in responses {
            encode_response(response, &mut self.write_buf);
        }
        self.stream.write_all(&self.write_buf).await?;
        self.stream.flush().await?;
        Ok(())
    }
}

//! Wire protocol and connection handling
//!
//! ## Frame Format
//! ```text
//! request:  METHOD TXN SEQ LEN\r\n\r\n\r\n<LEN payload bytes>
//! response: METHOD TXN SEQ CODE LEN\r\n\r\n\r\n<LEN payload bytes>
//! ```
//! `TXN` is `-1` for requests that do not belong to a transaction. The
//! payload is the file name for NEW_TXN and READ, the fragment bytes for
//! WRITE, the message for ERROR and the file contents for a READ reply.
//!
//! ## Architecture
//! - `message`: request and response types
//! - `codec`: frame encoding and decoding on `BytesMut`
//! - `frame`: buffered frame I/O over a `TcpStream`
//!
//! Requests on one connection are handled in arrival order. Each handler
//! runs on tokio's blocking pool because commits block on fsync.

use tokio::net::TcpStream;

use crate::error::{DfsError, Result};
use crate::handler::{self, ResponseBuffer, Services};

mod codec;
mod frame;
mod message;

pub use codec::{
    decode_request, decode_response, encode_request, encode_response, HEADER_TERMINATOR,
    MAX_CONTENT_LEN, MAX_FRAGMENTS, MAX_HEADER_LEN,
};
pub use message::{Method, Request, Response};

use frame::FrameIO;

/// Handles a single client connection
pub struct ConnectionHandler {
    io: FrameIO,
    services: Services,
}

impl ConnectionHandler {
    pub fn new(stream: TcpStream, services: Services) -> Self {
        Self {
            io: FrameIO::new(stream),
            services,
        }
    }

    /// Serve requests until the client disconnects.
    ///
    /// Returns an error only for connection I/O failures and fatal handler
    /// errors; the caller must check [`DfsError::is_fatal`].
    pub async fn run(mut self) -> Result<()> {
        loop {
            let request = match self.io.read_request().await {
                Ok(Some(request)) => request,
                Ok(None) => break,
                Err(e @ DfsError::Protocol(_)) => {
                    log::warn!("Rejecting malformed frame: {}", e);
                    let response = Response::error(0, e.error_code(), e.to_string());
                    self.io.write_responses(&[response]).await?;
                    continue;
                }
                Err(e) => return Err(e),
            };

            let responses = self.handle_request(request).await?;
            self.io.write_responses(&responses).await?;
        }
        Ok(())
    }

    async fn handle_request(&self, request: Request) -> Result<Vec<Response>> {
        log::debug!("{} for transaction {}", request.method(), request.txn_id());

        let services = self.services.clone();
        tokio::task::spawn_blocking(move || {
            let sink = ResponseBuffer::new();
            handler::dispatch(&services, request, &sink).map(|()| sink.take())
        })
        .await
        .map_err(|e| DfsError::Internal(format!("request handler panicked: {}", e)))?
    }
}

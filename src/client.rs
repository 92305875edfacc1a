//! Client side of the Unix socket protocol, used by the CLI and tests.

use std::path::Path;

use bytes::Bytes;
use futures::{SinkExt, StreamExt};
use prost::Message;
use tokio::net::UnixStream;
use tokio_util::codec::{Framed, LengthDelimitedCodec};

use crate::error::{JobdError, Result};
use crate::protocol::{Request, Response};
use crate::transport;

pub struct Client {
    framed: Framed<UnixStream, LengthDelimitedCodec>,
}

impl Client {
    pub async fn connect(path: impl AsRef<Path>) -> Result<Self> {
        let stream = UnixStream::connect(path.as_ref()).await?;
        Ok(Self {
            framed: Framed::new(stream, transport::codec()),
        })
    }

    /// Send one request and wait for its response.
    ///
    /// The server sends nothing back for requests it cannot decode, so a
    /// malformed request leaves this waiting until the connection closes.
    pub async fn call(&mut self, request: Request) -> Result<Response> {
        self.framed
            .send(Bytes::from(request.encode_to_vec()))
            .await?;

        let frame = self
            .framed
            .next()
            .await
            .ok_or_else(|| JobdError::Decode("connection closed before response".into()))??;
        Response::decode(frame.freeze())
            .map_err(|e| JobdError::Decode(format!("invalid response frame: {}", e)))
    }

    /// Like [`Client::call`], but an error reply becomes `Err`.
    pub async fn call_ok(&mut self, request: Request) -> Result<Response> {
        let response = self.call(request).await?;
        match response.error_category() {
            Some(category) => Err(JobdError::Remote {
                category: category.to_string(),
                detail: response.error_detail().unwrap_or_default().to_string(),
            }),
            None => Ok(response),
        }
    }
}

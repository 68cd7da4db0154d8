// SPDX-License-Identifier: Apache-2.0

use bytes::Bytes;
use futures::{SinkExt, StreamExt};
use serde::{de::DeserializeOwned, Serialize};
use tokio::net::TcpStream;
use tokio_util::codec::{Framed, LengthDelimitedCodec};

use crate::error::RpcError;

/// A length-delimited, `bcs`-framed connection: one bare TCP stream carrying one
/// message type, matching the three dedicated per-client connections (unsigned
/// request, signed request, response) the protocol calls for.
pub struct Connection {
    framed: Framed<TcpStream, LengthDelimitedCodec>,
}

impl Connection {
    pub fn new(stream: TcpStream) -> Self {
        stream.set_nodelay(true).ok();
        Self {
            framed: Framed::new(stream, LengthDelimitedCodec::new()),
        }
    }

    pub async fn send<T: Serialize>(&mut self, message: &T) -> Result<(), RpcError> {
        let bytes = bcs::to_bytes(message).expect("bcs encoding never fails");
        self.framed.send(Bytes::from(bytes)).await?;
        Ok(())
    }

    pub async fn recv<T: DeserializeOwned>(&mut self) -> Result<T, RpcError> {
        let frame = self
            .framed
            .next()
            .await
            .ok_or_else(|| RpcError::ConnectionClosed("peer closed the connection".to_string()))??;
        bcs::from_bytes(&frame).map_err(|_| RpcError::ConnectionClosed("malformed frame".to_string()))
    }
}

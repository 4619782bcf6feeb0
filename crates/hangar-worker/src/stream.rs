// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Closable byte streams exchanged with volume stores.

use std::io::Cursor;

use async_trait::async_trait;
use tokio::io::{AsyncRead, AsyncReadExt};

use crate::error::{Error, Result};

/// A readable byte stream backed by a remote transport.
///
/// `close` releases the transport. Streams must be closed exactly once by
/// whoever ends up owning them; dropping without closing only frees local
/// buffers.
#[async_trait]
pub trait ReadStream: AsyncRead + Send + Unpin {
    /// Releases the underlying transport.
    async fn close(&mut self) -> Result<()> {
        Ok(())
    }
}

/// Boxed [`ReadStream`].
pub type ByteStream = Box<dyn ReadStream>;

impl ReadStream for Cursor<Vec<u8>> {}

impl ReadStream for tokio::io::DuplexStream {}

#[async_trait]
impl ReadStream for Box<dyn ReadStream> {
    async fn close(&mut self) -> Result<()> {
        (**self).close().await
    }
}

/// Wraps an in-memory buffer as a stream.
pub fn from_bytes(bytes: impl Into<Vec<u8>>) -> ByteStream {
    Box::new(Cursor::new(bytes.into()))
}

/// Reads a stream to its end without closing it.
pub async fn read_all<R: AsyncRead + Unpin + ?Sized>(stream: &mut R) -> Result<Vec<u8>> {
    let mut buf = Vec::new();
    stream.read_to_end(&mut buf).await?;
    Ok(buf)
}

/// Runs every close result and folds failures into one error.
pub fn collect_close_errors<I>(results: I) -> Result<()>
where
    I: IntoIterator<Item = (&'static str, Result<()>)>,
{
    let failures: Vec<String> = results
        .into_iter()
        .filter_map(|(what, r)| r.err().map(|e| format!("{what}: {e}")))
        .collect();
    if failures.is_empty() {
        Ok(())
    } else {
        Err(Error::Close(failures))
    }
}

// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Moves volume contents between workers and reads single files out of
//! volumes.
//!
//! Volumes are exchanged as compressed tar streams. By default the
//! scheduler relays the stream: it reads from the source volume store and
//! writes into the destination one. When P2P streaming is enabled and both
//! ends support it, the destination hands out a URL and the source pushes
//! to it directly.

use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Duration;

use tokio::io::{AsyncRead, AsyncReadExt, ReadBuf, Take};
use tracing::{debug, info, warn};

use crate::artifact::ArtifactDestination;
use crate::compression::{Compression, Decoder};
use crate::config::StreamingConfig;
use crate::error::{Error, Result};
use crate::metrics::Metrics;
use crate::stream::{ReadStream, collect_close_errors};
use crate::volume::Volume;

/// Bound on obtaining a P2P URL from the destination.
pub const P2P_URL_TIMEOUT: Duration = Duration::from_secs(5);

const BLOCK: usize = 512;

/// Streams volumes using the configured codec and transport.
#[derive(Debug, Clone)]
pub struct Streamer {
    compression: Compression,
    p2p_enabled: bool,
    p2p_timeout: Duration,
    metrics: Arc<Metrics>,
}

impl Streamer {
    /// Creates a streamer from streaming settings.
    pub fn new(config: &StreamingConfig, metrics: Arc<Metrics>) -> Self {
        Self {
            compression: config.compression,
            p2p_enabled: config.p2p_enabled,
            p2p_timeout: config.p2p_timeout,
            metrics,
        }
    }

    /// Codec used on the wire.
    pub fn compression(&self) -> Compression {
        self.compression
    }

    /// Copies the whole of `src` into `dst`.
    pub async fn stream(&self, src: &Volume, dst: &dyn ArtifactDestination) -> Result<()> {
        if self.p2p_enabled && src.supports_p2p() && dst.supports_p2p() {
            self.p2p_stream(src, dst).await?;
        } else {
            self.relay(src, dst).await?;
        }
        self.metrics.volume_streamed();
        Ok(())
    }

    async fn relay(&self, src: &Volume, dst: &dyn ArtifactDestination) -> Result<()> {
        debug!(volume = %src.handle(), compression = %self.compression, "Relaying volume");
        let out = src.stream_out(".", self.compression).await?;
        dst.stream_in(".", self.compression, out).await
    }

    async fn p2p_stream(&self, src: &Volume, dst: &dyn ArtifactDestination) -> Result<()> {
        let url = tokio::time::timeout(P2P_URL_TIMEOUT, dst.get_stream_in_p2p_url("."))
            .await
            .map_err(|_| Error::Timeout(P2P_URL_TIMEOUT))??;
        info!(volume = %src.handle(), url = %url, "Streaming volume P2P");
        let push = src.stream_p2p_out(".", &url, self.compression);
        if self.p2p_timeout.is_zero() {
            push.await
        } else {
            tokio::time::timeout(self.p2p_timeout, push)
                .await
                .map_err(|_| Error::Timeout(self.p2p_timeout))?
        }
    }

    /// Opens one file inside `volume`.
    ///
    /// Reads the tar stream of `path` up to the first regular entry and
    /// returns a reader bounded to that entry. An empty archive yields
    /// [`Error::FileNotFound`].
    pub async fn stream_file(&self, volume: &Volume, path: &str) -> Result<FileStream> {
        let out = volume.stream_out(path, self.compression).await?;
        let mut decoder = self.compression.decoder(out);
        match first_entry_size(&mut decoder).await {
            Ok(Some(size)) => Ok(FileStream {
                inner: decoder.take(size),
                read_error: None,
            }),
            Ok(None) => {
                close_transport(&mut decoder, volume).await;
                Err(Error::FileNotFound(path.to_string()))
            }
            Err(e) => {
                close_transport(&mut decoder, volume).await;
                Err(e)
            }
        }
    }
}

/// Closes the transport under an abandoned read. The read's own error is
/// what the caller sees.
async fn close_transport(decoder: &mut Decoder, volume: &Volume) {
    if let Err(e) = decoder.transport_mut().close().await {
        warn!(volume = %volume.handle(), error = %e, "Failed to close volume stream");
    }
}

async fn read_block(reader: &mut Decoder, block: &mut [u8; BLOCK]) -> Result<bool> {
    let mut filled = 0;
    while filled < BLOCK {
        let n = reader.read(&mut block[filled..]).await?;
        if n == 0 {
            if filled == 0 {
                return Ok(false);
            }
            return Err(Error::Archive("truncated tar header".into()));
        }
        filled += n;
    }
    Ok(true)
}

/// Size of the first regular entry, skipping extension headers.
async fn first_entry_size(reader: &mut Decoder) -> Result<Option<u64>> {
    let mut block = [0u8; BLOCK];
    loop {
        if !read_block(reader, &mut block).await? {
            return Ok(None);
        }
        if block.iter().all(|b| *b == 0) {
            return Ok(None);
        }
        let header = tar::Header::from_byte_slice(&block);
        let size = header
            .entry_size()
            .map_err(|e| Error::Archive(e.to_string()))?;
        let entry_type = header.entry_type();
        if entry_type.is_gnu_longname()
            || entry_type.is_gnu_longlink()
            || entry_type.is_pax_local_extensions()
            || entry_type.is_pax_global_extensions()
            || entry_type.is_dir()
        {
            let padded = size.div_ceil(BLOCK as u64) * BLOCK as u64;
            tokio::io::copy(&mut (&mut *reader).take(padded), &mut tokio::io::sink()).await?;
            continue;
        }
        return Ok(Some(size));
    }
}

/// Reader over one file extracted from a volume's tar stream.
///
/// Must be closed; closing reports decompression failures seen while
/// reading together with transport close failures.
pub struct FileStream {
    inner: Take<Decoder>,
    read_error: Option<String>,
}

impl FileStream {
    /// Releases the decoder and the transport beneath it.
    pub async fn close(mut self) -> Result<()> {
        let decoder = match self.read_error.take() {
            Some(e) => Err(Error::Archive(e)),
            None => Ok(()),
        };
        let transport = self.inner.get_mut().transport_mut().close().await;
        collect_close_errors([("decompressor", decoder), ("transport", transport)])
    }
}

impl AsyncRead for FileStream {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<std::io::Result<()>> {
        let this = self.get_mut();
        let poll = Pin::new(&mut this.inner).poll_read(cx, buf);
        if let Poll::Ready(Err(e)) = &poll {
            this.read_error = Some(e.to_string());
        }
        poll
    }
}

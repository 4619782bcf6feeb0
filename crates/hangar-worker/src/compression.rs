// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Compression codecs wrapping tar streams.

use std::fmt;
use std::pin::Pin;
use std::str::FromStr;
use std::task::{Context, Poll};

use async_compression::tokio::bufread::{GzipDecoder, ZstdDecoder};
use async_compression::tokio::write::{GzipEncoder, ZstdEncoder};
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncRead, AsyncWriteExt, BufReader, ReadBuf};

use crate::error::Result;
use crate::stream::ByteStream;

/// Codec applied to tar streams moved between volumes.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Compression {
    /// gzip framing.
    #[default]
    Gzip,
    /// zstd framing.
    Zstd,
    /// Uncompressed tar.
    Raw,
}

impl Compression {
    /// Encoding name passed to volume stores.
    pub fn encoding(&self) -> &'static str {
        match self {
            Compression::Gzip => "gzip",
            Compression::Zstd => "zstd",
            Compression::Raw => "raw",
        }
    }

    /// Wraps a compressed stream in a decoder.
    pub fn decoder(&self, stream: ByteStream) -> Decoder {
        let reader = BufReader::new(stream);
        match self {
            Compression::Gzip => Decoder::Gzip(GzipDecoder::new(reader)),
            Compression::Zstd => Decoder::Zstd(ZstdDecoder::new(reader)),
            Compression::Raw => Decoder::Raw(reader),
        }
    }

    /// Compresses an in-memory buffer.
    pub async fn compress(&self, data: &[u8]) -> Result<Vec<u8>> {
        match self {
            Compression::Gzip => {
                let mut encoder = GzipEncoder::new(Vec::new());
                encoder.write_all(data).await?;
                encoder.shutdown().await?;
                Ok(encoder.into_inner())
            }
            Compression::Zstd => {
                let mut encoder = ZstdEncoder::new(Vec::new());
                encoder.write_all(data).await?;
                encoder.shutdown().await?;
                Ok(encoder.into_inner())
            }
            Compression::Raw => Ok(data.to_vec()),
        }
    }

    /// Decompresses an in-memory buffer.
    pub async fn decompress(&self, data: Vec<u8>) -> Result<Vec<u8>> {
        let mut decoder = self.decoder(crate::stream::from_bytes(data));
        crate::stream::read_all(&mut decoder).await
    }
}

impl fmt::Display for Compression {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.encoding())
    }
}

impl FromStr for Compression {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "gzip" => Ok(Compression::Gzip),
            "zstd" => Ok(Compression::Zstd),
            "raw" => Ok(Compression::Raw),
            other => Err(other.to_string()),
        }
    }
}

/// Decompressing reader that keeps its transport reachable for closing.
pub enum Decoder {
    /// gzip decoder.
    Gzip(GzipDecoder<BufReader<ByteStream>>),
    /// zstd decoder.
    Zstd(ZstdDecoder<BufReader<ByteStream>>),
    /// Pass-through.
    Raw(BufReader<ByteStream>),
}

impl Decoder {
    /// The compressed stream being decoded.
    pub fn transport_mut(&mut self) -> &mut ByteStream {
        match self {
            Decoder::Gzip(d) => d.get_mut().get_mut(),
            Decoder::Zstd(d) => d.get_mut().get_mut(),
            Decoder::Raw(r) => r.get_mut(),
        }
    }
}

impl AsyncRead for Decoder {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<std::io::Result<()>> {
        match self.get_mut() {
            Decoder::Gzip(d) => Pin::new(d).poll_read(cx, buf),
            Decoder::Zstd(d) => Pin::new(d).poll_read(cx, buf),
            Decoder::Raw(r) => Pin::new(r).poll_read(cx, buf),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_codecs_preserve_content() {
        let payload = b"layer contents ".repeat(64);
        for codec in [Compression::Gzip, Compression::Zstd, Compression::Raw] {
            let packed = codec.compress(&payload).await.unwrap();
            assert_eq!(codec.decompress(packed).await.unwrap(), payload, "{codec}");
        }
    }

    #[test]
    fn test_parse_names() {
        assert_eq!("zstd".parse::<Compression>(), Ok(Compression::Zstd));
        assert_eq!(Compression::default().encoding(), "gzip");
        assert!("lz4".parse::<Compression>().is_err());
    }

    #[test]
    fn test_serde_names() {
        let json = serde_json::to_string(&Compression::Raw).unwrap();
        assert_eq!(json, "\"raw\"");
    }
}

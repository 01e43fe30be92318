//! Streaming decompression of upstream response bodies.
//!
//! Every variant wraps the upstream byte stream in a streaming decoder so
//! backpressure propagates to the upstream connection; nothing here fully
//! buffers a response before forwarding.

use bytes::Bytes;
use futures_util::{Stream, StreamExt, TryStreamExt};
use std::io;
use std::pin::Pin;
use tokio_util::io::{ReaderStream, StreamReader};

use async_compression::tokio::bufread::{BrotliDecoder, DeflateDecoder, GzipDecoder};

pub type ByteStream = Pin<Box<dyn Stream<Item = io::Result<Bytes>> + Send>>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ContentEncoding {
    Gzip,
    Deflate,
    Brotli,
    /// LZW, as produced by the historical HTTP `compress` encoding, MSB bit
    /// order.
    Compress,
    Identity,
}

pub fn parse_content_encoding(header: Option<&str>) -> Result<ContentEncoding, String> {
    match header.map(str::trim).unwrap_or("") {
        "" | "identity" => Ok(ContentEncoding::Identity),
        "gzip" | "x-gzip" => Ok(ContentEncoding::Gzip),
        "deflate" => Ok(ContentEncoding::Deflate),
        "br" => Ok(ContentEncoding::Brotli),
        "compress" | "x-compress" => Ok(ContentEncoding::Compress),
        other => Err(other.to_string()),
    }
}

fn to_async_read(
    stream: impl Stream<Item = reqwest::Result<Bytes>> + Send + 'static,
) -> impl tokio::io::AsyncBufRead + Send + Unpin + 'static {
    let mapped = stream.map_err(|e| io::Error::new(io::ErrorKind::Other, e));
    tokio::io::BufReader::new(StreamReader::new(mapped))
}

/// Wraps an upstream byte stream in the decoder matching `encoding`. Unknown
/// encodings are handled by the caller (pass-through with a warning) before
/// this is ever called.
pub fn decode_stream(
    encoding: ContentEncoding,
    upstream: impl Stream<Item = reqwest::Result<Bytes>> + Send + 'static,
) -> ByteStream {
    match encoding {
        ContentEncoding::Identity => {
            let mapped = upstream.map_err(|e| io::Error::new(io::ErrorKind::Other, e));
            Box::pin(mapped)
        }
        ContentEncoding::Gzip => {
            let reader = GzipDecoder::new(to_async_read(upstream));
            Box::pin(ReaderStream::new(reader))
        }
        ContentEncoding::Deflate => {
            let reader = DeflateDecoder::new(to_async_read(upstream));
            Box::pin(ReaderStream::new(reader))
        }
        ContentEncoding::Brotli => {
            let reader = BrotliDecoder::new(to_async_read(upstream));
            Box::pin(ReaderStream::new(reader))
        }
        ContentEncoding::Compress => Box::pin(LzwStream::new(upstream)),
    }
}

/// Streaming LZW ("compress" `Content-Encoding`) decoder, MSB bit order,
/// built directly on `weezl` since `async-compression` has no `compress`
/// variant.
struct LzwStream<S> {
    upstream: S,
    decoder: weezl::decode::Decoder,
    pending_input: Vec<u8>,
    done: bool,
}

impl<S> LzwStream<S> {
    fn new(upstream: S) -> Self {
        Self {
            upstream,
            decoder: weezl::decode::Decoder::new(weezl::BitOrder::Msb, 8),
            pending_input: Vec::new(),
            done: false,
        }
    }
}

impl<S> Stream for LzwStream<S>
where
    S: Stream<Item = reqwest::Result<Bytes>> + Send + Unpin,
{
    type Item = io::Result<Bytes>;

    fn poll_next(
        mut self: Pin<&mut Self>,
        cx: &mut std::task::Context<'_>,
    ) -> std::task::Poll<Option<Self::Item>> {
        use std::task::Poll;

        if self.done {
            return Poll::Ready(None);
        }

        loop {
            if !self.pending_input.is_empty() {
                let mut out = vec![0u8; 64 * 1024];
                let result = self.decoder.decode_bytes(&self.pending_input, &mut out);
                let consumed = result.consumed_in;
                let written = result.consumed_out;
                self.pending_input.drain(0..consumed);
                if written > 0 {
                    out.truncate(written);
                    return Poll::Ready(Some(Ok(Bytes::from(out))));
                }
                if let Err(err) = result.status {
                    self.done = true;
                    return Poll::Ready(Some(Err(io::Error::new(
                        io::ErrorKind::InvalidData,
                        err.to_string(),
                    ))));
                }
                if consumed == 0 {
                    // decoder made no progress on buffered input; need more bytes.
                }
            }

            match Pin::new(&mut self.upstream).poll_next(cx) {
                Poll::Ready(Some(Ok(chunk))) => {
                    self.pending_input.extend_from_slice(&chunk);
                }
                Poll::Ready(Some(Err(err))) => {
                    self.done = true;
                    return Poll::Ready(Some(Err(io::Error::new(io::ErrorKind::Other, err))));
                }
                Poll::Ready(None) => {
                    self.done = true;
                    return Poll::Ready(None);
                }
                Poll::Pending => return Poll::Pending,
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_known_encodings() {
        assert_eq!(parse_content_encoding(Some("gzip")), Ok(ContentEncoding::Gzip));
        assert_eq!(parse_content_encoding(Some("br")), Ok(ContentEncoding::Brotli));
        assert_eq!(
            parse_content_encoding(Some("deflate")),
            Ok(ContentEncoding::Deflate)
        );
        assert_eq!(
            parse_content_encoding(Some("compress")),
            Ok(ContentEncoding::Compress)
        );
        assert_eq!(parse_content_encoding(None), Ok(ContentEncoding::Identity));
        assert_eq!(parse_content_encoding(Some("")), Ok(ContentEncoding::Identity));
    }

    #[test]
    fn unknown_encoding_is_reported_for_pass_through_with_warning() {
        assert_eq!(
            parse_content_encoding(Some("zstd")),
            Err("zstd".to_string())
        );
    }
}

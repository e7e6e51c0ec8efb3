//! Buffered decompression of response bodies.
//!
//! These encodings cannot in general be decoded chunk-by-chunk with
//! guaranteed forward progress, so the whole body is accumulated and decoded
//! once the stream terminates. Downstream consumers (event parsers, body
//! taps, the client) always see identity-encoded bytes.

use std::io::Read;

use bytes::Bytes;
use tracing::warn;

use crate::pipeline::{HeaderMods, ResponseMeta, Transform};

pub struct DecompressTransform {
    buf: Vec<u8>,
    decoded_len: Option<usize>,
    failed: bool,
}

impl DecompressTransform {
    pub fn new() -> Self {
        Self {
            buf: Vec::new(),
            decoded_len: None,
            failed: false,
        }
    }
}

impl Default for DecompressTransform {
    fn default() -> Self {
        Self::new()
    }
}

impl Transform for DecompressTransform {
    fn should_activate(&self, meta: &ResponseMeta) -> bool {
        meta.content_encoding.is_some()
    }

    fn buffers(&self, _meta: &ResponseMeta) -> bool {
        true
    }

    fn process(&mut self, chunk: Bytes, _meta: &ResponseMeta) -> Option<Bytes> {
        self.buf.extend_from_slice(&chunk);
        None
    }

    fn flush(&mut self, meta: &ResponseMeta) -> Option<Bytes> {
        let encoding = meta.content_encoding.as_deref().unwrap_or("");
        let raw = std::mem::take(&mut self.buf);
        if raw.is_empty() {
            self.decoded_len = Some(0);
            return Some(Bytes::new());
        }
        match decode(encoding, &raw) {
            Ok(decoded) => {
                self.decoded_len = Some(decoded.len());
                Some(Bytes::from(decoded))
            }
            Err(e) => {
                warn!(
                    "failed to decode {encoding} body ({} bytes), passing through: {e}",
                    raw.len()
                );
                self.failed = true;
                Some(Bytes::from(raw))
            }
        }
    }

    fn header_mods(&self, _meta: &ResponseMeta) -> HeaderMods {
        if self.failed {
            return HeaderMods::default();
        }
        let mut mods = HeaderMods::default();
        mods.remove.push("content-encoding".into());
        mods.remove.push("transfer-encoding".into());
        if let Some(len) = self.decoded_len {
            mods.set.push(("content-length".into(), len.to_string()));
        }
        mods
    }

    fn failed(&self) -> bool {
        self.failed
    }
}

fn decode(encoding: &str, data: &[u8]) -> std::io::Result<Vec<u8>> {
    match encoding {
        "gzip" | "x-gzip" => {
            let mut out = Vec::new();
            flate2::read::GzDecoder::new(data).read_to_end(&mut out)?;
            Ok(out)
        }
        // `deflate` in the wild is either zlib-wrapped or raw
        "deflate" => {
            let mut out = Vec::new();
            match flate2::read::ZlibDecoder::new(data).read_to_end(&mut out) {
                Ok(_) => Ok(out),
                Err(_) => {
                    let mut out = Vec::new();
                    flate2::read::DeflateDecoder::new(data).read_to_end(&mut out)?;
                    Ok(out)
                }
            }
        }
        "br" => {
            let mut out = Vec::new();
            brotli::Decompressor::new(data, 4096).read_to_end(&mut out)?;
            Ok(out)
        }
        "zstd" => zstd::stream::decode_all(data),
        other => Err(std::io::Error::other(format!(
            "unsupported content-encoding: {other}"
        ))),
    }
}

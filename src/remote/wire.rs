//! Line-delimited batch format: one `id\tjson` pair per line, optionally
//! gzip-compressed as a whole.

use std::io::{Read, Write};

use flate2::read::GzDecoder as GzReader;
use flate2::write::{GzDecoder, GzEncoder};
use flate2::Compression;

use super::RemoteError;
use crate::types::ObjectId;

const GZIP_MAGIC: [u8; 2] = [0x1f, 0x8b];

/// Whether `bytes` starts with the gzip magic number.
pub fn is_gzip(bytes: &[u8]) -> bool {
    bytes.starts_with(&GZIP_MAGIC)
}

/// Encodes `(id, json)` pairs as newline-terminated `id\tjson` lines.
///
/// Compact JSON never contains a raw newline or tab, so no escaping is needed.
pub fn encode_lines<'a, I>(items: I) -> Vec<u8>
where
    I: IntoIterator<Item = (&'a ObjectId, &'a str)>,
{
    let mut out = Vec::new();
    for (id, json) in items {
        out.extend_from_slice(id.as_str().as_bytes());
        out.push(b'\t');
        out.extend_from_slice(json.as_bytes());
        out.push(b'\n');
    }
    out
}

/// Gzips `bytes`.
pub fn gzip(bytes: &[u8]) -> Result<Vec<u8>, RemoteError> {
    let mut encoder = GzEncoder::new(Vec::with_capacity(bytes.len() / 4), Compression::fast());
    encoder.write_all(bytes)?;
    Ok(encoder.finish()?)
}

/// Inflates a gzip body.
pub fn gunzip(bytes: &[u8]) -> Result<Vec<u8>, RemoteError> {
    let mut out = Vec::with_capacity(bytes.len() * 4);
    GzReader::new(bytes).read_to_end(&mut out)?;
    Ok(out)
}

/// Full request body for an upload.
pub fn encode_batch<'a, I>(items: I, compress: bool) -> Result<Vec<u8>, RemoteError>
where
    I: IntoIterator<Item = (&'a ObjectId, &'a str)>,
{
    let body = encode_lines(items);
    if compress {
        gzip(&body)
    } else {
        Ok(body)
    }
}

/// Decodes a complete body, detecting compression from the magic number.
pub fn decode_batch(body: &[u8]) -> Result<Vec<(ObjectId, String)>, RemoteError> {
    let mut decoder = if is_gzip(body) {
        LineDecoder::gzip()
    } else {
        LineDecoder::new()
    };
    let mut items = decoder.push(body)?;
    items.extend(decoder.finish()?);
    Ok(items)
}

fn parse_line(line: &[u8]) -> Result<(ObjectId, String), RemoteError> {
    let line = line.strip_suffix(b"\r").unwrap_or(line);
    let tab = line
        .iter()
        .position(|&b| b == b'\t')
        .ok_or_else(|| RemoteError::Wire("line without a tab separator".into()))?;
    let id = std::str::from_utf8(&line[..tab])
        .map_err(|err| RemoteError::Wire(format!("id is not utf-8: {err}")))?;
    let id = ObjectId::parse(id).map_err(|err| RemoteError::Wire(err.to_string()))?;
    let json = String::from_utf8(line[tab + 1..].to_vec())
        .map_err(|err| RemoteError::Wire(format!("record {id} is not utf-8: {err}")))?;
    Ok((id, json))
}

/// Incremental decoder for batch download bodies.
///
/// Accepts the body in arbitrary chunks and yields every line completed by
/// the bytes seen so far.
pub struct LineDecoder {
    inflater: Option<GzDecoder<Vec<u8>>>,
    pending: Vec<u8>,
}

impl Default for LineDecoder {
    fn default() -> Self {
        Self::new()
    }
}

impl LineDecoder {
    /// Decoder for an uncompressed body.
    pub fn new() -> Self {
        Self {
            inflater: None,
            pending: Vec::new(),
        }
    }

    /// Decoder for a gzip-compressed body.
    pub fn gzip() -> Self {
        Self {
            inflater: Some(GzDecoder::new(Vec::new())),
            pending: Vec::new(),
        }
    }

    /// Feeds `chunk` and returns every pair completed by it.
    pub fn push(&mut self, chunk: &[u8]) -> Result<Vec<(ObjectId, String)>, RemoteError> {
        match &mut self.inflater {
            Some(inflater) => {
                inflater.write_all(chunk)?;
                self.pending.append(inflater.get_mut());
            }
            None => self.pending.extend_from_slice(chunk),
        }
        self.drain_lines()
    }

    /// Flushes the decoder, returning a final unterminated line if any.
    pub fn finish(mut self) -> Result<Vec<(ObjectId, String)>, RemoteError> {
        if let Some(inflater) = self.inflater.take() {
            let mut rest = inflater.finish()?;
            self.pending.append(&mut rest);
        }
        let mut items = self.drain_lines()?;
        if !self.pending.is_empty() {
            items.push(parse_line(&self.pending)?);
        }
        Ok(items)
    }

    fn drain_lines(&mut self) -> Result<Vec<(ObjectId, String)>, RemoteError> {
        let mut items = Vec::new();
        let mut start = 0;
        while let Some(offset) = self.pending[start..].iter().position(|&b| b == b'\n') {
            let line = &self.pending[start..start + offset];
            if !line.is_empty() {
                items.push(parse_line(line)?);
            }
            start += offset + 1;
        }
        self.pending.drain(..start);
        Ok(items)
    }
}

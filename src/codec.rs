use compression_codecs::{DecodeV2, EncodeV2, GzipDecoder, GzipEncoder};
use compression_core::Level;
use http::{HeaderMap, header};

/// How the upstream body is transformed on its way downstream.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Transcode {
    /// Copy the upstream body as is.
    Passthrough,
    /// Gzip the upstream body.
    Compress,
    /// Gunzip the upstream body.
    Decompress,
}

impl Transcode {
    /// Picks the transformation for a client that does or does not accept
    /// gzip and an upstream body that is or is not gzipped.
    pub fn select(downstream_gzip: bool, upstream_gzip: bool) -> Self {
        match (downstream_gzip, upstream_gzip) {
            (true, false) => Transcode::Compress,
            (false, true) => Transcode::Decompress,
            _ => Transcode::Passthrough,
        }
    }
}

/// Creates a gzip encoder at the default level.
pub(crate) fn gzip_encoder() -> Box<dyn EncodeV2 + Send> {
    Box::new(GzipEncoder::new(Level::Default.into()))
}

/// Creates a gzip decoder.
pub(crate) fn gzip_decoder() -> Box<dyn DecodeV2 + Send> {
    Box::new(GzipDecoder::new())
}

/// Returns whether the request's `Accept-Encoding` allows a gzip response.
///
/// The header value is expected to be comma-separated encodings with optional
/// quality values (e.g., "gzip, br;q=1.0, zstd;q=0.8"). An explicit gzip
/// entry decides; otherwise `*` covers gzip.
pub fn accepts_gzip(headers: &HeaderMap) -> bool {
    let mut gzip: Option<f32> = None;
    let mut wildcard: Option<f32> = None;

    let entries = headers
        .get_all(header::ACCEPT_ENCODING)
        .iter()
        .filter_map(|v| v.to_str().ok())
        .flat_map(|v| v.split(','))
        .map(|part| parse_encoding_with_quality(part.trim()));

    for (encoding, quality) in entries {
        let slot = if is_gzip_token(encoding) {
            &mut gzip
        } else if encoding == "*" {
            &mut wildcard
        } else {
            continue;
        };
        let best = slot.get_or_insert(0.0);
        *best = best.max(quality);
    }

    gzip.or(wildcard).is_some_and(|quality| quality > 0.0)
}

/// Returns whether the response's `Content-Encoding` is gzip.
pub fn is_gzip(headers: &HeaderMap) -> bool {
    headers
        .get_all(header::CONTENT_ENCODING)
        .iter()
        .filter_map(|v| v.to_str().ok())
        .flat_map(|v| v.split(','))
        .any(|encoding| is_gzip_token(encoding.trim()))
}

/// Returns whether the response carries a `Content-Encoding` other than gzip
/// or identity.
pub(crate) fn has_foreign_encoding(headers: &HeaderMap) -> bool {
    headers
        .get_all(header::CONTENT_ENCODING)
        .iter()
        .filter_map(|v| v.to_str().ok())
        .flat_map(|v| v.split(','))
        .map(str::trim)
        .any(|encoding| {
            !encoding.is_empty()
                && !encoding.eq_ignore_ascii_case("identity")
                && !is_gzip_token(encoding)
        })
}

fn is_gzip_token(encoding: &str) -> bool {
    encoding.eq_ignore_ascii_case("gzip") || encoding.eq_ignore_ascii_case("x-gzip")
}

/// Parses an encoding entry like "gzip" or "br;q=0.8" into (encoding, quality).
fn parse_encoding_with_quality(s: &str) -> (&str, f32) {
    let mut parts = s.splitn(2, ';');
    let encoding = parts.next().unwrap_or("").trim();

    let quality = parts
        .next()
        .and_then(|q| {
            let q = q.trim();
            if q.starts_with("q=") || q.starts_with("Q=") {
                q[2..].parse::<f32>().ok()
            } else {
                None
            }
        })
        .unwrap_or(1.0);

    (encoding, quality)
}

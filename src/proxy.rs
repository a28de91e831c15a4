use crate::body::PrerenderBody;
use crate::classifier::request_host;
use crate::codec::{self, Transcode};
use crate::config::PrerenderConfig;
use crate::error::PrerenderError;
use bytes::Bytes;
use http::{HeaderValue, Method, Request, Response, header};
use http_body_util::Empty;
use regex::Regex;
use std::sync::LazyLock;

/// Request header carrying the rendering service token.
pub const X_PRERENDER_TOKEN: &str = "x-prerender-token";

/// Cloudflare's visitor header, e.g. `{"scheme":"https"}`.
pub const CF_VISITOR: &str = "cf-visitor";

/// Standard proxy header naming the client's protocol.
pub const X_FORWARDED_PROTO: &str = "x-forwarded-proto";

static CF_SCHEME: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r#""scheme":"(https?)""#).expect("scheme pattern is valid")
});

/// Determines the protocol the client used to reach us.
///
/// `CF-Visitor` wins over `X-Forwarded-Proto`, which wins over the request's
/// own scheme. Defaults to `http`.
pub fn resolve_protocol<B>(req: &Request<B>) -> String {
    let headers = req.headers();

    let cf_visitor = headers
        .get(CF_VISITOR)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| CF_SCHEME.captures(v))
        .and_then(|caps| caps.get(1))
        .map(|m| m.as_str().to_owned());
    if let Some(protocol) = cf_visitor {
        return protocol;
    }

    let forwarded = headers
        .get(X_FORWARDED_PROTO)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.split(',').next())
        .map(str::trim)
        .filter(|v| !v.is_empty());
    if let Some(protocol) = forwarded {
        return protocol.to_owned();
    }

    req.uri().scheme_str().unwrap_or("http").to_owned()
}

/// Builds the rendering service URL for a request:
/// `<service><protocol>://<host><path>?<query>`.
pub fn upstream_url<B>(config: &PrerenderConfig, req: &Request<B>) -> String {
    let uri = req.uri();
    format!(
        "{}{}://{}{}?{}",
        config.base_url(),
        resolve_protocol(req),
        request_host(req),
        uri.path(),
        uri.query().unwrap_or_default(),
    )
}

/// Builds the GET request sent to the rendering service.
///
/// Gzip is always requested from upstream; the response is transcoded to
/// whatever the client accepts.
pub fn build_request<B>(
    config: &PrerenderConfig,
    req: &Request<B>,
) -> Result<Request<Empty<Bytes>>, PrerenderError> {
    let url = upstream_url(config, req);

    let mut builder = Request::builder()
        .method(Method::GET)
        .uri(url.as_str())
        .header(header::ACCEPT_ENCODING, HeaderValue::from_static("gzip"));

    for name in [header::USER_AGENT, header::CONTENT_TYPE] {
        if let Some(value) = req.headers().get(&name) {
            builder = builder.header(name, value.clone());
        }
    }

    if let Some(token) = config.token_value() {
        builder = builder.header(X_PRERENDER_TOKEN, token.clone());
    }

    builder
        .body(Empty::new())
        .map_err(|source| PrerenderError::Request { url, source })
}

/// Turns the rendering service's response into the client's response.
///
/// | client gzip | upstream gzip | body       | `Content-Encoding` |
/// |-------------|---------------|------------|--------------------|
/// | yes         | yes           | verbatim   | `gzip`             |
/// | yes         | no            | gzipped    | `gzip`             |
/// | no          | yes           | gunzipped  | none               |
/// | no          | no            | verbatim   | upstream's         |
pub fn render_response<B, R>(
    upstream: Response<R>,
    downstream_gzip: bool,
) -> Response<PrerenderBody<B, R>> {
    let (parts, body) = upstream.into_parts();
    let upstream_gzip = codec::is_gzip(&parts.headers);
    // Gzip-wrapping an already encoded body would hide its encoding.
    let transcode = match Transcode::select(downstream_gzip, upstream_gzip) {
        Transcode::Compress if codec::has_foreign_encoding(&parts.headers) => {
            Transcode::Passthrough
        }
        transcode => transcode,
    };

    let mut response = Response::new(PrerenderBody::rendered(body, transcode));
    *response.status_mut() = parts.status;

    let headers = response.headers_mut();
    if let Some(content_type) = parts.headers.get(header::CONTENT_TYPE) {
        headers.insert(header::CONTENT_TYPE, content_type.clone());
    }

    match transcode {
        Transcode::Compress => {
            headers.insert(
                header::CONTENT_ENCODING,
                HeaderValue::from_static("gzip"),
            );
        }
        Transcode::Decompress => {}
        Transcode::Passthrough => {
            for value in parts.headers.get_all(header::CONTENT_ENCODING) {
                headers.append(header::CONTENT_ENCODING, value.clone());
            }
            if let Some(length) = parts.headers.get(header::CONTENT_LENGTH) {
                headers.insert(header::CONTENT_LENGTH, length.clone());
            }
        }
    }

    headers.insert(header::VARY, HeaderValue::from_static("accept-encoding"));

    tracing::debug!(
        status = %parts.status,
        downstream_gzip,
        upstream_gzip,
        ?transcode,
        "serving prerendered response"
    );

    response
}

#[cfg(test)]
mod tests {
    use super::*;
    use http::StatusCode;

    fn request(uri: &str, headers: &[(&str, &str)]) -> Request<()> {
        let mut builder = Request::get(uri);
        for (name, value) in headers {
            builder = builder.header(*name, *value);
        }
        builder.body(()).unwrap()
    }

    fn config() -> PrerenderConfig {
        PrerenderConfig::new().service_url("https://service").unwrap()
    }

    fn upstream(headers: &[(&'static str, &'static str)]) -> Response<&'static str> {
        let mut response = Response::new("body");
        for (name, value) in headers {
            response
                .headers_mut()
                .insert(*name, HeaderValue::from_static(*value));
        }
        response
    }

    #[test]
    fn test_upstream_url() {
        let req = request("https://example.com/", &[]);
        assert_eq!(
            upstream_url(&config(), &req),
            "https://service/https://example.com/?"
        );

        let req = request("http://example.com/a/b?x=1&y=2", &[]);
        assert_eq!(
            upstream_url(&config(), &req),
            "https://service/http://example.com/a/b?x=1&y=2"
        );
    }

    #[test]
    fn test_upstream_url_origin_form() {
        let req = request("/page?q=1", &[("host", "example.com")]);
        assert_eq!(
            upstream_url(&config(), &req),
            "https://service/http://example.com/page?q=1"
        );
    }

    #[test]
    fn test_protocol_from_cf_visitor() {
        let req = request(
            "/",
            &[
                ("cf-visitor", r#"{"scheme":"https"}"#),
                ("x-forwarded-proto", "http"),
            ],
        );
        assert_eq!(resolve_protocol(&req), "https");
    }

    #[test]
    fn test_protocol_from_forwarded_proto() {
        let req = request("http://example.com/", &[("x-forwarded-proto", "https, http")]);
        assert_eq!(resolve_protocol(&req), "https");
    }

    #[test]
    fn test_protocol_ignores_unparseable_cf_visitor() {
        let req = request("/", &[("cf-visitor", "garbage"), ("x-forwarded-proto", "https")]);
        assert_eq!(resolve_protocol(&req), "https");
    }

    #[test]
    fn test_protocol_defaults() {
        assert_eq!(resolve_protocol(&request("https://example.com/", &[])), "https");
        assert_eq!(resolve_protocol(&request("/", &[])), "http");
    }

    #[test]
    fn test_build_request_headers() {
        let config = config().token("secret").unwrap();
        let req = request(
            "https://example.com/",
            &[
                ("user-agent", "twitterbot"),
                ("content-type", "text/html"),
                ("accept-encoding", "br"),
                ("cookie", "session=1"),
            ],
        );
        let upstream = build_request(&config, &req).unwrap();

        assert_eq!(upstream.method(), Method::GET);
        assert_eq!(upstream.uri(), "https://service/https://example.com/?");
        let headers = upstream.headers();
        assert_eq!(headers[header::ACCEPT_ENCODING], "gzip");
        assert_eq!(headers[header::USER_AGENT], "twitterbot");
        assert_eq!(headers[header::CONTENT_TYPE], "text/html");
        assert_eq!(headers[X_PRERENDER_TOKEN], "secret");
        assert!(headers.get(header::COOKIE).is_none());
    }

    #[test]
    fn test_build_request_without_token() {
        let req = request("https://example.com/", &[("user-agent", "twitterbot")]);
        let upstream = build_request(&config(), &req).unwrap();
        assert!(upstream.headers().get(X_PRERENDER_TOKEN).is_none());
        assert!(upstream.headers().get(header::CONTENT_TYPE).is_none());
    }

    #[test]
    fn test_build_request_rejects_bad_url() {
        let req = request("/", &[("host", "exa mple.com")]);
        let err = build_request(&config(), &req).unwrap_err();
        assert!(matches!(err, PrerenderError::Request { .. }));
        assert!(err.url().starts_with("https://service/"));
    }

    #[test]
    fn test_render_gzip_to_gzip_client() {
        let response = upstream(&[("content-encoding", "gzip"), ("content-type", "text/html")]);
        let rendered: Response<PrerenderBody<(), _>> = render_response(response, true);

        assert!(matches!(rendered.body(), PrerenderBody::Rendered { .. }));
        assert_eq!(rendered.headers()[header::CONTENT_ENCODING], "gzip");
        assert_eq!(rendered.headers()[header::CONTENT_TYPE], "text/html");
    }

    #[test]
    fn test_render_plain_to_gzip_client() {
        let response = upstream(&[("content-type", "text/html"), ("content-length", "4")]);
        let rendered: Response<PrerenderBody<(), _>> = render_response(response, true);

        match rendered.body() {
            PrerenderBody::Transcoded { state, .. } => assert!(state.is_compressing()),
            _ => panic!("Expected transcoded body"),
        }
        assert_eq!(rendered.headers()[header::CONTENT_ENCODING], "gzip");
        assert!(rendered.headers().get(header::CONTENT_LENGTH).is_none());
    }

    #[test]
    fn test_render_gzip_to_plain_client() {
        let response = upstream(&[("content-encoding", "gzip"), ("content-length", "20")]);
        let rendered: Response<PrerenderBody<(), _>> = render_response(response, false);

        match rendered.body() {
            PrerenderBody::Transcoded { state, .. } => assert!(!state.is_compressing()),
            _ => panic!("Expected transcoded body"),
        }
        assert!(rendered.headers().get(header::CONTENT_ENCODING).is_none());
        assert!(rendered.headers().get(header::CONTENT_LENGTH).is_none());
    }

    #[test]
    fn test_render_plain_to_plain_client() {
        let response = upstream(&[("content-length", "4")]);
        let rendered: Response<PrerenderBody<(), _>> = render_response(response, false);

        assert!(matches!(rendered.body(), PrerenderBody::Rendered { .. }));
        assert!(rendered.headers().get(header::CONTENT_ENCODING).is_none());
        assert_eq!(rendered.headers()[header::CONTENT_LENGTH], "4");
    }

    #[test]
    fn test_render_mirrors_foreign_encoding() {
        let response = upstream(&[("content-encoding", "br")]);
        let rendered: Response<PrerenderBody<(), _>> = render_response(response, false);
        assert_eq!(rendered.headers()[header::CONTENT_ENCODING], "br");
    }

    #[test]
    fn test_render_passes_foreign_encoding_to_gzip_client() {
        let response = upstream(&[("content-encoding", "br"), ("content-length", "4")]);
        let rendered: Response<PrerenderBody<(), _>> = render_response(response, true);

        assert!(matches!(rendered.body(), PrerenderBody::Rendered { .. }));
        assert_eq!(rendered.headers()[header::CONTENT_ENCODING], "br");
        assert_eq!(rendered.headers()[header::CONTENT_LENGTH], "4");
    }

    #[test]
    fn test_render_mirrors_status_and_drops_other_headers() {
        let mut response = upstream(&[("set-cookie", "a=b"), ("vary", "user-agent")]);
        *response.status_mut() = StatusCode::NOT_FOUND;
        let rendered: Response<PrerenderBody<(), _>> = render_response(response, false);

        assert_eq!(rendered.status(), StatusCode::NOT_FOUND);
        assert!(rendered.headers().get(header::SET_COOKIE).is_none());
        assert_eq!(rendered.headers()[header::VARY], "accept-encoding");
    }
}

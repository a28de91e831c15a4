//! Prerendering middleware for Tower.
//!
//! This crate provides a Tower layer that answers crawler requests with a
//! snapshot from a remote rendering service (such as Prerender.io) and hands
//! every other request to the wrapped service.
//!
//! # Example
//!
//! ```ignore
//! use http_prerender::{PrerenderConfig, PrerenderLayer};
//! use tower::ServiceBuilder;
//!
//! let config = PrerenderConfig::from_env()?.deny([r"/admin"])?;
//! let service = ServiceBuilder::new()
//!     .layer(PrerenderLayer::with_https_client(config)?)
//!     .service(my_service);
//! ```
//!
//! # Classification Rules
//!
//! A request is prerendered only when all of the following hold:
//! - It has a non-empty `User-Agent`
//! - Its method is `GET` or `HEAD`
//! - Its URL does not end in a static resource extension (`.js`, `.css`, `.png`, ...)
//! - It comes from a known crawler, carries `X-Bufferbot`, or has a non-empty
//!   `_escaped_fragment_` query parameter
//! - Its lower-cased URL matches the allow-list (when one is set) and does not
//!   match the deny-list
//!
//! # Response Encoding
//!
//! The rendering service is always asked for gzip. The response body is then
//! passed through, gzipped or gunzipped so that it matches the client's
//! `Accept-Encoding`. The upstream status and `Content-Type` are kept.
//!
//! A prerendered response is final: the wrapped service is only called for
//! requests that are not prerendered, or when the rendering service fails and
//! [`PrerenderConfig::fallback_on_error`] is enabled.

#![deny(missing_docs)]

mod body;
mod classifier;
#[cfg(feature = "client")]
mod client;
mod codec;
mod config;
mod error;
mod future;
mod layer;
mod proxy;
mod service;

pub use body::PrerenderBody;
pub use classifier::{
    CRAWLER_USER_AGENTS, ESCAPED_FRAGMENT, RequestView, SKIPPED_EXTENSIONS, X_BUFFERBOT,
    request_url, should_prerender,
};
#[cfg(feature = "client")]
pub use client::{HttpsClient, https_client};
pub use codec::{Transcode, accepts_gzip, is_gzip};
pub use config::{DEFAULT_SERVICE_URL, PrerenderConfig, SERVICE_URL_ENV, TOKEN_ENV};
pub use error::{BoxError, ConfigError, PrerenderError};
pub use future::ResponseFuture;
pub use layer::PrerenderLayer;
pub use proxy::{
    CF_VISITOR, X_FORWARDED_PROTO, X_PRERENDER_TOKEN, build_request, render_response,
    resolve_protocol, upstream_url,
};
pub use service::PrerenderService;

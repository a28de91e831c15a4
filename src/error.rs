use thiserror::Error;

/// Boxed error type returned by [`PrerenderService`](crate::PrerenderService).
pub type BoxError = tower::BoxError;

/// Errors raised while building a [`PrerenderConfig`](crate::PrerenderConfig).
#[derive(Debug, Error)]
pub enum ConfigError {
    /// The rendering service URL is not an absolute `http` or `https` URL.
    #[error("invalid prerender service URL {url:?}: {reason}")]
    InvalidServiceUrl {
        /// The rejected URL.
        url: String,
        /// Why it was rejected.
        reason: String,
    },

    /// An allow-list or deny-list pattern failed to compile.
    #[error("invalid URL pattern {pattern:?}")]
    InvalidPattern {
        /// The rejected pattern.
        pattern: String,
        /// The underlying regex error.
        #[source]
        source: regex::Error,
    },

    /// The token cannot be sent as a header value.
    #[error("invalid prerender token")]
    InvalidToken(#[from] http::header::InvalidHeaderValue),

    /// The TLS client configuration could not be built.
    #[cfg(feature = "client")]
    #[error("failed to configure TLS for the upstream client")]
    Tls(#[from] rustls::Error),
}

/// Errors raised while proxying a request to the rendering service.
///
/// Both variants occur before anything is written downstream, so the
/// request can still be handed to the next service.
#[derive(Debug, Error)]
pub enum PrerenderError {
    /// The upstream request could not be constructed.
    #[error("failed to build prerender request for {url}")]
    Request {
        /// The upstream URL.
        url: String,
        /// The underlying HTTP error.
        #[source]
        source: http::Error,
    },

    /// The rendering service could not be reached.
    #[error("prerender request to {url} failed")]
    Upstream {
        /// The upstream URL.
        url: String,
        /// The client's error.
        #[source]
        source: BoxError,
    },
}

impl PrerenderError {
    /// Returns the upstream URL the failed request was addressed to.
    pub fn url(&self) -> &str {
        match self {
            PrerenderError::Request { url, .. } | PrerenderError::Upstream { url, .. } => url,
        }
    }
}

use crate::body::PrerenderBody;
use crate::classifier::should_prerender;
use crate::codec::accepts_gzip;
use crate::config::PrerenderConfig;
use crate::error::BoxError;
use crate::future::ResponseFuture;
use crate::proxy::build_request;
use bytes::Bytes;
use http::{Request, Response};
use http_body_util::Empty;
use std::sync::Arc;
use std::task::{Context, Poll, ready};
use tower::Service;

/// A Tower service that serves prerendered pages to crawlers.
///
/// Requests the classifier accepts are fetched from the rendering service
/// through `client`; all others go to `inner`.
#[derive(Debug, Clone)]
pub struct PrerenderService<S, C> {
    inner: S,
    client: C,
    config: Arc<PrerenderConfig>,
}

impl<S, C> PrerenderService<S, C> {
    /// Creates a new prerender service wrapping the given inner service.
    pub fn new(inner: S, client: C, config: Arc<PrerenderConfig>) -> Self {
        Self {
            inner,
            client,
            config,
        }
    }

    /// Returns the configuration.
    pub fn config(&self) -> &PrerenderConfig {
        &self.config
    }

    /// Returns a reference to the inner service.
    pub fn inner(&self) -> &S {
        &self.inner
    }

    /// Returns a mutable reference to the inner service.
    pub fn inner_mut(&mut self) -> &mut S {
        &mut self.inner
    }

    /// Consumes this service, returning the inner service.
    pub fn into_inner(self) -> S {
        self.inner
    }
}

impl<S, C, ReqBody, ResBody, UpBody> Service<Request<ReqBody>> for PrerenderService<S, C>
where
    S: Service<Request<ReqBody>, Response = Response<ResBody>> + Clone,
    S::Error: Into<BoxError>,
    C: Service<Request<Empty<Bytes>>, Response = Response<UpBody>> + Clone,
    C::Error: Into<BoxError>,
{
    type Response = Response<PrerenderBody<ResBody, UpBody>>;
    type Error = BoxError;
    type Future = ResponseFuture<S::Future, C::Future, S, ReqBody>;

    fn poll_ready(&mut self, cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        ready!(self.client.poll_ready(cx)).map_err(Into::<BoxError>::into)?;
        self.inner.poll_ready(cx).map_err(Into::into)
    }

    fn call(&mut self, req: Request<ReqBody>) -> Self::Future {
        if !should_prerender(&self.config, &req) {
            return ResponseFuture::next(self.inner.call(req));
        }

        let upstream = match build_request(&self.config, &req) {
            Ok(upstream) => upstream,
            Err(error) if self.config.falls_back_on_error() => {
                tracing::warn!(error = %error, "prerender request invalid, falling back to next service");
                return ResponseFuture::next(self.inner.call(req));
            }
            Err(error) => return ResponseFuture::failed(error),
        };

        let url = upstream.uri().to_string();
        let downstream_gzip = accepts_gzip(req.headers());
        tracing::debug!(%url, downstream_gzip, "fetching prerendered page");

        // Take the services that were driven to readiness
        let client = self.client.clone();
        let mut client = std::mem::replace(&mut self.client, client);
        let future = client.call(upstream);

        let fallback = self.config.falls_back_on_error().then(|| {
            let inner = self.inner.clone();
            (std::mem::replace(&mut self.inner, inner), req)
        });

        ResponseFuture::render(future, url, downstream_gzip, fallback)
    }
}

use crate::config::PrerenderConfig;
use crate::service::PrerenderService;
use std::sync::Arc;
use tower::Layer;

/// A Tower layer that serves prerendered pages to crawlers.
///
/// `client` is any service that performs the GET against the rendering
/// service, such as a `hyper_util` client.
#[derive(Debug, Clone)]
pub struct PrerenderLayer<C> {
    config: Arc<PrerenderConfig>,
    client: C,
}

impl<C> PrerenderLayer<C> {
    /// Creates a new prerender layer.
    pub fn new(config: PrerenderConfig, client: C) -> Self {
        Self::with_shared_config(Arc::new(config), client)
    }

    /// Creates a new prerender layer from an already shared configuration.
    pub fn with_shared_config(config: Arc<PrerenderConfig>, client: C) -> Self {
        Self { config, client }
    }

    /// Returns the configuration.
    pub fn config(&self) -> &PrerenderConfig {
        &self.config
    }
}

#[cfg(feature = "client")]
impl PrerenderLayer<crate::client::HttpsClient> {
    /// Creates a new prerender layer that reaches the rendering service over
    /// a pooled HTTP/HTTPS client.
    pub fn with_https_client(config: PrerenderConfig) -> Result<Self, crate::ConfigError> {
        Ok(Self::new(config, crate::client::https_client()?))
    }
}

impl<S, C: Clone> Layer<S> for PrerenderLayer<C> {
    type Service = PrerenderService<S, C>;

    fn layer(&self, inner: S) -> Self::Service {
        PrerenderService::new(inner, self.client.clone(), self.config.clone())
    }
}

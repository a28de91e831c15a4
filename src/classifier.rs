use crate::config::PrerenderConfig;
use http::{Method, Request, header};
use std::borrow::Cow;
use url::form_urlencoded;

/// Request header set by Buffer's crawler to ask for a prerendered page.
pub const X_BUFFERBOT: &str = "x-bufferbot";

/// Query parameter of the AJAX crawling scheme.
pub const ESCAPED_FRAGMENT: &str = "_escaped_fragment_";

/// User agent substrings of crawlers and link unfurlers that get prerendered
/// pages. Entries are lower case.
pub const CRAWLER_USER_AGENTS: &[&str] = &[
    "googlebot",
    "yahoo",
    "bingbot",
    "yandex",
    "baiduspider",
    "facebookexternalhit",
    "twitterbot",
    "rogerbot",
    "linkedinbot",
    "embedly",
    "quora link preview",
    "showyoubot",
    "outbrain",
    "pinterest",
    "developers.google.com/+/web/snippet",
    "slackbot",
    "vkshare",
    "w3c_validator",
    "redditbot",
    "applebot",
    "whatsapp",
    "flipboard",
    "tumblr",
    "bitlybot",
    "skypeuripreview",
    "nuzzel",
    "discordbot",
    "google page speed",
    "qwantify",
    "pinterestbot",
    "bitrix link preview",
    "xing-contenttabreceiver",
    "chrome-lighthouse",
    "telegrambot",
];

/// Extensions of static resources that are never prerendered. Entries are
/// lower case.
pub const SKIPPED_EXTENSIONS: &[&str] = &[
    ".js", ".css", ".xml", ".less", ".png", ".jpg", ".jpeg", ".gif", ".pdf", ".doc", ".txt",
    ".ico", ".rss", ".zip", ".mp3", ".rar", ".exe", ".wmv", ".avi", ".ppt", ".mpg",
    ".mpeg", ".tif", ".wav", ".mov", ".psd", ".ai", ".xls", ".mp4", ".m4a", ".swf", ".dat",
    ".dmg", ".iso", ".flv", ".m4v", ".torrent", ".ttf", ".woff", ".woff2", ".svg", ".eot",
];

/// The parts of a request that decide whether it is prerendered.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RequestView<'a> {
    method: &'a Method,
    user_agent: String,
    bufferbot: bool,
    escaped_fragment: bool,
    url: String,
}

impl<'a> RequestView<'a> {
    /// Extracts the classification input from a request.
    pub fn from_request<B>(req: &'a Request<B>) -> Self {
        let user_agent = req
            .headers()
            .get(header::USER_AGENT)
            .map(|v| String::from_utf8_lossy(v.as_bytes()).to_lowercase())
            .unwrap_or_default();

        let bufferbot = req
            .headers()
            .get(X_BUFFERBOT)
            .is_some_and(|v| !v.is_empty());

        let escaped_fragment = req.uri().query().is_some_and(|query| {
            form_urlencoded::parse(query.as_bytes())
                .find(|(key, _)| key == ESCAPED_FRAGMENT)
                .is_some_and(|(_, value)| !value.is_empty())
        });

        Self {
            method: req.method(),
            user_agent,
            bufferbot,
            escaped_fragment,
            url: request_url(req).to_lowercase(),
        }
    }

    /// Returns the lower-cased user agent.
    pub fn user_agent(&self) -> &str {
        &self.user_agent
    }

    /// Returns the lower-cased, fully qualified request URL.
    pub fn url(&self) -> &str {
        &self.url
    }

    fn is_static_resource(&self) -> bool {
        SKIPPED_EXTENSIONS.iter().any(|ext| self.url.ends_with(ext))
    }

    fn is_crawler(&self) -> bool {
        CRAWLER_USER_AGENTS
            .iter()
            .any(|agent| self.user_agent.contains(agent))
    }

    /// Decides whether the request is prerendered under `config`.
    pub fn should_prerender(&self, config: &PrerenderConfig) -> bool {
        if self.user_agent.is_empty() {
            return false;
        }

        if self.method != Method::GET && self.method != Method::HEAD {
            return false;
        }

        if self.is_static_resource() {
            return false;
        }

        let wants_prerender = self.bufferbot || self.escaped_fragment || self.is_crawler();
        wants_prerender && config.permits(&self.url)
    }
}

/// Decides whether `req` should be served by the rendering service.
///
/// Requests without a user agent, requests other than `GET`/`HEAD` and
/// requests for static resources are never prerendered. Of the rest, requests
/// from known crawlers, from Buffer, or carrying a non-empty
/// `_escaped_fragment_` are prerendered, subject to the configured allow and
/// deny patterns.
pub fn should_prerender<B>(config: &PrerenderConfig, req: &Request<B>) -> bool {
    let view = RequestView::from_request(req);
    let verdict = view.should_prerender(config);
    tracing::debug!(url = %view.url(), user_agent = %view.user_agent(), verdict, "classified request");
    verdict
}

/// Reconstructs the absolute URL of a request.
///
/// Origin-form request targets take their host from the `Host` header and
/// default to the `http` scheme.
pub fn request_url<B>(req: &Request<B>) -> String {
    let uri = req.uri();
    let scheme = uri.scheme_str().unwrap_or("http");
    let path = uri.path_and_query().map_or("/", |pq| pq.as_str());
    format!("{scheme}://{}{path}", request_host(req))
}

/// Returns the host the request was addressed to.
pub(crate) fn request_host<B>(req: &Request<B>) -> Cow<'_, str> {
    if let Some(authority) = req.uri().authority() {
        return Cow::Borrowed(authority.as_str());
    }
    req.headers()
        .get(header::HOST)
        .map(|v| String::from_utf8_lossy(v.as_bytes()))
        .unwrap_or_default()
}

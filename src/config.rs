use crate::error::ConfigError;
use http::{HeaderValue, Uri};
use regex::Regex;

/// Default rendering service.
pub const DEFAULT_SERVICE_URL: &str = "https://service.prerender.io/";

/// Environment variable holding the token sent as `X-Prerender-Token`.
pub const TOKEN_ENV: &str = "PRERENDER_TOKEN";

/// Environment variable overriding [`DEFAULT_SERVICE_URL`].
pub const SERVICE_URL_ENV: &str = "PRERENDER_SERVICE_URL";

/// Immutable prerender settings, built once at startup and shared by every
/// request.
#[derive(Debug, Clone)]
pub struct PrerenderConfig {
    service_url: String,
    token: Option<HeaderValue>,
    allow: Vec<Regex>,
    deny: Vec<Regex>,
    fallback_on_error: bool,
}

impl PrerenderConfig {
    /// Creates a configuration pointing at [`DEFAULT_SERVICE_URL`] with no
    /// token and no allow or deny patterns.
    pub fn new() -> Self {
        Self {
            service_url: DEFAULT_SERVICE_URL.to_owned(),
            token: None,
            allow: Vec::new(),
            deny: Vec::new(),
            fallback_on_error: false,
        }
    }

    /// Creates a configuration from `PRERENDER_TOKEN` and
    /// `PRERENDER_SERVICE_URL`, falling back to the defaults for unset or
    /// empty variables.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Like [`from_env`](Self::from_env), reading variables through `lookup`.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let var = |key: &str| lookup(key).filter(|value| !value.is_empty());

        let mut config = Self::new();
        if let Some(url) = var(SERVICE_URL_ENV) {
            config = config.service_url(&url)?;
        }
        if let Some(token) = var(TOKEN_ENV) {
            config = config.token(&token)?;
        }
        Ok(config)
    }

    /// Sets the rendering service base URL.
    ///
    /// The URL must be absolute with an `http` or `https` scheme. A trailing
    /// `/` is appended when missing.
    pub fn service_url(mut self, url: &str) -> Result<Self, ConfigError> {
        let invalid = |reason: &str| ConfigError::InvalidServiceUrl {
            url: url.to_owned(),
            reason: reason.to_owned(),
        };

        let uri: Uri = url.parse().map_err(|_| invalid("not a valid URI"))?;
        match uri.scheme_str() {
            Some("http") | Some("https") => {}
            Some(_) => return Err(invalid("scheme must be http or https")),
            None => return Err(invalid("missing scheme")),
        }
        if uri.authority().is_none() {
            return Err(invalid("missing host"));
        }
        if url.contains(['?', '#']) {
            return Err(invalid("must not carry a query or fragment"));
        }

        let mut url = url.to_owned();
        if !url.ends_with('/') {
            url.push('/');
        }
        self.service_url = url;
        Ok(self)
    }

    /// Sets the token forwarded as `X-Prerender-Token`.
    pub fn token(mut self, token: &str) -> Result<Self, ConfigError> {
        let mut value = HeaderValue::from_str(token)?;
        value.set_sensitive(true);
        self.token = Some(value);
        Ok(self)
    }

    /// Adds patterns to the allow-list.
    ///
    /// Once the allow-list is non-empty, only URLs matching at least one of its
    /// patterns are prerendered.
    pub fn allow<I, S>(mut self, patterns: I) -> Result<Self, ConfigError>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        self.allow.extend(compile(patterns)?);
        Ok(self)
    }

    /// Adds patterns to the deny-list. URLs matching any of them are never
    /// prerendered.
    pub fn deny<I, S>(mut self, patterns: I) -> Result<Self, ConfigError>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        self.deny.extend(compile(patterns)?);
        Ok(self)
    }

    /// Hands the request to the next service when the rendering service
    /// cannot be reached, instead of failing it.
    pub fn fallback_on_error(mut self, enabled: bool) -> Self {
        self.fallback_on_error = enabled;
        self
    }

    /// Returns the base URL of the rendering service, always ending in `/`.
    pub fn base_url(&self) -> &str {
        &self.service_url
    }

    /// Returns the `X-Prerender-Token` value, if configured.
    pub fn token_value(&self) -> Option<&HeaderValue> {
        self.token.as_ref()
    }

    /// Returns whether upstream failures fall back to the next service.
    pub fn falls_back_on_error(&self) -> bool {
        self.fallback_on_error
    }

    /// Applies the allow-list and then the deny-list to a lower-cased URL.
    pub(crate) fn permits(&self, url: &str) -> bool {
        if !self.allow.is_empty() && !self.allow.iter().any(|re| re.is_match(url)) {
            return false;
        }
        !self.deny.iter().any(|re| re.is_match(url))
    }
}

impl Default for PrerenderConfig {
    fn default() -> Self {
        Self::new()
    }
}

fn compile<I, S>(patterns: I) -> Result<Vec<Regex>, ConfigError>
where
    I: IntoIterator<Item = S>,
    S: AsRef<str>,
{
    patterns
        .into_iter()
        .map(|pattern| {
            let pattern = pattern.as_ref();
            Regex::new(pattern).map_err(|source| ConfigError::InvalidPattern {
                pattern: pattern.to_owned(),
                source,
            })
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = PrerenderConfig::new();
        assert_eq!(config.base_url(), DEFAULT_SERVICE_URL);
        assert!(config.token_value().is_none());
        assert!(!config.falls_back_on_error());
        assert!(config.permits("https://example.com/"));
    }

    #[test]
    fn test_service_url_gets_trailing_slash() {
        let config = PrerenderConfig::new()
            .service_url("http://localhost:3000")
            .unwrap();
        assert_eq!(config.base_url(), "http://localhost:3000/");

        let config = PrerenderConfig::new()
            .service_url("http://localhost:3000/render/")
            .unwrap();
        assert_eq!(config.base_url(), "http://localhost:3000/render/");
    }

    #[test]
    fn test_service_url_rejects_relative_and_foreign_schemes() {
        for url in ["/render", "ftp://example.com/", "not a url", ""] {
            let err = PrerenderConfig::new().service_url(url).unwrap_err();
            assert!(
                matches!(err, ConfigError::InvalidServiceUrl { .. }),
                "{url:?} should be rejected"
            );
        }
    }

    #[test]
    fn test_service_url_rejects_query_and_fragment() {
        for url in ["http://h/render?x", "http://h/render?", "http://h/render#top"] {
            let err = PrerenderConfig::new().service_url(url).unwrap_err();
            assert!(
                matches!(err, ConfigError::InvalidServiceUrl { .. }),
                "{url:?} should be rejected"
            );
        }
    }

    #[test]
    fn test_token_is_sensitive() {
        let config = PrerenderConfig::new().token("secret").unwrap();
        let token = config.token_value().unwrap();
        assert_eq!(token, "secret");
        assert!(token.is_sensitive());
    }

    #[test]
    fn test_token_rejects_control_characters() {
        let err = PrerenderConfig::new().token("bad\ntoken").unwrap_err();
        assert!(matches!(err, ConfigError::InvalidToken(_)));
    }

    #[test]
    fn test_invalid_pattern() {
        let err = PrerenderConfig::new().deny(["(unclosed"]).unwrap_err();
        match err {
            ConfigError::InvalidPattern { pattern, .. } => assert_eq!(pattern, "(unclosed"),
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn test_allow_list_restricts() {
        let config = PrerenderConfig::new().allow([r"/blog/"]).unwrap();
        assert!(config.permits("https://example.com/blog/post"));
        assert!(!config.permits("https://example.com/shop"));
    }

    #[test]
    fn test_empty_allow_list_is_absent() {
        let config = PrerenderConfig::new()
            .allow(Vec::<String>::new())
            .unwrap();
        assert!(config.permits("https://example.com/anything"));
    }

    #[test]
    fn test_deny_list_overrides_allow_list() {
        let config = PrerenderConfig::new()
            .allow([r"example\.com"])
            .unwrap()
            .deny([r"/admin"])
            .unwrap();
        assert!(config.permits("https://example.com/"));
        assert!(!config.permits("https://example.com/admin/users"));
    }

    #[test]
    fn test_from_lookup() {
        let config = PrerenderConfig::from_lookup(|key| match key {
            TOKEN_ENV => Some("abc".to_owned()),
            SERVICE_URL_ENV => Some("http://render.internal:3000".to_owned()),
            _ => None,
        })
        .unwrap();
        assert_eq!(config.base_url(), "http://render.internal:3000/");
        assert_eq!(config.token_value().unwrap(), "abc");
    }

    #[test]
    fn test_from_lookup_ignores_empty_values() {
        let config = PrerenderConfig::from_lookup(|_| Some(String::new())).unwrap();
        assert_eq!(config.base_url(), DEFAULT_SERVICE_URL);
        assert!(config.token_value().is_none());
    }
}

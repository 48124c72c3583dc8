use std::time::Duration;

use crate::error::ConfigError;

const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

/// Endpoint a [`WebSocketConnector`](super::WebSocketConnector) dials on every attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WebSocketConfig {
    /// The WebSocket URL or bare host
    pub url: String,
    /// Optional path suffix (e.g., "/doc/notes")
    pub path: Option<String>,
    /// Whether to use TLS (wss:// vs ws://)
    pub use_tls: bool,
    /// Attempts that have not opened by then are reported as failed
    pub connect_timeout: Duration,
}

impl WebSocketConfig {
    pub fn new(url: impl Into<String>) -> Self {
        let url = url.into();
        // Auto-detect TLS based on URL
        let use_tls = url.starts_with("wss://")
            || (!url.starts_with("ws://")
                && !url.contains("127.0.0.1")
                && !url.contains("localhost"));

        Self {
            url,
            path: None,
            use_tls,
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
        }
    }

    pub fn with_path(mut self, path: impl Into<String>) -> Self {
        self.path = Some(path.into());
        self
    }

    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    /// Build the full WebSocket URL
    pub fn build_url(&self) -> String {
        let mut url = self.url.clone();

        if !url.starts_with("ws://") && !url.starts_with("wss://") {
            url = if self.use_tls {
                format!("wss://{}", url)
            } else {
                format!("ws://{}", url)
            };
        }

        // Normalize localhost to avoid IPv6 issues
        if url.contains("localhost") {
            url = url.replace("localhost", "127.0.0.1");
        }

        if let Some(ref path) = self.path {
            if !url.ends_with('/') && !path.starts_with('/') {
                url.push('/');
            }
            url.push_str(path);
        }

        url
    }
}

/// Builder for WebSocket configuration
#[derive(Debug, Default)]
pub struct WebSocketConfigBuilder {
    url: Option<String>,
    path: Option<String>,
    use_tls: Option<bool>,
    connect_timeout: Option<Duration>,
}

impl WebSocketConfigBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn url(mut self, url: impl Into<String>) -> Self {
        self.url = Some(url.into());
        self
    }

    pub fn path(mut self, path: impl Into<String>) -> Self {
        self.path = Some(path.into());
        self
    }

    pub fn use_tls(mut self, use_tls: bool) -> Self {
        self.use_tls = Some(use_tls);
        self
    }

    pub fn connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = Some(timeout);
        self
    }

    /// Fails when the URL is missing or the resulting URL does not parse.
    pub fn build(self) -> Result<WebSocketConfig, ConfigError> {
        let url = self.url.ok_or(ConfigError::Missing("url"))?;
        let mut config = WebSocketConfig::new(url);

        if let Some(path) = self.path {
            config = config.with_path(path);
        }
        if let Some(use_tls) = self.use_tls {
            config.use_tls = use_tls;
        }
        if let Some(timeout) = self.connect_timeout {
            config.connect_timeout = timeout;
        }

        let full = config.build_url();
        url::Url::parse(&full).map_err(|source| ConfigError::InvalidUrl { url: full, source })?;
        Ok(config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bare_remote_host_gets_tls() {
        let config = WebSocketConfig::new("sync.example.com").with_path("doc/notes");
        assert!(config.use_tls);
        assert_eq!(config.build_url(), "wss://sync.example.com/doc/notes");
    }

    #[test]
    fn localhost_is_plain_and_normalized() {
        let config = WebSocketConfig::new("localhost:1234").with_path("/room");
        assert!(!config.use_tls);
        assert_eq!(config.build_url(), "ws://127.0.0.1:1234/room");
    }

    #[test]
    fn builder_requires_url() {
        assert!(matches!(
            WebSocketConfigBuilder::new().build(),
            Err(ConfigError::Missing("url"))
        ));
    }

    #[test]
    fn builder_rejects_unparseable_url() {
        let result = WebSocketConfigBuilder::new().url("ws://exa mple").build();
        assert!(matches!(result, Err(ConfigError::InvalidUrl { .. })));
    }

    #[test]
    fn builder_overrides_tls_and_timeout() {
        let config = WebSocketConfigBuilder::new()
            .url("10.0.0.2:9000")
            .use_tls(false)
            .connect_timeout(Duration::from_millis(250))
            .build()
            .expect("valid config");
        assert_eq!(config.build_url(), "ws://10.0.0.2:9000");
        assert_eq!(config.connect_timeout, Duration::from_millis(250));
    }
}

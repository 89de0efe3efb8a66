//! Server configuration
//!
//! All tunables for the connection engine live here: socket options, timer
//! durations, the admission ceiling, parser limits, and WebSocket limits.

use core::time::Duration;

// ----------------------------------------------------------------------------
// Parser Limits
// ----------------------------------------------------------------------------

/// Limits enforced while parsing a request
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct ParseLimits {
    /// Maximum length of the request line in bytes
    pub max_request_line: usize,
    /// Maximum number of headers per request
    pub max_header_count: usize,
    /// Maximum size of the header block in bytes
    pub max_head_size: usize,
    /// Maximum size of a request body in bytes
    pub max_body_size: usize,
}

impl Default for ParseLimits {
    fn default() -> Self {
        Self {
            max_request_line: 8192,        // 8KB request line
            max_header_count: 100,         // 100 headers
            max_head_size: 65536,          // 64KB header block
            max_body_size: 1024 * 1024,    // 1MB body
        }
    }
}

impl ParseLimits {
    /// Create permissive limits for trusted environments
    pub fn permissive() -> Self {
        Self {
            max_request_line: 16384,
            max_header_count: 256,
            max_head_size: 262144,
            max_body_size: 64 * 1024 * 1024,
        }
    }

    /// Create strict limits for exposed deployments
    pub fn strict() -> Self {
        Self {
            max_request_line: 2048,
            max_header_count: 50,
            max_head_size: 16384,
            max_body_size: 256 * 1024,
        }
    }
}

// ----------------------------------------------------------------------------
// WebSocket Configuration
// ----------------------------------------------------------------------------

/// Limits and tunables for WebSocket sessions
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct WsConfig {
    /// Maximum size of a single frame payload in bytes
    pub max_frame_size: usize,
    /// Maximum size of an assembled message in bytes
    pub max_message_size: usize,
    /// Capacity of the inbound and outbound message queues
    pub queue_capacity: usize,
    /// How long to wait for the closing handshake and handler teardown
    pub close_timeout: Duration,
}

impl Default for WsConfig {
    fn default() -> Self {
        Self {
            max_frame_size: 1 << 20,   // 1MB frames
            max_message_size: 1 << 20, // 1MB messages
            queue_capacity: 32,
            close_timeout: Duration::from_secs(10),
        }
    }
}

// ----------------------------------------------------------------------------
// Server Configuration
// ----------------------------------------------------------------------------

/// Master configuration for the connection engine
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct ServerConfig {
    /// Address to bind
    pub host: String,
    /// Port to bind (0 picks an ephemeral port)
    pub port: u16,
    /// Admission ceiling: maximum open connections / in-flight handler
    /// tasks before new requests get 503 (None disables admission control)
    pub limit_concurrency: Option<usize>,
    /// Maximum time to receive a complete request head and body
    pub request_timeout: Duration,
    /// Maximum time for the handler to produce and the engine to write
    /// a response
    pub response_timeout: Duration,
    /// Maximum idle time between requests on a persistent connection
    pub keep_alive_timeout: Duration,
    /// How long shutdown waits for open connections before forcing them
    /// closed
    pub graceful_shutdown_timeout: Duration,
    /// Listen backlog
    pub backlog: u32,
    /// Set SO_REUSEPORT on the listening socket (Unix only)
    pub reuse_port: bool,
    /// Report "https"/"wss" as the request scheme (for deployments behind
    /// a TLS-terminating front)
    pub secure: bool,
    /// Emit one access-log line per completed response
    pub access_log: bool,
    /// Headers added to every response before handler headers
    pub default_headers: Vec<(String, String)>,
    /// Request parser limits
    pub parse: ParseLimits,
    /// WebSocket limits
    pub ws: WsConfig,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".into(),
            port: 8000,
            limit_concurrency: None,
            request_timeout: Duration::from_secs(60),
            response_timeout: Duration::from_secs(60),
            keep_alive_timeout: Duration::from_secs(5),
            graceful_shutdown_timeout: Duration::from_secs(10),
            backlog: 100,
            reuse_port: false,
            secure: false,
            access_log: true,
            default_headers: Vec::new(),
            parse: ParseLimits::default(),
            ws: WsConfig::default(),
        }
    }
}

impl ServerConfig {
    /// Create new configuration with default values
    pub fn new() -> Self {
        Self::default()
    }

    /// Create configuration with short timers, suitable for tests
    pub fn testing() -> Self {
        Self {
            port: 0,
            request_timeout: Duration::from_millis(500),
            response_timeout: Duration::from_secs(2),
            keep_alive_timeout: Duration::from_millis(200),
            graceful_shutdown_timeout: Duration::from_millis(500),
            access_log: false,
            ..Self::default()
        }
    }

    /// Set the bind address
    pub fn with_host<T: Into<String>>(mut self, host: T) -> Self {
        self.host = host.into();
        self
    }

    /// Set the bind port
    pub fn with_port(mut self, port: u16) -> Self {
        self.port = port;
        self
    }

    /// Set the admission ceiling
    pub fn with_limit_concurrency(mut self, limit: usize) -> Self {
        self.limit_concurrency = Some(limit);
        self
    }

    /// Set the request timeout
    pub fn with_request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = timeout;
        self
    }

    /// Set the response timeout
    pub fn with_response_timeout(mut self, timeout: Duration) -> Self {
        self.response_timeout = timeout;
        self
    }

    /// Set the keep-alive timeout
    pub fn with_keep_alive_timeout(mut self, timeout: Duration) -> Self {
        self.keep_alive_timeout = timeout;
        self
    }

    /// Set the graceful shutdown grace period
    pub fn with_graceful_shutdown_timeout(mut self, timeout: Duration) -> Self {
        self.graceful_shutdown_timeout = timeout;
        self
    }

    /// Add a default response header
    pub fn with_default_header<N, V>(mut self, name: N, value: V) -> Self
    where
        N: Into<String>,
        V: Into<String>,
    {
        self.default_headers.push((name.into(), value.into()));
        self
    }

    /// Enable or disable the access log
    pub fn with_access_log(mut self, enabled: bool) -> Self {
        self.access_log = enabled;
        self
    }

    /// Enable SO_REUSEPORT
    pub fn with_reuse_port(mut self, enabled: bool) -> Self {
        self.reuse_port = enabled;
        self
    }

    /// Set the listen backlog
    pub fn with_backlog(mut self, backlog: u32) -> Self {
        self.backlog = backlog;
        self
    }

    /// Mark the deployment as TLS-terminated upstream
    pub fn with_secure(mut self, secure: bool) -> Self {
        self.secure = secure;
        self
    }

    /// Set request parser limits
    pub fn with_parse_limits(mut self, limits: ParseLimits) -> Self {
        self.parse = limits;
        self
    }

    /// Set WebSocket limits
    pub fn with_ws(mut self, ws: WsConfig) -> Self {
        self.ws = ws;
        self
    }

    /// Scheme reported on requests
    pub fn http_scheme(&self) -> &'static str {
        if self.secure {
            "https"
        } else {
            "http"
        }
    }

    /// Scheme reported on WebSocket sessions
    pub fn ws_scheme(&self) -> &'static str {
        if self.secure {
            "wss"
        } else {
            "ws"
        }
    }

    /// Validate the configuration for consistency and feasibility
    pub fn validate(&self) -> core::result::Result<(), String> {
        if self.host.is_empty() {
            return Err("Host cannot be empty".into());
        }
        if self.backlog == 0 {
            return Err("Backlog cannot be zero".into());
        }
        if let Some(0) = self.limit_concurrency {
            return Err("Concurrency limit cannot be zero".into());
        }
        if self.request_timeout.is_zero()
            || self.response_timeout.is_zero()
            || self.keep_alive_timeout.is_zero()
        {
            return Err("Timer durations cannot be zero".into());
        }
        if self.parse.max_request_line == 0
            || self.parse.max_header_count == 0
            || self.parse.max_head_size == 0
        {
            return Err("Parser limits cannot be zero".into());
        }
        if self.parse.max_request_line > self.parse.max_head_size {
            return Err("Request line limit cannot exceed header block limit".into());
        }
        if self.ws.max_frame_size == 0 || self.ws.max_message_size == 0 {
            return Err("WebSocket size limits cannot be zero".into());
        }
        if self.ws.max_frame_size > self.ws.max_message_size {
            return Err("WebSocket frame limit cannot exceed message limit".into());
        }
        if self.ws.queue_capacity == 0 {
            return Err("WebSocket queue capacity cannot be zero".into());
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_validation() {
        let config = ServerConfig::default();
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_testing_config_validation() {
        let config = ServerConfig::testing();
        assert!(config.validate().is_ok());
        assert_eq!(config.port, 0);
    }

    #[test]
    fn test_builder_methods() {
        let config = ServerConfig::new()
            .with_host("0.0.0.0")
            .with_port(9000)
            .with_limit_concurrency(64)
            .with_default_header("Server", "hearth")
            .with_secure(true);

        assert_eq!(config.host, "0.0.0.0");
        assert_eq!(config.port, 9000);
        assert_eq!(config.limit_concurrency, Some(64));
        assert_eq!(config.default_headers.len(), 1);
        assert_eq!(config.http_scheme(), "https");
        assert_eq!(config.ws_scheme(), "wss");
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_invalid_config_validation() {
        let mut config = ServerConfig::default();
        config.limit_concurrency = Some(0);
        assert!(config.validate().is_err());

        let mut config = ServerConfig::default();
        config.backlog = 0;
        assert!(config.validate().is_err());

        let mut config = ServerConfig::default();
        config.ws.max_frame_size = config.ws.max_message_size * 2;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_parse_limit_presets() {
        assert!(ParseLimits::permissive().max_body_size > ParseLimits::default().max_body_size);
        assert!(ParseLimits::strict().max_body_size < ParseLimits::default().max_body_size);
    }
}

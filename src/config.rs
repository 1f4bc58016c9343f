use tracing::info;

// ---------------------------------------------------------------------------
// Server configuration -- loaded from environment variables
// ---------------------------------------------------------------------------

/// Runtime configuration for the signaling server.
///
/// Every field can be set via an environment variable prefixed with
/// `SIGNALHUB_`, except `stun`, which deliberately reads the bare `STUN`
/// variable: its value is what `GET /stun` hands back to clients verbatim.
#[derive(Debug, Clone)]
pub struct Config {
    /// Address the HTTP/WebSocket listener binds to.
    pub bind_addr: String,

    /// Comma-separated CORS origins, or `*` for permissive mode.
    pub allowed_origins: String,

    /// Default log filter when `RUST_LOG` is not set.
    pub log_level: String,

    /// STUN host list served verbatim at `GET /stun`.
    pub stun: String,
}

impl Config {
    /// Load configuration from the environment (`.env` is applied
    /// best-effort first).
    pub fn from_env() -> Self {
        let _ = dotenvy::dotenv();

        let config = Config {
            bind_addr: env_or("SIGNALHUB_BIND_ADDR", "0.0.0.0:8080"),
            allowed_origins: env_or("SIGNALHUB_ALLOWED_ORIGINS", "*"),
            log_level: env_or("SIGNALHUB_LOG_LEVEL", "info"),
            stun: env_or("STUN", ""),
        };
        config.log_summary();
        config
    }

    fn log_summary(&self) {
        info!("──── SignalHub configuration ────");
        info!("  bind_addr       : {}", self.bind_addr);
        info!(
            "  cors_origins    : {}",
            if self.allowed_origins == "*" {
                "* (permissive)"
            } else {
                &self.allowed_origins
            }
        );
        info!("  log_level       : {}", self.log_level);
        info!(
            "  stun            : {}",
            if self.stun.is_empty() { "(not set)" } else { &self.stun }
        );
        info!("─────────────────────────────────");
    }
}

fn env_or(key: &str, default: &str) -> String {
    std::env::var(key).unwrap_or_else(|_| default.to_string())
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

//! Configuration for the HTTP server

use std::env;

/// Server configuration
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Address to listen on
    pub host: String,

    /// Port to listen on
    pub port: u16,

    /// PostgreSQL connection URL
    pub pg_url: String,

    /// Upper bound on open PostgreSQL connections
    pub max_connections: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 9000,
            pg_url: "postgres://postgres@localhost:5432/sofadb".to_string(),
            max_connections: 16,
        }
    }
}

impl ServerConfig {
    /// Read the configuration from `SOFADB_*` environment variables, falling
    /// back to the defaults. Command-line flags override both.
    pub fn from_env() -> Self {
        let mut config = Self::default();
        if let Ok(host) = env::var("SOFADB_HOST") {
            config.host = host;
        }
        if let Ok(port) = env::var("SOFADB_PORT") {
            if let Ok(port) = port.parse() {
                config.port = port;
            }
        }
        if let Ok(pg_url) = env::var("SOFADB_PG_URL") {
            config.pg_url = pg_url;
        }
        if let Ok(max) = env::var("SOFADB_MAX_CONNECTIONS") {
            if let Ok(max) = max.parse() {
                config.max_connections = max;
            }
        }
        config
    }

    /// Create a configuration for testing: a random port and a small pool.
    pub fn for_testing(pg_url: &str) -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 0,
            pg_url: pg_url.to_string(),
            max_connections: 4,
        }
    }
}

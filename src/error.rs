//! Top-level error types: configuration loading and process bootstrap.
//!
//! Per-component failure modes that are recovered at a closer boundary
//! (DIMSE protocol errors, store failures, spool I/O) have their own
//! `thiserror` enums next to the component that raises them:
//! [`crate::scp_error::ScpError`], [`crate::store_client::StoreError`],
//! [`crate::spool::SpoolError`]. Enrichment failures (§4.4) are recovered
//! inline as a `bool` return from [`crate::enrichment::query`] rather than
//! a dedicated error type, since every failure path converges on the same
//! outcome (force safe Patient defaults, tell the caller to spool).

#[derive(thiserror::Error, Debug)]
pub enum ConfigError {
    #[error("failed to parse configuration")]
    Parse(#[from] toml::de::Error),

    #[error("failed to extract typed settings")]
    Extract(#[from] figment::Error),

    #[error("failed to persist configuration to {path}")]
    Persist {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("no config group named \"{0}\"")]
    MissingGroup(String),
}

#[derive(thiserror::Error, Debug)]
pub enum StartupError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error("failed to bind listener on {addr}")]
    Bind {
        addr: std::net::SocketAddr,
        #[source]
        source: std::io::Error,
    },
}

//! Accept loop and retry-worker scheduling (C8).
//!
//! The Enet4 `storescp` example this service started from drove its
//! accept loop straight from `std::net::TcpListener::incoming`, handling
//! one association at a time on the calling thread. This service needs
//! to hold many associations open simultaneously (print clients tend to
//! keep a Film Session open across many Film Box/Image Box exchanges)
//! while keeping the retry sweep of the spool directory from running
//! concurrently with itself, so the accept loop moves onto `tokio`:
//! `TcpListener::accept` feeds `spawn_blocking` workers running the
//! synchronous [`crate::scp`] state machine, bounded by a `Semaphore`,
//! alongside a single `time::interval` ticker driving [`crate::retry`].

use std::sync::Arc;
use std::time::Duration;

use tokio::net::TcpListener;
use tokio::sync::Semaphore;

use crate::config::ConfigView;
use crate::error::StartupError;
use crate::retry;
use crate::scp::{self, HandleOptions};
use crate::settings::Settings;
use crate::uid::SiteUidSource;

/// UID root this service mints instance UIDs under, sharing the private
/// enterprise root declared in [`crate::private_sop_uids`].
const UID_ROOT: &str = "1.2.826.0.1.3680043.8.498.1.9";

/// Runs the print SCP until the process is terminated.
///
/// Accepts connections on `settings.port`, dispatching each to its own
/// blocking task up to `settings.max_associations` at a time, while a
/// second task wakes every `settings.spool_interval` to retry enrichment
/// and storage for anything left behind in the spool directory.
pub async fn run(settings: Settings, config: ConfigView) -> Result<(), StartupError> {
    let addr = std::net::SocketAddr::new(std::net::IpAddr::V4(std::net::Ipv4Addr::UNSPECIFIED), settings.port);
    let listener = TcpListener::bind(addr)
        .await
        .map_err(|source| StartupError::Bind { addr, source })?;
    tracing::info!(%addr, "listening");

    let uid_source = Arc::new(SiteUidSource::new(UID_ROOT));
    let semaphore = Arc::new(Semaphore::new(settings.max_associations.get()));
    let config = Arc::new(config);
    let settings = Arc::new(settings);

    let retry_settings = settings.clone();
    let retry_config = config.clone();
    tokio::spawn(async move {
        retry_worker(retry_settings, retry_config).await;
    });

    loop {
        let (socket, peer_addr) = match listener.accept().await {
            Ok(accepted) => accepted,
            Err(error) => {
                tracing::warn!(%error, "failed to accept connection");
                continue;
            }
        };

        let permit = semaphore.clone().acquire_owned().await.expect("semaphore never closed");
        let settings = settings.clone();
        let config = config.clone();
        let uid_source = uid_source.clone();

        tokio::task::spawn_blocking(move || {
            let _permit = permit;
            let socket = match socket.into_std() {
                Ok(socket) => socket,
                Err(error) => {
                    tracing::warn!(%peer_addr, %error, "failed to convert accepted socket to blocking");
                    return;
                }
            };
            if let Err(error) = socket.set_nodelay(true) {
                tracing::debug!(%peer_addr, %error, "failed to set TCP_NODELAY");
            }

            let options = HandleOptions {
                max_pdu_length: 16384,
                strict: false,
                block_mode: true,
                timeout: settings.timeout,
                spool_path: settings.spool_path.as_path(),
            };

            if let Err(error) = scp::handle_association(socket, &config, uid_source.as_ref(), &options) {
                tracing::warn!(%peer_addr, %error, "association ended with an error");
            }
        });
    }
}

/// Wakes every `spool_interval` and runs one retry sweep. Never overlaps
/// with itself: the next tick only fires after the previous sweep (and
/// the sleep) has returned, same as a single-threaded `QTimer`.
async fn retry_worker(settings: Arc<Settings>, config: Arc<ConfigView>) {
    let mut ticker = tokio::time::interval(settings.spool_interval.max(Duration::from_secs(1)));
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    loop {
        ticker.tick().await;
        let settings = settings.clone();
        let config = config.clone();
        let result = tokio::task::spawn_blocking(move || retry::run_once(&settings, &config)).await;
        match result {
            Ok(Ok(summary)) => {
                if summary.is_active() {
                    tracing::info!(
                        re_enriched = summary.re_enriched,
                        re_stored = summary.re_stored,
                        still_pending = summary.still_pending,
                        "retry sweep complete"
                    );
                }
            }
            Ok(Err(error)) => tracing::warn!(%error, "retry sweep failed"),
            Err(error) => tracing::error!(%error, "retry sweep task panicked"),
        }
    }
}

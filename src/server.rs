use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;

use anyhow::{Context, Result};
use tokio::net::TcpListener;
use tokio::sync::{Mutex, Notify};

use crate::config::Config;
use crate::dnslist::SystemResolver;
use crate::logger::Logger;
use crate::ratelimiter::RateLimiter;
use crate::session::Session;

/// Compteurs partagés par toutes les sessions: jauge des sessions vivantes et
/// index monotone.
pub struct ServerCounters {
    live: AtomicUsize,
    next_index: AtomicU64,
}

impl ServerCounters {
    pub fn new() -> Self {
        Self {
            live: AtomicUsize::new(0),
            next_index: AtomicU64::new(0),
        }
    }

    /// Réserve l'index de la session et incrémente la jauge. Appelé à la
    /// construction de chaque session.
    pub fn session_started(&self) -> u64 {
        self.live.fetch_add(1, Ordering::SeqCst);
        self.next_index.fetch_add(1, Ordering::SeqCst) + 1
    }

    pub fn session_ended(&self) {
        self.live.fetch_sub(1, Ordering::SeqCst);
    }

    pub fn live(&self) -> usize {
        self.live.load(Ordering::SeqCst)
    }
}

impl Default for ServerCounters {
    fn default() -> Self {
        Self::new()
    }
}

/// The acceptor: one listening socket, one spawned task per connection. It
/// never waits for a session to finish.
pub struct Server {
    cfg: Arc<Config>,
    counters: Arc<ServerCounters>,
    logger: Arc<Logger>,
    resolver: Arc<SystemResolver>,
    limiter: Arc<Mutex<RateLimiter>>,
    shutdown: Notify,
}

impl Server {
    pub fn new(cfg: Config) -> Result<Arc<Self>> {
        let logger =
            Logger::new(cfg.log_path.clone(), cfg.log_verbose).context("failed to open log file")?;
        if cfg.store_data {
            std::fs::create_dir_all(&cfg.store_path)
                .with_context(|| format!("failed to create store directory {:?}", cfg.store_path))?;
        }
        Ok(Arc::new(Self {
            limiter: Arc::new(Mutex::new(RateLimiter::new(cfg.max_conn_per_min))),
            cfg: Arc::new(cfg),
            counters: Arc::new(ServerCounters::new()),
            logger: Arc::new(logger),
            resolver: Arc::new(SystemResolver::new()),
            shutdown: Notify::new(),
        }))
    }

    pub fn counters(&self) -> &ServerCounters {
        &self.counters
    }

    /// Bloque jusqu'à l'arrêt. 0 arrêt propre, 1 échec du bind, 2 échec de
    /// l'accept.
    pub async fn run(self: &Arc<Self>) -> i32 {
        let listener = match TcpListener::bind((self.cfg.listen_ip, self.cfg.listen_port)).await {
            Ok(listener) => listener,
            Err(e) => {
                self.logger
                    .event(&format!(
                        "bind {}:{} failed: {e}",
                        self.cfg.listen_ip, self.cfg.listen_port
                    ))
                    .await;
                return 1;
            }
        };
        self.run_on(listener).await
    }

    /// Même boucle, sur un listener déjà lié.
    pub async fn run_on(self: &Arc<Self>, listener: TcpListener) -> i32 {
        if let Ok(addr) = listener.local_addr() {
            self.logger.event(&format!("listening on {addr}")).await;
        }
        loop {
            tokio::select! {
                _ = self.shutdown.notified() => {
                    self.logger.event("shutdown requested, closing listener").await;
                    return 0;
                }
                accepted = listener.accept() => match accepted {
                    Ok((stream, peer)) => {
                        let session = Session::new(
                            Arc::clone(&self.cfg),
                            Arc::clone(&self.counters),
                            Arc::clone(&self.logger),
                            Arc::clone(&self.resolver),
                            Arc::clone(&self.limiter),
                            peer.ip(),
                        );
                        tokio::spawn(session.handle(stream));
                    }
                    Err(e) => {
                        self.logger.event(&format!("accept failed: {e}")).await;
                        return 2;
                    }
                },
            }
        }
    }

    /// Demande d'arrêt; asynchrone et idempotente. Les sessions en cours se
    /// terminent d'elles-mêmes.
    pub fn stop(&self) {
        self.shutdown.notify_one();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn counters_track_live_sessions_and_indexes() {
        let counters = ServerCounters::new();
        assert_eq!(counters.live(), 0);

        let first = counters.session_started();
        let second = counters.session_started();
        assert_eq!(first, 1);
        assert_eq!(second, 2);
        assert_eq!(counters.live(), 2);

        counters.session_ended();
        assert_eq!(counters.live(), 1);
        counters.session_ended();
        assert_eq!(counters.live(), 0);

        // l'index ne redescend jamais
        assert_eq!(counters.session_started(), 3);
    }
}

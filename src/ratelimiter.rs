use std::collections::{HashMap, VecDeque};
use std::net::IpAddr;
use std::time::{Duration, Instant};

const WINDOW: Duration = Duration::from_secs(60);

/// Fenêtre glissante d'une minute, par adresse cliente.
pub struct RateLimiter {
    connections: HashMap<IpAddr, VecDeque<Instant>>,
    max_per_minute: usize,
}

impl RateLimiter {
    pub fn new(max_per_minute: usize) -> Self {
        Self {
            connections: HashMap::new(),
            max_per_minute,
        }
    }

    /// Enregistre une connexion de `ip` et dit si elle passe sous le plafond.
    pub fn check_and_add(&mut self, ip: IpAddr) -> bool {
        let now = Instant::now();
        let entries = self.connections.entry(ip).or_default();

        // Purger les entrées plus vieilles qu'une minute
        while let Some(&time) = entries.front() {
            if now.duration_since(time) > WINDOW {
                entries.pop_front();
            } else {
                break;
            }
        }

        if entries.len() >= self.max_per_minute {
            false
        } else {
            entries.push_back(now);
            true
        }
    }
}

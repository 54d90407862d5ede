use std::collections::{HashMap, VecDeque};
use std::net::IpAddr;
use std::time::{Duration, Instant};

const WINDOW: Duration = Duration::from_secs(60);

/// Sliding one-minute window of connection attempts per client IP.
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

    pub fn check_and_add(&mut self, ip: IpAddr) -> bool {
        self.check_and_add_at(ip, Instant::now())
    }

    pub(crate) fn check_and_add_at(&mut self, ip: IpAddr, now: Instant) -> bool {
        // Keyed on the IP only: the client port changes on every connection.
        let entries = self.connections.entry(ip).or_default();
        while let Some(&time) = entries.front() {
            if now.duration_since(time) >= WINDOW {
                entries.pop_front();
            } else {
                break;
            }
        }

        let allowed = entries.len() < self.max_per_minute;
        if allowed {
            entries.push_back(now);
        }

        if self.connections.len() > 1024 {
            self.connections
                .retain(|_, times| times.back().is_some_and(|t| now.duration_since(*t) < WINDOW));
        }

        allowed
    }
}

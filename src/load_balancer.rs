use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use thiserror::Error;
use tokio::time::{Duration, interval};

#[derive(Debug, Error, PartialEq, Eq)]
pub enum LoadBalancerError {
    #[error("at least one backend is required")]
    NoBackends,
}

// Single upstream server
pub struct Backend {
    pub url: String,
    healthy: AtomicBool,
}

impl Backend {
    pub fn new(url: String) -> Self {
        Self {
            url,
            healthy: AtomicBool::new(true),
        }
    }

    pub fn is_healthy(&self) -> bool {
        self.healthy.load(Ordering::Relaxed)
    }

    pub fn set_healthy(&self, healthy: bool) {
        self.healthy.store(healthy, Ordering::Relaxed);
    }
}

// Round-robin over the upstreams behind the gate
pub struct LoadBalancer {
    backends: Vec<Arc<Backend>>,
    current: AtomicUsize,
}

impl LoadBalancer {
    // Create from comma-separated urls "localhost:3000, localhost:3001"
    pub fn new(backends_str: &str) -> Result<Self, LoadBalancerError> {
        let backends: Vec<Arc<Backend>> = backends_str
            .split(',')
            .map(|s| s.trim())
            .filter(|s| !s.is_empty())
            .map(|url| {
                // add http:// if not present
                let full_url = if url.starts_with("http") {
                    url.trim_end_matches('/').to_string()
                } else {
                    format!("http://{}", url.trim_end_matches('/'))
                };
                Arc::new(Backend::new(full_url))
            })
            .collect();
        if backends.is_empty() {
            return Err(LoadBalancerError::NoBackends);
        }

        for (i, b) in backends.iter().enumerate() {
            tracing::info!(index = i + 1, url = %b.url, "Registered backend");
        }

        Ok(Self {
            backends,
            current: AtomicUsize::new(0),
        })
    }

    // Get next healthy backend (round-robin)
    pub fn get_backend(&self) -> Option<Arc<Backend>> {
        let len = self.backends.len();
        let start = self.current.fetch_add(1, Ordering::Relaxed) % len;

        (0..len)
            .map(|i| &self.backends[(start + i) % len])
            .find(|backend| backend.is_healthy())
            .map(Arc::clone)
    }

    pub fn all_backends(&self) -> &[Arc<Backend>] {
        &self.backends
    }
}

// Polls every backend's health path on a fixed interval
pub async fn health_checker(
    load_balancer: Arc<LoadBalancer>,
    client: reqwest::Client,
    check_interval: Duration,
    health_path: Arc<str>,
) {
    let mut interval = interval(check_interval);

    tracing::info!(interval = ?check_interval, "Backend health checker started");

    loop {
        interval.tick().await;

        for backend in load_balancer.all_backends() {
            let url = format!("{}{}", backend.url, health_path);

            let was_healthy = backend.is_healthy();

            let is_healthy = match client.get(&url).timeout(Duration::from_secs(5)).send().await {
                Ok(res) => res.status().is_success(),
                Err(_) => false,
            };
            backend.set_healthy(is_healthy);

            // Log status changes
            if was_healthy != is_healthy {
                if is_healthy {
                    tracing::info!(url = %backend.url, "Backend is now healthy");
                } else {
                    tracing::warn!(url = %backend.url, "Backend is now unhealthy");
                }
            }
        }
    }
}

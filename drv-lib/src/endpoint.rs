use std::sync::Mutex;
use std::time::{Duration, Instant};

use url::Url;

use crate::{DrvError, DrvResult};

/// One remote upload target with its own health state. Mutated only by the
/// pool's selection/bookkeeping; failures are counted per endpoint and a
/// cooldown window is armed once they reach the configured threshold.
#[derive(Debug, Clone)]
pub struct Endpoint {
    url: String,
    failures: u32,
    cooldown_until: Option<Instant>,
}

impl Endpoint {
    fn new(url: String) -> Self {
        Self {
            url,
            failures: 0,
            cooldown_until: None,
        }
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    fn is_available(&self, now: Instant) -> bool {
        match self.cooldown_until {
            Some(until) => now >= until,
            None => true,
        }
    }
}

struct PoolState {
    slots: Vec<Endpoint>,
    cursor: usize,
}

/// Stateless round-robin pick: scan from `cursor`, return the first endpoint
/// whose cooldown has expired.
fn pick_available(slots: &[Endpoint], cursor: usize, now: Instant) -> Option<usize> {
    for i in 0..slots.len() {
        let idx = (cursor + i) % slots.len();
        if slots[idx].is_available(now) {
            return Some(idx);
        }
    }
    None
}

pub struct EndpointPool {
    state: Mutex<PoolState>,
    failure_threshold: u32,
    cooldown: Duration,
}

impl EndpointPool {
    pub fn new(
        urls: Vec<String>,
        failure_threshold: u32,
        cooldown: Duration,
    ) -> DrvResult<Self> {
        if urls.is_empty() {
            return Err(DrvError::Invalid("endpoint list is empty".to_string()));
        }
        if failure_threshold == 0 {
            return Err(DrvError::Invalid(
                "failure threshold must be at least 1".to_string(),
            ));
        }
        for url in urls.iter() {
            Url::parse(url)
                .map_err(|e| DrvError::Invalid(format!("bad endpoint url {}: {}", url, e)))?;
        }
        Ok(Self {
            state: Mutex::new(PoolState {
                slots: urls.into_iter().map(Endpoint::new).collect(),
                cursor: 0,
            }),
            failure_threshold,
            cooldown,
        })
    }

    /// Next endpoint in the healthy rotation. Fails with a transient error
    /// when every endpoint is cooling down instead of blocking.
    pub fn select(&self) -> DrvResult<String> {
        let mut state = self.state.lock().unwrap();
        let now = Instant::now();
        let idx = pick_available(&state.slots, state.cursor, now).ok_or_else(|| {
            DrvError::Transient("all endpoints are cooling down".to_string())
        })?;
        state.cursor = (idx + 1) % state.slots.len();
        Ok(state.slots[idx].url.clone())
    }

    /// A success clears the failure counter and any cooldown, restoring the
    /// endpoint to the healthy rotation.
    pub fn record_success(&self, url: &str) {
        let mut state = self.state.lock().unwrap();
        if let Some(slot) = state.slots.iter_mut().find(|s| s.url == url) {
            slot.failures = 0;
            slot.cooldown_until = None;
        }
    }

    pub fn record_failure(&self, url: &str) {
        let threshold = self.failure_threshold;
        let cooldown = self.cooldown;
        let mut state = self.state.lock().unwrap();
        if let Some(slot) = state.slots.iter_mut().find(|s| s.url == url) {
            slot.failures += 1;
            if slot.failures >= threshold {
                warn!(
                    "endpoint {} cooling down after {} consecutive failures",
                    slot.url, slot.failures
                );
                slot.cooldown_until = Some(Instant::now() + cooldown);
            }
        }
    }

    pub fn healthy_count(&self) -> usize {
        let state = self.state.lock().unwrap();
        let now = Instant::now();
        state.slots.iter().filter(|s| s.is_available(now)).count()
    }

    pub fn len(&self) -> usize {
        self.state.lock().unwrap().slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

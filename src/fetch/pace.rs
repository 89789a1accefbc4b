// src/fetch/pace.rs
use std::time::Duration;
use tokio::time::sleep;
use tracing::trace;

use super::{PageSource, RawPage};
use crate::countries::CountryTarget;

/// Wraps a `PageSource` so every call after the first waits `delay` first.
///
/// One `Paced` per worker: the delay is honoured per worker, not globally.
pub struct Paced<'a, S: PageSource> {
    source: &'a S,
    delay: Duration,
    calls: usize,
}

impl<'a, S: PageSource> Paced<'a, S> {
    pub fn new(source: &'a S, delay: Duration) -> Self {
        Self {
            source,
            delay,
            calls: 0,
        }
    }

    pub async fn fetch(&mut self, target: &CountryTarget) -> RawPage {
        if self.calls > 0 && !self.delay.is_zero() {
            trace!(delay_ms = self.delay.as_millis() as u64, "pacing before request");
            sleep(self.delay).await;
        }
        self.calls += 1;
        self.source.fetch(target).await
    }

    pub fn calls(&self) -> usize {
        self.calls
    }
}

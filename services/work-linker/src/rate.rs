//!
//! src/rate.rs  Andrew Belles  Oct 16th, 2026
//!
//! Process wide request budget shared by every scheduler. Each dispatch
//! charges its weight, a ticker drains one unit per interval, and once the
//! load crosses the burst threshold every extra unit costs one penalty of
//! delay before the next dispatch anywhere in the process.
//!

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::config::RateConfig;

#[derive(Debug)]
pub struct RateWindow {
    load: AtomicU32,
    cfg: RateConfig,
    shutdown: CancellationToken
}

impl RateWindow {
    pub fn new(cfg: RateConfig) -> Arc<Self> {
        Arc::new(Self {
            load: AtomicU32::new(0),
            cfg,
            shutdown: CancellationToken::new()
        })
    }

    pub fn load(&self) -> u32 {
        self.load.load(Ordering::SeqCst)
    }

    /// Adds `weight` to the load and returns the new load
    pub fn charge(&self, weight: u32) -> u32 {
        self.load.fetch_add(weight, Ordering::SeqCst).saturating_add(weight)
    }

    /// Extra wait imposed on the next dispatch given the current load
    pub fn extra_delay(&self) -> Duration {
        self.delay_for(self.load())
    }

    fn delay_for(&self, load: u32) -> Duration {
        let threshold = self.cfg.burst_threshold;
        if load < threshold {
            return Duration::ZERO;
        }
        // slots below the threshold are free
        let over = load - threshold.saturating_sub(1);
        self.cfg.penalty * over
    }

    /// Drains one unit, never below zero. Returns the load after the tick.
    pub fn tick(&self) -> u32 {
        match self.load.fetch_update(Ordering::SeqCst, Ordering::SeqCst, |l| {
            if l > 0 { Some(l - 1) } else { None }
        }) {
            Ok(prev) => prev - 1,
            Err(_) => 0
        }
    }

    /// Spawns the background decay loop. The first tick lands one full
    /// interval after the call.
    pub fn start_ticker(self: &Arc<Self>) -> JoinHandle<()> {
        let this = Arc::clone(self);
        tokio::spawn(async move {
            let period = this.cfg.decay_interval;
            let mut ticker = interval_at(Instant::now() + period, period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            info!(period_ms = period.as_millis() as u64, "rate.ticker.start");
            loop {
                tokio::select! {
                    _ = this.shutdown.cancelled() => break,
                    _ = ticker.tick() => {
                        if this.load() > 0 {
                            let load = this.tick();
                            debug!(load, "rate.tick");
                        }
                    }
                }
            }
            info!("rate.ticker.stop");
        })
    }

    pub fn shutdown(&self) {
        self.shutdown.cancel();
    }
}

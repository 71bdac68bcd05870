//! Retention purge. Readings are kept for a fixed window after their
//! measurement timestamp, then deleted wherever they sit: still pending,
//! already consumed by an evaluation, delegated or not. Purging is
//! independent of evaluation and idempotent, so the schedule is free to
//! fire whenever.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use tokio::time::{interval, MissedTickBehavior};
use tracing::{debug, info};

use crate::engine::PrivacyEngine;
use crate::store::TrixelStore;

pub struct RetentionPurger {
    store: Arc<TrixelStore>,
    engine: Arc<PrivacyEngine>,
    keep_interval: chrono::Duration,
    purge_interval: std::time::Duration,
}

impl RetentionPurger {
    pub fn new(
        store: Arc<TrixelStore>,
        engine: Arc<PrivacyEngine>,
        keep_interval: chrono::Duration,
        purge_interval: std::time::Duration,
    ) -> RetentionPurger {
        RetentionPurger {
            store,
            engine,
            keep_interval,
            purge_interval,
        }
    }

    /// One purge round as of `now`. Returns the number of deleted readings.
    pub fn purge_at(&self, now: DateTime<Utc>) -> usize {
        let cutoff = now - self.keep_interval;
        let removed = self.store.purge_older_than(cutoff);
        if removed > 0 {
            info!(removed, "purged readings past retention");
        } else {
            debug!("retention purge found nothing to remove");
        }
        self.engine.note_purged(removed);
        removed
    }

    /// Purge on the configured interval until the task is dropped. The
    /// first round runs right away, which clears anything that aged out
    /// while the node was down.
    pub async fn run(&self) {
        let mut ticker = interval(self.purge_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            ticker.tick().await;
            self.purge_at(Utc::now());
        }
    }
}

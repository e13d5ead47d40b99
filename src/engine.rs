//! The simulator core: one owner of the configuration urn, stepped either in
//! batches or event by event depending on how often sampled pairs react.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Instant;

use crate::error::SimError;
use crate::rng::SimRng;
use crate::table::{Reaction, TransitionTable};
use crate::urn::Urn;
use rand::SeedableRng;

/// Decay applied to the running null-fraction estimate after every batch.
pub(crate) const NULL_EWMA_DECAY: f64 = 0.1;

#[derive(Clone, Debug)]
pub(crate) struct Simulator {
    pub(crate) n: i64,
    pub(crate) table: Arc<TransitionTable>,
    pub(crate) reactions: Arc<Vec<Reaction>>,
    /// Current configuration. During a batch this temporarily holds only the
    /// agents not yet touched by the block; `updated` holds the rest.
    pub(crate) urn: Urn,
    pub(crate) updated: Urn,
    pub(crate) rng: SimRng,
    /// Interaction steps simulated so far. Parallel time is `t_steps / n`.
    pub(crate) t_steps: u64,
    pub(crate) silent: bool,
    pub(crate) batch_size: i64,
    pub(crate) switch_threshold: f64,
    pub(crate) null_ewma: f64,
    pub(crate) use_gillespie: bool,
    pub(crate) switch_count: u64,
    pub(crate) weights: Vec<f64>,
}

impl Simulator {
    pub(crate) fn new(
        config: &[i64],
        table: Arc<TransitionTable>,
        reactions: Arc<Vec<Reaction>>,
        seed: u64,
        batch_alpha: f64,
        switch_threshold: f64,
    ) -> Self {
        let n: i64 = config.iter().sum();
        let batch = (batch_alpha * (n as f64).sqrt()).floor() as i64;
        let batch_size = batch.clamp(1, (n / 2).max(1));
        let weights = vec![0.0; reactions.len()];
        let mut sim = Self {
            n,
            table,
            reactions,
            urn: Urn::new(config),
            updated: Urn::empty(config.len()),
            rng: SimRng::seed_from_u64(seed),
            t_steps: 0,
            silent: false,
            batch_size,
            switch_threshold,
            null_ewma: 0.0,
            use_gillespie: false,
            switch_count: 0,
            weights,
        };
        sim.refresh_silence();
        sim
    }

    pub(crate) fn reseed(&mut self, seed: u64) {
        self.rng = SimRng::seed_from_u64(seed);
    }

    /// Replace the configuration and step counter, keeping table and tuning.
    pub(crate) fn reset(&mut self, config: &[i64], t_steps: u64) {
        debug_assert_eq!(config.iter().sum::<i64>(), self.n);
        self.urn.rebuild(config);
        self.updated.clear();
        self.t_steps = t_steps;
        self.silent = false;
        self.null_ewma = 0.0;
        self.use_gillespie = false;
        self.switch_count = 0;
        self.refresh_silence();
    }

    pub(crate) fn counts(&self) -> &[i64] {
        self.urn.counts()
    }

    /// Advance until the step counter reaches `until_step` or the
    /// configuration goes silent. Cancellation and the deadline are observed
    /// between blocks, never inside one.
    pub(crate) fn run(
        &mut self,
        until_step: u64,
        deadline: Option<Instant>,
        cancel: Option<&AtomicBool>,
    ) -> Result<(), SimError> {
        while self.t_steps < until_step {
            if self.silent {
                // nothing can change; let time pass in one jump
                self.t_steps = until_step;
                break;
            }
            if let Some(flag) = cancel {
                if flag.load(Ordering::Relaxed) {
                    return Err(SimError::Cancelled);
                }
            }
            if let Some(limit) = deadline {
                if Instant::now() >= limit {
                    return Err(SimError::Timeout);
                }
            }
            if self.use_gillespie {
                self.gillespie_step(until_step);
            } else {
                self.multibatch_step(until_step);
            }
        }
        Ok(())
    }

    /// Exact silence test: zero total propensity over the non-null reactions.
    pub(crate) fn refresh_silence(&mut self) {
        if self.total_nonnull_weight() <= 0.0 {
            self.silent = true;
        }
    }
}

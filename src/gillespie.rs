//! Event-driven stepping for sparse regimes.
//!
//! When almost every sampled pair is null, simulating interactions one by
//! one wastes nearly all of its work. This path instead samples the number
//! of interactions until the next non-null event directly, then picks which
//! reaction fired proportionally to its propensity.

use crate::engine::Simulator;
use crate::rng::geometric;
use crate::table::{Reaction, Transition};
use rand::Rng;

impl Simulator {
    /// Probability that one uniformly sampled ordered interaction fires `r`
    /// in the current configuration.
    fn reaction_weight(&self, r: &Reaction) -> f64 {
        let [i, j] = r.inputs;
        let ci = self.urn.count(i);
        let cj = if i == j { ci - 1 } else { self.urn.count(j) };
        if ci <= 0 || cj <= 0 {
            return 0.0;
        }
        let pairs = ci as f64 * cj as f64;
        pairs * r.probability / (self.n as f64 * (self.n as f64 - 1.0))
    }

    /// Recompute all reaction weights; returns their sum (the per-step
    /// probability that an interaction is non-null).
    pub(crate) fn total_nonnull_weight(&mut self) -> f64 {
        if self.n < 2 {
            self.weights.fill(0.0);
            return 0.0;
        }
        let mut total = 0.0;
        for k in 0..self.reactions.len() {
            let w = self.reaction_weight(&self.reactions[k]);
            self.weights[k] = w;
            total += w;
        }
        total
    }

    /// One event-driven step: advance to the next non-null interaction (or
    /// to `until_step` if it comes first) and apply the sampled reaction.
    pub(crate) fn gillespie_step(&mut self, until_step: u64) {
        let total = self.total_nonnull_weight();
        if total <= 0.0 {
            self.silent = true;
            return;
        }
        // dense again: hand back to the batched path
        if total * self.batch_size as f64 > self.switch_threshold {
            self.use_gillespie = false;
            self.null_ewma = 1.0 - total;
            return;
        }
        let gap = geometric(&mut self.rng, total);
        let remaining = until_step - self.t_steps;
        if gap > remaining {
            self.t_steps = until_step;
            return;
        }
        self.t_steps += gap;

        let mut target = self.rng.gen::<f64>() * total;
        let mut chosen = None;
        for (k, &w) in self.weights.iter().enumerate() {
            if w <= 0.0 {
                continue;
            }
            chosen = Some(k);
            if target < w {
                break;
            }
            target -= w;
        }
        let Some(chosen) = chosen else { return };
        let r = self.reactions[chosen];
        self.urn.add(r.inputs[0], -1);
        self.urn.add(r.inputs[1], -1);
        self.urn.add(r.outputs[0], 1);
        self.urn.add(r.outputs[1], 1);
    }

    /// Apply one interaction between states `s1`, `s2`, staging the outputs
    /// into the updated-agents urn. Returns true when the transition was
    /// non-null.
    pub(crate) fn apply_single(&mut self, s1: usize, s2: usize) -> bool {
        match self.table.get(s1, s2) {
            Transition::Null => {
                self.updated.add(s1, 1);
                self.updated.add(s2, 1);
                false
            }
            Transition::Deterministic(out) => {
                self.updated.add(out[0], 1);
                self.updated.add(out[1], 1);
                true
            }
            Transition::Random { outputs, probs } => {
                let mut u = self.rng.gen::<f64>();
                let mut out = outputs[outputs.len() - 1];
                for (k, &p) in probs.iter().enumerate() {
                    if u < p {
                        out = outputs[k];
                        break;
                    }
                    u -= p;
                }
                self.updated.add(out[0], 1);
                self.updated.add(out[1], 1);
                out != [s1, s2]
            }
        }
    }
}

//! Batched stepping: simulate a block of O(√n) interactions at once.
//!
//! Within a block, agents that no earlier interaction has touched are
//! statistically interchangeable, so whole collision-free stretches of pairs
//! can be drawn from the urn in bulk and applied per (state, state) count
//! instead of per interaction. The rare interactions that re-use an already
//! touched agent are replayed one at a time against the staged
//! post-interaction states, which makes the block distribution identical to
//! sequential simulation.
//!
//! Bookkeeping during a block: `urn` holds agents untouched so far, `updated`
//! holds the post-interaction states of touched agents. The two always sum
//! to n and are merged when the block ends.

use crate::engine::{Simulator, NULL_EWMA_DECAY};
use crate::rng::{hypergeometric, multinomial_into};
use crate::table::Transition;
use rand::Rng;

impl Simulator {
    /// Simulate one block of up to `batch_size` interactions, clamped so the
    /// step counter never passes `until_step`.
    pub(crate) fn multibatch_step(&mut self, until_step: u64) {
        if self.n < 2 {
            self.silent = true;
            return;
        }
        let remaining = (until_step - self.t_steps).min(self.batch_size as u64) as i64;
        let block = remaining.max(1);
        debug_assert_eq!(self.updated.total(), 0);

        let mut pairs_done: i64 = 0;
        let mut nonnull: i64 = 0;
        while pairs_done < block {
            let touched = self.updated.total();
            let max_run = block - pairs_done;
            match self.sample_collision_pair(touched, max_run) {
                Some(m) => {
                    if m > 1 {
                        self.apply_fresh_pairs(m - 1, &mut nonnull);
                        pairs_done += m - 1;
                    }
                    self.replay_collision_pair(&mut nonnull);
                    pairs_done += 1;
                }
                None => {
                    self.apply_fresh_pairs(max_run, &mut nonnull);
                    pairs_done += max_run;
                }
            }
        }

        let staged = self.updated.counts().to_vec();
        self.urn.add_counts(&staged);
        self.updated.clear();
        self.t_steps += block as u64;

        let frac_null = 1.0 - nonnull as f64 / block as f64;
        self.null_ewma =
            (1.0 - NULL_EWMA_DECAY) * self.null_ewma + NULL_EWMA_DECAY * frac_null;
        if nonnull == 0 {
            self.refresh_silence();
        }
        if !self.silent
            && (1.0 - self.null_ewma) * (self.batch_size as f64) < self.switch_threshold
        {
            self.use_gillespie = true;
            self.switch_count += 1;
        }
    }

    /// Index (1-based) of the first pair in the next `max_run` pairs that
    /// involves an already-touched agent, or None if the whole run is
    /// collision-free.
    ///
    /// With `touched` agents used and 2(m−1) more consumed by the run so
    /// far, pair m draws two fresh agents with probability
    /// fresh·(fresh−1) / (n(n−1)); inverse-transform over the running
    /// product of those factors.
    fn sample_collision_pair(&mut self, touched: i64, max_run: i64) -> Option<i64> {
        let u: f64 = self.rng.gen();
        let nf = self.n as f64;
        let denom = nf * (nf - 1.0);
        let mut prod = 1.0;
        for m in 1..=max_run {
            let fresh = (self.n - touched - 2 * (m - 1)) as f64;
            let p_free = ((fresh * (fresh - 1.0)) / denom).clamp(0.0, 1.0);
            prod *= p_free;
            if u >= prod {
                return Some(m);
            }
        }
        None
    }

    /// Apply `pairs` interactions whose participants are all fresh.
    ///
    /// Draws the 2·pairs participants from the untouched urn in one pass,
    /// splits them into first and second picks, pairs the two sides by a
    /// uniformly random matching, and applies each (i, j) bucket in bulk.
    fn apply_fresh_pairs(&mut self, pairs: i64, nonnull: &mut i64) {
        let q = self.table.q();
        let drawn = self
            .urn
            .sample_without_replacement(&mut self.rng, 2 * pairs);

        // which of the drawn agents were the first pick of their pair
        let mut first = vec![0i64; q];
        let mut remaining_total = 2 * pairs;
        let mut remaining_first = pairs;
        for (i, &d) in drawn.iter().enumerate() {
            if remaining_first == 0 {
                break;
            }
            let f = hypergeometric(
                &mut self.rng,
                remaining_total as u64,
                d as u64,
                remaining_first as u64,
            ) as i64;
            first[i] = f;
            remaining_total -= d;
            remaining_first -= f;
        }
        debug_assert_eq!(remaining_first, 0);

        let mut second: Vec<i64> = drawn
            .iter()
            .zip(first.iter())
            .map(|(&d, &f)| d - f)
            .collect();
        let mut second_total = pairs;

        // random bijection between first and second picks, bucket by bucket
        for i in 0..q {
            let mut need = first[i];
            if need == 0 {
                continue;
            }
            let mut avail = second_total;
            for j in 0..q {
                if need == 0 {
                    break;
                }
                let in_bucket = second[j];
                if in_bucket == 0 {
                    continue;
                }
                let take = hypergeometric(
                    &mut self.rng,
                    avail as u64,
                    in_bucket as u64,
                    need as u64,
                ) as i64;
                if take > 0 {
                    self.apply_bulk(i, j, take, nonnull);
                    second[j] -= take;
                    second_total -= take;
                }
                avail -= in_bucket;
                need -= take;
            }
            debug_assert_eq!(need, 0);
        }
        debug_assert_eq!(second_total, 0);
    }

    /// Apply `count` interactions with first state `i` and second state `j`,
    /// staging all outputs into the updated urn.
    fn apply_bulk(&mut self, i: usize, j: usize, count: i64, nonnull: &mut i64) {
        match self.table.get(i, j) {
            Transition::Null => {
                self.updated.add(i, count);
                self.updated.add(j, count);
            }
            Transition::Deterministic(out) => {
                self.updated.add(out[0], count);
                self.updated.add(out[1], count);
                *nonnull += count;
            }
            Transition::Random { outputs, probs } => {
                let mut split = vec![0u64; probs.len()];
                multinomial_into(&mut self.rng, count as u64, probs, &mut split);
                for (branch, &c) in split.iter().enumerate() {
                    if c == 0 {
                        continue;
                    }
                    let out = outputs[branch];
                    self.updated.add(out[0], c as i64);
                    self.updated.add(out[1], c as i64);
                    if out != [i, j] {
                        *nonnull += c as i64;
                    }
                }
            }
        }
    }

    /// Replay one interaction known to involve at least one touched agent.
    ///
    /// Repeat participants are drawn from the updated urn so they carry
    /// their current post-interaction state; fresh participants come from
    /// the untouched urn. The second pick always excludes the first agent,
    /// which both urns guarantee because the first agent was removed before
    /// the second draw.
    fn replay_collision_pair(&mut self, nonnull: &mut i64) {
        let n = self.n;
        let touched = self.updated.total();
        debug_assert!(touched >= 1);
        let fresh = self.urn.total();

        // Relative weights of the two ways a pair can contain a repeat:
        // first pick repeats (second unconstrained), or first is fresh and
        // the second repeats.
        let w_first_repeat = touched as u128 * (n - 1) as u128;
        let w_second_repeat = fresh as u128 * touched as u128;
        let roll = self.rng.gen_range(0..w_first_repeat + w_second_repeat);

        let (s1, s2) = if roll < w_first_repeat {
            let s1 = self.updated.sample_remove(&mut self.rng);
            let touched_left = self.updated.total();
            let s2 = if self.rng.gen_range(0..n - 1) < touched_left {
                self.updated.sample_remove(&mut self.rng)
            } else {
                self.urn.sample_remove(&mut self.rng)
            };
            (s1, s2)
        } else {
            let s1 = self.urn.sample_remove(&mut self.rng);
            let s2 = self.updated.sample_remove(&mut self.rng);
            (s1, s2)
        };

        if self.apply_single(s1, s2) {
            *nonnull += 1;
        }
    }
}

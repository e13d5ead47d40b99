//! Seeded random streams and the small set of discrete distributions the
//! engines sample from.
//!
//! Every `Simulation` owns one ChaCha8 stream; independent trials derive
//! their own streams from the base seed so ensembles are reproducible
//! regardless of scheduling.

use rand::distributions::Distribution;
use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;
use rand_distr::{Binomial, Hypergeometric, Poisson};

pub type SimRng = ChaCha8Rng;

const GOLDEN_GAMMA: u64 = 0x9E3779B97F4A7C15;

/// Mix a base seed with a stream index into an independent 64-bit seed.
///
/// SplitMix64 finalizer; distinct `stream` values give uncorrelated streams
/// even when `seed` is None and the default base is used.
pub fn derive_seed(seed: Option<u64>, stream: u64) -> u64 {
    let base = seed.unwrap_or(0xDEADBEEFCAFEBABE);
    let z = base ^ stream.wrapping_mul(GOLDEN_GAMMA);
    let z = z.wrapping_add(GOLDEN_GAMMA);
    let mut result = z;
    result = (result ^ (result >> 30)).wrapping_mul(0xBF58476D1CE4E5B9);
    result = (result ^ (result >> 27)).wrapping_mul(0x94D049BB133111EB);
    result ^ (result >> 31)
}

pub fn stream_rng(seed: Option<u64>, stream: u64) -> SimRng {
    SimRng::seed_from_u64(derive_seed(seed, stream))
}

pub(crate) fn binomial(rng: &mut SimRng, n: u64, p: f64) -> u64 {
    if n == 0 || p <= 0.0 {
        return 0;
    }
    if p >= 1.0 {
        return n;
    }
    match Binomial::new(n, p) {
        Ok(dist) => dist.sample(rng),
        Err(_) => 0,
    }
}

/// Number of marked items in a size-`draws` sample without replacement from
/// `total` items of which `success` are marked.
pub(crate) fn hypergeometric(rng: &mut SimRng, total: u64, success: u64, draws: u64) -> u64 {
    let success = success.min(total);
    let draws = draws.min(total);
    if draws == 0 || success == 0 {
        return 0;
    }
    if success == total {
        return draws;
    }
    if draws == total {
        return success;
    }
    match Hypergeometric::new(total, success, draws) {
        Ok(dist) => dist.sample(rng),
        Err(_) => draws.min(success),
    }
}

pub(crate) fn poisson(rng: &mut SimRng, mean: f64) -> u64 {
    if mean <= 0.0 {
        return 0;
    }
    match Poisson::new(mean) {
        Ok(dist) => {
            let x: f64 = dist.sample(rng);
            x.round().max(0.0) as u64
        }
        Err(_) => 0,
    }
}

/// Number of Bernoulli(p) trials up to and including the first success.
///
/// Saturates instead of overflowing when p is vanishingly small.
pub(crate) fn geometric(rng: &mut SimRng, p: f64) -> u64 {
    if p >= 1.0 {
        return 1;
    }
    if p <= 0.0 {
        return u64::MAX;
    }
    let mut u: f64 = rng.gen();
    if u <= 0.0 {
        u = f64::MIN_POSITIVE;
    }
    // ln(1 - p) computed without cancellation
    let log_q = (-p).ln_1p();
    let failures = (u.ln() / log_q).floor();
    if !failures.is_finite() || failures >= 9.0e18 {
        u64::MAX
    } else {
        failures as u64 + 1
    }
}

/// Split `trials` across `probs` by sequential binomial conditioning.
///
/// `out` is overwritten; probabilities are assumed non-negative and are
/// normalized by the remaining mass, so the split is exact even when the
/// input does not sum to exactly 1.
pub(crate) fn multinomial_into(rng: &mut SimRng, trials: u64, probs: &[f64], out: &mut [u64]) {
    debug_assert_eq!(probs.len(), out.len());
    let mut remaining = trials;
    let mut mass: f64 = probs.iter().sum();
    for (k, &p) in probs.iter().enumerate() {
        if remaining == 0 {
            out[k] = 0;
            continue;
        }
        if k + 1 == probs.len() {
            out[k] = remaining;
            break;
        }
        let share = if mass > 0.0 { (p / mass).clamp(0.0, 1.0) } else { 0.0 };
        let taken = binomial(rng, remaining, share);
        out[k] = taken;
        remaining -= taken;
        mass -= p;
    }
}

//! User-facing simulation driver.
//!
//! Owns the state indexing, the engine, and the recorded history. States are
//! arbitrary `Ord + Hash` values; they are enumerated once at construction
//! and everything afterwards runs on dense indices.

use std::collections::{BTreeMap, HashMap};
use std::fmt::Debug;
use std::hash::Hash;
use std::sync::atomic::AtomicBool;
use std::sync::Arc;
use std::time::{Duration, Instant};

use rayon::prelude::*;

use crate::engine::Simulator;
use crate::error::SimError;
use crate::rng::{derive_seed, poisson};
use crate::table::{build_table, enumerate_states, Reaction, Rule, TransitionOrder};

/// Largest supported population size; counts are 64-bit signed integers.
pub const MAX_POPULATION: i64 = 1 << 62;

/// Tuning and reproducibility options for a [`Simulation`].
#[derive(Clone, Debug)]
pub struct Options {
    /// How ordered input pairs relate to unordered interactions.
    pub transition_order: TransitionOrder,
    /// Base seed for all pseudorandom draws. `None` selects a fixed default
    /// base, so two simulations built with `None` behave identically.
    pub seed: Option<u64>,
    /// Hand over to event-driven stepping when the estimated number of
    /// non-null interactions per batch drops below this value, and hand back
    /// when it rises above it again.
    pub gillespie_switch_threshold: f64,
    /// Upper bound on the reachable state set during enumeration.
    pub max_states: usize,
    /// Batch size multiplier: a batch simulates about `batch_alpha · √n`
    /// interactions.
    pub batch_alpha: f64,
    /// Draw Poisson-distributed interaction counts per unit of parallel time
    /// instead of the fixed n interactions of the discrete model.
    pub continuous_time: bool,
}

impl Default for Options {
    fn default() -> Self {
        Self {
            transition_order: TransitionOrder::Asymmetric,
            seed: None,
            gillespie_switch_threshold: 1.0,
            max_states: 512,
            batch_alpha: 1.0,
            continuous_time: false,
        }
    }
}

/// Stop condition for [`Simulation::run`].
pub enum RunUntil<S> {
    /// Run until every enabled interaction is null.
    Silent,
    /// Run until the given parallel time is reached.
    Time(f64),
    /// Run until the predicate over the configuration holds. Evaluated at
    /// recording boundaries only, so a run never pays the predicate cost per
    /// interaction.
    Predicate(Box<dyn Fn(&HashMap<S, i64>) -> bool + Send>),
}

#[derive(Debug)]
pub struct Simulation<S> {
    state_list: Vec<S>,
    state_index: HashMap<S, usize>,
    sim: Simulator,
    options: Options,
    time: f64,
    times: Vec<f64>,
    configs: Vec<Vec<i64>>,
    trial_counter: u64,
}

impl<S> Simulation<S>
where
    S: Clone + Eq + Hash + Ord + Debug + Send + Sync,
{
    /// Enumerate the reachable states, index the rule, and set up the
    /// engine. The initial snapshot at t = 0 is recorded immediately.
    pub fn new(
        init_config: HashMap<S, i64>,
        rule: Rule<S>,
        options: Options,
    ) -> Result<Self, SimError> {
        let mut n: i64 = 0;
        for (state, &count) in &init_config {
            if count < 0 {
                return Err(SimError::InvalidConfig(format!(
                    "negative count {count} for state {state:?}"
                )));
            }
            n = n
                .checked_add(count)
                .filter(|&total| total <= MAX_POPULATION)
                .ok_or_else(|| {
                    SimError::InvalidConfig(format!(
                        "population size exceeds the supported maximum of {MAX_POPULATION}"
                    ))
                })?;
        }
        let seeds: Vec<S> = init_config.keys().cloned().collect();
        let state_list = enumerate_states(&seeds, &rule, options.max_states)?;
        let state_index: HashMap<S, usize> = state_list
            .iter()
            .enumerate()
            .map(|(idx, s)| (s.clone(), idx))
            .collect();
        let (table, reactions) = build_table(&state_list, &rule, options.transition_order)?;

        let mut config = vec![0i64; state_list.len()];
        for (state, &count) in &init_config {
            config[state_index[state]] += count;
        }

        let sim = Simulator::new(
            &config,
            Arc::new(table),
            Arc::new(reactions),
            derive_seed(options.seed, 0),
            options.batch_alpha,
            options.gillespie_switch_threshold,
        );

        let mut simulation = Self {
            state_list,
            state_index,
            sim,
            options,
            time: 0.0,
            times: Vec::new(),
            configs: Vec::new(),
            trial_counter: 1,
        };
        simulation.record();
        Ok(simulation)
    }

    /// All reachable states, in index order. History columns follow this
    /// ordering.
    pub fn state_list(&self) -> &[S] {
        &self.state_list
    }

    pub fn state_index(&self, state: &S) -> Option<usize> {
        self.state_index.get(state).copied()
    }

    pub fn population_size(&self) -> i64 {
        self.sim.n
    }

    /// Current parallel time.
    pub fn time(&self) -> f64 {
        self.time
    }

    pub fn is_silent(&self) -> bool {
        self.sim.silent
    }

    /// Whether the engine is currently stepping event by event.
    pub fn gillespie_active(&self) -> bool {
        self.sim.use_gillespie
    }

    /// How many times the engine has handed over to event-driven stepping.
    pub fn gillespie_switch_count(&self) -> u64 {
        self.sim.switch_count
    }

    /// Current counts in `state_list` order.
    pub fn config_array(&self) -> &[i64] {
        self.sim.counts()
    }

    /// Current configuration as a map over states with non-zero counts.
    pub fn config_dict(&self) -> HashMap<S, i64> {
        dict_of(&self.state_list, self.sim.counts())
    }

    pub fn times(&self) -> &[f64] {
        &self.times
    }

    pub fn configs(&self) -> &[Vec<i64>] {
        &self.configs
    }

    /// Recorded `(time, counts)` snapshots in recording order.
    pub fn history(&self) -> impl Iterator<Item = (f64, &[i64])> + '_ {
        self.times
            .iter()
            .copied()
            .zip(self.configs.iter().map(|row| row.as_slice()))
    }

    /// Run until the stop condition holds, recording a snapshot every
    /// `history_interval` units of parallel time.
    pub fn run(&mut self, until: RunUntil<S>, history_interval: f64) -> Result<(), SimError> {
        self.run_with_control(until, history_interval, None, None)
    }

    /// As [`run`](Self::run), with an optional wall-clock budget and a
    /// cooperative cancellation flag. Both are observed between batches, so
    /// either can overshoot by at most one batch of work.
    pub fn run_with_control(
        &mut self,
        until: RunUntil<S>,
        history_interval: f64,
        timeout: Option<Duration>,
        cancel: Option<&AtomicBool>,
    ) -> Result<(), SimError> {
        if !history_interval.is_finite() || history_interval <= 0.0 {
            return Err(SimError::InvalidConfig(
                "history_interval must be strictly positive".into(),
            ));
        }
        let deadline = timeout.map(|budget| Instant::now() + budget);
        if self.stop_met(&until) {
            return Ok(());
        }
        loop {
            let mut target = self.time + history_interval;
            if let RunUntil::Time(end) = &until {
                if *end < target {
                    target = *end;
                }
            }
            let dt = (target - self.time).max(0.0);
            let add = self.steps_for(dt);
            let until_step = self.sim.t_steps.saturating_add(add);
            self.sim.run(until_step, deadline, cancel)?;
            self.time = target;
            self.record();
            if self.stop_met(&until) {
                return Ok(());
            }
            // a silent configuration can never satisfy a predicate later
            if self.sim.silent && matches!(until, RunUntil::Predicate(_)) {
                return Ok(());
            }
        }
    }

    /// Reset to a configuration (the original initial configuration when
    /// `None`), clearing the recorded history. The population size cannot
    /// change, since it fixes the timescale.
    pub fn reset(&mut self, init_config: Option<&HashMap<S, i64>>) -> Result<(), SimError> {
        let config = match init_config {
            Some(map) => self.config_from_dict(map)?,
            None => self
                .configs
                .first()
                .cloned()
                .unwrap_or_else(|| self.sim.counts().to_vec()),
        };
        self.check_population(&config)?;
        self.sim.reset(&config, 0);
        self.time = 0.0;
        self.times.clear();
        self.configs.clear();
        self.record();
        Ok(())
    }

    /// Replace the current configuration without resetting the clock or the
    /// history. The new configuration is recorded as a snapshot.
    pub fn set_config(&mut self, config: &HashMap<S, i64>) -> Result<(), SimError> {
        let config = self.config_from_dict(config)?;
        self.check_population(&config)?;
        let t_steps = self.sim.t_steps;
        self.sim.reset(&config, t_steps);
        self.record();
        Ok(())
    }

    /// All non-null transitions in reaction notation, one per line.
    /// Symmetric duplicates are listed once.
    pub fn reactions(&self) -> String {
        self.format_reactions(false)
    }

    /// The subset of [`reactions`](Self::reactions) with non-zero propensity
    /// in the current configuration.
    pub fn enabled_reactions(&self) -> String {
        self.format_reactions(true)
    }

    /// Reset to the initial configuration and run a fresh trial to silence,
    /// returning the parallel time it took.
    pub fn sample_silence_time(&mut self) -> Result<f64, SimError> {
        self.reset(None)?;
        self.run(RunUntil::Silent, 1.0)?;
        Ok(self.time)
    }

    /// Sample the configuration `time` units ahead of the current one,
    /// `num_samples` times independently. Trials use derived seeds and run
    /// in parallel; the simulation itself is left untouched.
    pub fn sample_future_configuration(
        &mut self,
        time: f64,
        num_samples: usize,
    ) -> Result<Vec<Vec<i64>>, SimError> {
        if !time.is_finite() || time < 0.0 {
            return Err(SimError::InvalidConfig(
                "sample time must be non-negative".into(),
            ));
        }
        let base = self.sim.clone();
        let seed = self.options.seed;
        let continuous = self.options.continuous_time;
        let first_stream = self.trial_counter;
        self.trial_counter += num_samples as u64;

        (0..num_samples)
            .into_par_iter()
            .map(|trial| {
                let mut engine = base.clone();
                engine.reseed(derive_seed(seed, first_stream + trial as u64));
                let expected = time * engine.n as f64;
                let add = if continuous {
                    poisson(&mut engine.rng, expected)
                } else {
                    expected.ceil().max(0.0) as u64
                };
                let target = engine.t_steps.saturating_add(add);
                engine.run(target, None, None)?;
                Ok(engine.counts().to_vec())
            })
            .collect()
    }

    fn check_population(&self, config: &[i64]) -> Result<(), SimError> {
        let total: i64 = config.iter().sum();
        if total != self.sim.n {
            return Err(SimError::InvalidConfig(format!(
                "configuration holds {total} agents but the simulation was built for {}",
                self.sim.n
            )));
        }
        Ok(())
    }

    fn config_from_dict(&self, map: &HashMap<S, i64>) -> Result<Vec<i64>, SimError> {
        let mut config = vec![0i64; self.state_list.len()];
        for (state, &count) in map {
            if count < 0 {
                return Err(SimError::InvalidConfig(format!(
                    "negative count {count} for state {state:?}"
                )));
            }
            let idx = self.state_index.get(state).ok_or_else(|| {
                SimError::InvalidConfig(format!(
                    "state {state:?} is not in the reachable state set"
                ))
            })?;
            config[*idx] += count;
        }
        Ok(config)
    }

    fn stop_met(&self, until: &RunUntil<S>) -> bool {
        match until {
            RunUntil::Silent => self.sim.silent,
            RunUntil::Time(end) => self.time >= *end,
            RunUntil::Predicate(holds) => holds(&self.config_dict()),
        }
    }

    fn steps_for(&mut self, dt: f64) -> u64 {
        let expected = dt * self.sim.n as f64;
        if self.options.continuous_time {
            poisson(&mut self.sim.rng, expected)
        } else {
            expected.ceil().max(0.0) as u64
        }
    }

    fn record(&mut self) {
        self.times.push(self.time);
        self.configs.push(self.sim.counts().to_vec());
    }

    fn reaction_enabled(&self, reaction: &Reaction) -> bool {
        let [i, j] = reaction.inputs;
        if i == j {
            self.sim.urn.count(i) >= 2
        } else {
            self.sim.urn.count(i) >= 1 && self.sim.urn.count(j) >= 1
        }
    }

    // One line per unordered reaction; a reaction that fires for both input
    // orders is flagged symmetric, one given for a single order is flagged
    // ordered.
    fn format_reactions(&self, only_enabled: bool) -> String {
        let width = self
            .state_list
            .iter()
            .map(|s| format!("{s:?}").len())
            .max()
            .unwrap_or(1);
        let mut merged: BTreeMap<([usize; 2], [usize; 2], u64), u8> = BTreeMap::new();
        for reaction in self.sim.reactions.iter() {
            if only_enabled && !self.reaction_enabled(reaction) {
                continue;
            }
            let mut inputs = reaction.inputs;
            let mut outputs = reaction.outputs;
            inputs.sort_unstable();
            outputs.sort_unstable();
            let orders = if reaction.inputs[0] == reaction.inputs[1] {
                3
            } else if reaction.inputs == inputs {
                1
            } else {
                2
            };
            *merged
                .entry((inputs, outputs, reaction.probability.to_bits()))
                .or_insert(0) |= orders;
        }
        let mut lines = Vec::new();
        for ((inputs, outputs, prob_bits), orders) in merged {
            let name = |idx: usize| format!("{:>width$}", format!("{:?}", self.state_list[idx]));
            let mut line = format!(
                "{}, {}  -->  {}, {}",
                name(inputs[0]),
                name(inputs[1]),
                name(outputs[0]),
                name(outputs[1])
            );
            let probability = f64::from_bits(prob_bits);
            if probability < 1.0 {
                line.push_str(&format!("      with probability {probability}"));
            }
            line.push_str(if orders == 3 { "      (symmetric)" } else { "      (ordered)" });
            lines.push(line);
        }
        lines.join("\n")
    }
}

fn dict_of<S: Clone + Eq + Hash>(states: &[S], counts: &[i64]) -> HashMap<S, i64> {
    states
        .iter()
        .zip(counts.iter())
        .filter(|(_, &count)| count != 0)
        .map(|(state, &count)| (state.clone(), count))
        .collect()
}

/// Gather convergence-time samples across population sizes.
///
/// For each n, one simulation is built and `num_trials` independent trials
/// run in parallel from the initial condition, each until the convergence
/// condition holds (or, when no condition is given, until silence). Times
/// are reported at `check_interval` resolution.
pub fn time_trials<S, F>(
    rule: &Rule<S>,
    ns: &[i64],
    initial_condition: F,
    convergence: Option<&(dyn Fn(&HashMap<S, i64>) -> bool + Sync)>,
    options: &Options,
    num_trials: usize,
    check_interval: f64,
) -> Result<Vec<(i64, f64)>, SimError>
where
    S: Clone + Eq + Hash + Ord + Debug + Send + Sync,
    F: Fn(i64) -> HashMap<S, i64>,
{
    if !check_interval.is_finite() || check_interval <= 0.0 {
        return Err(SimError::InvalidConfig(
            "check_interval must be strictly positive".into(),
        ));
    }
    let mut out = Vec::with_capacity(ns.len() * num_trials);
    for (size_idx, &n) in ns.iter().enumerate() {
        let simulation = Simulation::new(initial_condition(n), rule.clone(), options.clone())?;
        let base = simulation.sim.clone();
        let state_list = simulation.state_list.clone();
        let samples: Result<Vec<f64>, SimError> = (0..num_trials)
            .into_par_iter()
            .map(|trial| {
                let mut engine = base.clone();
                let stream = (size_idx * num_trials + trial) as u64 + 1;
                engine.reseed(derive_seed(options.seed, stream));
                let mut elapsed = 0.0f64;
                loop {
                    if engine.silent {
                        break;
                    }
                    if let Some(converged) = convergence {
                        if converged(&dict_of(&state_list, engine.counts())) {
                            break;
                        }
                    }
                    let add = (check_interval * engine.n as f64).ceil() as u64;
                    let target = engine.t_steps.saturating_add(add);
                    engine.run(target, None, None)?;
                    elapsed += check_interval;
                }
                Ok(elapsed)
            })
            .collect();
        for sample in samples? {
            out.push((n, sample));
        }
    }
    Ok(out)
}

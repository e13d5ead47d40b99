//! Stochastic simulation of population protocols.
//!
//! A population of n indistinguishable agents, each in one of finitely many
//! states, evolves by repeatedly picking an ordered pair of distinct agents
//! uniformly at random and applying a transition rule to their states. One
//! unit of parallel time corresponds to n interactions.
//!
//! The engine batches Θ(√n) interactions into a single block by exploiting
//! the small state set, and falls back to event-driven (Gillespie) stepping
//! when almost every sampled pair is null. For a fixed seed, rule, and
//! initial configuration the recorded trajectory is fully deterministic.
//!
//! ```
//! use popsim::{Options, Rule, RunUntil, Simulation, TransitionOrder};
//! use std::collections::HashMap;
//!
//! let rule = Rule::from_pairs([
//!     (("A", "B"), ("U", "U")),
//!     (("A", "U"), ("A", "A")),
//!     (("B", "U"), ("B", "B")),
//! ]);
//! let init = HashMap::from([("A", 51), ("B", 49)]);
//! let options = Options {
//!     transition_order: TransitionOrder::Symmetric,
//!     seed: Some(0),
//!     ..Options::default()
//! };
//! let mut sim = Simulation::new(init, rule, options)?;
//! sim.run(RunUntil::Silent, 1.0)?;
//! assert!(sim.is_silent());
//! assert_eq!(sim.config_array().iter().sum::<i64>(), 100);
//! # Ok::<(), popsim::SimError>(())
//! ```

mod engine;
mod error;
mod gillespie;
mod multibatch;
mod rng;
mod simulation;
mod table;
mod urn;

pub use error::SimError;
pub use rng::{derive_seed, stream_rng, SimRng};
pub use simulation::{time_trials, Options, RunUntil, Simulation, MAX_POPULATION};
pub use table::{Output, Reaction, Rule, Transition, TransitionOrder, TransitionTable};
pub use urn::Urn;

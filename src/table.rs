//! Rule preprocessing: reachable-state enumeration and the indexed
//! transition table the hot loops read.
//!
//! User rules speak in terms of state values; everything past this module
//! works on dense indices `0..q`. Randomized rules are kept losslessly as
//! branch lists with probabilities.

use std::collections::{HashMap, HashSet};
use std::fmt::Debug;
use std::hash::Hash;
use std::sync::Arc;

use crate::error::SimError;

const PROB_TOLERANCE: f64 = 1e-12;

/// Output of a rule applied to an ordered pair of states.
#[derive(Clone, Debug)]
pub enum Output<S> {
    /// Deterministic transition to a pair of states.
    Pair(S, S),
    /// Probability distribution over output pairs. Probabilities may sum to
    /// less than 1; the deficit is assigned to the identity (null) output.
    Random(Vec<(f64, (S, S))>),
}

/// A transition rule, either an explicit mapping or a callable.
///
/// Input pairs absent from the mapping, or for which the callable returns
/// `None`, are null transitions.
pub enum Rule<S> {
    Map(HashMap<(S, S), Output<S>>),
    Fn(Arc<dyn Fn(&S, &S) -> Option<Output<S>> + Send + Sync>),
}

impl<S: Clone + Eq + Hash> Rule<S> {
    /// Build a deterministic rule from `(input pair) -> (output pair)` entries.
    pub fn from_pairs<I>(entries: I) -> Self
    where
        I: IntoIterator<Item = ((S, S), (S, S))>,
    {
        Self::Map(
            entries
                .into_iter()
                .map(|(input, (x, y))| (input, Output::Pair(x, y)))
                .collect(),
        )
    }

    pub fn from_fn<F>(f: F) -> Self
    where
        F: Fn(&S, &S) -> Option<Output<S>> + Send + Sync + 'static,
    {
        Self::Fn(Arc::new(f))
    }

    fn eval(&self, a: &S, b: &S) -> Option<Output<S>> {
        match self {
            Rule::Map(map) => map.get(&(a.clone(), b.clone())).cloned(),
            Rule::Fn(f) => f(a, b),
        }
    }
}

impl<S> Clone for Rule<S>
where
    S: Clone + Eq + Hash,
{
    fn clone(&self) -> Self {
        match self {
            Rule::Map(map) => Rule::Map(map.clone()),
            Rule::Fn(f) => Rule::Fn(Arc::clone(f)),
        }
    }
}

/// How ordered input pairs relate to unordered interactions.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Default)]
pub enum TransitionOrder {
    /// Input order matters; pairs not given are null.
    #[default]
    Asymmetric,
    /// A null `(i,j)` inherits the entry for `(j,i)` with outputs swapped.
    Symmetric,
    /// As `Symmetric`, but explicit entries for both orders must agree
    /// (up to the swap) or the rule is rejected.
    SymmetricEnforced,
}

/// One non-null outcome of an ordered input pair, with its probability.
/// Enumerated once at build time; the Gillespie engine derives propensities
/// from these.
#[derive(Clone, Copy, Debug)]
pub struct Reaction {
    pub inputs: [usize; 2],
    pub outputs: [usize; 2],
    pub probability: f64,
}

/// Lookup result for an ordered input pair.
#[derive(Clone, Copy, Debug)]
pub enum Transition<'a> {
    Null,
    Deterministic([usize; 2]),
    Random {
        outputs: &'a [[usize; 2]],
        probs: &'a [f64],
    },
}

/// Dense indexed form of the rule over `q` states.
///
/// Immutable after build; lookups are O(1) row indexing.
#[derive(Clone, Debug)]
pub struct TransitionTable {
    q: usize,
    delta: Vec<[usize; 2]>,
    null: Vec<bool>,
    random: Vec<(u32, u32)>, // (offset, branch count); count 0 = deterministic
    random_outputs: Vec<[usize; 2]>,
    random_probs: Vec<f64>,
}

impl TransitionTable {
    pub fn q(&self) -> usize {
        self.q
    }

    pub fn is_null(&self, i: usize, j: usize) -> bool {
        self.null[i * self.q + j]
    }

    pub fn get(&self, i: usize, j: usize) -> Transition<'_> {
        let cell = i * self.q + j;
        let (offset, count) = self.random[cell];
        if count > 0 {
            let range = offset as usize..offset as usize + count as usize;
            Transition::Random {
                outputs: &self.random_outputs[range.clone()],
                probs: &self.random_probs[range],
            }
        } else if self.null[cell] {
            Transition::Null
        } else {
            Transition::Deterministic(self.delta[cell])
        }
    }
}

/// Find all states reachable from `seeds` under `rule` by breadth-first
/// exploration of ordered pairs.
///
/// |Q| is assumed finite; the `max_states` bound turns a runaway rule into
/// an `Unreachable` error instead of an endless search.
pub(crate) fn enumerate_states<S>(
    seeds: &[S],
    rule: &Rule<S>,
    max_states: usize,
) -> Result<Vec<S>, SimError>
where
    S: Clone + Eq + Hash + Ord,
{
    let mut checked: Vec<S> = Vec::new();
    let mut checked_set: HashSet<S> = HashSet::new();
    let mut pending: Vec<S> = Vec::new();
    let mut pending_set: HashSet<S> = HashSet::new();

    for s in seeds {
        if pending_set.insert(s.clone()) {
            pending.push(s.clone());
        }
    }

    while let Some(next) = pending.pop() {
        pending_set.remove(&next);
        if !checked_set.insert(next.clone()) {
            continue;
        }
        checked.push(next.clone());
        if checked.len() > max_states {
            return Err(SimError::Unreachable { limit: max_states });
        }
        for idx in 0..checked.len() {
            let other = checked[idx].clone();
            for output in [rule.eval(&other, &next), rule.eval(&next, &other)]
                .into_iter()
                .flatten()
            {
                let mut visit = |s: &S| {
                    if !checked_set.contains(s) && !pending_set.contains(s) {
                        pending_set.insert(s.clone());
                        pending.push(s.clone());
                    }
                };
                match &output {
                    Output::Pair(x, y) => {
                        visit(x);
                        visit(y);
                    }
                    Output::Random(branches) => {
                        for (_, (x, y)) in branches {
                            visit(x);
                            visit(y);
                        }
                    }
                }
            }
        }
        if checked.len() + pending.len() > max_states {
            return Err(SimError::Unreachable { limit: max_states });
        }
    }

    checked.sort();
    Ok(checked)
}

// Normalized branch list for one ordered input pair.
type Branches = Vec<([usize; 2], f64)>;

fn is_identity(branches: &Branches, i: usize, j: usize) -> bool {
    branches.len() == 1 && branches[0].0 == [i, j]
}

fn swapped(branches: &Branches) -> Branches {
    branches
        .iter()
        .map(|&([a, b], p)| ([b, a], p))
        .collect()
}

fn normalize_output<S>(
    output: Option<Output<S>>,
    i: usize,
    j: usize,
    index_of: &HashMap<S, usize>,
) -> Result<Branches, SimError>
where
    S: Clone + Eq + Hash + Debug,
{
    let lookup = |s: &S| -> Result<usize, SimError> {
        index_of.get(s).copied().ok_or_else(|| {
            SimError::InvalidRule(format!(
                "rule produced state {s:?} that was not discovered during enumeration"
            ))
        })
    };
    match output {
        None => Ok(vec![([i, j], 1.0)]),
        Some(Output::Pair(x, y)) => Ok(vec![([lookup(&x)?, lookup(&y)?], 1.0)]),
        Some(Output::Random(raw)) => {
            let mut branches: Branches = Vec::with_capacity(raw.len());
            for (p, (x, y)) in &raw {
                if *p < -PROB_TOLERANCE {
                    return Err(SimError::InvalidRule(format!(
                        "negative probability {p} for output {:?}",
                        (x, y)
                    )));
                }
                if *p <= 0.0 {
                    continue; // zero-probability branches are never sampled
                }
                let out = [lookup(x)?, lookup(y)?];
                match branches.iter_mut().find(|(o, _)| *o == out) {
                    Some((_, q)) => *q += p,
                    None => branches.push((out, *p)),
                }
            }
            let sum: f64 = branches.iter().map(|(_, p)| p).sum();
            if sum > 1.0 + PROB_TOLERANCE {
                return Err(SimError::InvalidRule(format!(
                    "output probabilities sum to {sum}, which exceeds 1"
                )));
            }
            let deficit = 1.0 - sum;
            if deficit > PROB_TOLERANCE {
                match branches.iter_mut().find(|(o, _)| *o == [i, j]) {
                    Some((_, q)) => *q += deficit,
                    None => branches.push(([i, j], deficit)),
                }
            }
            let total: f64 = branches.iter().map(|(_, p)| p).sum();
            if (total - 1.0).abs() > PROB_TOLERANCE {
                return Err(SimError::InvalidRule(format!(
                    "normalized probabilities sum to {total}, not 1"
                )));
            }
            Ok(branches)
        }
    }
}

fn branch_lists_match(a: &Branches, b: &Branches) -> bool {
    if a.len() != b.len() {
        return false;
    }
    let mut a = a.clone();
    let mut b = b.clone();
    a.sort_by(|(x, _), (y, _)| x.cmp(y));
    b.sort_by(|(x, _), (y, _)| x.cmp(y));
    a.iter()
        .zip(b.iter())
        .all(|((ao, ap), (bo, bp))| ao == bo && (ap - bp).abs() <= 1e-9)
}

/// Evaluate `rule` on every ordered index pair and assemble the table plus
/// the non-null reaction descriptors.
pub(crate) fn build_table<S>(
    states: &[S],
    rule: &Rule<S>,
    order: TransitionOrder,
) -> Result<(TransitionTable, Vec<Reaction>), SimError>
where
    S: Clone + Eq + Hash + Debug,
{
    let q = states.len();
    let index_of: HashMap<S, usize> = states
        .iter()
        .enumerate()
        .map(|(idx, s)| (s.clone(), idx))
        .collect();

    let mut entries: Vec<Branches> = Vec::with_capacity(q * q);
    for (i, a) in states.iter().enumerate() {
        for (j, b) in states.iter().enumerate() {
            let branches = normalize_output(rule.eval(a, b), i, j, &index_of)?;
            entries.push(branches);
        }
    }

    if order != TransitionOrder::Asymmetric {
        for i in 0..q {
            for j in 0..q {
                let fwd = i * q + j;
                let rev = j * q + i;
                let fwd_null = is_identity(&entries[fwd], i, j);
                let rev_null = is_identity(&entries[rev], j, i);
                if fwd_null && !rev_null {
                    let copied = swapped(&entries[rev]);
                    entries[fwd] = copied;
                } else if order == TransitionOrder::SymmetricEnforced
                    && !fwd_null
                    && !rev_null
                    && i < j
                    && !branch_lists_match(&entries[fwd], &swapped(&entries[rev]))
                {
                    return Err(SimError::InvalidRule(format!(
                        "asymmetric interaction: ({:?}, {:?}) and ({:?}, {:?}) disagree",
                        states[i], states[j], states[j], states[i]
                    )));
                }
            }
        }
    }

    let mut delta = vec![[0usize; 2]; q * q];
    let mut null = vec![false; q * q];
    let mut random = vec![(0u32, 0u32); q * q];
    let mut random_outputs = Vec::new();
    let mut random_probs = Vec::new();
    let mut reactions = Vec::new();

    for i in 0..q {
        for j in 0..q {
            let cell = i * q + j;
            let branches = &entries[cell];
            if branches.len() == 1 {
                let (out, _) = branches[0];
                delta[cell] = out;
                null[cell] = out == [i, j];
                if !null[cell] {
                    reactions.push(Reaction {
                        inputs: [i, j],
                        outputs: out,
                        probability: 1.0,
                    });
                }
            } else {
                delta[cell] = [i, j];
                random[cell] = (random_outputs.len() as u32, branches.len() as u32);
                for &(out, p) in branches {
                    random_outputs.push(out);
                    random_probs.push(p);
                    if out != [i, j] {
                        reactions.push(Reaction {
                            inputs: [i, j],
                            outputs: out,
                            probability: p,
                        });
                    }
                }
            }
        }
    }

    Ok((
        TransitionTable {
            q,
            delta,
            null,
            random,
            random_outputs,
            random_probs,
        },
        reactions,
    ))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn majority_rule() -> Rule<&'static str> {
        Rule::from_pairs([
            (("A", "B"), ("U", "U")),
            (("A", "U"), ("A", "A")),
            (("B", "U"), ("B", "B")),
        ])
    }

    #[test]
    fn enumeration_finds_states_only_in_outputs() {
        let rule = majority_rule();
        let states = enumerate_states(&["A", "B"], &rule, 64).unwrap();
        assert_eq!(states, vec!["A", "B", "U"]);
    }

    #[test]
    fn enumeration_bound_is_enforced() {
        let rule = Rule::from_fn(|a: &u64, b: &u64| Some(Output::Pair(a + b + 1, *b)));
        let err = enumerate_states(&[0u64, 1], &rule, 20).unwrap_err();
        assert!(matches!(err, SimError::Unreachable { limit: 20 }));
    }

    #[test]
    fn symmetric_mode_fills_missing_reverse_entries() {
        let rule = majority_rule();
        let states = enumerate_states(&["A", "B"], &rule, 64).unwrap();
        let (table, _) = build_table(&states, &rule, TransitionOrder::Symmetric).unwrap();
        // B=1 A=0: (B, A) inherits (A, B) -> (U, U) with outputs swapped
        match table.get(1, 0) {
            Transition::Deterministic(out) => assert_eq!(out, [2, 2]),
            other => panic!("expected deterministic entry, got {other:?}"),
        }
        assert!(!table.is_null(1, 0));
    }

    #[test]
    fn asymmetric_mode_leaves_reverse_entries_null() {
        let rule = majority_rule();
        let states = enumerate_states(&["A", "B"], &rule, 64).unwrap();
        let (table, _) = build_table(&states, &rule, TransitionOrder::Asymmetric).unwrap();
        assert!(table.is_null(1, 0));
        assert!(!table.is_null(0, 1));
    }

    #[test]
    fn enforced_mode_rejects_contradictory_orders() {
        let rule = Rule::from_pairs([
            (("A", "B"), ("A", "A")),
            (("B", "A"), ("B", "B")),
        ]);
        let states = enumerate_states(&["A", "B"], &rule, 64).unwrap();
        let err = build_table(&states, &rule, TransitionOrder::SymmetricEnforced).unwrap_err();
        assert!(matches!(err, SimError::InvalidRule(_)));
    }

    #[test]
    fn over_unit_probabilities_are_rejected() {
        let rule = Rule::Map(HashMap::from([(
            ("A", "A"),
            Output::Random(vec![(0.7, ("A", "A")), (0.7, ("B", "B"))]),
        )]));
        let states = enumerate_states(&["A"], &rule, 64).unwrap();
        let err = build_table(&states, &rule, TransitionOrder::Asymmetric).unwrap_err();
        assert!(matches!(err, SimError::InvalidRule(_)));
    }

    #[test]
    fn probability_deficit_becomes_identity_branch() {
        let rule = Rule::Map(HashMap::from([(
            ("A", "A"),
            Output::Random(vec![(0.25, ("B", "B"))]),
        )]));
        let states = enumerate_states(&["A"], &rule, 64).unwrap();
        let (table, reactions) = build_table(&states, &rule, TransitionOrder::Asymmetric).unwrap();
        match table.get(0, 0) {
            Transition::Random { outputs, probs } => {
                assert_eq!(outputs.len(), 2);
                let total: f64 = probs.iter().sum();
                assert!((total - 1.0).abs() < 1e-12);
                let identity = outputs.iter().position(|&o| o == [0, 0]).unwrap();
                assert!((probs[identity] - 0.75).abs() < 1e-12);
            }
            other => panic!("expected random entry, got {other:?}"),
        }
        // only the non-identity branch is a reaction
        assert_eq!(reactions.len(), 1);
        assert!((reactions[0].probability - 0.25).abs() < 1e-12);
    }

    #[test]
    fn zero_probability_branches_are_dropped() {
        let rule = Rule::Map(HashMap::from([(
            ("A", "A"),
            Output::Random(vec![(1.0, ("B", "B")), (0.0, ("C", "C"))]),
        )]));
        let states = enumerate_states(&["A"], &rule, 64).unwrap();
        // "C" is reachable through enumeration but never produced
        let idx_b = states.iter().position(|s| *s == "B").unwrap();
        let (table, _) = build_table(&states, &rule, TransitionOrder::Asymmetric).unwrap();
        let idx_a = states.iter().position(|s| *s == "A").unwrap();
        match table.get(idx_a, idx_a) {
            Transition::Deterministic(out) => assert_eq!(out, [idx_b, idx_b]),
            other => panic!("expected collapsed deterministic entry, got {other:?}"),
        }
    }

    #[test]
    fn single_branch_distribution_collapses_to_deterministic() {
        let rule = Rule::Map(HashMap::from([(
            ("A", "B"),
            Output::Random(vec![(1.0, ("B", "B"))]),
        )]));
        let states = enumerate_states(&["A", "B"], &rule, 64).unwrap();
        let (table, reactions) = build_table(&states, &rule, TransitionOrder::Asymmetric).unwrap();
        match table.get(0, 1) {
            Transition::Deterministic(out) => assert_eq!(out, [1, 1]),
            other => panic!("expected deterministic entry, got {other:?}"),
        }
        assert_eq!(reactions.len(), 1);
        assert!((reactions[0].probability - 1.0).abs() < f64::EPSILON);
    }
}

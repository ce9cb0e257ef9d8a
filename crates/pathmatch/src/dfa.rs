//! NFA construction and subset determinization over byte equivalence
//! classes.

use std::collections::HashMap;

use chef_common::{AccessMask, Error, Result};

use crate::parse::{ByteSet, Repeat, Token};
use crate::CompileConfig;

/// Transition sentinel for "no move": the matcher rejects on it.
pub(crate) const DEAD: u32 = u32::MAX;

struct NfaState {
    eps: Vec<u32>,
    arcs: Vec<(ByteSet, u32)>,
    accepting: bool,
    perms: u32,
}

impl NfaState {
    fn new() -> Self {
        Self {
            eps: Vec::new(),
            arcs: Vec::new(),
            accepting: false,
            perms: 0,
        }
    }
}

struct Nfa {
    states: Vec<NfaState>,
}

impl Nfa {
    fn build(patterns: &[(Vec<Token>, AccessMask)]) -> Self {
        let mut nfa = Nfa {
            states: vec![NfaState::new()],
        };
        for (tokens, access) in patterns {
            let mut cur = nfa.push();
            nfa.states[0].eps.push(cur);
            for token in tokens {
                cur = nfa.append(cur, token);
            }
            let state = &mut nfa.states[cur as usize];
            state.accepting = true;
            state.perms |= access.bits();
        }
        nfa
    }

    fn push(&mut self) -> u32 {
        self.states.push(NfaState::new());
        (self.states.len() - 1) as u32
    }

    fn append(&mut self, cur: u32, token: &Token) -> u32 {
        let next = self.push();
        match token.repeat {
            Repeat::One => {
                self.states[cur as usize].arcs.push((token.set, next));
            }
            Repeat::ZeroOrOne => {
                self.states[cur as usize].arcs.push((token.set, next));
                self.states[cur as usize].eps.push(next);
            }
            Repeat::ZeroOrMore => {
                self.states[cur as usize].eps.push(next);
                self.states[next as usize].arcs.push((token.set, next));
            }
            Repeat::OneOrMore => {
                self.states[cur as usize].arcs.push((token.set, next));
                self.states[next as usize].arcs.push((token.set, next));
            }
        }
        next
    }

    fn eps_closure(&self, seed: &[u32], out: &mut Vec<u32>) {
        out.clear();
        out.extend_from_slice(seed);
        let mut i = 0;
        while i < out.len() {
            let state = out[i];
            for &next in &self.states[state as usize].eps {
                if !out.contains(&next) {
                    out.push(next);
                }
            }
            i += 1;
        }
        out.sort_unstable();
        out.dedup();
    }
}

/// The deterministic matcher and the unit of blob serialization.
#[derive(Debug)]
pub struct Dfa {
    pub(crate) classmap: [u8; 256],
    pub(crate) num_classes: u32,
    pub(crate) num_states: u32,
    pub(crate) start: u32,
    /// `num_states * num_classes` entries, row per state, `DEAD` = reject.
    pub(crate) transitions: Vec<u32>,
    /// Per-state granted access bits.
    pub(crate) perms: Vec<u32>,
    /// Accept bitmap, one bit per state in little-endian u64 words.
    pub(crate) accept: Vec<u64>,
}

impl Dfa {
    pub(crate) fn build(
        patterns: &[(Vec<Token>, AccessMask)],
        cfg: &CompileConfig,
    ) -> Result<Self> {
        let nfa = Nfa::build(patterns);

        // Partition the byte alphabet: two bytes are equivalent when every
        // arc set either contains both or neither.
        let mut sets: Vec<ByteSet> = Vec::new();
        for state in &nfa.states {
            for (set, _) in &state.arcs {
                if !sets.contains(set) {
                    sets.push(*set);
                }
            }
        }
        let mut classmap = [0u8; 256];
        let mut reps: Vec<u8> = Vec::new();
        let mut sig_ids: HashMap<Vec<u64>, u8> = HashMap::new();
        for byte in 0..=255u8 {
            let mut sig = vec![0u64; sets.len().div_ceil(64)];
            for (idx, set) in sets.iter().enumerate() {
                if set.contains(byte) {
                    sig[idx / 64] |= 1u64 << (idx % 64);
                }
            }
            let class = match sig_ids.get(&sig) {
                Some(&id) => id,
                None => {
                    if reps.len() >= cfg.max_classes {
                        return Err(Error::CompileFailed(format!(
                            "byte classes exceed the limit of {}",
                            cfg.max_classes
                        )));
                    }
                    let id = reps.len() as u8;
                    sig_ids.insert(sig, id);
                    reps.push(byte);
                    id
                }
            };
            classmap[byte as usize] = class;
        }
        let num_classes = reps.len() as u32;

        // Subset construction.
        let mut closure = Vec::new();
        nfa.eps_closure(&[0], &mut closure);
        let mut ids: HashMap<Vec<u32>, u32> = HashMap::new();
        let mut subsets: Vec<Vec<u32>> = Vec::new();
        ids.insert(closure.clone(), 0);
        subsets.push(closure.clone());
        let mut transitions: Vec<u32> = Vec::new();
        let mut cursor = 0usize;
        while cursor < subsets.len() {
            let subset = subsets[cursor].clone();
            for class in 0..num_classes {
                let rep = reps[class as usize];
                let mut moved: Vec<u32> = Vec::new();
                for &state in &subset {
                    for (set, target) in &nfa.states[state as usize].arcs {
                        if set.contains(rep) && !moved.contains(target) {
                            moved.push(*target);
                        }
                    }
                }
                if moved.is_empty() {
                    transitions.push(DEAD);
                    continue;
                }
                nfa.eps_closure(&moved, &mut closure);
                let id = match ids.get(&closure) {
                    Some(&id) => id,
                    None => {
                        if subsets.len() >= cfg.max_states {
                            return Err(Error::CompileFailed(format!(
                                "automaton states exceed the limit of {}",
                                cfg.max_states
                            )));
                        }
                        let id = subsets.len() as u32;
                        ids.insert(closure.clone(), id);
                        subsets.push(closure.clone());
                        id
                    }
                };
                transitions.push(id);
            }
            cursor += 1;
        }

        let num_states = subsets.len() as u32;
        let mut perms = vec![0u32; num_states as usize];
        let mut accept = vec![0u64; (num_states as usize).div_ceil(64)];
        for (id, subset) in subsets.iter().enumerate() {
            for &state in subset {
                let nfa_state = &nfa.states[state as usize];
                if nfa_state.accepting {
                    accept[id / 64] |= 1u64 << (id % 64);
                    perms[id] |= nfa_state.perms;
                }
            }
        }

        Ok(Dfa {
            classmap,
            num_classes,
            num_states,
            start: 0,
            transitions,
            perms,
            accept,
        })
    }

    pub(crate) fn is_accepting(&self, state: u32) -> bool {
        self.accept[state as usize / 64] & (1u64 << (state % 64)) != 0
    }

    /// Union mask of all patterns accepting `input`, or `None`.
    pub fn granted(&self, input: &[u8]) -> Option<AccessMask> {
        let mut state = self.start;
        for &byte in input {
            let class = self.classmap[byte as usize] as u32;
            state = self.transitions[(state * self.num_classes + class) as usize];
            if state == DEAD {
                return None;
            }
        }
        self.is_accepting(state)
            .then(|| AccessMask::from_bits_truncate(self.perms[state as usize]))
    }
}

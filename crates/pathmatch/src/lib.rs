//! Glob path pattern compiler and matcher.
//!
//! Patterns are anchored at both ends and matched byte-wise against paths.
//! The language: `?` matches one non-`/` byte, `*` matches zero or more
//! non-`/` bytes, `**` matches zero or more of any byte, `[set]` matches one
//! byte from the set (with `a-z` ranges), and a `?`/`+`/`*` directly after a
//! set repeats it zero-or-one/one-or-more/zero-or-more times.
//!
//! Two engines share one normalized token stream: an iterative backtracking
//! matcher that serves as the reference oracle, and a byte-classed DFA used
//! for enforcement and for the exportable profile blob.

mod backtrack;
mod blob;
mod dfa;
mod parse;

use chef_common::{AccessMask, Error, Result};

pub use dfa::Dfa;

/// One glob pattern with the permissions it grants.
#[derive(Debug, Clone)]
pub struct PathPattern {
    pub glob: String,
    pub access: AccessMask,
}

impl PathPattern {
    pub fn new(glob: impl Into<String>, access: AccessMask) -> Self {
        Self {
            glob: glob.into(),
            access,
        }
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct CompileFlags {
    pub case_insensitive: bool,
}

impl CompileFlags {
    pub const CASE_INSENSITIVE: CompileFlags = CompileFlags {
        case_insensitive: true,
    };
}

/// Complexity bounds for compilation.
#[derive(Debug, Clone)]
pub struct CompileConfig {
    pub max_patterns: usize,
    pub max_pattern_length: usize,
    pub max_states: usize,
    pub max_classes: usize,
}

impl Default for CompileConfig {
    fn default() -> Self {
        Self {
            max_patterns: 256,
            max_pattern_length: 1024,
            max_states: 4096,
            max_classes: 256,
        }
    }
}

/// Which matcher backs a compiled profile.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MatchEngine {
    /// Reference implementation, linear scan over patterns.
    Backtrack,
    /// Deterministic automaton, default for enforcement.
    Dfa,
}

/// Outcome of matching one path against a profile.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MatchResult {
    pub matched: bool,
    pub granted: AccessMask,
}

#[derive(Debug)]
enum EngineImpl {
    Backtrack(backtrack::PatternSet),
    Dfa(dfa::Dfa),
}

/// A compiled set of path patterns.
#[derive(Debug)]
pub struct CompiledPathProfile {
    engine: EngineImpl,
}

impl CompiledPathProfile {
    /// Match `path`, returning whether some pattern accepts it with at least
    /// `required` permissions and the union of all matching patterns' masks.
    pub fn matches(&self, path: &str, required: AccessMask) -> MatchResult {
        let granted = match &self.engine {
            EngineImpl::Backtrack(set) => set.granted(path.as_bytes()),
            EngineImpl::Dfa(dfa) => dfa.granted(path.as_bytes()),
        };
        match granted {
            Some(granted) => MatchResult {
                matched: granted.contains(required),
                granted,
            },
            None => MatchResult {
                matched: false,
                granted: AccessMask::NONE,
            },
        }
    }

    /// Serialize the profile into the fixed little-endian blob format.
    /// Only DFA-backed profiles can be exported.
    pub fn export(&self) -> Result<Vec<u8>> {
        match &self.engine {
            EngineImpl::Dfa(dfa) => Ok(blob::export(dfa)),
            EngineImpl::Backtrack(_) => Err(Error::invalid_argument(
                "backtrack profiles cannot be exported; compile with MatchEngine::Dfa",
            )),
        }
    }

    /// Deserialize a profile blob, rejecting any structural inconsistency.
    pub fn import(bytes: &[u8]) -> Result<Self> {
        let dfa = blob::import(bytes)?;
        Ok(Self {
            engine: EngineImpl::Dfa(dfa),
        })
    }

    pub fn engine(&self) -> MatchEngine {
        match &self.engine {
            EngineImpl::Backtrack(_) => MatchEngine::Backtrack,
            EngineImpl::Dfa(_) => MatchEngine::Dfa,
        }
    }
}

/// Compile `patterns` into a profile backed by the requested engine.
pub fn compile(
    patterns: &[PathPattern],
    flags: CompileFlags,
    cfg: &CompileConfig,
    engine: MatchEngine,
) -> Result<CompiledPathProfile> {
    if patterns.len() > cfg.max_patterns {
        return Err(Error::invalid_argument(format!(
            "{} patterns exceed the limit of {}",
            patterns.len(),
            cfg.max_patterns
        )));
    }
    let mut parsed = Vec::with_capacity(patterns.len());
    for pattern in patterns {
        if pattern.glob.len() > cfg.max_pattern_length {
            return Err(Error::invalid_argument(format!(
                "pattern {:?} exceeds {} bytes",
                pattern.glob, cfg.max_pattern_length
            )));
        }
        let tokens = parse::parse(&pattern.glob, flags)?;
        parsed.push((tokens, pattern.access));
    }

    let engine = match engine {
        MatchEngine::Backtrack => EngineImpl::Backtrack(backtrack::PatternSet::new(parsed)),
        MatchEngine::Dfa => EngineImpl::Dfa(dfa::Dfa::build(&parsed, cfg)?),
    };
    Ok(CompiledPathProfile { engine })
}

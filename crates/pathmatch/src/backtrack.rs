//! Iterative backtracking matcher, the reference oracle for the DFA.

use chef_common::AccessMask;

use crate::parse::Token;

/// A compiled pattern set matched by linear scan with per-pattern
/// backtracking.
#[derive(Debug)]
pub struct PatternSet {
    patterns: Vec<(Vec<Token>, AccessMask)>,
}

impl PatternSet {
    pub fn new(patterns: Vec<(Vec<Token>, AccessMask)>) -> Self {
        Self { patterns }
    }

    /// Union of the masks of every pattern accepting `input`, or `None`
    /// when no pattern accepts it.
    pub fn granted(&self, input: &[u8]) -> Option<AccessMask> {
        let mut granted = AccessMask::NONE;
        let mut matched = false;
        for (tokens, access) in &self.patterns {
            if matches(tokens, input) {
                matched = true;
                granted |= *access;
            }
        }
        matched.then_some(granted)
    }
}

/// Greedy match with an explicit choice stack: each variable-width token
/// first takes the longest run its set allows, then gives bytes back one at
/// a time when the remainder fails to match.
fn matches(tokens: &[Token], input: &[u8]) -> bool {
    // (token index, input position, bytes taken)
    let mut stack: Vec<(usize, usize, usize)> = Vec::new();
    let mut t = 0usize;
    let mut i = 0usize;

    loop {
        if t < tokens.len() {
            let token = &tokens[t];
            let available = run_length(&token.set, &input[i..]).min(token.repeat.max());
            if available >= token.repeat.min() {
                stack.push((t, i, available));
                i += available;
                t += 1;
                continue;
            }
        } else if i == input.len() {
            return true;
        }

        // Dead end: shrink the most recent greedy choice that still has
        // slack, or fail when none remains.
        loop {
            let Some((pt, pi, taken)) = stack.pop() else {
                return false;
            };
            if taken > tokens[pt].repeat.min() {
                stack.push((pt, pi, taken - 1));
                i = pi + taken - 1;
                t = pt + 1;
                break;
            }
        }
    }
}

/// Number of consecutive leading bytes of `input` contained in `set`.
fn run_length(set: &crate::parse::ByteSet, input: &[u8]) -> usize {
    input.iter().take_while(|b| set.contains(**b)).count()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::parse::parse;
    use crate::CompileFlags;

    fn accepts(glob: &str, input: &str) -> bool {
        let tokens = parse(glob, CompileFlags::default()).unwrap();
        matches(&tokens, input.as_bytes())
    }

    #[test]
    fn literal_exact_match_only() {
        assert!(accepts("/dev/null", "/dev/null"));
        assert!(!accepts("/dev/null", "/dev/null0"));
        assert!(!accepts("/dev/null", "/dev/nul"));
    }

    #[test]
    fn star_stops_at_separator() {
        assert!(accepts("/tmp/*", "/tmp/file"));
        assert!(accepts("/tmp/*", "/tmp/"));
        assert!(!accepts("/tmp/*", "/tmp/a/b"));
    }

    #[test]
    fn globstar_crosses_separators() {
        assert!(accepts("/srv/**", "/srv/a/b/c"));
        assert!(accepts("/srv/**/leaf", "/srv/a/b/leaf"));
        assert!(!accepts("/srv/**/leaf", "/srv/a/b/tail"));
    }

    #[test]
    fn backtracking_gives_back_greedy_bytes() {
        // `**` initially swallows the whole remainder and must return
        // `/system.log` for the suffix to match.
        assert!(accepts("/stress/**/system.log", "/stress/a/b/c/system.log"));
        // Nested give-back across two variable tokens.
        assert!(accepts("/a*b**c", "/axxbyybzzc"));
    }

    #[test]
    fn class_repetition_bounds() {
        assert!(accepts("/dev/tty[0-9]+", "/dev/tty1"));
        assert!(accepts("/dev/tty[0-9]+", "/dev/tty123"));
        assert!(!accepts("/dev/tty[0-9]+", "/dev/tty"));
        assert!(accepts("/dev/port[0-9]?", "/dev/port"));
        assert!(accepts("/dev/port[0-9]?", "/dev/port7"));
        assert!(!accepts("/dev/port[0-9]?", "/dev/port77"));
    }

    #[test]
    fn union_of_overlapping_masks() {
        let patterns = vec![
            (
                parse("/x/**", CompileFlags::default()).unwrap(),
                AccessMask::READ,
            ),
            (
                parse("/x/bin/*", CompileFlags::default()).unwrap(),
                AccessMask::EXEC,
            ),
        ];
        let set = PatternSet::new(patterns);
        assert_eq!(
            set.granted(b"/x/bin/sh"),
            Some(AccessMask::READ | AccessMask::EXEC)
        );
        assert_eq!(set.granted(b"/x/etc/passwd"), Some(AccessMask::READ));
        assert_eq!(set.granted(b"/y"), None);
    }
}

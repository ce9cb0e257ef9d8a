//! Both engines must agree on every input, and the blob round-trip must
//! preserve the matched language exactly.

use chef_common::AccessMask;
use chef_pathmatch::{
    compile, CompileConfig, CompileFlags, CompiledPathProfile, MatchEngine, PathPattern,
};

fn both(globs: &[&str], flags: CompileFlags) -> (CompiledPathProfile, CompiledPathProfile) {
    let patterns: Vec<_> = globs
        .iter()
        .map(|g| PathPattern::new(*g, AccessMask::READ))
        .collect();
    let cfg = CompileConfig::default();
    let oracle = compile(&patterns, flags, &cfg, MatchEngine::Backtrack).unwrap();
    let dfa = compile(&patterns, flags, &cfg, MatchEngine::Dfa).unwrap();
    (oracle, dfa)
}

fn assert_parity(globs: &[&str], flags: CompileFlags, inputs: &[(&str, bool)]) {
    let (oracle, dfa) = both(globs, flags);
    for &(path, expected) in inputs {
        let from_oracle = oracle.matches(path, AccessMask::READ);
        let from_dfa = dfa.matches(path, AccessMask::READ);
        assert_eq!(
            from_oracle.matched, expected,
            "oracle disagrees with expectation on {path}"
        );
        assert_eq!(
            from_dfa.matched, expected,
            "dfa disagrees with expectation on {path}"
        );
        assert_eq!(
            from_oracle.granted, from_dfa.granted,
            "granted mask mismatch on {path}"
        );
    }
}

#[test]
fn stress_pattern_parity() {
    assert_parity(
        &[
            "/stress/**/system.log",
            "/stress/*/tmp?/file[0-9]*.txt",
            "/stress/[a-z]*/branch/**/end",
        ],
        CompileFlags::default(),
        &[
            ("/stress/a/b/c/system.log", true),
            ("/stress/root/tmp1/file123.txt", true),
            ("/stress/alpha/branch/x/y/z/end", true),
            ("/stress/root/tmp12/file123.txt", false),
            ("/stress/1/branch/x/end", false),
            ("/other/a/b/system.log", false),
        ],
    );
}

#[test]
fn case_insensitive_compile() {
    assert_parity(
        &["/DEV/SDA?"],
        CompileFlags::CASE_INSENSITIVE,
        &[
            ("/dev/sda1", true),
            ("/DEV/SDA1", true),
            // Two trailing characters where `?` accepts exactly one.
            ("/dev/sda12", false),
            ("/dev/sda", false),
        ],
    );
}

#[test]
fn case_sensitive_by_default() {
    assert_parity(
        &["/DEV/SDA?"],
        CompileFlags::default(),
        &[("/DEV/SDA1", true), ("/dev/sda1", false)],
    );
}

#[test]
fn charset_modifier_parity() {
    assert_parity(
        &[
            "/dev/tty[0-9]+",
            "/dev/port[0-9]?",
            "/var/log/[a-z]*.log",
        ],
        CompileFlags::default(),
        &[
            ("/dev/tty1", true),
            ("/dev/tty", false),
            ("/dev/port", true),
            ("/dev/port77", false),
            ("/var/log/system.log", true),
            ("/var/log/1.log", false),
        ],
    );
}

#[test]
fn imported_blob_matches_the_same_language() {
    let globs = [
        "/stress/**/system.log",
        "/stress/*/tmp?/file[0-9]*.txt",
        "/dev/tty[0-9]+",
        "/var/log/[a-z]*.log",
    ];
    let patterns: Vec<_> = globs
        .iter()
        .map(|g| PathPattern::new(*g, AccessMask::READ | AccessMask::WRITE))
        .collect();
    let cfg = CompileConfig::default();
    let compiled = compile(&patterns, CompileFlags::default(), &cfg, MatchEngine::Dfa).unwrap();
    let restored = CompiledPathProfile::import(&compiled.export().unwrap()).unwrap();

    for path in exhaustive_probe_paths() {
        let original = compiled.matches(&path, AccessMask::READ);
        let roundtrip = restored.matches(&path, AccessMask::READ);
        assert_eq!(original, roundtrip, "blob round-trip diverged on {path}");
    }
}

/// Pseudo-random probe corpus from a fixed-seed LCG so failures reproduce.
fn exhaustive_probe_paths() -> Vec<String> {
    let mut seed = 0x5eed_cafe_u64;
    let mut next = move || {
        seed = seed.wrapping_mul(6364136223846793005).wrapping_add(1442695040888963407);
        (seed >> 33) as u32
    };
    let components = [
        "stress", "a", "tmp1", "tmp12", "file1.txt", "file123.txt", "system.log", "dev",
        "tty", "tty9", "port", "var", "log", "branch", "end", "x",
    ];
    let mut paths = Vec::with_capacity(512);
    for _ in 0..512 {
        let depth = (next() % 5 + 1) as usize;
        let mut path = String::new();
        for _ in 0..depth {
            path.push('/');
            path.push_str(components[(next() as usize) % components.len()]);
        }
        paths.push(path);
    }
    paths
}

#[test]
fn random_pattern_corpus_parity() {
    let globs = [
        "/srv/**",
        "/srv/*/data/file?",
        "/srv/[a-m]+/**/tail",
        "/opt/[A-Z][a-z]*",
        "/opt/**/bin/*",
    ];
    let (oracle, dfa) = both(&globs, CompileFlags::default());
    for path in exhaustive_probe_paths() {
        assert_eq!(
            oracle.matches(&path, AccessMask::READ),
            dfa.matches(&path, AccessMask::READ),
            "engines diverged on {path}"
        );
    }
    for path in [
        "/srv/x/data/file1",
        "/srv/abc/q/r/tail",
        "/opt/Alpha",
        "/opt/a/b/bin/tool",
        "/srv/x/data/file12",
        "/opt/ALPHA",
    ] {
        assert_eq!(
            oracle.matches(path, AccessMask::READ),
            dfa.matches(path, AccessMask::READ),
            "engines diverged on {path}"
        );
    }
}

//! Fixed little-endian serialization of a compiled profile.
//!
//! Layout, 16-byte aligned throughout:
//!
//! ```text
//! 0x00  magic u32, version u32, binary_size u32, reserved u32
//! 0x10  accept_words u32, classmap_off u32, transitions_off u32,
//!       perms_off u32, num_states u32, num_classes u32, start_state u32,
//!       reserved u32
//! 0x30  accept bitmap  (accept_words x u64)
//!       classmap       (256 bytes, at classmap_off)
//!       transitions    (num_states x num_classes x u32, at transitions_off)
//!       perms          (num_states x u32, at perms_off)
//! ```
//!
//! Readers reject any blob whose declared offsets or counts fall outside
//! `binary_size`.

use chef_common::{Error, Result};

use crate::dfa::{Dfa, DEAD};

const MAGIC: u32 = u32::from_le_bytes(*b"CHPF");
const VERSION: u32 = 1;
const HEADER_LEN: usize = 0x10;
const RECORD_LEN: usize = 0x20;
const ACCEPT_OFF: usize = HEADER_LEN + RECORD_LEN;

fn align16(value: usize) -> usize {
    (value + 15) & !15
}

pub fn export(dfa: &Dfa) -> Vec<u8> {
    let accept_words = dfa.accept.len();
    let accept_len = accept_words * 8;
    let classmap_off = align16(ACCEPT_OFF + accept_len);
    let transitions_off = align16(classmap_off + 256);
    let transitions_len = dfa.transitions.len() * 4;
    let perms_off = align16(transitions_off + transitions_len);
    let binary_size = align16(perms_off + dfa.perms.len() * 4);

    let mut out = vec![0u8; binary_size];
    let mut put = |off: usize, value: u32| {
        out[off..off + 4].copy_from_slice(&value.to_le_bytes());
    };
    put(0x00, MAGIC);
    put(0x04, VERSION);
    put(0x08, binary_size as u32);
    put(0x10, accept_words as u32);
    put(0x14, classmap_off as u32);
    put(0x18, transitions_off as u32);
    put(0x1c, perms_off as u32);
    put(0x20, dfa.num_states);
    put(0x24, dfa.num_classes);
    put(0x28, dfa.start);

    for (i, word) in dfa.accept.iter().enumerate() {
        out[ACCEPT_OFF + i * 8..ACCEPT_OFF + i * 8 + 8].copy_from_slice(&word.to_le_bytes());
    }
    out[classmap_off..classmap_off + 256].copy_from_slice(&dfa.classmap);
    for (i, entry) in dfa.transitions.iter().enumerate() {
        let off = transitions_off + i * 4;
        out[off..off + 4].copy_from_slice(&entry.to_le_bytes());
    }
    for (i, entry) in dfa.perms.iter().enumerate() {
        let off = perms_off + i * 4;
        out[off..off + 4].copy_from_slice(&entry.to_le_bytes());
    }
    out
}

fn bad(msg: impl Into<String>) -> Error {
    Error::InvalidBlob(msg.into())
}

fn read_u32(bytes: &[u8], off: usize) -> Result<u32> {
    let end = off
        .checked_add(4)
        .ok_or_else(|| bad("offset overflow"))?;
    let slice = bytes
        .get(off..end)
        .ok_or_else(|| bad(format!("read past end at offset {off:#x}")))?;
    Ok(u32::from_le_bytes(slice.try_into().expect("4-byte slice")))
}

/// Bounds-check a section: `off + count * width` must stay inside `size`.
fn check_section(size: usize, off: usize, count: usize, width: usize, what: &str) -> Result<()> {
    let len = count
        .checked_mul(width)
        .and_then(|len| off.checked_add(len))
        .ok_or_else(|| bad(format!("{what} section length overflows")))?;
    if len > size {
        return Err(bad(format!(
            "{what} section [{off:#x}..{len:#x}] exceeds binary size {size:#x}"
        )));
    }
    Ok(())
}

pub fn import(bytes: &[u8]) -> Result<Dfa> {
    if bytes.len() < ACCEPT_OFF {
        return Err(bad("blob shorter than header"));
    }
    if read_u32(bytes, 0x00)? != MAGIC {
        return Err(bad("bad magic"));
    }
    if read_u32(bytes, 0x04)? != VERSION {
        return Err(bad("unsupported version"));
    }
    let binary_size = read_u32(bytes, 0x08)? as usize;
    if binary_size != bytes.len() {
        return Err(bad(format!(
            "declared size {binary_size} does not match payload {}",
            bytes.len()
        )));
    }

    let accept_words = read_u32(bytes, 0x10)? as usize;
    let classmap_off = read_u32(bytes, 0x14)? as usize;
    let transitions_off = read_u32(bytes, 0x18)? as usize;
    let perms_off = read_u32(bytes, 0x1c)? as usize;
    let num_states = read_u32(bytes, 0x20)?;
    let num_classes = read_u32(bytes, 0x24)?;
    let start = read_u32(bytes, 0x28)?;

    if num_states == 0 {
        return Err(bad("zero states"));
    }
    if num_classes == 0 || num_classes > 256 {
        return Err(bad(format!("class count {num_classes} out of range")));
    }
    if start >= num_states {
        return Err(bad(format!(
            "start state {start} out of range for {num_states} states"
        )));
    }
    if accept_words != (num_states as usize).div_ceil(64) {
        return Err(bad(format!(
            "accept word count {accept_words} does not match {num_states} states"
        )));
    }

    check_section(binary_size, ACCEPT_OFF, accept_words, 8, "accept")?;
    check_section(binary_size, classmap_off, 256, 1, "classmap")?;
    let transition_count = (num_states as usize)
        .checked_mul(num_classes as usize)
        .ok_or_else(|| bad("transition count overflows"))?;
    check_section(binary_size, transitions_off, transition_count, 4, "transitions")?;
    check_section(binary_size, perms_off, num_states as usize, 4, "perms")?;

    let mut accept = Vec::with_capacity(accept_words);
    for i in 0..accept_words {
        let off = ACCEPT_OFF + i * 8;
        accept.push(u64::from_le_bytes(
            bytes[off..off + 8].try_into().expect("8-byte slice"),
        ));
    }

    let mut classmap = [0u8; 256];
    classmap.copy_from_slice(&bytes[classmap_off..classmap_off + 256]);
    for &class in &classmap {
        if class as u32 >= num_classes {
            return Err(bad(format!("classmap entry {class} out of range")));
        }
    }

    let mut transitions = Vec::with_capacity(transition_count);
    for i in 0..transition_count {
        let entry = read_u32(bytes, transitions_off + i * 4)?;
        if entry != DEAD && entry >= num_states {
            return Err(bad(format!("transition target {entry} out of range")));
        }
        transitions.push(entry);
    }

    let mut perms = Vec::with_capacity(num_states as usize);
    for i in 0..num_states as usize {
        perms.push(read_u32(bytes, perms_off + i * 4)?);
    }

    Ok(Dfa {
        classmap,
        num_classes,
        num_states,
        start,
        transitions,
        perms,
        accept,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::parse::parse;
    use crate::{CompileConfig, CompileFlags};
    use chef_common::AccessMask;

    fn sample_dfa() -> Dfa {
        let patterns = vec![
            (
                parse("/stress/**/system.log", CompileFlags::default()).unwrap(),
                AccessMask::READ,
            ),
            (
                parse("/dev/tty[0-9]+", CompileFlags::default()).unwrap(),
                AccessMask::READ | AccessMask::WRITE,
            ),
        ];
        Dfa::build(&patterns, &CompileConfig::default()).unwrap()
    }

    #[test]
    fn round_trip_preserves_matching() {
        let dfa = sample_dfa();
        let blob = export(&dfa);
        let restored = import(&blob).unwrap();
        for path in [
            "/stress/a/b/c/system.log",
            "/stress/system.log/",
            "/dev/tty12",
            "/dev/tty",
            "/unrelated",
        ] {
            assert_eq!(
                dfa.granted(path.as_bytes()),
                restored.granted(path.as_bytes()),
                "mismatch on {path}"
            );
        }
    }

    #[test]
    fn blob_is_16_byte_aligned() {
        let blob = export(&sample_dfa());
        assert_eq!(blob.len() % 16, 0);
        let classmap_off = u32::from_le_bytes(blob[0x14..0x18].try_into().unwrap());
        let transitions_off = u32::from_le_bytes(blob[0x18..0x1c].try_into().unwrap());
        assert_eq!(classmap_off % 16, 0);
        assert_eq!(transitions_off % 16, 0);
    }

    #[test]
    fn truncation_is_rejected() {
        let blob = export(&sample_dfa());
        let truncated = &blob[..blob.len() - 16];
        assert!(matches!(import(truncated), Err(Error::InvalidBlob(_))));
    }

    #[test]
    fn every_perturbed_header_field_is_rejected() {
        let blob = export(&sample_dfa());
        // (offset, poison value): accept_words, classmap_off,
        // transitions_off, perms_off, num_states, num_classes, start_state.
        let cases: &[(usize, u32)] = &[
            (0x10, 0xffff),
            (0x14, blob.len() as u32),
            (0x18, blob.len() as u32 - 1),
            (0x1c, u32::MAX),
            (0x20, 0),
            (0x24, 0),
            (0x24, 257),
            (0x28, u32::MAX),
        ];
        for &(off, value) in cases {
            let mut poisoned = blob.clone();
            poisoned[off..off + 4].copy_from_slice(&value.to_le_bytes());
            assert!(
                import(&poisoned).is_err(),
                "poisoning {off:#x} with {value} was accepted"
            );
        }
    }

    #[test]
    fn wrong_magic_and_version_are_rejected() {
        let mut blob = export(&sample_dfa());
        blob[0] ^= 0xff;
        assert!(import(&blob).is_err());

        let mut blob = export(&sample_dfa());
        blob[4] = 9;
        assert!(import(&blob).is_err());
    }
}

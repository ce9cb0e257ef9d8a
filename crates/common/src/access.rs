//! Filesystem access masks shared by the pattern matcher, the policy model,
//! and the kernel allow-map. The bit values are wire format: the in-kernel
//! LSM hook compares against these exact bits.

use std::fmt;
use std::ops::{BitOr, BitOrAssign};
use std::str::FromStr;

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Hash)]
pub struct AccessMask(u32);

impl AccessMask {
    pub const NONE: AccessMask = AccessMask(0);
    pub const READ: AccessMask = AccessMask(0x1);
    pub const WRITE: AccessMask = AccessMask(0x2);
    pub const EXEC: AccessMask = AccessMask(0x4);
    pub const ALL: AccessMask = AccessMask(0x7);

    pub const fn bits(self) -> u32 {
        self.0
    }

    /// Build a mask from raw bits, dropping anything outside the defined set.
    pub const fn from_bits_truncate(bits: u32) -> Self {
        AccessMask(bits & Self::ALL.0)
    }

    pub const fn contains(self, other: AccessMask) -> bool {
        self.0 & other.0 == other.0
    }

    pub const fn is_empty(self) -> bool {
        self.0 == 0
    }
}

impl BitOr for AccessMask {
    type Output = AccessMask;

    fn bitor(self, rhs: AccessMask) -> AccessMask {
        AccessMask(self.0 | rhs.0)
    }
}

impl BitOrAssign for AccessMask {
    fn bitor_assign(&mut self, rhs: AccessMask) {
        self.0 |= rhs.0;
    }
}

impl fmt::Display for AccessMask {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut parts = Vec::new();
        if self.contains(Self::READ) {
            parts.push("read");
        }
        if self.contains(Self::WRITE) {
            parts.push("write");
        }
        if self.contains(Self::EXEC) {
            parts.push("execute");
        }
        f.write_str(&parts.join(","))
    }
}

impl FromStr for AccessMask {
    type Err = String;

    /// Parse the config form: `read`, `write`, `execute` joined by `,`.
    fn from_str(value: &str) -> Result<Self, Self::Err> {
        let mut mask = AccessMask::NONE;
        for part in value.split(',') {
            let part = part.trim();
            if part.is_empty() {
                continue;
            }
            match part.to_ascii_lowercase().as_str() {
                "read" => mask |= Self::READ,
                "write" => mask |= Self::WRITE,
                "execute" | "exec" => mask |= Self::EXEC,
                other => return Err(format!("unknown access kind: {other}")),
            }
        }
        Ok(mask)
    }
}

impl<'de> Deserialize<'de> for AccessMask {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        let raw = String::deserialize(deserializer)?;
        raw.parse().map_err(serde::de::Error::custom)
    }
}

impl Serialize for AccessMask {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        serializer.serialize_str(&self.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_csv_forms() {
        assert_eq!(
            "read,write".parse::<AccessMask>().unwrap(),
            AccessMask::READ | AccessMask::WRITE
        );
        assert_eq!(
            "read,write,execute".parse::<AccessMask>().unwrap(),
            AccessMask::ALL
        );
        assert_eq!("exec".parse::<AccessMask>().unwrap(), AccessMask::EXEC);
    }

    #[test]
    fn rejects_unknown_kind() {
        assert!("read,admin".parse::<AccessMask>().is_err());
    }

    #[test]
    fn bit_values_are_wire_stable() {
        assert_eq!(AccessMask::READ.bits(), 0x1);
        assert_eq!(AccessMask::WRITE.bits(), 0x2);
        assert_eq!(AccessMask::EXEC.bits(), 0x4);
    }

    #[test]
    fn display_round_trips() {
        let mask = AccessMask::READ | AccessMask::EXEC;
        assert_eq!(mask.to_string().parse::<AccessMask>().unwrap(), mask);
    }
}

//! Container id generation and validation.

use rand::distributions::Alphanumeric;
use rand::rngs::OsRng;
use rand::Rng;

use crate::error::{Error, Result};

pub const CONTAINER_ID_LEN: usize = 16;

/// Generate a fresh 16-character alphanumeric container id from the OS RNG.
pub fn generate_container_id() -> String {
    OsRng
        .sample_iter(&Alphanumeric)
        .take(CONTAINER_ID_LEN)
        .map(char::from)
        .collect()
}

/// Validate a caller-supplied container id.
///
/// Ids become cgroup directory names and allow-map identities, so the
/// accepted alphabet is `[A-Za-z0-9._-]` and a leading dot is rejected to
/// keep hidden-directory names out of `/sys/fs/cgroup`.
pub fn validate_container_id(id: &str) -> Result<()> {
    if id.is_empty() {
        return Err(Error::invalid_argument("container id is empty"));
    }
    if id.starts_with('.') {
        return Err(Error::invalid_argument(format!(
            "container id {id:?} must not start with a dot"
        )));
    }
    if let Some(bad) = id
        .chars()
        .find(|c| !(c.is_ascii_alphanumeric() || matches!(c, '.' | '_' | '-')))
    {
        return Err(Error::invalid_argument(format!(
            "container id {id:?} contains invalid character {bad:?}"
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn generated_ids_are_well_formed() {
        for _ in 0..32 {
            let id = generate_container_id();
            assert_eq!(id.len(), CONTAINER_ID_LEN);
            assert!(validate_container_id(&id).is_ok());
        }
    }

    #[test]
    fn generated_ids_are_unique() {
        let a = generate_container_id();
        let b = generate_container_id();
        assert_ne!(a, b);
    }

    #[test]
    fn rejects_hidden_and_traversal_names() {
        assert!(validate_container_id(".hidden").is_err());
        assert!(validate_container_id("../escape").is_err());
        assert!(validate_container_id("").is_err());
        assert!(validate_container_id("ok/nope").is_err());
    }

    #[test]
    fn accepts_dotted_and_dashed_names() {
        assert!(validate_container_id("build-1.stage_2").is_ok());
    }
}

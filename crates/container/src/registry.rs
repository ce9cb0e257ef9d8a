//! Live container registry, keyed by id.
//!
//! The container daemon is single-threaded; the registry is accessed only
//! from its event loop and needs no locking.

use std::collections::HashMap;

use crate::container::Container;
use crate::{ContainerError, Result};

#[derive(Default)]
pub struct ContainerRegistry {
    containers: HashMap<String, Container>,
}

impl ContainerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, container: Container) -> Result<()> {
        let id = container.id().to_string();
        if self.containers.contains_key(&id) {
            return Err(ContainerError::InvalidContainerId(format!(
                "{id} already exists"
            )));
        }
        self.containers.insert(id, container);
        Ok(())
    }

    pub fn get_mut(&mut self, id: &str) -> Result<&mut Container> {
        self.containers
            .get_mut(id)
            .ok_or_else(|| ContainerError::InvalidContainerId(id.to_string()))
    }

    /// Remove the container from the registry. Destruction happens on the
    /// returned value, after the registry no longer knows the id.
    pub fn remove(&mut self, id: &str) -> Result<Container> {
        self.containers
            .remove(id)
            .ok_or_else(|| ContainerError::InvalidContainerId(id.to_string()))
    }

    pub fn contains(&self, id: &str) -> bool {
        self.containers.contains_key(id)
    }

    pub fn len(&self) -> usize {
        self.containers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.containers.is_empty()
    }

    pub fn ids(&self) -> impl Iterator<Item = &str> {
        self.containers.keys().map(String::as_str)
    }
}

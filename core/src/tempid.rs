//! Bidirectional map between a scratch identifier (`existing_person_0`,
//! `temp_node_3`, ...) and a stable id. Used by the extractor and the
//! cleanup engine to let an LLM reference graph entities by a short
//! opaque handle without ever seeing a real id. Scoped to one call, never
//! persisted.

use std::collections::HashMap;
use std::hash::Hash;
use thiserror::Error;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum TempIdError {
    #[error("temporary id already registered: {0}")]
    Duplicate(String),
}

#[derive(Debug)]
pub struct TempIdMapper<Id: Clone + Eq + Hash> {
    forward: HashMap<String, Id>,
    backward: HashMap<Id, String>,
}

impl<Id: Clone + Eq + Hash> TempIdMapper<Id> {
    pub fn new() -> Self {
        Self { forward: HashMap::new(), backward: HashMap::new() }
    }

    /// Registers a new `tempId -> id` pair. Refuses to overwrite an
    /// existing tempId.
    pub fn register(&mut self, temp_id: impl Into<String>, id: Id) -> Result<(), TempIdError> {
        let temp_id = temp_id.into();
        if self.forward.contains_key(&temp_id) {
            return Err(TempIdError::Duplicate(temp_id));
        }
        self.backward.insert(id.clone(), temp_id.clone());
        self.forward.insert(temp_id, id);
        Ok(())
    }

    pub fn resolve(&self, temp_id: &str) -> Option<&Id> {
        self.forward.get(temp_id)
    }

    pub fn temp_id_for(&self, id: &Id) -> Option<&str> {
        self.backward.get(id).map(|s| s.as_str())
    }

    pub fn contains_temp_id(&self, temp_id: &str) -> bool {
        self.forward.contains_key(temp_id)
    }

    pub fn len(&self) -> usize {
        self.forward.len()
    }

    pub fn is_empty(&self) -> bool {
        self.forward.is_empty()
    }
}

impl<Id: Clone + Eq + Hash> Default for TempIdMapper<Id> {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn register_and_resolve_round_trips() {
        let mut mapper: TempIdMapper<u32> = TempIdMapper::new();
        mapper.register("existing_person_0", 7).unwrap();
        assert_eq!(mapper.resolve("existing_person_0"), Some(&7));
        assert_eq!(mapper.temp_id_for(&7), Some("existing_person_0"));
    }

    #[test]
    fn duplicate_registration_is_rejected() {
        let mut mapper: TempIdMapper<u32> = TempIdMapper::new();
        mapper.register("temp_node_0", 1).unwrap();
        let err = mapper.register("temp_node_0", 2).unwrap_err();
        assert_eq!(err, TempIdError::Duplicate("temp_node_0".to_string()));
    }

    #[test]
    fn unknown_temp_id_resolves_to_none() {
        let mapper: TempIdMapper<u32> = TempIdMapper::new();
        assert_eq!(mapper.resolve("missing"), None);
    }
}

// Copyright (c) 2024 Graphcore Ltd. All rights reserved.

use std::cell::RefCell;

use crate::Id;
use crate::tracker::{EntityManager, Track};

/// A tracker that keeps log events in memory so tests can assert on them.
pub struct InMemoryTracker {
    entity_manager: EntityManager,
    events: RefCell<Vec<String>>,
}

impl InMemoryTracker {
    /// Create a new [`InMemoryTracker`] with an [`EntityManager`].
    #[must_use]
    pub fn new(entity_manager: EntityManager) -> Self {
        Self {
            entity_manager,
            events: RefCell::new(Vec::new()),
        }
    }

    fn add_event(&self, event: String) {
        self.events.borrow_mut().push(event);
    }

    /// Return the recorded events, clearing the buffer.
    pub fn take_events(&self) -> Vec<String> {
        self.events.borrow_mut().drain(..).collect()
    }

    /// True if any recorded event contains `needle`.
    pub fn contains(&self, needle: &str) -> bool {
        self.events.borrow().iter().any(|e| e.contains(needle))
    }
}

impl Track for InMemoryTracker {
    fn unique_id(&self) -> Id {
        self.entity_manager.unique_id()
    }

    fn is_entity_enabled(&self, id: Id, level: log::Level) -> bool {
        self.entity_manager.is_log_enabled_at_level(id, level)
    }

    fn add_entity(&self, id: Id, entity_name: &str) {
        self.entity_manager.add_entity(id, entity_name);
    }

    fn enter(&self, id: Id, object: Id) {
        self.add_event(format!("{id}: enter {object}"));
    }

    fn exit(&self, id: Id, object: Id) {
        self.add_event(format!("{id}: exit {object}"));
    }

    fn create(&self, created_by: Id, id: Id, num_bytes: usize, name: &str) {
        self.add_event(format!("{created_by}: created {id}, {name}, {num_bytes} bytes"));
    }

    fn destroy(&self, destroyed_by: Id, id: Id) {
        self.add_event(format!("{destroyed_by}: destroyed {id}"));
    }

    fn connect(&self, connect_from: Id, connect_to: Id) {
        self.add_event(format!("{connect_from}: connect to {connect_to}"));
    }

    fn log(&self, id: Id, level: log::Level, msg: std::fmt::Arguments) {
        self.add_event(format!("{id}:{level}: {msg}"));
    }

    fn time(&self, _set_by: Id, tick: u64) {
        self.entity_manager.set_tick(tick);
    }

    fn shutdown(&self) {}
}

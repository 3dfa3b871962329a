// Copyright (c) 2024 Graphcore Ltd. All rights reserved.

use std::cell::RefCell;

use crate::Id;
use crate::tracker::Track;

/// A tracker that does nothing.
///
/// This can be useful for benchmarks that want to have minimum overheads.
pub struct DevNullTracker;

thread_local! {
    static NEXT_ID: RefCell<u64> = const { RefCell::new(crate::ROOT.0 + 1) };
}

impl Track for DevNullTracker {
    fn unique_id(&self) -> Id {
        NEXT_ID.with(|next| {
            let mut guard = next.borrow_mut();
            let id = *guard;
            *guard += 1;
            Id(id)
        })
    }
    fn is_entity_enabled(&self, _id: Id, _level: log::Level) -> bool {
        false
    }
    fn add_entity(&self, _id: Id, _entity_name: &str) {}
    fn enter(&self, _id: Id, _obj: Id) {}
    fn exit(&self, _id: Id, _obj: Id) {}
    fn create(&self, _id: Id, _obj: Id, _num_bytes: usize, _name: &str) {}
    fn destroy(&self, _id: Id, _obj: Id) {}
    fn connect(&self, _connect_from: Id, _connect_to: Id) {}
    fn log(&self, _id: Id, _level: log::Level, _msg: std::fmt::Arguments) {}
    fn time(&self, _set_by: Id, _tick: u64) {}
    fn shutdown(&self) {}
}

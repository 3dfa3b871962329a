// Copyright (c) 2024 Graphcore Ltd. All rights reserved.

//! This module provides combined _track_ capabilities for the LAGSIM project.
//!
//! _Track_ means the combination of _log_ and _trace_ where:
//!
//!   - _log_ are text-based human-readable messages emitted at various levels
//!     of verbosity (from `Trace` through to `Error`).
//!   - _trace_ provides a standard set of modelling events that can be
//!     emitted. For example, object creation/destruction or objects entering
//!     and leaving simulation [`Entities`](crate::entity::Entity).
//!
//! Every simulation component holds an [`Entity`](crate::entity::Entity)
//! which carries a [`Tracker`] handle, so the logging context is passed by
//! construction rather than read from ambient state.

// Enable warnings for missing documentation
#![warn(missing_docs)]

use std::str::FromStr;

pub use log;

pub mod entity;
pub mod id;

/// Include the trackers.
pub mod tracker;
pub use id::Id;
pub use tracker::{Track, Tracker};

/// A type alias for objects that receive _log_ / _trace_ events.
pub type Writer = Box<dyn std::io::Write>;

/// Id value which indicates that there is no valid id
pub const NO_ID: Id = Id(0);

/// The root id from which all other ids are derived
pub const ROOT: Id = Id(1);

/// Take a command-line style string and convert it to a Level
#[must_use]
pub fn str_to_level(lvl: &str) -> log::Level {
    match log::Level::from_str(lvl) {
        Ok(level) => level,
        Err(_) => panic!("Unable to parse level string '{lvl}'"),
    }
}

pub mod test_helpers;

/// Create a unique [`Id`] for an object created by the given entity.
#[macro_export]
macro_rules! create_id {
    ($entity:expr) => {{ $entity.tracker.unique_id() }};
}

// Track an enter event.
#[doc(hidden)]
#[macro_export]
macro_rules! enter {
    ($entity:expr ; $enter_id:expr) => {
        if $entity
            .tracker
            .is_entity_enabled($entity.id, log::Level::Trace)
        {
            $entity.tracker.enter($entity.id, $enter_id);
        }
    };
}

// Track an exit event.
#[doc(hidden)]
#[macro_export]
macro_rules! exit {
    ($entity:expr ; $exit_id:expr) => {
        if $entity
            .tracker
            .is_entity_enabled($entity.id, log::Level::Trace)
        {
            $entity.tracker.exit($entity.id, $exit_id);
        }
    };
}

/// Add an entity creation event
#[macro_export]
macro_rules! create {
    ($entity:expr) => {{
        if $entity
            .tracker
            .is_entity_enabled($entity.id, log::Level::Trace)
        {
            let parent_id = match &$entity.parent {
                Some(parent) => parent.id,
                None => $crate::NO_ID,
            };
            $entity
                .tracker
                .create(parent_id, $entity.id, 0, $entity.full_name().as_str());
        }
    }};
    ($entity:expr ; $created:expr, $num_bytes:expr) => {{
        if $entity
            .tracker
            .is_entity_enabled($entity.id, log::Level::Trace)
        {
            $entity.tracker.create(
                $entity.id,
                $created.id(),
                $num_bytes,
                format!("{}", $created).as_str(),
            );
        }
    }};
}

/// Add an entity destroy event
#[macro_export]
macro_rules! destroy {
    ($entity:expr) => {{
        if $entity
            .tracker
            .is_entity_enabled($entity.id, log::Level::Trace)
        {
            match &$entity.parent {
                Some(parent) => $entity.tracker.destroy($entity.id, parent.id),
                None => $entity.tracker.destroy($entity.id, $crate::NO_ID),
            };
        }
    }};
}

/// Connect two entities
#[macro_export]
macro_rules! connect {
    ($from_entity:expr ; $to_entity:expr) => {{
        if $from_entity
            .tracker
            .is_entity_enabled($from_entity.id, log::Level::Trace)
        {
            $from_entity
                .tracker
                .connect($from_entity.id, $to_entity.id);
        }
    }};
}

/// Update the current simulation time (in ticks).
#[macro_export]
macro_rules! set_time {
    ($entity:expr ; $tick:expr) => {{
        if $entity
            .tracker
            .is_entity_enabled($entity.id, log::Level::Trace)
        {
            $entity.tracker.time($entity.id, $tick);
        }
    }};
}

/// Base macro for log messages of all levels.
///
/// This wrapper checks the per-entity enable before formatting so that
/// disabled entities pay nothing for their log statements.
#[macro_export]
macro_rules! log_base {
    ($entity:expr ; $lvl:expr, $($arg:tt)+) => (
        if $entity.tracker.is_entity_enabled($entity.id, $lvl) {
            $entity.tracker.log($entity.id, $lvl, format_args!($($arg)+));
        }
    );
}

/// The `trace` macro provides a wrapper for [`log_base`](macro.log_base.html)
/// at level `log::Level::Trace`
#[macro_export]
macro_rules! trace {
    ($entity:expr ; $($arg:tt)+) => (
        $crate::log_base!($entity ; $crate::log::Level::Trace, $($arg)+);
    );
}

/// The `debug` macro provides a wrapper for [`log_base`](macro.log_base.html)
/// at level `log::Level::Debug`
#[macro_export]
macro_rules! debug {
    ($entity:expr ; $($arg:tt)+) => (
        $crate::log_base!($entity ; $crate::log::Level::Debug, $($arg)+);
    );
}

/// The `info` macro provides a wrapper for [`log_base`](macro.log_base.html)
/// at level `log::Level::Info`
#[macro_export]
macro_rules! info {
    ($entity:expr ; $($arg:tt)+) => (
        $crate::log_base!($entity ; $crate::log::Level::Info, $($arg)+);
    );
}

/// The `warn` macro provides a wrapper for [`log_base`](macro.log_base.html)
/// at level `log::Level::Warn`
#[macro_export]
macro_rules! warn {
    ($entity:expr ; $($arg:tt)+) => (
        $crate::log_base!($entity ; $crate::log::Level::Warn, $($arg)+);
    );
}

/// The `error` macro provides a wrapper for [`log_base`](macro.log_base.html)
/// at level `log::Level::Error`
#[macro_export]
macro_rules! error {
    ($entity:expr ; $($arg:tt)+) => (
        $crate::log_base!($entity ; $crate::log::Level::Error, $($arg)+);
    );
}

// Copyright (c) 2024 Graphcore Ltd. All rights reserved.

//! Helper functions for configuring tracking in tests.

use std::io;
use std::rc::Rc;

use crate::tracker::{EntityManager, TextTracker};
use crate::{Tracker, str_to_level};

/// Default level used by tests when `LAGSIM_TEST_LOG` is not set.
const DEFAULT_TEST_LEVEL: log::Level = log::Level::Warn;

/// Create a [`Tracker`] for a test.
///
/// Events go to stdout (captured by the test harness); the level can be
/// raised for debug with e.g. `LAGSIM_TEST_LOG=debug cargo test`. The
/// `full_filepath` argument is conventionally `file!()` and is printed so
/// that interleaved test output can be attributed.
#[must_use]
pub fn create_tracker(full_filepath: &str) -> Tracker {
    let level = match std::env::var("LAGSIM_TEST_LOG") {
        Ok(lvl) => str_to_level(&lvl),
        Err(_) => DEFAULT_TEST_LEVEL,
    };
    println!("{full_filepath}: tracking at {level}");

    let entity_manager = EntityManager::new(level);
    let writer = Box::new(io::BufWriter::new(io::stdout()));
    let tracker: Tracker = Rc::new(TextTracker::new(entity_manager, writer));
    tracker
}

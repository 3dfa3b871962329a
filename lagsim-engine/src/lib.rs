// Copyright (c) 2024 Graphcore Ltd. All rights reserved.

//! `LAGSIM` engine
//!
//! This library provides the core engine which executes event driven
//! cooperative simulation components. Components are registered with the
//! [engine](crate::engine::Engine) and their `run()` futures are spawned
//! onto a deterministic single-threaded [executor](crate::executor).
//!
//! Time is a single global integer tick counter managed by the
//! [clock](crate::time::Clock). A component models the passage of time by
//! awaiting [`wait_ticks`](crate::time::Clock::wait_ticks); a component that
//! runs for as long as the rest of the simulation does should await
//! [`wait_ticks_or_exit`](crate::time::Clock::wait_ticks_or_exit) so that it
//! does not keep the simulation alive on its own.
//!
//! # Simple Application
//!
//! A very simple application would look like:
//!
//! ```rust
//! use lagsim_engine::engine::Engine;
//! use lagsim_engine::run_simulation;
//!
//! let mut engine = Engine::default();
//! let clock = engine.clock();
//! engine.spawn(async move {
//!     clock.wait_ticks(10).await;
//!     Ok(())
//! });
//! run_simulation!(engine);
//! assert_eq!(engine.tick_now(), 10);
//! ```

pub mod engine;
pub mod executor;
pub mod test_helpers;
pub mod time;
pub mod traits;
pub mod types;

#[macro_export]
/// Spawn all registered component run() functions and then run the
/// simulation.
macro_rules! run_simulation {
    ($engine:ident) => {
        $engine.run().unwrap();
    };
    ($engine:ident, $expect:expr) => {
        match $engine.run() {
            Ok(()) => panic!("Expected an error!"),
            Err(e) => assert_eq!(format!("{e}").as_str(), $expect),
        }
    };
}

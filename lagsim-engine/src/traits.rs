// Copyright (c) 2024 Graphcore Ltd. All rights reserved.

//! Common traits used across the LAGSIM engine.

use async_trait::async_trait;

use crate::types::SimResult;

/// A component whose `run()` future is spawned when the simulation starts.
#[async_trait(?Send)]
pub trait Runnable {
    /// The component's main loop.
    async fn run(&self) -> SimResult {
        Ok(())
    }
}

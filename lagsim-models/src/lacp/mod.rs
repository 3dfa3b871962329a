// Copyright (c) 2025 Graphcore Ltd. All rights reserved.

//! Link Aggregation Control Protocol.
//!
//! The per-port state machines live in [`port`] and [`machines`], the
//! device-wide aggregator assignment in [`selection`], and the data path in
//! [`aggregator`] and [`distribution`].

pub mod aggregator;
pub mod distribution;
pub mod machines;
pub mod pdu;
pub mod port;
pub mod selection;

use lagsim_engine::time::Tick;

// Canonical protocol intervals in ticks. One tick is one fast-periodic
// sub-unit; the required ordering is
// fast < aggregate-wait < short-timeout < slow < long < churn.
pub const FAST_PERIODIC_TIME: Tick = 1;
pub const AGGREGATE_WAIT_TIME: Tick = 2;
pub const SHORT_TIMEOUT_TIME: Tick = 3;
pub const SLOW_PERIODIC_TIME: Tick = 30;
pub const LONG_TIMEOUT_TIME: Tick = 90;
pub const CHURN_DETECTION_TIME: Tick = 60;

/// Default actor admin key given to every port and aggregator.
pub const DEFAULT_ACTOR_KEY: u16 = 0x0a00;
/// Key used to park an aggregator so no port will select it.
pub const UNUSED_AGGREGATOR_KEY: u16 = 0x0fff;

/// High bit of the WTR time encodes non-revertive mode.
pub const WTR_NON_REVERTIVE: u16 = 0x8000;

/// Collector max delay advertised in LACPDUs.
pub const DEFAULT_COLLECTOR_MAX_DELAY: u16 = 50;

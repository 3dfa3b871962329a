// Copyright (c) 2025 Graphcore Ltd. All rights reserved.

//! `LAGSIM` models
//!
//! A discrete-time Ethernet simulator built to exercise IEEE 802.1AX Link
//! Aggregation: the LACP per-port state machines and selection logic, the
//! conversation-sensitive frame distribution and the Distributed Resilient
//! Network Interconnect with its DRCP portal protocol.
//!
//! Devices ([`device::Device`]) are engine components; links between their
//! MACs ([`mac`]) are the only runtime-mutable topology. The protocol core
//! lives in [`lacp`] and [`drni`], glued together per device by the
//! [`linkagg`] shim.
//!
//! # Simple Application
//!
//! ```rust
//! use lagsim_engine::run_simulation;
//! use lagsim_engine::test_helpers::start_test;
//! use lagsim_models::device::{Device, connect};
//!
//! let mut engine = start_test(file!());
//! let top = engine.top().clone();
//! let b0 = Device::new_bridge(&engine, &top, "b00", 4, 0xb00).unwrap();
//! let b1 = Device::new_bridge(&engine, &top, "b01", 4, 0xb01).unwrap();
//!
//! let clock = engine.clock();
//! let (b0_task, b1_task) = (b0.clone(), b1.clone());
//! engine.spawn(async move {
//!     clock.wait_until(10).await;
//!     connect(&b0_task, 0, &b1_task, 0, 5);
//!     clock.wait_until(100).await;
//!     Ok(())
//! });
//! run_simulation!(engine);
//!
//! assert!(b0.with_lag(|lag| lag.is_operational(0)));
//! ```

pub mod device;
pub mod drni;
pub mod frame;
pub mod lacp;
pub mod linkagg;
pub mod mac;
pub mod types;

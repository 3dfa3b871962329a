// Copyright (c) 2025 Graphcore Ltd. All rights reserved.

#![allow(dead_code)]

use std::rc::Rc;

use lagsim_engine::engine::Engine;
use lagsim_models::device::Device;
use lagsim_models::lacp::port::Selected;
use lagsim_models::linkagg::LinkAgg;

/// Build `count` bridge devices named `b00`, `b01`, ...
pub fn bridges(engine: &Engine, count: usize, num_macs: usize) -> Vec<Rc<Device>> {
    (0..count)
        .map(|i| {
            Device::new_bridge(
                engine,
                engine.top(),
                &format!("b{i:02}"),
                num_macs,
                0xb00 + i as u64,
            )
            .unwrap()
        })
        .collect()
}

/// Build `count` end-station devices named `e03`, `e04`, ... to match the
/// conventional numbering after three bridges.
pub fn stations(engine: &Engine, count: usize, num_macs: usize) -> Vec<Rc<Device>> {
    (0..count)
        .map(|i| {
            Device::new_station(
                engine,
                engine.top(),
                &format!("e{:02}", i + 3),
                num_macs,
                0xe03 + i as u64,
            )
            .unwrap()
        })
        .collect()
}

/// Distributing member port numbers of an aggregator.
pub fn lag_members(device: &Device, agg_index: usize) -> Vec<u16> {
    device.with_lag(|lag| lag.distributing_port_numbers(agg_index))
}

/// Check the structural invariants that must hold at any quiet point:
/// distributing implies collecting, an attachment and a partner in sync,
/// and an aggregator is operational exactly when a member distributes.
pub fn check_invariants(lag: &LinkAgg) {
    for port in &lag.ports {
        if port.is_distributing() {
            assert!(port.is_collecting(), "{}: distributing but not collecting", port.entity);
            assert!(port.attached.is_some(), "{}: distributing while detached", port.entity);
            assert!(port.partner_sync(), "{}: distributing without partner sync", port.entity);
            assert!(
                matches!(port.selected, Selected::Selected(_)),
                "{}: distributing while unselected",
                port.entity
            );
        }
    }
    // At a quiet point the mux attachment always agrees with selection
    for port in &lag.ports {
        if let Some(agg) = port.attached {
            assert_eq!(
                port.selected,
                Selected::Selected(agg),
                "{}: attached to {agg} but selection disagrees",
                port.entity
            );
        }
    }
}

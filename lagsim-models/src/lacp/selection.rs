// Copyright (c) 2025 Graphcore Ltd. All rights reserved.

//! Selection Logic: assigns aggregation ports to aggregators.
//!
//! Runs once per device per tick, after the receive machines. Selected
//! ports are left alone as long as their LagId still matches the snapshot
//! taken at selection time; everything else re-seats by the
//! preferred-aggregator policy. Eviction leaves the losers unselected for a
//! tick, which is the source of the transient bouncing seen when many ports
//! come up close together.

use lagsim_track::debug;

use super::aggregator::Aggregator;
use super::port::{AggPort, Selected};
use crate::types::LagId;

/// One pass of the Selection Logic.
///
/// `withheld[i]` marks ports the distributed relay is keeping out of
/// selection (wrong portal partner); they are treated like ports with a
/// null LagId.
pub fn run_selection(ports: &mut [AggPort], aggregators: &[Aggregator], withheld: &[bool]) {
    let lag_ids: Vec<Option<LagId>> = ports
        .iter()
        .enumerate()
        .map(|(i, p)| if withheld[i] { None } else { p.lag_id() })
        .collect();

    // Drop selections that no longer describe the port: the LagId moved
    // (admin change, partner move, identity override) or the aggregator was
    // reconfigured away from the port's key.
    for (i, port) in ports.iter_mut().enumerate() {
        if let Selected::Selected(agg) = port.selected {
            let stale = match (&lag_ids[i], &port.selected_lag_id) {
                (Some(current), Some(snapshot)) => current != snapshot,
                _ => true,
            };
            let agg_gone = !aggregators[agg].enabled
                || aggregators[agg].oper_key != port.actor_oper_key;
            if stale || agg_gone || port.port_moved {
                debug!(port.entity ; "unselected (stale={stale}, agg_gone={agg_gone}, moved={})",
                    port.port_moved);
                port.set_selected(Selected::Unselected, None);
            }
        }
        port.port_moved = false;
    }

    // Seat unselected ports, lowest port id first so the group leader
    // claims before its followers look for it. Ports evicted during this
    // pass wait for the next tick.
    let mut order: Vec<usize> = (0..ports.len()).collect();
    order.sort_by_key(|&i| ports[i].port_id.id());
    let mut evicted = vec![false; ports.len()];

    for &i in &order {
        if ports[i].selected != Selected::Unselected || evicted[i] {
            continue;
        }
        let Some(lag_id) = lag_ids[i] else {
            continue;
        };

        // The lowest port of the group decides where the LAG lives
        let lowest = order
            .iter()
            .copied()
            .filter(|&j| matches!(&lag_ids[j], Some(other) if lag_id.same_lag(other)))
            .min_by_key(|&j| ports[j].port_id.id())
            .unwrap_or(i);

        let target = if lowest == i {
            choose_for_leader(ports, aggregators, i, &lag_id)
        } else {
            // Followers join the aggregator their leader sits on
            holder_of(ports, &lag_id)
        };

        let Some(target) = target else {
            continue;
        };

        // Claiming an aggregator held by a different LAG evicts all its
        // members; they reseat on a later tick.
        let evictees: Vec<usize> = (0..ports.len())
            .filter(|&j| {
                matches!(ports[j].selected, Selected::Selected(agg) if agg == target)
                    && !matches!(&ports[j].selected_lag_id, Some(other) if lag_id.same_lag(other))
            })
            .collect();
        for j in evictees {
            debug!(ports[j].entity ; "evicted from aggregator {target}");
            ports[j].set_selected(Selected::Unselected, None);
            evicted[j] = true;
        }

        debug!(ports[i].entity ; "selected aggregator {target}");
        ports[i].set_selected(Selected::Selected(target), Some(lag_id));
    }

    // A LAG must not span aggregators: members seated away from their
    // leader's aggregator are re-seated on a later tick.
    let leader_agg: Vec<Option<usize>> = (0..ports.len())
        .map(|i| {
            let lag_id = lag_ids[i]?;
            let lowest = order
                .iter()
                .copied()
                .filter(|&j| matches!(&lag_ids[j], Some(other) if lag_id.same_lag(other)))
                .min_by_key(|&j| ports[j].port_id.id())?;
            match ports[lowest].selected {
                Selected::Selected(agg) => Some(agg),
                Selected::Unselected => None,
            }
        })
        .collect();
    for (i, port) in ports.iter_mut().enumerate() {
        if let (Selected::Selected(agg), Some(leader)) = (port.selected, leader_agg[i]) {
            if agg != leader {
                debug!(port.entity ; "re-seating with group leader (aggregator {leader})");
                port.set_selected(Selected::Unselected, None);
            }
        }
    }
}

/// Pick an aggregator for the lowest port of a group.
fn choose_for_leader(
    ports: &[AggPort],
    aggregators: &[Aggregator],
    leader: usize,
    lag_id: &LagId,
) -> Option<usize> {
    let key = ports[leader].actor_oper_key;

    // The preferred aggregator shares the port's index. The preferred
    // owner always wins it, evicting a squatter if necessary.
    let preferred = ports[leader].index;
    if let Some(agg) = aggregators.get(preferred) {
        if agg.enabled && agg.oper_key == key {
            return Some(preferred);
        }
    }

    // Stay with the group if it is already seated somewhere
    if let Some(agg) = holder_of(ports, lag_id) {
        return Some(agg);
    }

    // Lowest-indexed free aggregator with a matching key
    aggregators
        .iter()
        .position(|agg| {
            agg.enabled
                && agg.oper_key == key
                && !ports
                    .iter()
                    .any(|p| matches!(p.selected, Selected::Selected(held) if held == agg.index))
        })
}

/// The aggregator currently holding ports of this LAG, if any.
fn holder_of(ports: &[AggPort], lag_id: &LagId) -> Option<usize> {
    ports.iter().find_map(|p| match (p.selected, &p.selected_lag_id) {
        (Selected::Selected(agg), Some(other)) if lag_id.same_lag(other) => Some(agg),
        _ => None,
    })
}

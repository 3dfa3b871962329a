// Copyright (c) 2025 Graphcore Ltd. All rights reserved.

//! Conversation-sensitive distribution: C-VID classified frames leave on
//! the links the conversation map assigns, for both the default spread and
//! the eight-link spread with renumbered links.

mod common;

use common::{bridges, stations};
use lagsim_engine::run_simulation;
use lagsim_engine::test_helpers::start_test;
use lagsim_models::device::{Device, connect};
use lagsim_models::frame::VlanTag;
use lagsim_models::lacp::distribution::ConvLinkMap;
use lagsim_models::types::LagAlgorithm;
use std::rc::Rc;

/// Untagged frame then C-tagged frames vid 0..=7, as the original driver's
/// nine-frame burst.
fn send_nine_frames(station: &Device) {
    station.generate_test_frame(None);
    for vid in 0..8 {
        station.generate_test_frame(Some(VlanTag::customer(vid)));
    }
}

fn data_rx(device: &Device, macs: core::ops::Range<usize>) -> Vec<u64> {
    macs.map(|m| device.mac_stats(m).rx_data_frames).collect()
}

#[test]
fn default_spread_over_three_links() {
    let mut engine = start_test(file!());
    let devices = bridges(&engine, 3, 8);
    let (b0, b2) = (devices[0].clone(), devices[2].clone());
    let mut ends = stations(&engine, 2, 4);
    let es5 = ends.remove(1);
    let es3 = ends.remove(0);

    // C-VID classification on both ends of the b0/b2 LAG
    for device in [&b0, &b2] {
        device.with_lag_mut(|lag| {
            for agg in &mut lag.aggregators {
                agg.set_port_algorithm(LagAlgorithm::CVid);
            }
        });
    }

    let clock = engine.clock();
    engine.spawn(async move {
        clock.wait_until(10).await;
        // Three links with link numbers {4, 5, 6}
        connect(&b0, 3, &b2, 3, 5);
        connect(&b0, 4, &b2, 4, 5);
        connect(&b0, 5, &b2, 5, 5);
        // Stations on either side of the bridged path
        connect(&es3, 0, &b0, 6, 5);
        connect(&es5, 0, &b2, 0, 5);

        clock.wait_until(100).await;
        assert_eq!(common::lag_members(&b0, 3), vec![0x103, 0x104, 0x105]);

        // The conversation map is the modulo spread over {4, 5, 6}
        b0.with_lag(|lag| {
            let map: Vec<u16> = (0..8).map(|c| lag.aggregators[3].conversation_link(c)).collect();
            assert_eq!(map, vec![4, 5, 6, 4, 5, 6, 4, 5]);
        });

        let before = data_rx(&b2, 3..6);
        send_nine_frames(&es3);

        clock.wait_until(130).await;
        // Conversation IDs 0,0,1,2,3,4,5,6,7 spread as links
        // 4,4,5,6,4,5,6,4,5: four frames on link 4, three on 5, two on 6
        let after = data_rx(&b2, 3..6);
        let delta: Vec<u64> = after.iter().zip(&before).map(|(a, b)| a - b).collect();
        assert_eq!(delta, vec![4, 3, 2]);

        // Every frame crossed the LAG on exactly one link and was flooded
        // through to the far station exactly once
        let mut vids: Vec<Option<u16>> = es5
            .station_received()
            .iter()
            .map(|record| record.vid)
            .collect();
        vids.sort_unstable();
        let expected: Vec<Option<u16>> =
            std::iter::once(None).chain((0..8).map(Some)).collect();
        assert_eq!(vids, expected);
        Ok(())
    });

    run_simulation!(engine);
}

#[test]
fn eight_link_spread_with_renumbered_links() {
    let mut engine = start_test(file!());
    let devices = bridges(&engine, 3, 8);
    let (b0, b2) = (devices[0].clone(), devices[2].clone());
    let es3: Rc<Device> = stations(&engine, 1, 4).remove(0);

    for device in [&b0, &b2] {
        device.with_lag_mut(|lag| {
            // Link numbers above 7 exercise the slot folding: {17, 25, 6}
            lag.ports[3].set_link_number(17);
            lag.ports[4].set_link_number(25);
            for agg in &mut lag.aggregators {
                agg.set_port_algorithm(LagAlgorithm::CVid);
                agg.set_conv_link_map(ConvLinkMap::EightLinkSpread);
            }
        });
    }

    let clock = engine.clock();
    engine.spawn(async move {
        clock.wait_until(10).await;
        connect(&b0, 3, &b2, 3, 5);
        connect(&b0, 4, &b2, 4, 5);
        connect(&b0, 5, &b2, 5, 5);
        connect(&es3, 0, &b0, 6, 5);

        clock.wait_until(100).await;
        // 17 and 25 both fold to slot 1 and 17 wins it, so 25 never
        // carries a conversation; slots 2..=5 fall back down to 17 and
        // slots 6..=8 resolve to 6
        b0.with_lag(|lag| {
            let map: Vec<u16> = (0..8).map(|c| lag.aggregators[3].conversation_link(c)).collect();
            assert_eq!(map, vec![17, 17, 17, 17, 17, 6, 6, 6]);
        });

        let before = data_rx(&b2, 3..6);
        send_nine_frames(&es3);

        clock.wait_until(130).await;
        // Conversation IDs 0,0,1,2,3,4 ride link 17 (mac3); 5,6,7 ride
        // link 6 (mac5); link 25 (mac4) stays idle
        let after = data_rx(&b2, 3..6);
        let delta: Vec<u64> = after.iter().zip(&before).map(|(a, b)| a - b).collect();
        assert_eq!(delta, vec![6, 0, 3]);

        // A duplicated link number forces both offenders out of the
        // distribution; the remaining link carries everything
        clock.wait_until(150).await;
        b0.with_lag_mut(|lag| lag.ports[4].set_link_number(17));

        clock.wait_until(170).await;
        b0.with_lag(|lag| {
            assert!(lag.ports[3].dup_link_suppressed);
            assert!(lag.ports[4].dup_link_suppressed);
            assert_eq!(lag.distributing_port_numbers(3), vec![0x105]);
            assert_eq!(lag.aggregators[3].conversation_link(0), 6);
        });

        // Renumbering away resolves the collision
        clock.wait_until(200).await;
        b0.with_lag_mut(|lag| lag.ports[4].set_link_number(25));

        clock.wait_until(230).await;
        b0.with_lag(|lag| {
            assert_eq!(
                lag.distributing_port_numbers(3),
                vec![0x103, 0x104, 0x105]
            );
        });
        Ok(())
    });

    run_simulation!(engine);
}

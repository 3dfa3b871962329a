// Copyright (c) 2025 Graphcore Ltd. All rights reserved.

//! Loopbacks onto the same system: same-port loops aggregate with each
//! other, cross-port loops split into a master and a slave end so both
//! halves of the LAG get an aggregator.

mod common;

use common::{bridges, check_invariants, lag_members};
use lagsim_engine::run_simulation;
use lagsim_engine::test_helpers::start_test;
use lagsim_models::device::{connect, disconnect};

#[test]
fn loopback_variants_aggregate_separately() {
    let mut engine = start_test(file!());
    let devices = bridges(&engine, 1, 8);
    let b0 = devices[0].clone();

    let clock = engine.clock();
    engine.spawn(async move {
        clock.wait_until(10).await;
        connect(&b0, 0, &b0, 0, 5); // same-port loopback

        clock.wait_until(70).await;
        assert_eq!(lag_members(&b0, 0), vec![0x100]);
        assert!(b0.with_lag(|lag| lag.is_operational(0)));

        clock.wait_until(100).await;
        connect(&b0, 1, &b0, 3, 5); // cross-port loopback

        clock.wait_until(170).await;
        // Master and slave end on their own aggregators
        assert_eq!(lag_members(&b0, 1), vec![0x101]);
        assert_eq!(lag_members(&b0, 3), vec![0x103]);

        clock.wait_until(200).await;
        connect(&b0, 5, &b0, 5, 5); // second same-port loopback

        clock.wait_until(270).await;
        // Same-port loops share a LAG
        assert_eq!(lag_members(&b0, 0), vec![0x100, 0x105]);

        clock.wait_until(300).await;
        connect(&b0, 2, &b0, 4, 5); // second cross-port loopback

        clock.wait_until(370).await;
        assert_eq!(lag_members(&b0, 1), vec![0x101, 0x102]);
        assert_eq!(lag_members(&b0, 3), vec![0x103, 0x104]);
        b0.with_lag(check_invariants);

        clock.wait_until(400).await;
        disconnect(&b0, 0);
        clock.wait_until(450).await;
        assert_eq!(lag_members(&b0, 0), vec![0x105]);

        clock.wait_until(500).await;
        disconnect(&b0, 5);
        clock.wait_until(550).await;
        assert!(!b0.with_lag(|lag| lag.is_operational(0)));

        // A loop between ports 0 and 5 joins the cross-port LAG: three
        // masters on one aggregator, three slaves on another
        clock.wait_until(600).await;
        connect(&b0, 0, &b0, 5, 5);

        clock.wait_until(700).await;
        let masters = b0.with_lag(|lag| {
            let agg = lag.ports[0].attached.expect("port 0 should be attached");
            lag.distributing_port_numbers(agg)
        });
        let slaves = b0.with_lag(|lag| {
            let agg = lag.ports[5].attached.expect("port 5 should be attached");
            lag.distributing_port_numbers(agg)
        });
        assert_eq!(masters, vec![0x100, 0x101, 0x102]);
        assert_eq!(slaves, vec![0x103, 0x104, 0x105]);
        b0.with_lag(check_invariants);

        clock.wait_until(750).await;
        disconnect(&b0, 0);
        clock.wait_until(820).await;
        // Survivors stay where they are when the lowest port leaves
        let masters = b0.with_lag(|lag| {
            let agg = lag.ports[1].attached.expect("port 1 should be attached");
            lag.distributing_port_numbers(agg)
        });
        assert_eq!(masters, vec![0x101, 0x102]);
        assert_eq!(lag_members(&b0, 3), vec![0x103, 0x104]);

        // Port 0 looping onto itself reclaims its preferred aggregator and
        // pushes the cross-loop masters off to the next one
        clock.wait_until(900).await;
        connect(&b0, 0, &b0, 0, 5);

        clock.wait_until(980).await;
        assert_eq!(lag_members(&b0, 0), vec![0x100]);
        assert_eq!(lag_members(&b0, 1), vec![0x101, 0x102]);
        assert_eq!(lag_members(&b0, 3), vec![0x103, 0x104]);
        b0.with_lag(check_invariants);
        Ok(())
    });

    run_simulation!(engine);
}

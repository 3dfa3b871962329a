// Copyright (c) 2025 Graphcore Ltd. All rights reserved.

//! Dual homing: with only one usable aggregator, two upstream LAGs contend
//! for it and the preferred-aggregator priority decides which one runs.

mod common;

use common::{bridges, check_invariants, lag_members};
use lagsim_engine::run_simulation;
use lagsim_engine::test_helpers::start_test;
use lagsim_models::device::{connect, disconnect};
use lagsim_models::lacp::{DEFAULT_ACTOR_KEY, UNUSED_AGGREGATOR_KEY};

#[test]
fn one_aggregator_arbitrates_two_uplinks() {
    let mut engine = start_test(file!());
    let devices = bridges(&engine, 3, 8);
    let (b0, b1, b2) = (devices[0].clone(), devices[1].clone(), devices[2].clone());

    let clock = engine.clock();
    engine.spawn(async move {
        clock.wait_until(10).await;
        connect(&b0, 0, &b1, 0, 5);
        connect(&b0, 2, &b2, 2, 5);
        connect(&b0, 3, &b1, 3, 5);

        clock.wait_until(80).await;
        assert_eq!(lag_members(&b0, 0), vec![0x100, 0x103]);
        assert_eq!(lag_members(&b0, 2), vec![0x102]);

        // Park every aggregator except the first: b0 can now form exactly
        // one LAG
        clock.wait_until(100).await;
        b0.with_lag_mut(|lag| {
            for agg in &mut lag.aggregators {
                agg.set_admin_key(UNUSED_AGGREGATOR_KEY);
            }
            lag.aggregators[0].set_admin_key(DEFAULT_ACTOR_KEY);
        });

        clock.wait_until(150).await;
        // The b2 uplink loses its aggregator and goes down
        assert!(!b0.with_lag(|lag| lag.is_operational(2)));
        assert_eq!(lag_members(&b0, 0), vec![0x100, 0x103]);

        // Taking the b1 LAG down frees the aggregator for the b2 uplink
        clock.wait_until(200).await;
        disconnect(&b0, 0);
        clock.wait_until(300).await;
        disconnect(&b0, 3);

        clock.wait_until(350).await;
        assert_eq!(lag_members(&b0, 0), vec![0x102]);

        clock.wait_until(400).await;
        connect(&b0, 1, &b2, 1, 5);
        clock.wait_until(450).await;
        assert_eq!(lag_members(&b0, 0), vec![0x101, 0x102]);

        // Reconnecting a b1 link changes nothing: port 0x103 has no claim
        // on the occupied aggregator
        clock.wait_until(500).await;
        connect(&b0, 3, &b1, 3, 5);
        clock.wait_until(550).await;
        assert_eq!(lag_members(&b0, 0), vec![0x101, 0x102]);

        // But port 0x100 owns aggregator 0 by preference: its return
        // evicts the b2 LAG and brings the b1 LAG back up
        clock.wait_until(600).await;
        connect(&b0, 0, &b1, 0, 5);
        clock.wait_until(700).await;
        assert_eq!(lag_members(&b0, 0), vec![0x100, 0x103]);
        assert!(!b2.with_lag(|lag| lag.is_operational(1)));
        b0.with_lag(check_invariants);
        b1.with_lag(check_invariants);
        b2.with_lag(check_invariants);
        Ok(())
    });

    run_simulation!(engine);
}

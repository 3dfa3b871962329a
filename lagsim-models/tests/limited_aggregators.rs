// Copyright (c) 2025 Graphcore Ltd. All rights reserved.

//! Fewer matching aggregators than ports: keys confine LAGs to specific
//! aggregators, surplus ports take over free non-preferred aggregators and
//! exhaustion leaves ports unselected.

mod common;

use common::{bridges, check_invariants, lag_members};
use lagsim_engine::run_simulation;
use lagsim_engine::test_helpers::start_test;
use lagsim_models::device::{connect, disconnect};

const SPECIAL_KEY: u16 = 0x999;

#[test]
fn keys_steer_lags_to_matching_aggregators() {
    let mut engine = start_test(file!());
    let devices = bridges(&engine, 3, 8);
    let (b0, b1, b2) = (devices[0].clone(), devices[1].clone(), devices[2].clone());

    // Three ports but only two aggregators carry the special key
    b0.with_lag_mut(|lag| {
        for index in [1, 3, 5] {
            lag.ports[index].set_actor_admin_key(SPECIAL_KEY);
        }
        lag.aggregators[1].set_admin_key(SPECIAL_KEY);
        lag.aggregators[4].set_admin_key(SPECIAL_KEY);
    });

    let clock = engine.clock();
    engine.spawn(async move {
        clock.wait_until(10).await;
        connect(&b0, 0, &b1, 0, 5);
        clock.wait_until(100).await;
        connect(&b0, 1, &b1, 1, 5);

        clock.wait_until(150).await;
        // Different keys at the b0 end keep the links in separate LAGs
        assert_eq!(lag_members(&b0, 0), vec![0x100]);
        assert_eq!(lag_members(&b0, 1), vec![0x101]);

        clock.wait_until(200).await;
        connect(&b0, 3, &b1, 3, 5);
        clock.wait_until(300).await;
        connect(&b0, 5, &b1, 5, 5);

        clock.wait_until(350).await;
        assert_eq!(lag_members(&b0, 1), vec![0x101, 0x103, 0x105]);

        clock.wait_until(400).await;
        disconnect(&b0, 3);
        clock.wait_until(500).await;
        disconnect(&b0, 5);

        // A special-key port facing a new partner cannot use its preferred
        // aggregator (wrong key); it takes the free matching one
        clock.wait_until(600).await;
        connect(&b0, 3, &b2, 3, 5);
        clock.wait_until(650).await;
        assert_eq!(lag_members(&b0, 4), vec![0x103]);

        clock.wait_until(700).await;
        connect(&b0, 5, &b2, 5, 5);
        clock.wait_until(750).await;
        assert_eq!(lag_members(&b0, 4), vec![0x103, 0x105]);

        // A default-key port whose preferred aggregator carries the
        // special key falls through to the lowest free default aggregator
        clock.wait_until(800).await;
        connect(&b0, 4, &b2, 4, 5);
        clock.wait_until(850).await;
        assert_eq!(lag_members(&b0, 2), vec![0x104]);

        // A lower port joining that LAG keeps it on the same aggregator,
        // which is now the preferred one of the new lowest member
        clock.wait_until(900).await;
        connect(&b0, 2, &b2, 2, 5);
        clock.wait_until(960).await;
        assert_eq!(lag_members(&b0, 2), vec![0x102, 0x104]);
        b0.with_lag(check_invariants);
        b1.with_lag(check_invariants);
        b2.with_lag(check_invariants);
        Ok(())
    });

    run_simulation!(engine);
}

#[test]
fn no_matching_aggregator_means_no_lag() {
    let mut engine = start_test(file!());
    let devices = bridges(&engine, 2, 4);
    let (b0, b1) = (devices[0].clone(), devices[1].clone());

    // A port key no aggregator carries
    b0.with_lag_mut(|lag| lag.ports[2].set_actor_admin_key(SPECIAL_KEY));

    let clock = engine.clock();
    engine.spawn(async move {
        clock.wait_until(10).await;
        connect(&b0, 2, &b1, 2, 5);

        clock.wait_until(150).await;
        assert!(b0.with_lag(|lag| !lag.is_operational(2)));
        assert!(b0.with_lag(|lag| {
            use lagsim_models::lacp::port::Selected;
            lag.ports[2].selected == Selected::Unselected
        }));
        // The partner end sees no sync and never distributes either
        assert!(b1.with_lag(|lag| !lag.is_operational(2)));
        Ok(())
    });

    run_simulation!(engine);
}

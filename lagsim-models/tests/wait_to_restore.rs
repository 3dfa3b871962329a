// Copyright (c) 2025 Graphcore Ltd. All rights reserved.

//! Wait-to-restore: a restored port is held out of its LAG for the WTR
//! time, a second failure restarts the hold, and non-revertive ports stay
//! out until the administrative sweep returns them.

mod common;

use common::{bridges, check_invariants, lag_members, stations};
use lagsim_engine::run_simulation;
use lagsim_engine::test_helpers::start_test;
use lagsim_models::device::{connect, disconnect};
use lagsim_models::lacp::WTR_NON_REVERTIVE;

#[test]
fn wtr_delays_rejoin_and_restarts_on_second_failure() {
    let mut engine = start_test(file!());
    let devices = bridges(&engine, 1, 8);
    let b0 = devices[0].clone();
    let es3 = stations(&engine, 1, 4).remove(0);

    b0.with_lag_mut(|lag| {
        for port in &mut lag.ports {
            port.set_wtr_time(30);
        }
    });

    let clock = engine.clock();
    engine.spawn(async move {
        clock.wait_until(10).await;
        connect(&b0, 0, &es3, 0, 5);
        connect(&b0, 1, &es3, 1, 5);
        connect(&b0, 2, &es3, 2, 5);

        clock.wait_until(60).await;
        // First bring-up is not a restoration: no hold-off
        assert_eq!(lag_members(&b0, 0), vec![0x100, 0x101, 0x102]);
        assert_eq!(lag_members(&es3, 0), vec![0x100, 0x101, 0x102]);

        clock.wait_until(100).await;
        disconnect(&b0, 1);
        disconnect(&b0, 2);

        clock.wait_until(110).await;
        assert_eq!(lag_members(&b0, 0), vec![0x100]);
        assert!(b0.with_lag(|lag| lag.is_operational(0)));

        clock.wait_until(115).await;
        connect(&b0, 1, &es3, 1, 5);
        connect(&b0, 2, &es3, 2, 5);

        // The second link fails again mid-hold, restarting its timer
        clock.wait_until(120).await;
        disconnect(&b0, 2);
        clock.wait_until(125).await;
        connect(&b0, 2, &es3, 2, 5);

        clock.wait_until(143).await;
        // Both restored links are still held out of the LAG
        assert_eq!(lag_members(&b0, 0), vec![0x100]);

        clock.wait_until(151).await;
        // Port 1's hold (armed at 115) has expired and it is back; port
        // 2's hold was restarted at 125 and is still running
        assert_eq!(lag_members(&b0, 0), vec![0x100, 0x101]);

        clock.wait_until(175).await;
        assert_eq!(lag_members(&b0, 0), vec![0x100, 0x101, 0x102]);
        assert_eq!(lag_members(&es3, 0), vec![0x100, 0x101, 0x102]);
        b0.with_lag(check_invariants);
        es3.with_lag(check_invariants);
        Ok(())
    });

    run_simulation!(engine);
}

#[test]
fn non_revertive_ports_return_only_on_sweep() {
    let mut engine = start_test(file!());
    let devices = bridges(&engine, 1, 8);
    let b0 = devices[0].clone();
    let es3 = stations(&engine, 1, 4).remove(0);

    let clock = engine.clock();
    engine.spawn(async move {
        clock.wait_until(10).await;
        connect(&b0, 0, &es3, 0, 5);
        connect(&b0, 1, &es3, 1, 5);
        connect(&b0, 2, &es3, 2, 5);

        clock.wait_until(60).await;
        assert_eq!(lag_members(&b0, 0), vec![0x100, 0x101, 0x102]);

        // Switch every port to non-revertive mode
        clock.wait_until(200).await;
        b0.with_lag_mut(|lag| {
            for port in &mut lag.ports {
                port.set_wtr_time(30 | WTR_NON_REVERTIVE);
            }
        });

        clock.wait_until(210).await;
        disconnect(&b0, 1);
        disconnect(&b0, 2);
        clock.wait_until(225).await;
        connect(&b0, 1, &es3, 1, 5);
        connect(&b0, 2, &es3, 2, 5);

        clock.wait_until(300).await;
        // Non-revertive: the restored ports do not come back on their own
        assert_eq!(lag_members(&b0, 0), vec![0x100]);

        // The last active port failing means every contender is now held,
        // which sweeps the up ports back to revertive. With port 0x100
        // gone the survivors re-home onto port 0x101's preferred
        // aggregator.
        clock.wait_until(310).await;
        disconnect(&b0, 0);

        clock.wait_until(345).await;
        assert_eq!(lag_members(&b0, 1), vec![0x101, 0x102]);
        assert!(b0.with_lag(|lag| lag.is_operational(1)));
        assert!(!b0.with_lag(|lag| lag.is_operational(0)));

        // The swept-out port stays non-revertive: restoring it changes
        // nothing
        clock.wait_until(350).await;
        connect(&b0, 0, &es3, 0, 5);

        clock.wait_until(450).await;
        assert_eq!(lag_members(&b0, 1), vec![0x101, 0x102]);
        b0.with_lag(check_invariants);
        Ok(())
    });

    run_simulation!(engine);
}

// Copyright (c) 2025 Graphcore Ltd. All rights reserved.

use criterion::{BatchSize, Criterion, criterion_group, criterion_main};
use lagsim_engine::engine::Engine;
use lagsim_models::device::{Device, connect};
use lagsim_models::lacp::pdu::{Lacpdu, ParticipantInfo, STATE_ACTIVITY, STATE_SYNC, STATE_TIMEOUT};
use lagsim_models::types::{LagAlgorithm, PortId, SysId};
use lagsim_track::tracker::dev_null_tracker;
use rand::{Rng, SeedableRng, rngs::StdRng};

fn sample_pdus() -> Vec<Lacpdu> {
    let mut rng = StdRng::seed_from_u64(0x1a9);
    (0..512)
        .map(|_| Lacpdu {
            version: 2,
            actor: ParticipantInfo {
                system: SysId::new(rng.gen(), rng.gen::<u64>() & 0xffff_ffff_ffff),
                key: rng.gen(),
                port: PortId::new(0, rng.gen()),
                state: STATE_ACTIVITY | STATE_TIMEOUT | STATE_SYNC,
            },
            partner: ParticipantInfo {
                system: SysId::new(rng.gen(), rng.gen::<u64>() & 0xffff_ffff_ffff),
                key: rng.gen(),
                port: PortId::new(0, rng.gen()),
                state: STATE_ACTIVITY | STATE_SYNC,
            },
            collector_max_delay: 50,
            port_algorithm: Some(LagAlgorithm::CVid),
            conv_digest: Some([rng.gen(); 16]),
        })
        .collect()
}

fn bench_codec(c: &mut Criterion) {
    let mut group = c.benchmark_group("lacpdu");

    let pdus = sample_pdus();
    group.bench_function("encode", |b| {
        b.iter(|| {
            let mut total = 0;
            for pdu in &pdus {
                total += pdu.to_bytes().len();
            }
            total
        });
    });

    let encoded: Vec<Vec<u8>> = pdus.iter().map(Lacpdu::to_bytes).collect();
    group.bench_function("parse", |b| {
        b.iter(|| {
            let mut parsed = 0;
            for bytes in &encoded {
                if Lacpdu::from_bytes(bytes).is_some() {
                    parsed += 1;
                }
            }
            assert_eq!(parsed, encoded.len());
            parsed
        });
    });

    group.finish();
}

fn setup_lag_simulation() -> (Engine, std::rc::Rc<Device>) {
    // Create an engine without the tracker system writing anywhere
    let tracker = dev_null_tracker();
    let engine = Engine::new(&tracker);
    let top = engine.top().clone();
    let b0 = Device::new_bridge(&engine, &top, "b00", 4, 0xb00).unwrap();
    let b1 = Device::new_bridge(&engine, &top, "b01", 4, 0xb01).unwrap();

    let clock = engine.clock();
    let (b0_task, b1_task) = (b0.clone(), b1.clone());
    engine.spawn(async move {
        clock.wait_until(10).await;
        for mac in 0..4 {
            connect(&b0_task, mac, &b1_task, mac, 5);
        }
        clock.wait_until(300).await;
        Ok(())
    });
    (engine, b0)
}

fn run_lag_simulation(args: (Engine, std::rc::Rc<Device>)) {
    let (mut engine, b0) = args;
    engine.run().unwrap();
    assert!(b0.with_lag(|lag| lag.is_operational(0)));
}

fn bench_convergence(c: &mut Criterion) {
    let mut group = c.benchmark_group("lag_convergence");
    group.bench_function("four_links_300_ticks", |b| {
        b.iter_batched(setup_lag_simulation, run_lag_simulation, BatchSize::SmallInput);
    });
    group.finish();
}

criterion_group! {
    name = benches;
    config = Criterion::default();
    targets = bench_codec, bench_convergence
}
criterion_main!(benches);

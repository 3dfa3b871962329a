// Copyright (c) 2024 Graphcore Ltd. All rights reserved.

use std::cell::Cell;
use std::rc::Rc;

use async_trait::async_trait;
use lagsim_engine::test_helpers::start_test;
use lagsim_engine::traits::Runnable;
use lagsim_engine::types::SimResult;
use lagsim_engine::{run_simulation, sim_error};

struct Counter {
    runs: Cell<u32>,
}

#[async_trait(?Send)]
impl Runnable for Counter {
    async fn run(&self) -> SimResult {
        self.runs.set(self.runs.get() + 1);
        Ok(())
    }
}

#[test]
fn all_spawned() {
    let mut engine = start_test(file!());

    let first = Rc::new(Counter { runs: Cell::new(0) });
    let second = Rc::new(Counter { runs: Cell::new(0) });
    engine.register(first.clone());
    engine.register(second.clone());

    run_simulation!(engine);

    assert_eq!(first.runs.get(), 1);
    assert_eq!(second.runs.get(), 1);
}

#[test]
fn task_error_stops_simulation() {
    let mut engine = start_test(file!());
    let clock = engine.clock();

    engine.spawn(async move {
        clock.wait_ticks(3).await;
        sim_error!("deliberate failure")
    });

    run_simulation!(engine, "Error: deliberate failure");
}

#[test]
fn tasks_polled_in_spawn_order() {
    let mut engine = start_test(file!());

    let order = Rc::new(std::cell::RefCell::new(Vec::new()));
    for i in 0..4 {
        let order = order.clone();
        let clock = engine.clock();
        engine.spawn(async move {
            clock.wait_ticks(1).await;
            order.borrow_mut().push(i);
            Ok(())
        });
    }

    run_simulation!(engine);
    assert_eq!(*order.borrow(), vec![0, 1, 2, 3]);
}

// Copyright (c) 2024 Graphcore Ltd. All rights reserved.

//! Single-threaded deterministic executor.
//!
//! Tasks are polled in the order they were spawned, once per scheduling
//! round. Between rounds the executor advances the [`Clock`] to the next
//! tick for which any task is waiting. There are no threads and no
//! preemption, so a simulation run is reproducible.

use std::cell::RefCell;
use std::future::Future;
use std::pin::Pin;
use std::rc::Rc;
use std::task::{Context, Poll, RawWaker, RawWakerVTable, Waker};

use lagsim_track::entity::Entity;
use lagsim_track::set_time;

use crate::time::Clock;
use crate::types::SimResult;

fn no_op(_: *const ()) {}

fn task_raw_waker(task: Rc<Task>) -> RawWaker {
    let vtable = &RawWakerVTable::new(clone_raw_waker, wake_task, no_op, no_op);
    let ptr = Rc::into_raw(task) as *const ();
    RawWaker::new(ptr, vtable)
}

fn waker_for_task(task: Rc<Task>) -> Waker {
    unsafe { Waker::from_raw(task_raw_waker(task)) }
}

unsafe fn clone_raw_waker(data: *const ()) -> RawWaker {
    unsafe {
        // Tasks are always wrapped in a reference counter to allow them to be
        // shared read-only.
        let rc_task = Rc::from_raw(data as *const Task);
        let clone = rc_task.clone();
        let vtable = &RawWakerVTable::new(clone_raw_waker, wake_task, no_op, no_op);
        let ptr = Rc::into_raw(clone) as *const ();
        RawWaker::new(ptr, vtable)
    }
}

unsafe fn wake_task(data: *const ()) {
    unsafe {
        // Tasks are always wrapped in a reference counter to allow them to be
        // shared read-only.
        let rc_task = Rc::from_raw(data as *const Task);
        let cloned = rc_task.clone();
        rc_task.executor_state.new_tasks.borrow_mut().push(cloned);
    }
}

struct Task {
    future: RefCell<Pin<Box<dyn Future<Output = SimResult>>>>,
    executor_state: Rc<ExecutorState>,
}

impl Task {
    pub fn new(
        future: impl Future<Output = SimResult> + 'static,
        executor_state: Rc<ExecutorState>,
    ) -> Task {
        Task {
            future: RefCell::new(Box::pin(future)),
            executor_state,
        }
    }

    fn poll(&self, context: &mut Context) -> Poll<SimResult> {
        self.future.borrow_mut().as_mut().poll(context)
    }
}

struct ExecutorState {
    task_queue: RefCell<Vec<Rc<Task>>>,
    new_tasks: RefCell<Vec<Rc<Task>>>,
    clock: Clock,
}

impl ExecutorState {
    pub fn new() -> Self {
        Self {
            task_queue: RefCell::new(Vec::new()),
            new_tasks: RefCell::new(Vec::new()),
            clock: Clock::new(),
        }
    }
}

/// Single-threaded executor
///
/// This is a thin wrapper (using [`Rc`]) around the real executor, so that
/// this struct can be cloned and passed around.
#[derive(Clone)]
pub struct Executor {
    pub entity: Rc<Entity>,
    state: Rc<ExecutorState>,
}

impl Executor {
    pub fn spawn(&self, future: impl Future<Output = SimResult> + 'static) {
        self.state
            .new_tasks
            .borrow_mut()
            .push(Rc::new(Task::new(future, self.state.clone())));
    }

    pub fn run(&self, finished: &Rc<RefCell<bool>>) -> SimResult {
        loop {
            self.step(finished)?;
            if *finished.borrow() {
                break;
            }

            if self.state.new_tasks.borrow().is_empty() {
                if self.state.clock.shared_state.all_waiters_can_exit() {
                    // Every remaining task is a background loop
                    break;
                }
                match self.state.clock.shared_state.pop_next() {
                    Some((tick, wakers)) => {
                        // No runnable tasks left, advance time
                        set_time!(self.entity ; tick);
                        self.state.clock.set_now(tick);
                        for task_waker in wakers.into_iter() {
                            task_waker.waker.wake();
                        }
                    }
                    None => break,
                }
            }
        }
        Ok(())
    }

    pub fn step(&self, finished: &Rc<RefCell<bool>>) -> SimResult {
        // Append new tasks created since the last step into the task queue
        let mut task_queue = self.state.task_queue.borrow_mut();
        task_queue.append(&mut self.state.new_tasks.borrow_mut());

        // Loop over all tasks, polling them. A task that is not ready will
        // have parked itself on the clock or been re-queued by its waker.
        for task in task_queue.drain(..) {
            if *finished.borrow() {
                break;
            }

            // The waker re-queues the task via new_tasks when woken
            let waker = waker_for_task(task.clone());
            let mut context = Context::from_waker(&waker);

            match task.poll(&mut context) {
                Poll::Ready(Err(e)) => {
                    // Error - return early
                    return Err(e);
                }
                Poll::Ready(Ok(())) => {
                    // Otherwise, drop task as it is complete
                }
                Poll::Pending => {
                    // Task will have parked itself waiting somewhere
                }
            }
        }
        Ok(())
    }

    #[must_use]
    pub fn clock(&self) -> Clock {
        self.state.clock.clone()
    }

    #[must_use]
    pub fn tick_now(&self) -> u64 {
        self.state.clock.tick_now()
    }
}

/// `Spawner` spawns new futures into the executor.
#[derive(Clone)]
pub struct Spawner {
    state: Rc<ExecutorState>,
}

impl Spawner {
    pub fn spawn(&self, future: impl Future<Output = SimResult> + 'static) {
        self.state
            .new_tasks
            .borrow_mut()
            .push(Rc::new(Task::new(future, self.state.clone())));
    }
}

pub fn new_executor_and_spawner(top: &Rc<Entity>) -> (Executor, Spawner) {
    let state = Rc::new(ExecutorState::new());
    let entity = Rc::new(Entity::new(top, "executor"));
    (
        Executor {
            entity,
            state: state.clone(),
        },
        Spawner { state },
    )
}

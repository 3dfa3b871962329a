// Copyright (c) 2024 Graphcore Ltd. All rights reserved.

//! This module represents the time during a simulation.
//!
//! Time is a single global integer tick counter. One tick corresponds to one
//! LACP fast-periodic sub-unit; every timer in the simulation is expressed as
//! a whole number of ticks.

use std::cell::RefCell;
use std::future::Future;
use std::pin::Pin;
use std::rc::Rc;
use std::task::{Context, Poll, Waker};

/// A simulation tick count.
pub type Tick = u64;

/// A task parked on the clock waiting for its wake time.
pub struct TaskWaker {
    /// The Waker to use to make the task active again.
    pub waker: Waker,

    /// When a task is scheduled in the future it may be a background task
    /// that will simply run forever, in which case it sets `can_exit` so the
    /// simulation is allowed to finish without it.
    pub can_exit: bool,
}

/// Shared state between futures using a Clock and the Clock itself.
pub struct ClockState {
    now: RefCell<Tick>,

    /// Queue of futures waiting for the right time.
    waiting: RefCell<Vec<Vec<TaskWaker>>>,

    /// Queue of times at which those futures are to be woken. This is kept
    /// sorted descending so that the last entry is the next to be woken.
    waiting_times: RefCell<Vec<Tick>>,
}

impl ClockState {
    fn schedule(&self, schedule_time: Tick, cx: &mut Context<'_>, can_exit: bool) {
        let mut waiting_times = self.waiting_times.borrow_mut();
        let mut waiting = self.waiting.borrow_mut();
        let task_waker = TaskWaker {
            waker: cx.waker().clone(),
            can_exit,
        };
        if let Some(index) = waiting_times.iter().position(|&x| x == schedule_time) {
            // Time already exists, add this task
            waiting[index].push(task_waker);
        } else {
            // Time not found, insert at the correct location to keep the
            // descending order
            match waiting_times.iter().position(|&x| x < schedule_time) {
                Some(index) => {
                    waiting_times.insert(index, schedule_time);
                    waiting.insert(index, vec![task_waker]);
                }
                None => {
                    waiting_times.push(schedule_time);
                    waiting.push(vec![task_waker]);
                }
            };
        }
    }

    fn advance_time(&self, to_time: Tick) {
        if to_time != *self.now.borrow() {
            assert!(to_time >= *self.now.borrow(), "Time moving backwards");
            *self.now.borrow_mut() = to_time;
        }
    }

    /// Remove and return the next wake time and its waiters.
    pub(crate) fn pop_next(&self) -> Option<(Tick, Vec<TaskWaker>)> {
        let time = self.waiting_times.borrow_mut().pop()?;
        let wakers = self.waiting.borrow_mut().pop()?;
        Some((time, wakers))
    }

    /// The simulation can exit if all scheduled tasks can exit.
    pub(crate) fn all_waiters_can_exit(&self) -> bool {
        for waiting in self.waiting.borrow().iter() {
            for task_waker in waiting {
                if !task_waker.can_exit {
                    // Found one task that must be completed
                    return false;
                }
            }
        }
        true
    }
}

/// State representing the global tick clock.
#[derive(Clone)]
pub struct Clock {
    pub(crate) shared_state: Rc<ClockState>,
}

impl Clock {
    /// Create a new [Clock] starting at tick zero.
    #[must_use]
    pub fn new() -> Self {
        let shared_state = Rc::new(ClockState {
            now: RefCell::new(0),
            waiting: RefCell::new(Vec::new()),
            waiting_times: RefCell::new(Vec::new()),
        });

        Self { shared_state }
    }

    /// Returns the current [Tick].
    #[must_use]
    pub fn tick_now(&self) -> Tick {
        *self.shared_state.now.borrow()
    }

    pub(crate) fn set_now(&self, tick: Tick) {
        self.shared_state.advance_time(tick);
    }

    /// Returns a [ClockDelay] future which must be `await`ed to delay the
    /// specified number of ticks.
    #[must_use = "Futures do nothing unless you `.await` or otherwise use them"]
    pub fn wait_ticks(&self, ticks: Tick) -> ClockDelay {
        ClockDelay {
            shared_state: self.shared_state.clone(),
            until: self.tick_now() + ticks,
            state: ClockDelayState::Pending,
            can_exit: false,
        }
    }

    /// Returns a [ClockDelay] future which must be `await`ed to delay the
    /// specified number of ticks. However, if the remainder of the simulation
    /// completes then this future is allowed to not complete. This allows the
    /// user to create tasks that can run continuously as long as the rest of
    /// the simulation continues to run.
    #[must_use = "Futures do nothing unless you `.await` or otherwise use them"]
    pub fn wait_ticks_or_exit(&self, ticks: Tick) -> ClockDelay {
        ClockDelay {
            shared_state: self.shared_state.clone(),
            until: self.tick_now() + ticks,
            state: ClockDelayState::Pending,
            can_exit: true,
        }
    }

    /// Returns a [ClockDelay] future that completes at the given absolute
    /// tick, which must not be in the past.
    #[must_use = "Futures do nothing unless you `.await` or otherwise use them"]
    pub fn wait_until(&self, tick: Tick) -> ClockDelay {
        assert!(tick >= self.tick_now(), "Time going backwards");
        ClockDelay {
            shared_state: self.shared_state.clone(),
            until: tick,
            state: ClockDelayState::Pending,
            can_exit: false,
        }
    }
}

impl Default for Clock {
    fn default() -> Self {
        Self::new()
    }
}

/// Possible states of a ClockDelay.
enum ClockDelayState {
    Pending,
    Running,
}

/// Future returned by the clock to manage advancing time using async
/// functions.
pub struct ClockDelay {
    shared_state: Rc<ClockState>,
    until: Tick,
    state: ClockDelayState,
    can_exit: bool,
}

impl Future for ClockDelay {
    type Output = ();
    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        match self.state {
            ClockDelayState::Pending => {
                if self.until == *self.shared_state.now.borrow() {
                    // Zero-length delay, nothing to schedule
                    return Poll::Ready(());
                }
                self.shared_state.schedule(self.until, cx, self.can_exit);
                self.state = ClockDelayState::Running;
                Poll::Pending
            }
            ClockDelayState::Running => {
                self.shared_state.advance_time(self.until);
                Poll::Ready(())
            }
        }
    }
}

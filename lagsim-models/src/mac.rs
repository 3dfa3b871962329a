// Copyright (c) 2025 Graphcore Ltd. All rights reserved.

//! MAC endpoints and the point-to-point links between them.
//!
//! A [`Link`] is a pair of FIFO queues of frames in flight, one per
//! direction, shared by the two attached [`Mac`]s. A frame enqueued at tick
//! `T` on a link with propagation delay `D` becomes receivable at `T + D`,
//! observable on the peer's next device tick. Links are the only
//! runtime-mutable topology: they can be attached, broken and re-attached
//! while the simulation runs, and a break is observed by both ends within a
//! tick through the shared `up` flag.

use std::cell::{Cell, RefCell};
use std::collections::VecDeque;
use std::rc::Rc;

use lagsim_engine::time::Tick;
use lagsim_model_builder::EntityDisplay;
use lagsim_track::entity::Entity;
use lagsim_track::id::Unique;
use lagsim_track::{debug, enter, exit, trace};

use crate::frame::Frame;

/// Frames in flight in one direction.
struct Pipe {
    queue: RefCell<VecDeque<(Frame, Tick)>>,
}

impl Pipe {
    fn new() -> Self {
        Self {
            queue: RefCell::new(VecDeque::new()),
        }
    }
}

/// Shared state of a point-to-point link.
pub struct Link {
    delay: Tick,
    up: Cell<bool>,
    /// `pipes[s]` carries frames transmitted by side `s`.
    pipes: [Pipe; 2],
}

impl Link {
    #[must_use]
    pub fn new(delay: Tick) -> Rc<Self> {
        // A zero delay would make delivery order depend on device iteration
        // order within the tick
        let delay = delay.max(1);
        Rc::new(Self {
            delay,
            up: Cell::new(true),
            pipes: [Pipe::new(), Pipe::new()],
        })
    }

    pub fn take_down(&self) {
        self.up.set(false);
        self.pipes[0].queue.borrow_mut().clear();
        self.pipes[1].queue.borrow_mut().clear();
    }

    #[must_use]
    pub fn is_up(&self) -> bool {
        self.up.get()
    }
}

/// How a MAC is attached to a link.
enum Attachment {
    /// One end of a two-ended link.
    Side { link: Rc<Link>, side: usize },
    /// Both ends of the same link: a same-port loopback. Transmitted frames
    /// come back to this MAC after the propagation delay.
    SelfLoop { link: Rc<Link> },
}

impl Attachment {
    fn link(&self) -> &Rc<Link> {
        match self {
            Attachment::Side { link, .. } => link,
            Attachment::SelfLoop { link } => link,
        }
    }
}

/// Counters kept by each MAC, used by scenario assertions.
#[derive(Clone, Copy, Debug, Default)]
pub struct MacStats {
    pub tx_frames: u64,
    pub rx_frames: u64,
    /// Received frames that were not Slow Protocols PDUs.
    pub rx_data_frames: u64,
}

#[derive(EntityDisplay)]
pub struct Mac {
    pub entity: Rc<Entity>,
    /// 48-bit address of this MAC.
    pub addr: u64,
    attachment: Option<Attachment>,
    tx_queue: VecDeque<Frame>,
    pub stats: MacStats,
}

impl Mac {
    #[must_use]
    pub fn new(parent: &Rc<Entity>, name: &str, addr: u64) -> Self {
        Self {
            entity: Rc::new(Entity::new(parent, name)),
            addr,
            attachment: None,
            tx_queue: VecDeque::new(),
            stats: MacStats::default(),
        }
    }

    /// True when a link is attached and has not gone down.
    #[must_use]
    pub fn enabled(&self) -> bool {
        match &self.attachment {
            Some(attachment) => attachment.link().is_up(),
            None => false,
        }
    }

    /// Attach one side of `link`. Any existing link is broken first, which
    /// the old peer observes through the shared state.
    pub fn attach(&mut self, link: Rc<Link>, side: usize) {
        self.break_link();
        debug!(self.entity ; "link attached (side {side})");
        self.attachment = Some(Attachment::Side { link, side });
    }

    /// Attach both ends of `link` to this MAC (same-port loopback).
    pub fn attach_self_loop(&mut self, link: Rc<Link>) {
        self.break_link();
        debug!(self.entity ; "self-loopback attached");
        self.attachment = Some(Attachment::SelfLoop { link });
    }

    /// Break the attached link, if any. The peer sees the link go down.
    pub fn break_link(&mut self) {
        if let Some(attachment) = self.attachment.take() {
            debug!(self.entity ; "link down");
            attachment.link().take_down();
        }
        self.tx_queue.clear();
    }

    /// Drop any frames currently in flight on the attached link, in both
    /// directions. The link itself stays up.
    pub fn reset(&mut self) {
        if let Some(attachment) = &self.attachment {
            let link = attachment.link();
            link.pipes[0].queue.borrow_mut().clear();
            link.pipes[1].queue.borrow_mut().clear();
            debug!(self.entity ; "link reset, frames in flight dropped");
        }
    }

    /// Queue a frame for transmission at the end of this device tick.
    pub fn enqueue_tx(&mut self, frame: Frame) {
        self.tx_queue.push_back(frame);
    }

    /// Move queued frames onto the link.
    pub fn transmit(&mut self, now: Tick) {
        if self.tx_queue.is_empty() {
            return;
        }
        let Some(attachment) = &self.attachment else {
            self.tx_queue.clear();
            return;
        };
        let link = attachment.link();
        if !link.is_up() {
            self.tx_queue.clear();
            return;
        }
        let pipe = match attachment {
            Attachment::Side { side, .. } => &link.pipes[*side],
            Attachment::SelfLoop { .. } => &link.pipes[0],
        };
        for frame in self.tx_queue.drain(..) {
            exit!(self.entity ; frame.id());
            trace!(self.entity ; "tx {frame}");
            self.stats.tx_frames += 1;
            pipe.queue.borrow_mut().push_back((frame, now + link.delay));
        }
    }

    /// Collect frames that have completed their propagation delay. A MAC
    /// whose link went down drops the attachment here, so both ends settle
    /// within a tick of a disconnection.
    pub fn poll_rx(&mut self, now: Tick) -> Vec<Frame> {
        let up = match &self.attachment {
            Some(attachment) => attachment.link().is_up(),
            None => return Vec::new(),
        };
        if !up {
            debug!(self.entity ; "link down observed");
            self.attachment = None;
            return Vec::new();
        }

        let attachment = self.attachment.as_ref().unwrap();
        let link = attachment.link();
        let pipe = match attachment {
            Attachment::Side { side, .. } => &link.pipes[1 - *side],
            Attachment::SelfLoop { .. } => &link.pipes[0],
        };

        let mut received = Vec::new();
        let mut queue = pipe.queue.borrow_mut();
        while let Some((_, due)) = queue.front() {
            if *due > now {
                break;
            }
            let (mut frame, _) = queue.pop_front().unwrap();
            frame.arrived = now;
            enter!(self.entity ; frame.id());
            self.stats.rx_frames += 1;
            if frame.ether_type != crate::frame::SLOW_PROTOCOLS_ETHERTYPE {
                self.stats.rx_data_frames += 1;
            }
            received.push(frame);
        }
        received
    }
}

#[cfg(test)]
mod tests {
    use lagsim_track::entity::toplevel;
    use lagsim_track::test_helpers::create_tracker;

    use super::*;
    use crate::frame::{Frame, TEST_DATA_ETHERTYPE};

    fn two_macs() -> (Mac, Mac) {
        let tracker = create_tracker(file!());
        let top = toplevel(&tracker, "top");
        let a = Mac::new(&top, "mac_a", 0xa);
        let b = Mac::new(&top, "mac_b", 0xb);
        (a, b)
    }

    #[test]
    fn delivery_after_delay() {
        let (mut a, mut b) = two_macs();
        let link = Link::new(5);
        a.attach(link.clone(), 0);
        b.attach(link, 1);

        let frame = Frame::new(&a.entity, 0xdead, 0xa, TEST_DATA_ETHERTYPE);
        a.enqueue_tx(frame);
        a.transmit(10);

        assert!(b.poll_rx(14).is_empty());
        let arrived = b.poll_rx(15);
        assert_eq!(arrived.len(), 1);
        assert_eq!(arrived[0].arrived, 15);
        assert_eq!(b.stats.rx_data_frames, 1);
    }

    #[test]
    fn break_observed_by_peer() {
        let (mut a, mut b) = two_macs();
        let link = Link::new(2);
        a.attach(link.clone(), 0);
        b.attach(link, 1);

        assert!(b.enabled());
        a.break_link();
        assert!(!b.enabled());

        // The peer drops its attachment on the next poll
        assert!(b.poll_rx(1).is_empty());
        assert!(!b.enabled());
    }

    #[test]
    fn self_loop_returns_frames() {
        let (mut a, _) = two_macs();
        a.attach_self_loop(Link::new(3));

        let frame = Frame::new(&a.entity, 0xdead, 0xa, TEST_DATA_ETHERTYPE);
        a.enqueue_tx(frame);
        a.transmit(0);

        assert!(a.poll_rx(2).is_empty());
        assert_eq!(a.poll_rx(3).len(), 1);
    }

    #[test]
    fn reattach_breaks_previous_link() {
        let (mut a, mut b) = two_macs();
        let link = Link::new(1);
        a.attach(link.clone(), 0);
        b.attach(link, 1);

        // Attaching a new link implicitly downs the old one
        a.attach(Link::new(1), 0);
        assert!(b.poll_rx(1).is_empty());
        assert!(!b.enabled());
    }

    #[test]
    fn reset_drops_frames_in_flight() {
        let (mut a, mut b) = two_macs();
        let link = Link::new(5);
        a.attach(link.clone(), 0);
        b.attach(link, 1);

        let frame = Frame::new(&a.entity, 0xdead, 0xa, TEST_DATA_ETHERTYPE);
        a.enqueue_tx(frame);
        a.transmit(0);
        b.reset();

        // The frame in flight is gone but the link stays usable
        assert!(b.poll_rx(5).is_empty());
        assert!(a.enabled() && b.enabled());

        let frame = Frame::new(&a.entity, 0xdead, 0xa, TEST_DATA_ETHERTYPE);
        a.enqueue_tx(frame);
        a.transmit(6);
        assert_eq!(b.poll_rx(11).len(), 1);
    }

    #[test]
    fn zero_delay_is_clamped() {
        let (mut a, mut b) = two_macs();
        let link = Link::new(0);
        a.attach(link.clone(), 0);
        b.attach(link, 1);

        let frame = Frame::new(&a.entity, 0xdead, 0xa, TEST_DATA_ETHERTYPE);
        a.enqueue_tx(frame);
        a.transmit(7);

        // Never observable in the same tick it was sent
        assert!(b.poll_rx(7).is_empty());
        assert_eq!(b.poll_rx(8).len(), 1);
    }
}

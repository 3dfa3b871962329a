// Copyright (c) 2025 Graphcore Ltd. All rights reserved.

//! Simulated network devices.
//!
//! A device owns its MACs, one link aggregation shim and a client layer (a
//! minimal flooding bridge or a test-frame end station). Each device is one
//! engine component; its task performs the per-tick sequence: decrement
//! timers, deliver received frames, run the protocol machines to a fixed
//! point, relay client traffic, then drain the MAC transmit queues.

use std::cell::RefCell;
use std::rc::Rc;

use async_trait::async_trait;
use lagsim_engine::engine::Engine;
use lagsim_engine::time::{Clock, Tick};
use lagsim_engine::traits::Runnable;
use lagsim_engine::types::{SimError, SimResult};
use lagsim_model_builder::EntityDisplay;
use lagsim_track::entity::Entity;
use lagsim_track::trace;

use crate::drni::relay::{DistRelayConfig, RelayClient};
use crate::frame::{Frame, TEST_DATA_ETHERTYPE, VlanTag};
use crate::lacp::aggregator::AggClient;
use crate::linkagg::{Delivery, Iss, LinkAgg};
use crate::mac::{Link, Mac, MacStats};
use crate::types::SysId;

/// Destination address used by generated test frames.
pub const TEST_FRAME_DA: u64 = 0x00aa_bbcc_ddee;

/// A minimal bridge relay: floods frames received on one port to every
/// other port with an attached ISS. No learning, no spanning tree.
pub struct Bridge {
    pub entity: Rc<Entity>,
    pub port_iss: Vec<Iss>,
}

/// One frame as seen by an end station, kept for scenario assertions.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ReceivedRecord {
    pub tick: Tick,
    pub sa: u64,
    pub vid: Option<u16>,
}

/// An end station: generates test frames into its single ISS and records
/// what it receives.
pub struct EndStation {
    pub entity: Rc<Entity>,
    pub iss: Iss,
    received: Vec<ReceivedRecord>,
    pending: Vec<Frame>,
}

pub enum Client {
    Bridge(Bridge),
    Station(EndStation),
}

pub struct DeviceState {
    pub macs: Vec<Mac>,
    pub lag: LinkAgg,
    pub client: Client,
}

#[derive(EntityDisplay)]
pub struct Device {
    pub entity: Rc<Entity>,
    clock: Clock,
    state: RefCell<DeviceState>,
}

impl Device {
    /// Build a bridge device with `num_macs` MACs, one aggregation port and
    /// one bridge port per MAC.
    pub fn new_bridge(
        engine: &Engine,
        parent: &Rc<Entity>,
        name: &str,
        num_macs: usize,
        addr: u64,
    ) -> Result<Rc<Self>, SimError> {
        let rc_self = Self::build(engine, parent, name, num_macs, addr, true);
        engine.register(rc_self.clone());
        Ok(rc_self)
    }

    /// Build an end-station device attached to its first aggregator.
    pub fn new_station(
        engine: &Engine,
        parent: &Rc<Entity>,
        name: &str,
        num_macs: usize,
        addr: u64,
    ) -> Result<Rc<Self>, SimError> {
        let rc_self = Self::build(engine, parent, name, num_macs, addr, false);
        engine.register(rc_self.clone());
        Ok(rc_self)
    }

    fn build(
        engine: &Engine,
        parent: &Rc<Entity>,
        name: &str,
        num_macs: usize,
        addr: u64,
        bridge: bool,
    ) -> Rc<Self> {
        let entity = Rc::new(Entity::new(parent, name));
        let system = SysId::new(0, addr);

        let macs = (0..num_macs)
            .map(|i| Mac::new(&entity, &format!("mac{i}"), (addr << 8) | i as u64))
            .collect();
        let mut lag = LinkAgg::new(&entity, num_macs, system, 2);

        let client = if bridge {
            for (i, agg) in lag.aggregators.iter_mut().enumerate() {
                agg.client = AggClient::BridgePort(i);
            }
            Client::Bridge(Bridge {
                entity: Rc::new(Entity::new(&entity, "bridge")),
                port_iss: (0..num_macs).map(Iss::Aggregator).collect(),
            })
        } else {
            lag.aggregators[0].client = AggClient::Station;
            Client::Station(EndStation {
                entity: Rc::new(Entity::new(&entity, "endstn")),
                iss: Iss::Aggregator(0),
                received: Vec::new(),
                pending: Vec::new(),
            })
        };

        Rc::new(Self {
            entity,
            clock: engine.clock(),
            state: RefCell::new(DeviceState { macs, lag, client }),
        })
    }

    /// The system identifier this device uses as a standalone LACP actor.
    #[must_use]
    pub fn system(&self) -> SysId {
        self.state.borrow().lag.ports[0].actor_admin_system
    }

    /// Run a closure against the aggregation shim.
    pub fn with_lag<R>(&self, f: impl FnOnce(&LinkAgg) -> R) -> R {
        f(&self.state.borrow().lag)
    }

    /// Run a closure against the aggregation shim, mutably. Management
    /// scenarios use this for their admin writes.
    pub fn with_lag_mut<R>(&self, f: impl FnOnce(&mut LinkAgg) -> R) -> R {
        f(&mut self.state.borrow_mut().lag)
    }

    #[must_use]
    pub fn mac_stats(&self, mac: usize) -> MacStats {
        self.state.borrow().macs[mac].stats
    }

    /// Drop frames in flight on a MAC's link without taking it down.
    pub fn reset_mac(&self, mac: usize) {
        self.state.borrow_mut().macs[mac].reset();
    }

    /// Create a distributed relay on `agg_index` and rewire the client
    /// stack the way a portal system is configured: the client port above
    /// the relay's aggregator talks to the relay, the surplus DRNI ports
    /// and the intra-portal MACs leave the client stack entirely.
    pub fn configure_drni(&self, agg_index: usize, ipp_macs: &[usize], config: DistRelayConfig) {
        let state = &mut *self.state.borrow_mut();
        let client = match &mut state.client {
            Client::Bridge(bridge) => {
                bridge.port_iss[agg_index] = Iss::Relay(agg_index);
                for offset in 1..config.num_drni_ports {
                    bridge.port_iss[agg_index + offset] = Iss::None;
                }
                for &mac in ipp_macs {
                    bridge.port_iss[mac] = Iss::None;
                }
                RelayClient::BridgePort(agg_index)
            }
            Client::Station(station) => {
                station.iss = Iss::Relay(agg_index);
                RelayClient::Station
            }
        };
        state.lag.config_dist_relay(agg_index, ipp_macs, &config, client);
    }

    /// Queue an untagged (or VLAN-tagged) test frame for transmission from
    /// this end station on its next tick.
    pub fn generate_test_frame(&self, tag: Option<VlanTag>) {
        let state = &mut *self.state.borrow_mut();
        let Client::Station(station) = &mut state.client else {
            panic!("test frames can only be generated by end stations");
        };
        let sa = state.lag.ports[0].actor_admin_system.addr;
        let mut frame = Frame::new(&station.entity, TEST_FRAME_DA, sa, TEST_DATA_ETHERTYPE)
            .set_body(b"lagsim test frame".to_vec());
        if let Some(tag) = tag {
            frame = frame.set_tag(tag);
        }
        station.pending.push(frame);
    }

    /// Frames received by this end station so far.
    #[must_use]
    pub fn station_received(&self) -> Vec<ReceivedRecord> {
        match &self.state.borrow().client {
            Client::Station(station) => station.received.clone(),
            Client::Bridge(_) => Vec::new(),
        }
    }

    fn tick(&self) -> SimResult {
        let now = self.clock.tick_now();
        let state = &mut *self.state.borrow_mut();

        state.lag.timer_tick();

        let mut deliveries = Vec::new();
        for mac_index in 0..state.macs.len() {
            let frames = state.macs[mac_index].poll_rx(now);
            for frame in frames {
                state
                    .lag
                    .receive_frame(&mut state.macs, mac_index, frame, &mut deliveries);
            }
        }

        state.lag.run(&mut state.macs, now);

        match &mut state.client {
            Client::Bridge(bridge) => {
                for delivery in deliveries {
                    let Delivery::BridgePort(in_port, frame) = delivery else {
                        continue;
                    };
                    trace!(bridge.entity ; "flooding {frame} from port {in_port}");
                    for out_port in 0..bridge.port_iss.len() {
                        let iss = bridge.port_iss[out_port];
                        if out_port != in_port && iss != Iss::None {
                            state.lag.transmit_down(&mut state.macs, iss, frame.clone());
                        }
                    }
                }
            }
            Client::Station(station) => {
                for delivery in deliveries {
                    let (Delivery::Station(frame) | Delivery::BridgePort(_, frame)) = delivery;
                    station.received.push(ReceivedRecord {
                        tick: now,
                        sa: frame.sa,
                        vid: frame.tag.map(|t| t.vid),
                    });
                }
                for frame in station.pending.drain(..) {
                    state.lag.transmit_down(&mut state.macs, station.iss, frame);
                }
            }
        }

        for mac in &mut state.macs {
            mac.transmit(now);
        }
        Ok(())
    }
}

#[async_trait(?Send)]
impl Runnable for Device {
    async fn run(&self) -> SimResult {
        loop {
            self.clock.wait_ticks_or_exit(1).await;
            self.tick()?;
        }
    }
}

/// Connect two MACs with a link of the given propagation delay. The MACs
/// may live in the same device, or be the same MAC (same-port loopback).
pub fn connect(a: &Device, mac_a: usize, b: &Device, mac_b: usize, delay: Tick) {
    let link = Link::new(delay);
    if std::ptr::eq(a, b) {
        let state = &mut *a.state.borrow_mut();
        if mac_a == mac_b {
            state.macs[mac_a].attach_self_loop(link);
        } else {
            state.macs[mac_a].attach(link.clone(), 0);
            state.macs[mac_b].attach(link, 1);
        }
    } else {
        a.state.borrow_mut().macs[mac_a].attach(link.clone(), 0);
        b.state.borrow_mut().macs[mac_b].attach(link, 1);
    }
}

/// Break the link attached to a MAC. The peer observes the break within a
/// tick.
pub fn disconnect(device: &Device, mac: usize) {
    device.state.borrow_mut().macs[mac].break_link();
}

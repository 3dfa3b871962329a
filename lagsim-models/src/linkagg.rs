// Copyright (c) 2025 Graphcore Ltd. All rights reserved.

//! The Link Aggregation shim of a device.
//!
//! Owns the aggregation ports, the aggregators and any distributed relays,
//! and runs the per-tick sequence of the protocol: timers, receive
//! machines, selection, the remaining port machines to a fixed point, the
//! DRCP machines and finally transmission. Cross-references between ports,
//! aggregators and relays are indices into the arrays owned here.

use std::rc::Rc;

use lagsim_engine::time::Tick;
use lagsim_model_builder::EntityDisplay;
use lagsim_track::entity::Entity;
use lagsim_track::{debug, trace, warn};

use crate::drni::pdu::{DRCP_SUBTYPE, Drcpdu, HomeLink};
use crate::drni::relay::{DistRelayConfig, DistributedRelay, RelayClient, RelayVerdict};
use crate::frame::{DRCP_DA, Frame, SLOW_PROTOCOLS_ETHERTYPE};
use crate::lacp::aggregator::{AggClient, Aggregator};
use crate::lacp::distribution::conversation_id;
use crate::lacp::pdu::{LACP_SUBTYPE, Lacpdu};
use crate::lacp::port::{AggPort, AggPortLower, Selected};
use crate::lacp::WTR_NON_REVERTIVE;
use crate::lacp::selection::run_selection;
use crate::mac::Mac;
use crate::types::SysId;

/// A frame handed up to the device's client layer.
#[derive(Debug)]
pub enum Delivery {
    BridgePort(usize, Frame),
    Station(Frame),
}

/// What sits below a bridge port or station on the ISS stack.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Iss {
    Mac(usize),
    Aggregator(usize),
    Relay(usize),
    None,
}

#[derive(EntityDisplay)]
pub struct LinkAgg {
    pub entity: Rc<Entity>,
    pub ports: Vec<AggPort>,
    pub aggregators: Vec<Aggregator>,
    /// Indexed like `aggregators`; a relay replaces its aggregator on the
    /// client-facing side of the stack.
    pub relays: Vec<Option<DistributedRelay>>,
}

impl LinkAgg {
    #[must_use]
    pub fn new(parent: &Rc<Entity>, num_ports: usize, system: SysId, lacp_version: u8) -> Self {
        let entity = Rc::new(Entity::new(parent, "lag"));
        let ports = (0..num_ports)
            .map(|i| AggPort::new(&entity, i, system, lacp_version))
            .collect();
        let aggregators = (0..num_ports)
            .map(|i| Aggregator::new(&entity, i, system))
            .collect();
        let relays = (0..num_ports).map(|_| None).collect();
        Self {
            entity,
            ports,
            aggregators,
            relays,
        }
    }

    /// Create a distributed relay on the given aggregator, renumbering the
    /// DRNI ports and detaching the bridge-facing MACs from LACP as the
    /// portal wiring requires.
    pub fn config_dist_relay(
        &mut self,
        agg_index: usize,
        ipp_macs: &[usize],
        config: &DistRelayConfig,
        client: RelayClient,
    ) {
        let home_system = self.aggregators[agg_index].actor_admin_system;
        let home_key = self.aggregators[agg_index].admin_key;
        let mut relay = DistributedRelay::new(
            &self.entity,
            agg_index,
            home_system,
            home_key,
            ipp_macs,
            config,
        );
        relay.client = client;

        for offset in 0..config.num_drni_ports {
            let port_index = agg_index + offset;
            let port = &mut self.ports[port_index];
            port.set_actor_admin_key(home_key);
            port.set_link_number(config.first_link_number + offset as u16);
            relay.port_indices.push(port_index);
        }
        // The IPP MACs no longer run LACP
        for &mac in ipp_macs {
            if let Some(port) = self.ports.iter_mut().find(|p| p.lower == AggPortLower::Mac(mac)) {
                port.lower = AggPortLower::None;
            }
        }

        self.aggregators[agg_index].client = AggClient::Relay(agg_index);
        self.aggregators[agg_index].discard_wrong_conversation_admin =
            config.discard_wrong_conversation;
        self.relays[agg_index] = Some(relay);
    }

    #[must_use]
    pub fn port_for_mac(&self, mac: usize) -> Option<usize> {
        self.ports
            .iter()
            .position(|p| p.lower == AggPortLower::Mac(mac))
    }

    #[must_use]
    pub fn relay_for_ipp(&self, mac: usize) -> Option<usize> {
        self.relays.iter().position(|r| {
            r.as_ref()
                .map(|relay| relay.ipps.iter().any(|ipp| ipp.mac_index == mac))
                .unwrap_or(false)
        })
    }

    /// Ports attached to an aggregator, in port-number order.
    #[must_use]
    pub fn members_of(&self, agg_index: usize) -> Vec<usize> {
        let mut members: Vec<usize> = self
            .ports
            .iter()
            .enumerate()
            .filter(|(_, p)| p.attached == Some(agg_index))
            .map(|(i, _)| i)
            .collect();
        members.sort_by_key(|&i| self.ports[i].port_id.id());
        members
    }

    /// True iff any attached port is distributing.
    #[must_use]
    pub fn is_operational(&self, agg_index: usize) -> bool {
        self.ports
            .iter()
            .any(|p| p.attached == Some(agg_index) && p.is_distributing())
    }

    /// Port numbers of the distributing members, for scenario assertions.
    #[must_use]
    pub fn distributing_port_numbers(&self, agg_index: usize) -> Vec<u16> {
        let mut numbers: Vec<u16> = self
            .ports
            .iter()
            .filter(|p| p.attached == Some(agg_index) && p.is_distributing())
            .map(|p| p.port_id.number)
            .collect();
        numbers.sort_unstable();
        numbers
    }

    pub fn timer_tick(&mut self) {
        for port in &mut self.ports {
            port.timer_tick();
        }
        for relay in self.relays.iter_mut().flatten() {
            relay.timer_tick();
        }
    }

    /// Deliver one received frame into the shim: protocol PDUs to their
    /// machines, data frames up the collection path.
    pub fn receive_frame(
        &mut self,
        macs: &mut [Mac],
        mac_index: usize,
        frame: Frame,
        out: &mut Vec<Delivery>,
    ) {
        if frame.is_slow_protocol(LACP_SUBTYPE) {
            if let Some(port_index) = self.port_for_mac(mac_index) {
                if frame.da == self.ports[port_index].protocol_da {
                    match Lacpdu::from_bytes(&frame.body) {
                        Some(pdu) => self.ports[port_index].rx_pdus.push(pdu),
                        None => {
                            trace!(self.entity ; "malformed LACPDU on mac{mac_index} dropped")
                        }
                    }
                    return;
                }
            }
            // Not for a port of ours at this address: fall through to the
            // data path so stacked shims can pick it up
        }

        if frame.is_slow_protocol(DRCP_SUBTYPE) && frame.da == DRCP_DA {
            if let Some(relay_index) = self.relay_for_ipp(mac_index) {
                let relay = self.relays[relay_index].as_mut().unwrap();
                let ipp = relay
                    .ipps
                    .iter_mut()
                    .find(|ipp| ipp.mac_index == mac_index)
                    .unwrap();
                match Drcpdu::from_bytes(&frame.body) {
                    Some(pdu) => ipp.rx_pdus.push(pdu),
                    None => trace!(self.entity ; "malformed DRCPDU on mac{mac_index} dropped"),
                }
            }
            return;
        }

        // Data over an intra-portal link
        if let Some(relay_index) = self.relay_for_ipp(mac_index) {
            let relay = self.relays[relay_index].as_ref().unwrap();
            let conv_id = conversation_id(&frame, relay.gateway_algorithm);
            let agg_index = relay.agg_index;
            match relay.frame_from_ipp(conv_id) {
                RelayVerdict::Client => self.deliver_to_relay_client(relay_index, frame, out),
                RelayVerdict::Aggregator => self.aggregator_transmit(macs, agg_index, frame),
                _ => trace!(self.entity ; "ipp data frame with no destination dropped"),
            }
            return;
        }

        // Collection path
        let Some(port_index) = self.port_for_mac(mac_index) else {
            return;
        };
        self.collect(macs, port_index, frame, out);
    }

    /// Collect a frame arriving on an aggregation port.
    fn collect(
        &mut self,
        macs: &mut [Mac],
        port_index: usize,
        frame: Frame,
        out: &mut Vec<Delivery>,
    ) {
        let port = &self.ports[port_index];
        if !port.is_collecting() {
            trace!(port.entity ; "frame dropped, not collecting");
            return;
        }
        let Some(agg_index) = port.attached else {
            return;
        };
        let agg = &self.aggregators[agg_index];
        let conv_id = conversation_id(&frame, agg.port_algorithm);
        if agg.discard_wrong_conversation && agg.conversation_link(conv_id) != port.link_number {
            debug!(agg.entity ; "conversation {conv_id:#x} discarded on wrong link {}",
                port.link_number);
            return;
        }

        match agg.client {
            AggClient::BridgePort(bridge_port) => out.push(Delivery::BridgePort(bridge_port, frame)),
            AggClient::Station => out.push(Delivery::Station(frame)),
            AggClient::Relay(relay_index) => {
                let relay = self.relays[relay_index].as_ref().unwrap();
                let conv_id = conversation_id(&frame, relay.gateway_algorithm);
                match relay.frame_from_aggregator(conv_id) {
                    RelayVerdict::Client => self.deliver_to_relay_client(relay_index, frame, out),
                    RelayVerdict::Ipp => self.forward_on_ipp(macs, relay_index, frame),
                    _ => trace!(self.entity ; "frame with no gateway dropped"),
                }
            }
            AggClient::OuterPort(outer) => {
                // Hierarchical aggregation: the inner aggregator is the
                // outer port's link
                if frame.is_slow_protocol(LACP_SUBTYPE)
                    && frame.da == self.ports[outer].protocol_da
                {
                    if let Some(pdu) = Lacpdu::from_bytes(&frame.body) {
                        self.ports[outer].rx_pdus.push(pdu);
                    }
                } else {
                    self.collect(macs, outer, frame, out);
                }
            }
            AggClient::None => trace!(agg.entity ; "frame dropped, no client"),
        }
    }

    fn deliver_to_relay_client(
        &self,
        relay_index: usize,
        frame: Frame,
        out: &mut Vec<Delivery>,
    ) {
        let relay = self.relays[relay_index].as_ref().unwrap();
        match relay.client {
            RelayClient::BridgePort(bridge_port) => {
                out.push(Delivery::BridgePort(bridge_port, frame));
            }
            RelayClient::Station => out.push(Delivery::Station(frame)),
            RelayClient::None => {}
        }
    }

    fn forward_on_ipp(&self, macs: &mut [Mac], relay_index: usize, frame: Frame) {
        let relay = self.relays[relay_index].as_ref().unwrap();
        if let Some(ipp) = relay.ipps.iter().find(|ipp| ipp.enabled) {
            macs[ipp.mac_index].enqueue_tx(frame);
        }
    }

    /// Distribute a frame over an aggregator onto the link its conversation
    /// maps to.
    pub fn aggregator_transmit(&mut self, macs: &mut [Mac], agg_index: usize, frame: Frame) {
        let agg = &self.aggregators[agg_index];
        let conv_id = conversation_id(&frame, agg.port_algorithm);
        let link = agg.conversation_link(conv_id);
        if link == 0 {
            trace!(agg.entity ; "conversation {conv_id:#x} has no link, frame dropped");
            return;
        }
        let Some(port_index) = self.ports.iter().position(|p| {
            p.attached == Some(agg_index) && p.is_distributing() && p.link_number == link
        }) else {
            trace!(agg.entity ; "link {link} not distributing, frame dropped");
            return;
        };
        match self.ports[port_index].lower {
            AggPortLower::Mac(mac) => macs[mac].enqueue_tx(frame),
            AggPortLower::InnerAggregator(inner) => {
                self.aggregator_transmit(macs, inner, frame);
            }
            AggPortLower::None => {}
        }
    }

    /// Push a frame down from the client layer through the given ISS.
    pub fn transmit_down(&mut self, macs: &mut [Mac], iss: Iss, frame: Frame) {
        match iss {
            Iss::Mac(mac) => macs[mac].enqueue_tx(frame),
            Iss::Aggregator(agg_index) => self.aggregator_transmit(macs, agg_index, frame),
            Iss::Relay(relay_index) => {
                let relay = self.relays[relay_index].as_ref().unwrap();
                let conv_id = conversation_id(&frame, relay.gateway_algorithm);
                let agg_index = relay.agg_index;
                match relay.frame_from_client(conv_id) {
                    RelayVerdict::Aggregator => self.aggregator_transmit(macs, agg_index, frame),
                    RelayVerdict::Ipp => self.forward_on_ipp(macs, relay_index, frame),
                    _ => trace!(self.entity ; "frame with no gateway dropped"),
                }
            }
            Iss::None => {}
        }
    }

    /// Run all state machines to a fixed point for this tick.
    pub fn run(&mut self, macs: &mut [Mac], _now: Tick) {
        // Track the state of each port's underlying link
        let enabled: Vec<bool> = self
            .ports
            .iter()
            .map(|p| match p.lower {
                AggPortLower::Mac(mac) => macs[mac].enabled(),
                AggPortLower::InnerAggregator(agg) => self.is_operational(agg),
                AggPortLower::None => false,
            })
            .collect();
        for (port, enabled) in self.ports.iter_mut().zip(enabled) {
            port.update_enabled(enabled);
        }
        for relay in self.relays.iter_mut().flatten() {
            for ipp in &mut relay.ipps {
                let up = macs[ipp.mac_index].enabled();
                ipp.update_enabled(up);
            }
        }

        // Receive machines see this tick's PDUs before selection runs
        for port in &mut self.ports {
            port.rx_machine();
        }

        let withheld = self.withheld_ports();
        run_selection(&mut self.ports, &self.aggregators, &withheld);

        // Remaining machines to a fixed point
        for _ in 0..16 {
            let mut changed = false;
            for port in &mut self.ports {
                changed |= port.rx_machine();
                changed |= port.periodic_machine();
                changed |= port.mux_machine();
            }
            if !changed {
                break;
            }
        }
        for port in &mut self.ports {
            port.churn_machine();
        }

        self.non_revertive_sweep();
        self.run_relays(macs);
        self.update_aggregator_state();
        self.transmit_lacpdus(macs);
    }

    /// Ports the distributed relay keeps out of selection because their
    /// partner is not the portal's partner.
    fn withheld_ports(&self) -> Vec<bool> {
        let mut withheld = vec![false; self.ports.len()];
        for relay in self.relays.iter().flatten() {
            let Some(portal_partner) = relay.portal_partner else {
                continue;
            };
            for &port_index in &relay.port_indices {
                let port = &self.ports[port_index];
                if port.partner_learned && port.partner_oper.system != portal_partner {
                    withheld[port_index] = true;
                }
            }
        }
        withheld
    }

    /// When every non-revertive port contending for an aggregator is held
    /// (or down), all of them revert except those still down.
    fn non_revertive_sweep(&mut self) {
        for agg_index in 0..self.aggregators.len() {
            let key = self.aggregators[agg_index].oper_key;
            let candidates: Vec<usize> = (0..self.ports.len())
                .filter(|&i| {
                    self.ports[i].wtr_time & WTR_NON_REVERTIVE != 0
                        && self.ports[i].actor_oper_key == key
                })
                .collect();
            if candidates.is_empty() {
                continue;
            }
            let all_held = candidates
                .iter()
                .all(|&i| self.ports[i].non_revertive_hold || !self.ports[i].port_enabled);
            if !all_held {
                continue;
            }
            for &i in &candidates {
                if self.ports[i].port_enabled && self.ports[i].non_revertive_hold {
                    debug!(self.ports[i].entity ; "non-revertive sweep, port reverts");
                    self.ports[i].non_revertive_hold = false;
                }
            }
        }
    }

    fn run_relays(&mut self, macs: &mut [Mac]) {
        for relay_index in 0..self.relays.len() {
            let Some(relay) = self.relays[relay_index].as_mut() else {
                continue;
            };
            let agg_index = relay.agg_index;

            let home_links: Vec<HomeLink> = relay
                .port_indices
                .iter()
                .map(|&i| {
                    let port = &self.ports[i];
                    HomeLink {
                        link_number: port.link_number,
                        up: port.port_enabled,
                        distributing: port.is_distributing(),
                        partner_system: if port.partner_learned {
                            port.partner_oper.system
                        } else {
                            SysId::default()
                        },
                    }
                })
                .collect();

            let agg = &self.aggregators[agg_index];
            let port_algorithm = agg.port_algorithm;
            let port_digest = agg.digest();
            let identity_changed =
                relay.run(home_links, &agg.admin_conv_links, agg.conv_link_map);

            // Present the portal identity through the aggregator and its
            // DRNI ports
            let portal_system = relay.portal_system;
            let portal_key = relay.portal_key;
            let mismatch = relay.conversation_mismatch(port_algorithm, port_digest);
            let port_indices = relay.port_indices.clone();

            let mut tx_macs = Vec::new();
            for ipp in &mut relay.ipps {
                if ipp.poll_transmit() {
                    tx_macs.push(ipp.mac_index);
                }
            }
            let pdu = relay.build_pdu(port_algorithm, port_digest);
            let relay_entity = relay.entity.clone();

            let agg = &mut self.aggregators[agg_index];
            agg.actor_system = portal_system;
            agg.oper_key = portal_key;
            agg.discard_wrong_conversation_forced = mismatch;
            for &i in &port_indices {
                let port = &mut self.ports[i];
                port.actor_system = portal_system;
                port.actor_oper_key = portal_key;
                if identity_changed {
                    port.ntt = true;
                }
            }

            for mac_index in tx_macs {
                let frame = Frame::new(
                    &relay_entity,
                    DRCP_DA,
                    macs[mac_index].addr,
                    SLOW_PROTOCOLS_ETHERTYPE,
                )
                .set_body(pdu.to_bytes());
                macs[mac_index].enqueue_tx(frame);
            }
        }
    }

    /// Refresh per-aggregator operational state: duplicate link numbers,
    /// the partner's conversation view, DWC and the conversation map.
    fn update_aggregator_state(&mut self) {
        for agg_index in 0..self.aggregators.len() {
            let members = self.members_of(agg_index);

            // Duplicate link numbers force the offenders non-distributing
            for &i in &members {
                let number = self.ports[i].link_number;
                let duplicated = members
                    .iter()
                    .any(|&j| j != i && self.ports[j].link_number == number);
                if duplicated && !self.ports[i].dup_link_suppressed {
                    warn!(self.ports[i].entity ;
                        "duplicate link number {number} in LAG, port suppressed");
                }
                self.ports[i].dup_link_suppressed = duplicated;
            }

            let mut active_links: Vec<u16> = members
                .iter()
                .filter(|&&i| self.ports[i].is_distributing())
                .map(|&i| self.ports[i].link_number)
                .collect();
            active_links.sort_unstable();

            let partner_view = members
                .first()
                .map(|&i| (self.ports[i].partner_algorithm, self.ports[i].partner_digest));
            let agg = &mut self.aggregators[agg_index];
            if let Some((algorithm, digest)) = partner_view {
                agg.partner_algorithm = algorithm;
                agg.partner_digest = digest;
            } else {
                agg.partner_algorithm = None;
                agg.partner_digest = None;
            }
            agg.update_dwc();
            agg.update_conversation_map(&active_links);
        }

        // Ports advertise their aggregator's conversation configuration
        for port in &mut self.ports {
            if let Selected::Selected(agg_index) = port.selected {
                port.port_algorithm = self.aggregators[agg_index].port_algorithm;
                port.actor_digest = self.aggregators[agg_index].digest();
            }
        }
    }

    fn transmit_lacpdus(&mut self, macs: &mut [Mac]) {
        for port_index in 0..self.ports.len() {
            let Some(pdu) = self.ports[port_index].poll_transmit() else {
                continue;
            };
            let port = &self.ports[port_index];
            let da = port.protocol_da;
            let body = pdu.to_bytes();
            match port.lower {
                AggPortLower::Mac(mac) => {
                    let frame = Frame::new(
                        &port.entity,
                        da,
                        macs[mac].addr,
                        SLOW_PROTOCOLS_ETHERTYPE,
                    )
                    .set_body(body);
                    macs[mac].enqueue_tx(frame);
                }
                AggPortLower::InnerAggregator(inner) => {
                    let frame = Frame::new(
                        &port.entity,
                        da,
                        port.actor_system.addr,
                        SLOW_PROTOCOLS_ETHERTYPE,
                    )
                    .set_body(body);
                    self.aggregator_transmit(macs, inner, frame);
                }
                AggPortLower::None => {}
            }
        }
    }
}

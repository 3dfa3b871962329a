// Copyright (c) 2025 Graphcore Ltd. All rights reserved.

//! Intra-Portal Port: the DRCP peer machine for one link between the two
//! systems of a portal.
//!
//! Mirrors the LACP receive machine: CURRENT while the neighbor's DRCPDUs
//! keep arriving, EXPIRED on a missed timeout, DEFAULTED when the neighbor
//! is given up, IPP_DISABLED while the link is down.

use std::rc::Rc;

use lagsim_engine::time::Tick;
use lagsim_model_builder::EntityDisplay;
use lagsim_track::entity::Entity;
use lagsim_track::{debug, trace};

use super::pdu::Drcpdu;
use crate::lacp::{FAST_PERIODIC_TIME, SHORT_TIMEOUT_TIME};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum IppRxState {
    IppDisabled,
    Expired,
    Defaulted,
    Current,
}

#[derive(EntityDisplay)]
pub struct Ipp {
    pub entity: Rc<Entity>,
    /// MAC of the owning device this IPP runs over.
    pub mac_index: usize,

    pub rx_state: IppRxState,
    pub enabled: bool,
    pub drcp_while: Tick,
    pub periodic_while: Tick,
    pub tx_guard: Tick,
    pub ntt: bool,

    /// DRCPDUs delivered on this IPP in the current tick.
    pub rx_pdus: Vec<Drcpdu>,
}

/// What an evaluation pass asks the owning relay to do.
pub enum IppEvent {
    None,
    /// A fresh neighbor view arrived.
    NeighborUpdate(Box<Drcpdu>),
    /// The neighbor timed out or the link went down; forget it.
    NeighborLost,
}

impl Ipp {
    #[must_use]
    pub fn new(parent: &Rc<Entity>, index: usize, mac_index: usize) -> Self {
        Self {
            entity: Rc::new(Entity::new(parent, &format!("ipp{index}"))),
            mac_index,
            rx_state: IppRxState::IppDisabled,
            enabled: false,
            drcp_while: 0,
            periodic_while: 0,
            tx_guard: 0,
            ntt: false,
            rx_pdus: Vec::new(),
        }
    }

    pub fn timer_tick(&mut self) {
        for timer in [
            &mut self.drcp_while,
            &mut self.periodic_while,
            &mut self.tx_guard,
        ] {
            if *timer > 0 {
                *timer -= 1;
            }
        }
    }

    pub fn update_enabled(&mut self, enabled: bool) {
        if enabled != self.enabled {
            debug!(self.entity ; "ipp {}", if enabled { "enabled" } else { "disabled" });
            self.enabled = enabled;
        }
    }

    /// One evaluation of the peer machine.
    pub fn machine(&mut self) -> IppEvent {
        if !self.enabled {
            self.rx_pdus.clear();
            if self.rx_state != IppRxState::IppDisabled {
                trace!(self.entity ; "drcp -> IPP_DISABLED");
                self.rx_state = IppRxState::IppDisabled;
                return IppEvent::NeighborLost;
            }
            return IppEvent::None;
        }

        if self.rx_state == IppRxState::IppDisabled {
            trace!(self.entity ; "drcp -> EXPIRED");
            self.rx_state = IppRxState::Expired;
            self.drcp_while = SHORT_TIMEOUT_TIME;
            self.ntt = true;
        }

        if let Some(pdu) = self.rx_pdus.pop() {
            self.rx_pdus.clear();
            if self.rx_state != IppRxState::Current {
                trace!(self.entity ; "drcp -> CURRENT");
            }
            self.rx_state = IppRxState::Current;
            self.drcp_while = SHORT_TIMEOUT_TIME;
            return IppEvent::NeighborUpdate(Box::new(pdu));
        }

        match self.rx_state {
            IppRxState::Current if self.drcp_while == 0 => {
                trace!(self.entity ; "drcp -> EXPIRED");
                self.rx_state = IppRxState::Expired;
                self.drcp_while = SHORT_TIMEOUT_TIME;
                self.ntt = true;
                IppEvent::None
            }
            IppRxState::Expired if self.drcp_while == 0 => {
                debug!(self.entity ; "drcp -> DEFAULTED, neighbor lost");
                self.rx_state = IppRxState::Defaulted;
                IppEvent::NeighborLost
            }
            _ => IppEvent::None,
        }
    }

    /// Fast-periodic transmission: returns true when a DRCPDU should go out
    /// on this IPP now.
    pub fn poll_transmit(&mut self) -> bool {
        if !self.enabled {
            self.ntt = false;
            return false;
        }
        if self.periodic_while == 0 {
            self.ntt = true;
            self.periodic_while = FAST_PERIODIC_TIME;
        }
        if self.ntt && self.tx_guard == 0 {
            self.ntt = false;
            self.tx_guard = FAST_PERIODIC_TIME;
            return true;
        }
        false
    }
}

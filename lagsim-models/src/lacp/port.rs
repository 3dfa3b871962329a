// Copyright (c) 2025 Graphcore Ltd. All rights reserved.

//! An aggregation-capable physical port and its protocol state.

use std::fmt;
use std::rc::Rc;

use lagsim_engine::time::Tick;
use lagsim_model_builder::EntityDisplay;
use lagsim_track::entity::Entity;
use lagsim_track::trace;

use super::pdu::{
    Lacpdu, ParticipantInfo, STATE_ACTIVITY, STATE_AGGREGATION, STATE_COLLECTING,
    STATE_DISTRIBUTING, STATE_SYNC, STATE_TIMEOUT,
};
use super::{DEFAULT_ACTOR_KEY, WTR_NON_REVERTIVE};
use crate::frame::SLOW_PROTOCOLS_DA;
use crate::types::{ConvListDigest, LagAlgorithm, LagId, LoopRole, PortId, SysId};

/// Receive machine states.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RxState {
    Initialize,
    PortDisabled,
    LacpDisabled,
    Expired,
    Defaulted,
    Current,
}

/// Periodic transmission machine states.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PeriodicState {
    NoPeriodic,
    FastPeriodic,
    SlowPeriodic,
}

/// Coupled-control mux machine states.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum MuxState {
    Detached,
    Waiting,
    Attached,
    CollectingDistributing,
}

/// Churn detection machine states.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ChurnState {
    NoChurn,
    ChurnMonitor,
    Churn,
}

impl fmt::Display for MuxState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            MuxState::Detached => "DETACHED",
            MuxState::Waiting => "WAITING",
            MuxState::Attached => "ATTACHED",
            MuxState::CollectingDistributing => "COLLECTING_DISTRIBUTING",
        };
        write!(f, "{name}")
    }
}

/// Selection Logic verdict for a port.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Selected {
    Selected(usize),
    Unselected,
}

/// What sits below an aggregation port on the ISS stack.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum AggPortLower {
    /// The usual case: a MAC of the owning device.
    Mac(usize),
    /// Hierarchical aggregation: an inner aggregator of the same shim
    /// serves as this port's "link".
    InnerAggregator(usize),
    /// Port disabled by configuration.
    None,
}

#[derive(EntityDisplay)]
pub struct AggPort {
    pub entity: Rc<Entity>,
    /// Index of this port within its LinkAgg shim.
    pub index: usize,

    // Actor identity
    pub port_id: PortId,
    pub actor_admin_system: SysId,
    pub actor_system: SysId,
    pub actor_admin_key: u16,
    pub actor_oper_key: u16,
    pub actor_admin_state: u8,
    pub actor_oper_state: u8,
    pub lacp_version: u8,
    pub protocol_da: u64,

    // Partner records
    pub partner_admin: ParticipantInfo,
    pub partner_oper: ParticipantInfo,
    /// True once a real partner PDU has been recorded since the last
    /// default/disable.
    pub partner_learned: bool,
    /// Partner's advertised conversation configuration (LACPDU v2).
    pub partner_algorithm: Option<LagAlgorithm>,
    pub partner_digest: Option<ConvListDigest>,

    // Timers, decremented once per tick
    pub current_while: Tick,
    pub periodic_while: Tick,
    pub wait_while: Tick,
    pub churn_while: Tick,
    pub wtr_while: Tick,
    pub tx_guard: Tick,

    // Machine states
    pub rx_state: RxState,
    pub periodic_state: PeriodicState,
    pub mux_state: MuxState,
    pub churn_state: ChurnState,

    // Control signals
    pub port_enabled: bool,
    pub lacp_enabled: bool,
    pub ntt: bool,
    pub port_moved: bool,
    pub selected: Selected,
    /// LagId snapshot taken when the port was selected; a change unselects.
    pub selected_lag_id: Option<LagId>,
    /// Aggregator the mux machine is attached to.
    pub attached: Option<usize>,

    // Admin controls
    /// Wait-to-restore time; bit 15 marks non-revertive mode.
    pub wtr_time: u16,
    pub non_revertive_hold: bool,
    /// True once the port has carried traffic, so a later up-transition
    /// counts as a restoration.
    pub was_operational: bool,
    pub link_number: u16,
    pub port_algorithm: LagAlgorithm,
    pub actor_digest: ConvListDigest,
    /// Set while this port's link number collides with another member of
    /// the same LAG; reported as non-distributing.
    pub dup_link_suppressed: bool,

    pub lower: AggPortLower,
    /// LACPDUs delivered to this port in the current tick.
    pub rx_pdus: Vec<Lacpdu>,
}

impl AggPort {
    #[must_use]
    pub fn new(parent: &Rc<Entity>, index: usize, system: SysId, lacp_version: u8) -> Self {
        let port_number = 0x100 + index as u16;
        Self {
            entity: Rc::new(Entity::new(parent, &format!("aggport{index}"))),
            index,
            port_id: PortId::new(0, port_number),
            actor_admin_system: system,
            actor_system: system,
            actor_admin_key: DEFAULT_ACTOR_KEY,
            actor_oper_key: DEFAULT_ACTOR_KEY,
            actor_admin_state: STATE_ACTIVITY | STATE_TIMEOUT | STATE_AGGREGATION,
            actor_oper_state: STATE_ACTIVITY | STATE_TIMEOUT | STATE_AGGREGATION,
            lacp_version,
            protocol_da: SLOW_PROTOCOLS_DA,
            partner_admin: ParticipantInfo {
                // The default partner is individual and in sync, so a port
                // whose partner does not speak LACP comes up solitary
                state: STATE_SYNC | STATE_COLLECTING | STATE_DISTRIBUTING,
                ..ParticipantInfo::default()
            },
            partner_oper: ParticipantInfo::default(),
            partner_learned: false,
            partner_algorithm: None,
            partner_digest: None,
            current_while: 0,
            periodic_while: 0,
            wait_while: 0,
            churn_while: 0,
            wtr_while: 0,
            tx_guard: 0,
            rx_state: RxState::Initialize,
            periodic_state: PeriodicState::NoPeriodic,
            mux_state: MuxState::Detached,
            churn_state: ChurnState::NoChurn,
            port_enabled: false,
            lacp_enabled: true,
            ntt: false,
            port_moved: false,
            selected: Selected::Unselected,
            selected_lag_id: None,
            attached: None,
            wtr_time: 0,
            non_revertive_hold: false,
            was_operational: false,
            link_number: index as u16 + 1,
            port_algorithm: LagAlgorithm::Unspecified,
            actor_digest: [0; 16],
            dup_link_suppressed: false,
            lower: AggPortLower::Mac(index),
            rx_pdus: Vec::new(),
        }
    }

    /// The LagId this port would aggregate under, or `None` while the port
    /// cannot take part in selection.
    #[must_use]
    pub fn lag_id(&self) -> Option<LagId> {
        if !self.port_enabled || !self.lacp_enabled {
            return None;
        }
        match self.rx_state {
            RxState::Initialize | RxState::PortDisabled | RxState::LacpDisabled => return None,
            RxState::Expired | RxState::Defaulted | RxState::Current => {}
        }
        // Held-out ports do not aggregate until restored administratively
        // or by timer expiry
        if self.wtr_while > 0 || self.non_revertive_hold {
            return None;
        }

        // An unknown or defaulted partner reads as individual here, which
        // keeps a port solitary until a real partner is recorded
        let individual = self.actor_oper_state & STATE_AGGREGATION == 0
            || self.partner_oper.state & STATE_AGGREGATION == 0;
        let loopback = if self.partner_learned && self.partner_oper.system == self.actor_system {
            if self.partner_oper.port == self.port_id {
                LoopRole::SelfPort
            } else if self.partner_oper.port.id() < self.port_id.id() {
                LoopRole::Slave
            } else {
                LoopRole::None
            }
        } else {
            LoopRole::None
        };

        Some(LagId {
            actor_system: self.actor_system,
            actor_key: self.actor_oper_key,
            actor_port: self.port_id,
            partner_system: self.partner_oper.system,
            partner_key: self.partner_oper.key,
            partner_port: self.partner_oper.port,
            individual,
            loopback,
        })
    }

    /// The actor record carried in transmitted LACPDUs.
    #[must_use]
    pub fn actor_info(&self) -> ParticipantInfo {
        ParticipantInfo {
            system: self.actor_system,
            key: self.actor_oper_key,
            port: self.port_id,
            state: self.oper_state(),
        }
    }

    /// Actor state byte with duplicate-link suppression applied.
    #[must_use]
    pub fn oper_state(&self) -> u8 {
        if self.dup_link_suppressed {
            self.actor_oper_state & !STATE_DISTRIBUTING
        } else {
            self.actor_oper_state
        }
    }

    #[must_use]
    pub fn is_collecting(&self) -> bool {
        self.actor_oper_state & STATE_COLLECTING != 0
    }

    #[must_use]
    pub fn is_distributing(&self) -> bool {
        self.oper_state() & STATE_DISTRIBUTING != 0
    }

    #[must_use]
    pub fn partner_sync(&self) -> bool {
        self.partner_oper.state & STATE_SYNC != 0
    }

    /// Change selection state. Every transition to UNSELECTED must notify
    /// the partner, so NTT is set unconditionally there.
    pub fn set_selected(&mut self, selected: Selected, lag_id: Option<LagId>) {
        if self.selected == selected {
            return;
        }
        trace!(self.entity ; "selection {:?} -> {:?}", self.selected, selected);
        self.selected = selected;
        self.selected_lag_id = lag_id;
        if selected == Selected::Unselected {
            self.selected_lag_id = None;
            self.ntt = true;
        }
    }

    // Admin setters used by management scenarios. LagId-affecting changes
    // take effect through the per-tick consistency check in selection.

    pub fn set_actor_admin_key(&mut self, key: u16) {
        self.actor_admin_key = key;
        self.actor_oper_key = key;
    }

    pub fn set_actor_system_priority(&mut self, priority: u16) {
        self.actor_admin_system.priority = priority;
        self.actor_system.priority = priority;
    }

    pub fn set_actor_admin_state(&mut self, state: u8) {
        self.actor_admin_state = state;
        // Only the control bits flow straight into the oper state
        let control = STATE_ACTIVITY | STATE_TIMEOUT | STATE_AGGREGATION;
        self.actor_oper_state = (self.actor_oper_state & !control) | (state & control);
    }

    /// Set the wait-to-restore time in ticks; bit 15 selects non-revertive
    /// mode.
    pub fn set_wtr_time(&mut self, wtr: u16) {
        self.wtr_time = wtr;
        if wtr & WTR_NON_REVERTIVE == 0 {
            self.non_revertive_hold = false;
        }
    }

    pub fn set_link_number(&mut self, link_number: u16) {
        self.link_number = link_number;
    }

    pub fn set_port_algorithm(&mut self, algorithm: LagAlgorithm) {
        self.port_algorithm = algorithm;
    }

    pub fn set_protocol_da(&mut self, da: u64) {
        self.protocol_da = da;
    }
}

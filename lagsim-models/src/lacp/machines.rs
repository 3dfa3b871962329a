// Copyright (c) 2025 Graphcore Ltd. All rights reserved.

//! The per-port LACP state machines.
//!
//! Each machine is a transition function over the port state; the owning
//! shim calls them repeatedly within a tick until no machine reports a
//! change. Timers are decremented once per tick beforehand.

use lagsim_track::{debug, trace, warn};

use super::pdu::{
    Lacpdu, STATE_ACTIVITY, STATE_COLLECTING, STATE_DEFAULTED, STATE_DISTRIBUTING, STATE_EXPIRED,
    STATE_SYNC, STATE_TIMEOUT,
};
use super::port::{AggPort, ChurnState, MuxState, PeriodicState, RxState, Selected};
use super::{
    AGGREGATE_WAIT_TIME, CHURN_DETECTION_TIME, DEFAULT_COLLECTOR_MAX_DELAY, FAST_PERIODIC_TIME,
    LONG_TIMEOUT_TIME, SHORT_TIMEOUT_TIME, SLOW_PERIODIC_TIME, WTR_NON_REVERTIVE,
};

fn dec(timer: &mut u64) {
    if *timer > 0 {
        *timer -= 1;
    }
}

impl AggPort {
    /// Decrement all running timers. Called once per device tick before any
    /// machine is evaluated.
    pub fn timer_tick(&mut self) {
        dec(&mut self.current_while);
        dec(&mut self.periodic_while);
        dec(&mut self.wait_while);
        dec(&mut self.churn_while);
        dec(&mut self.wtr_while);
        dec(&mut self.tx_guard);
    }

    /// Track the state of the underlying link. Restoration of a previously
    /// operational port arms the wait-to-restore hold-off.
    pub fn update_enabled(&mut self, enabled: bool) {
        if enabled == self.port_enabled {
            return;
        }
        self.port_enabled = enabled;
        if enabled {
            debug!(self.entity ; "port enabled");
            let wtr = (self.wtr_time & !WTR_NON_REVERTIVE) as u64;
            if self.was_operational && wtr > 0 && !self.non_revertive_hold {
                trace!(self.entity ; "wait-to-restore armed for {wtr} ticks");
                self.wtr_while = wtr;
            }
        } else {
            debug!(self.entity ; "port disabled");
            self.wtr_while = 0;
            if self.was_operational && self.wtr_time & WTR_NON_REVERTIVE != 0 {
                trace!(self.entity ; "non-revertive hold set");
                self.non_revertive_hold = true;
            }
        }
    }

    fn enter_port_disabled(&mut self) {
        trace!(self.entity ; "rx -> PORT_DISABLED");
        self.rx_state = RxState::PortDisabled;
        self.partner_oper.state &= !STATE_SYNC;
    }

    fn enter_expired(&mut self) {
        trace!(self.entity ; "rx -> EXPIRED");
        self.rx_state = RxState::Expired;
        self.partner_oper.state |= STATE_TIMEOUT;
        self.partner_oper.state &= !STATE_SYNC;
        self.current_while = SHORT_TIMEOUT_TIME;
        self.actor_oper_state |= STATE_EXPIRED;
    }

    fn enter_defaulted(&mut self) {
        trace!(self.entity ; "rx -> DEFAULTED");
        self.rx_state = RxState::Defaulted;
        self.partner_oper = self.partner_admin;
        self.partner_learned = false;
        self.partner_algorithm = None;
        self.partner_digest = None;
        self.actor_oper_state |= STATE_DEFAULTED;
        self.actor_oper_state &= !STATE_EXPIRED;
    }

    fn record_pdu(&mut self, pdu: &Lacpdu) {
        // Does the partner's view of us need correcting?
        let relevant = STATE_ACTIVITY
            | STATE_TIMEOUT
            | crate::lacp::pdu::STATE_AGGREGATION
            | STATE_SYNC
            | STATE_COLLECTING
            | STATE_DISTRIBUTING;
        let us = self.actor_info();
        if pdu.partner.system != us.system
            || pdu.partner.key != us.key
            || pdu.partner.port != us.port
            || (pdu.partner.state ^ us.state) & relevant != 0
        {
            self.ntt = true;
        }

        self.partner_oper = pdu.actor;
        self.partner_learned = true;
        self.partner_algorithm = pdu.port_algorithm;
        self.partner_digest = pdu.conv_digest;
        self.actor_oper_state &= !(STATE_DEFAULTED | STATE_EXPIRED);

        // The current-while countdown follows our own timeout setting
        self.current_while = if self.actor_oper_state & STATE_TIMEOUT != 0 {
            SHORT_TIMEOUT_TIME
        } else {
            LONG_TIMEOUT_TIME
        };
    }

    /// Receive machine. Consumes PDUs queued since the last tick.
    pub fn rx_machine(&mut self) -> bool {
        let mut changed = false;

        if !self.port_enabled {
            if self.rx_state != RxState::PortDisabled {
                self.enter_port_disabled();
                changed = true;
            }
            self.rx_pdus.clear();
            return changed;
        }
        if !self.lacp_enabled {
            if self.rx_state != RxState::LacpDisabled {
                trace!(self.entity ; "rx -> LACP_DISABLED");
                self.rx_state = RxState::LacpDisabled;
                self.partner_oper = self.partner_admin;
                self.partner_oper.state &= !crate::lacp::pdu::STATE_AGGREGATION;
                changed = true;
            }
            self.rx_pdus.clear();
            return changed;
        }

        if matches!(
            self.rx_state,
            RxState::Initialize | RxState::PortDisabled | RxState::LacpDisabled
        ) {
            self.enter_expired();
            changed = true;
        }

        let pdus = std::mem::take(&mut self.rx_pdus);
        let mut pending = pdus.into_iter();
        for pdu in pending.by_ref() {
            if self.rx_state == RxState::Current
                && self.partner_learned
                && (self.partner_oper.system != pdu.actor.system
                    || self.partner_oper.port != pdu.actor.port)
            {
                // The remembered partner has moved to a different port.
                // Bounce through PORT_DISABLED so selection re-evaluates,
                // keeping the PDU for the re-entry.
                debug!(self.entity ; "partner moved: {} {} -> {} {}",
                    self.partner_oper.system, self.partner_oper.port,
                    pdu.actor.system, pdu.actor.port);
                self.port_moved = true;
                self.enter_port_disabled();
                self.rx_pdus.push(pdu);
                self.rx_pdus.extend(pending);
                return true;
            }

            if self.rx_state != RxState::Current {
                trace!(self.entity ; "rx -> CURRENT");
            }
            self.record_pdu(&pdu);
            self.rx_state = RxState::Current;
            changed = true;
        }

        match self.rx_state {
            RxState::Current if self.current_while == 0 => {
                self.enter_expired();
                changed = true;
            }
            RxState::Expired if self.current_while == 0 => {
                self.enter_defaulted();
                changed = true;
            }
            _ => {}
        }

        changed
    }

    /// Periodic transmission machine.
    pub fn periodic_machine(&mut self) -> bool {
        let actor_active = self.actor_oper_state & STATE_ACTIVITY != 0;
        let partner_active = self.partner_oper.state & STATE_ACTIVITY != 0;
        let active =
            self.port_enabled && self.lacp_enabled && (actor_active || partner_active);

        if !active {
            let changed = self.periodic_state != PeriodicState::NoPeriodic;
            self.periodic_state = PeriodicState::NoPeriodic;
            return changed;
        }

        // An unknown partner is assumed to be using short timeouts
        let fast = !self.partner_learned || self.partner_oper.state & STATE_TIMEOUT != 0;
        let (desired, interval) = if fast {
            (PeriodicState::FastPeriodic, FAST_PERIODIC_TIME)
        } else {
            (PeriodicState::SlowPeriodic, SLOW_PERIODIC_TIME)
        };

        let mut changed = false;
        if self.periodic_state != desired {
            self.periodic_state = desired;
            self.periodic_while = interval;
            changed = true;
        } else if self.periodic_while == 0 {
            self.ntt = true;
            self.periodic_while = interval;
            changed = true;
        }
        changed
    }

    /// Coupled-control mux machine.
    pub fn mux_machine(&mut self) -> bool {
        let selected_agg = match self.selected {
            Selected::Selected(agg) => Some(agg),
            Selected::Unselected => None,
        };

        match self.mux_state {
            MuxState::Detached => {
                if let Some(_agg) = selected_agg {
                    trace!(self.entity ; "mux -> WAITING");
                    self.mux_state = MuxState::Waiting;
                    self.wait_while = AGGREGATE_WAIT_TIME;
                    return true;
                }
                false
            }
            MuxState::Waiting => {
                if selected_agg.is_none() {
                    self.detach();
                    return true;
                }
                if self.wait_while == 0 {
                    let agg = selected_agg.unwrap();
                    debug!(self.entity ; "mux -> ATTACHED (aggregator {agg})");
                    self.mux_state = MuxState::Attached;
                    self.attached = Some(agg);
                    self.actor_oper_state |= STATE_SYNC;
                    self.actor_oper_state &= !(STATE_COLLECTING | STATE_DISTRIBUTING);
                    self.ntt = true;
                    return true;
                }
                false
            }
            MuxState::Attached => {
                // Unselected, or re-selected onto a different aggregator
                if selected_agg != self.attached {
                    self.detach();
                    return true;
                }
                if self.partner_sync() {
                    debug!(self.entity ; "mux -> COLLECTING_DISTRIBUTING");
                    self.mux_state = MuxState::CollectingDistributing;
                    self.actor_oper_state |= STATE_COLLECTING | STATE_DISTRIBUTING;
                    self.was_operational = true;
                    self.ntt = true;
                    return true;
                }
                false
            }
            MuxState::CollectingDistributing => {
                if selected_agg != self.attached {
                    // Leave via ATTACHED so distributing and collecting are
                    // withdrawn before sync
                    debug!(self.entity ; "mux -> ATTACHED (unselected)");
                    self.mux_state = MuxState::Attached;
                    self.actor_oper_state &= !(STATE_COLLECTING | STATE_DISTRIBUTING);
                    self.ntt = true;
                    return true;
                }
                if !self.partner_sync() {
                    debug!(self.entity ; "mux -> ATTACHED (partner out of sync)");
                    self.mux_state = MuxState::Attached;
                    self.actor_oper_state &= !(STATE_COLLECTING | STATE_DISTRIBUTING);
                    self.ntt = true;
                    return true;
                }
                false
            }
        }
    }

    fn detach(&mut self) {
        debug!(self.entity ; "mux -> DETACHED");
        self.mux_state = MuxState::Detached;
        self.attached = None;
        self.actor_oper_state &= !(STATE_DISTRIBUTING | STATE_COLLECTING | STATE_SYNC);
        self.ntt = true;
    }

    /// Churn detection. Diagnostic only; never affects convergence.
    pub fn churn_machine(&mut self) {
        let synced = self.actor_oper_state & STATE_SYNC != 0;
        if synced || self.selected == Selected::Unselected {
            self.churn_state = ChurnState::NoChurn;
            self.churn_while = 0;
            return;
        }
        match self.churn_state {
            ChurnState::NoChurn => {
                self.churn_state = ChurnState::ChurnMonitor;
                self.churn_while = CHURN_DETECTION_TIME;
            }
            ChurnState::ChurnMonitor => {
                if self.churn_while == 0 {
                    warn!(self.entity ; "actor churn detected");
                    self.churn_state = ChurnState::Churn;
                }
            }
            ChurnState::Churn => {}
        }
    }

    /// Transmit machine: at most one LACPDU per fast-period per port.
    pub fn poll_transmit(&mut self) -> Option<Lacpdu> {
        if !self.port_enabled || !self.lacp_enabled {
            self.ntt = false;
            return None;
        }
        if !self.ntt || self.tx_guard > 0 {
            return None;
        }
        self.ntt = false;
        self.tx_guard = FAST_PERIODIC_TIME;

        let version2 = self.lacp_version >= 2;
        Some(Lacpdu {
            version: self.lacp_version,
            actor: self.actor_info(),
            partner: self.partner_oper,
            collector_max_delay: DEFAULT_COLLECTOR_MAX_DELAY,
            port_algorithm: version2.then_some(self.port_algorithm),
            conv_digest: version2.then_some(self.actor_digest),
        })
    }
}

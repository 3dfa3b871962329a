// Copyright (c) 2025 Graphcore Ltd. All rights reserved.

//! The Distributed Relay: makes two cooperating systems look like a single
//! LACP system to their external partners.
//!
//! Each DR arbitrates the shared portal identity over its intra-portal
//! ports, overrides the actor identity of its attached aggregator and DRNI
//! ports, selects the gateway system per conversation ID and polices
//! conversation consistency across the portal.

use std::collections::BTreeMap;
use std::rc::Rc;

use lagsim_model_builder::EntityDisplay;
use lagsim_track::entity::Entity;
use lagsim_track::{debug, info};

use super::ipp::{Ipp, IppEvent, IppRxState};
use super::pdu::{Drcpdu, HomeLink};
use crate::lacp::distribution::ConvLinkMap;
use crate::types::{ConvListDigest, ConvVector, LagAlgorithm, SysId};

/// Who sits above the relay on the ISS stack.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RelayClient {
    BridgePort(usize),
    Station,
    None,
}

/// Administrative configuration of a distributed relay, supplied as one
/// record at creation. Runtime setters exist for the fields management
/// scenarios mutate.
#[derive(Clone, Debug)]
pub struct DistRelayConfig {
    /// Portal identity to use when non-zero; zero defers to the lower of
    /// the two home system identifiers.
    pub admin_portal_system: SysId,
    /// Portal key to use when non-zero; zero defers to the lower system's
    /// aggregator key.
    pub admin_portal_key: u16,
    pub num_drni_ports: usize,
    pub num_ipps: usize,
    /// Link number of the first DRNI port; subsequent ports count up.
    pub first_link_number: u16,
    pub gateway_enable: ConvVector,
    pub gateway_preference: ConvVector,
    pub gateway_algorithm: LagAlgorithm,
    pub cscd: bool,
    pub discard_wrong_conversation: bool,
}

impl Default for DistRelayConfig {
    fn default() -> Self {
        Self {
            admin_portal_system: SysId::default(),
            admin_portal_key: 0,
            num_drni_ports: 2,
            num_ipps: 2,
            first_link_number: 1,
            gateway_enable: ConvVector::ones(),
            gateway_preference: ConvVector::ones(),
            gateway_algorithm: LagAlgorithm::Unspecified,
            cscd: false,
            discard_wrong_conversation: false,
        }
    }
}

/// The neighbor system's state as learned from its DRCPDUs.
#[derive(Clone, Debug)]
pub struct NeighborView {
    pub system: SysId,
    pub key: u16,
    pub admin_portal_system: SysId,
    pub admin_portal_key: u16,
    pub cscd: bool,
    pub links: Vec<HomeLink>,
    pub gateway_algorithm: LagAlgorithm,
    pub port_algorithm: LagAlgorithm,
    pub gateway_digest: ConvListDigest,
    pub port_digest: ConvListDigest,
    pub gateway_enable: ConvVector,
    pub gateway_preference: ConvVector,
}

/// Where the relay wants a data frame to go next.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RelayVerdict {
    /// Hand the frame to the attached aggregator.
    Aggregator,
    /// Forward across the intra-portal link to the peer system.
    Ipp,
    /// Deliver to the client above the relay.
    Client,
    Discard,
}

#[derive(EntityDisplay)]
pub struct DistributedRelay {
    pub entity: Rc<Entity>,
    /// The aggregator this relay replaces on the client's ISS stack.
    pub agg_index: usize,
    /// Indices of the DRNI aggregation ports handled by this relay.
    pub port_indices: Vec<usize>,
    pub client: RelayClient,

    pub home_system: SysId,
    pub home_key: u16,

    // Administrative state
    pub admin_portal_system: SysId,
    pub admin_portal_key: u16,
    pub gateway_enable: ConvVector,
    pub gateway_preference: ConvVector,
    pub gateway_algorithm: LagAlgorithm,
    pub cscd: bool,

    pub ipps: Vec<Ipp>,
    pub neighbor: Option<NeighborView>,

    // Operational identity presented to external LACP partners
    pub portal_system: SysId,
    pub portal_key: u16,

    /// Bit set when the home system is the gateway for that conversation.
    pub gateway_home: ConvVector,
    /// Partner system the whole portal aggregates with; home ports facing
    /// anyone else are withheld from selection.
    pub portal_partner: Option<SysId>,
    /// Home link state advertised in DRCPDUs, refreshed each tick.
    pub home_links: Vec<HomeLink>,
}

impl DistributedRelay {
    #[must_use]
    pub fn new(
        parent: &Rc<Entity>,
        agg_index: usize,
        home_system: SysId,
        home_key: u16,
        ipp_macs: &[usize],
        config: &DistRelayConfig,
    ) -> Self {
        let entity = Rc::new(Entity::new(parent, &format!("drelay{agg_index}")));
        let ipps = ipp_macs
            .iter()
            .take(config.num_ipps)
            .enumerate()
            .map(|(i, &mac)| Ipp::new(&entity, i, mac))
            .collect();
        Self {
            entity,
            agg_index,
            port_indices: Vec::new(),
            client: RelayClient::None,
            home_system,
            home_key,
            admin_portal_system: config.admin_portal_system,
            admin_portal_key: config.admin_portal_key,
            gateway_enable: config.gateway_enable,
            gateway_preference: config.gateway_preference,
            gateway_algorithm: config.gateway_algorithm,
            cscd: config.cscd,
            ipps,
            neighbor: None,
            portal_system: home_system,
            portal_key: home_key,
            gateway_home: config.gateway_enable,
            portal_partner: None,
            home_links: Vec::new(),
        }
    }

    pub fn timer_tick(&mut self) {
        for ipp in &mut self.ipps {
            ipp.timer_tick();
        }
    }

    /// Gateway digest advertised to the neighbor. The per-system enable and
    /// preference vectors are expected to differ between the systems, so
    /// only the algorithm is folded in.
    #[must_use]
    pub fn gateway_digest(&self) -> ConvListDigest {
        let mut digest = [0u8; 16];
        digest[0] = 0x47; // 'G'
        digest[1] = self.gateway_algorithm.to_wire();
        digest
    }

    /// Run the DRCP peer machines and recompute portal state.
    ///
    /// `home_links` is the current state of this system's DRNI links; the
    /// conversation preferences of the attached aggregator feed the
    /// cooperative gateway choice. Returns true when the presented portal
    /// identity changed, which unselects the DRNI ports.
    pub fn run(
        &mut self,
        home_links: Vec<HomeLink>,
        admin_conv_links: &BTreeMap<u16, Vec<u16>>,
        conv_link_map: ConvLinkMap,
    ) -> bool {
        self.home_links = home_links;

        let mut neighbor_changed = false;
        for i in 0..self.ipps.len() {
            let event = self.ipps[i].machine();
            match event {
                IppEvent::None => {}
                IppEvent::NeighborUpdate(pdu) => {
                    let view = NeighborView {
                        system: pdu.home_system,
                        key: pdu.home_key,
                        admin_portal_system: pdu.admin_portal_system,
                        admin_portal_key: pdu.admin_portal_key,
                        cscd: pdu.cscd,
                        links: pdu.home_links,
                        gateway_algorithm: pdu.gateway_algorithm,
                        port_algorithm: pdu.port_algorithm,
                        gateway_digest: pdu.gateway_digest,
                        port_digest: pdu.port_digest,
                        gateway_enable: pdu.gateway_enable,
                        gateway_preference: pdu.gateway_preference,
                    };
                    self.neighbor = Some(view);
                    neighbor_changed = true;
                }
                IppEvent::NeighborLost => {
                    // Only dissolve the pairing when no IPP still has a
                    // live neighbor
                    if !self.any_ipp_current() && self.neighbor.is_some() {
                        info!(self.entity ; "neighbor lost, falling back to solo identity");
                        self.neighbor = None;
                        neighbor_changed = true;
                    }
                }
            }
        }

        let identity_changed = self.arbitrate();
        if neighbor_changed || identity_changed {
            for ipp in &mut self.ipps {
                ipp.ntt = true;
            }
        }

        self.select_gateways(admin_conv_links, conv_link_map);
        self.update_portal_partner();
        identity_changed
    }

    fn any_ipp_current(&self) -> bool {
        self.ipps
            .iter()
            .any(|ipp| ipp.rx_state == IppRxState::Current)
    }

    /// Arbitrate the portal identity. Paired: the administrative values if
    /// set, otherwise the lower home system's identity and key. Solo: this
    /// system's own identity.
    fn arbitrate(&mut self) -> bool {
        let (system, key) = match &self.neighbor {
            Some(neighbor) => {
                let system = if !self.admin_portal_system.is_null() {
                    self.admin_portal_system
                } else {
                    self.home_system.min(neighbor.system)
                };
                let key = if self.admin_portal_key != 0 {
                    self.admin_portal_key
                } else if self.home_system <= neighbor.system {
                    self.home_key
                } else {
                    neighbor.key
                };
                (system, key)
            }
            None => (self.home_system, self.home_key),
        };

        if system != self.portal_system || key != self.portal_key {
            info!(self.entity ; "portal identity {} key {:x} -> {} key {:x}",
                self.portal_system, self.portal_key, system, key);
            self.portal_system = system;
            self.portal_key = key;
            true
        } else {
            false
        }
    }

    /// Recompute the per-conversation gateway assignment.
    fn select_gateways(
        &mut self,
        admin_conv_links: &BTreeMap<u16, Vec<u16>>,
        conv_link_map: ConvLinkMap,
    ) {
        let Some(neighbor) = &self.neighbor else {
            // Solo: every enabled conversation enters here
            self.gateway_home = self.gateway_enable;
            return;
        };

        let home_is_lower = self.home_system < neighbor.system;
        let mut selected = ConvVector::zeroes();

        // Cooperative mode: the gateway follows the link carrying the
        // conversation, so gateway and port selection cannot disagree
        let cscd = self.cscd && neighbor.cscd;
        let cscd_links: Option<(Vec<u16>, Vec<u16>)> = cscd.then(|| {
            let up = |links: &[HomeLink]| -> Vec<u16> {
                links
                    .iter()
                    .filter(|l| l.up)
                    .map(|l| l.link_number)
                    .collect()
            };
            (up(&self.home_links), up(&neighbor.links))
        });

        for cid in 0..4096u16 {
            if let Some((home_up, neighbor_up)) = &cscd_links {
                if let Some(link) =
                    cscd_link_for(cid, admin_conv_links, conv_link_map, home_up, neighbor_up)
                {
                    selected.set(cid, home_up.contains(&link));
                    continue;
                }
            }

            let enable_home = self.gateway_enable.get(cid);
            let enable_neighbor = neighbor.gateway_enable.get(cid);
            let home_gw = match (enable_home, enable_neighbor) {
                (true, false) => true,
                (false, true) => false,
                (false, false) => false,
                (true, true) => {
                    // Both enabled: the lower system's preference bit
                    // decides, set meaning the lower system takes it
                    let lower_preference = if home_is_lower {
                        self.gateway_preference.get(cid)
                    } else {
                        neighbor.gateway_preference.get(cid)
                    };
                    lower_preference == home_is_lower
                }
            };
            selected.set(cid, home_gw);
        }
        if selected != self.gateway_home {
            debug!(self.entity ; "gateway assignment updated");
            self.gateway_home = selected;
        }
    }

    /// The portal aggregates with a single partner: the one on the
    /// lowest-numbered link that is up anywhere in the portal.
    fn update_portal_partner(&mut self) {
        if self.neighbor.is_none() {
            self.portal_partner = None;
            return;
        }
        let mut best: Option<(u16, SysId)> = None;
        let neighbor_links = self
            .neighbor
            .as_ref()
            .map(|n| n.links.as_slice())
            .unwrap_or(&[]);
        for link in self.home_links.iter().chain(neighbor_links) {
            if link.up && !link.partner_system.is_null() {
                let candidate = (link.link_number, link.partner_system);
                if best.map_or(true, |b| candidate.0 < b.0) {
                    best = Some(candidate);
                }
            }
        }
        let partner = best.map(|(_, system)| system);
        if partner != self.portal_partner {
            debug!(self.entity ; "portal partner now {partner:?}");
            self.portal_partner = partner;
        }
    }

    /// Whether the portal's conversation handling disagrees, forcing
    /// discard-wrong-conversation on the attached aggregator.
    #[must_use]
    pub fn conversation_mismatch(
        &self,
        port_algorithm: LagAlgorithm,
        port_digest: ConvListDigest,
    ) -> bool {
        match &self.neighbor {
            Some(neighbor) => {
                neighbor.gateway_algorithm != self.gateway_algorithm
                    || neighbor.gateway_digest != self.gateway_digest()
                    || neighbor.port_algorithm != port_algorithm
                    || neighbor.port_digest != port_digest
            }
            None => false,
        }
    }

    /// Route a data frame that arrived from the client above.
    #[must_use]
    pub fn frame_from_client(&self, conv_id: u16) -> RelayVerdict {
        if self.gateway_home.get(conv_id) {
            RelayVerdict::Aggregator
        } else if self.neighbor.is_some() {
            RelayVerdict::Ipp
        } else {
            RelayVerdict::Discard
        }
    }

    /// Route a data frame that came up from the attached aggregator.
    #[must_use]
    pub fn frame_from_aggregator(&self, conv_id: u16) -> RelayVerdict {
        if self.gateway_home.get(conv_id) {
            RelayVerdict::Client
        } else if self.neighbor.is_some() {
            RelayVerdict::Ipp
        } else {
            RelayVerdict::Discard
        }
    }

    /// Route a data frame that arrived over an intra-portal link.
    #[must_use]
    pub fn frame_from_ipp(&self, conv_id: u16) -> RelayVerdict {
        if self.gateway_home.get(conv_id) {
            RelayVerdict::Client
        } else {
            RelayVerdict::Aggregator
        }
    }

    /// Build the DRCPDU advertising current home state.
    #[must_use]
    pub fn build_pdu(&self, port_algorithm: LagAlgorithm, port_digest: ConvListDigest) -> Drcpdu {
        Drcpdu {
            version: 2,
            admin_portal_system: self.admin_portal_system,
            admin_portal_key: self.admin_portal_key,
            home_system: self.home_system,
            home_key: self.home_key,
            cscd: self.cscd,
            home_links: self.home_links.clone(),
            neighbor_system: self
                .neighbor
                .as_ref()
                .map(|n| n.system)
                .unwrap_or_default(),
            gateway_algorithm: self.gateway_algorithm,
            port_algorithm,
            gateway_digest: self.gateway_digest(),
            port_digest,
            gateway_enable: self.gateway_enable,
            gateway_preference: self.gateway_preference,
        }
    }

    // Management operations

    pub fn set_gateway_enable(&mut self, enable: ConvVector) {
        self.gateway_enable = enable;
        for ipp in &mut self.ipps {
            ipp.ntt = true;
        }
    }

    #[must_use]
    pub fn gateway_enable(&self) -> ConvVector {
        self.gateway_enable
    }

    pub fn set_gateway_preference(&mut self, preference: ConvVector) {
        self.gateway_preference = preference;
        for ipp in &mut self.ipps {
            ipp.ntt = true;
        }
    }

    #[must_use]
    pub fn gateway_preference(&self) -> ConvVector {
        self.gateway_preference
    }

    pub fn set_gateway_algorithm(&mut self, algorithm: LagAlgorithm) {
        self.gateway_algorithm = algorithm;
        for ipp in &mut self.ipps {
            ipp.ntt = true;
        }
    }

    pub fn set_cscd(&mut self, cscd: bool) {
        self.cscd = cscd;
        for ipp in &mut self.ipps {
            ipp.ntt = true;
        }
    }
}

/// The cooperative per-conversation link choice: the admin preference list
/// filtered by portal-wide availability, falling back to the modulo spread
/// over every link that is up in the portal.
fn cscd_link_for(
    conv_id: u16,
    admin_conv_links: &BTreeMap<u16, Vec<u16>>,
    conv_link_map: ConvLinkMap,
    home_up: &[u16],
    neighbor_up: &[u16],
) -> Option<u16> {
    let is_up = |n: u16| home_up.contains(&n) || neighbor_up.contains(&n);

    if conv_link_map == ConvLinkMap::AdminTable {
        let preferences = admin_conv_links.get(&(conv_id & 0xfff))?;
        return preferences.iter().copied().find(|&n| is_up(n));
    }

    let mut all: Vec<u16> = home_up.iter().chain(neighbor_up).copied().collect();
    all.sort_unstable();
    all.dedup();
    if all.is_empty() {
        return None;
    }
    Some(all[conv_id as usize % all.len()])
}

#[cfg(test)]
mod tests {
    use lagsim_track::entity::toplevel;
    use lagsim_track::test_helpers::create_tracker;

    use super::*;

    fn relay(home_addr: u64) -> DistributedRelay {
        let tracker = create_tracker(file!());
        let top = toplevel(&tracker, "top");
        DistributedRelay::new(
            &top,
            4,
            SysId::new(0, home_addr),
            0x0b05,
            &[6, 7],
            &DistRelayConfig::default(),
        )
    }

    fn neighbor_view(addr: u64) -> NeighborView {
        NeighborView {
            system: SysId::new(0, addr),
            key: 0x0c05,
            admin_portal_system: SysId::default(),
            admin_portal_key: 0,
            cscd: false,
            links: Vec::new(),
            gateway_algorithm: LagAlgorithm::Unspecified,
            port_algorithm: LagAlgorithm::Unspecified,
            gateway_digest: [0; 16],
            port_digest: [0; 16],
            gateway_enable: ConvVector::ones(),
            gateway_preference: ConvVector::zeroes(),
        }
    }

    #[test]
    fn solo_identity_is_home() {
        let mut r = relay(0xb01);
        assert!(!r.arbitrate());
        assert_eq!(r.portal_system, SysId::new(0, 0xb01));
        assert_eq!(r.portal_key, 0x0b05);
    }

    #[test]
    fn paired_identity_uses_lower_system() {
        let mut r = relay(0xb01);
        r.neighbor = Some(neighbor_view(0xb00));
        assert!(r.arbitrate());
        assert_eq!(r.portal_system, SysId::new(0, 0xb00));
        assert_eq!(r.portal_key, 0x0c05);

        // The lower system keeps its own identity and key
        let mut lower = relay(0xb00);
        lower.home_key = 0x0c05;
        lower.neighbor = Some(neighbor_view(0xb01));
        assert!(!lower.arbitrate());
        assert_eq!(lower.portal_system, SysId::new(0, 0xb00));
    }

    #[test]
    fn admin_identity_overrides() {
        let mut r = relay(0xb01);
        r.admin_portal_system = SysId::new(0, 0x550055);
        r.admin_portal_key = 0x0a05;
        r.neighbor = Some(neighbor_view(0xb00));
        r.arbitrate();
        assert_eq!(r.portal_system, SysId::new(0, 0x550055));
        assert_eq!(r.portal_key, 0x0a05);
    }

    #[test]
    fn gateway_split_by_lower_systems_preference() {
        let mut r = relay(0xb00); // home is the lower system
        let mut preference = ConvVector::zeroes();
        preference.set(3, true);
        r.gateway_preference = preference;
        r.neighbor = Some(neighbor_view(0xb01));

        r.select_gateways(&BTreeMap::new(), ConvLinkMap::Spread);
        assert!(r.gateway_home.get(3));
        assert!(!r.gateway_home.get(4));
    }

    #[test]
    fn gateway_exclusive_enables() {
        let mut r = relay(0xb00);
        let mut enable = ConvVector::zeroes();
        enable.set(1, true);
        enable.set(2, true);
        r.gateway_enable = enable;
        let mut neighbor = neighbor_view(0xb01);
        let mut n_enable = ConvVector::zeroes();
        n_enable.set(2, true);
        n_enable.set(3, true);
        neighbor.gateway_enable = n_enable;
        // Prefer the neighbor where both enable
        neighbor.gateway_preference = ConvVector::zeroes();
        r.gateway_preference = ConvVector::zeroes();
        r.neighbor = Some(neighbor);

        r.select_gateways(&BTreeMap::new(), ConvLinkMap::Spread);
        assert!(r.gateway_home.get(1)); // only home enables
        assert!(!r.gateway_home.get(2)); // both enable, preference clear -> higher
        assert!(!r.gateway_home.get(3)); // only neighbor enables
        assert!(!r.gateway_home.get(0)); // neither enables
    }

    #[test]
    fn cscd_follows_link_availability() {
        let mut r = relay(0xb00);
        r.cscd = true;
        let mut neighbor = neighbor_view(0xb01);
        neighbor.cscd = true;
        neighbor.links = vec![HomeLink {
            link_number: 3,
            up: true,
            distributing: true,
            partner_system: SysId::new(0, 0xe05),
        }];
        r.neighbor = Some(neighbor);
        r.home_links = vec![HomeLink {
            link_number: 1,
            up: true,
            distributing: true,
            partner_system: SysId::new(0, 0xe05),
        }];

        let mut admin = BTreeMap::new();
        admin.insert(0u16, vec![3, 1, 4, 2]);
        r.select_gateways(&admin, ConvLinkMap::AdminTable);
        // Link 3 lives on the neighbor, so conversation 0 exits there
        assert!(!r.gateway_home.get(0));

        // With link 3 down the preference list falls through to link 1
        r.neighbor.as_mut().unwrap().links[0].up = false;
        r.select_gateways(&admin, ConvLinkMap::AdminTable);
        assert!(r.gateway_home.get(0));
    }

    #[test]
    fn portal_partner_follows_lowest_link() {
        let mut r = relay(0xb01);
        r.neighbor = Some(neighbor_view(0xb00));
        r.home_links = vec![HomeLink {
            link_number: 3,
            up: true,
            distributing: false,
            partner_system: SysId::new(0, 0xe04),
        }];
        r.neighbor.as_mut().unwrap().links = vec![HomeLink {
            link_number: 1,
            up: true,
            distributing: false,
            partner_system: SysId::new(0, 0xe03),
        }];
        r.update_portal_partner();
        assert_eq!(r.portal_partner, Some(SysId::new(0, 0xe03)));

        // The neighbor's link going down hands the portal to the other
        // partner
        r.neighbor.as_mut().unwrap().links[0].up = false;
        r.update_portal_partner();
        assert_eq!(r.portal_partner, Some(SysId::new(0, 0xe04)));
    }
}

// Copyright (c) 2025 Graphcore Ltd. All rights reserved.

//! The LAG endpoint: collects and distributes frames over its attached
//! ports and owns the conversation-to-link map.

use std::collections::BTreeMap;
use std::rc::Rc;

use lagsim_model_builder::EntityDisplay;
use lagsim_track::entity::Entity;
use lagsim_track::info;

use super::DEFAULT_ACTOR_KEY;
use super::distribution::{self, CONV_IDS, ConvLinkMap};
use crate::types::{ConvListDigest, LagAlgorithm, SysId};

/// What sits above an aggregator on the ISS stack.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum AggClient {
    /// A bridge relay port of the owning device.
    BridgePort(usize),
    /// The end-station client of the owning device.
    Station,
    /// A distributed relay of the same shim.
    Relay(usize),
    /// Hierarchical aggregation: an outer aggregation port of the same shim.
    OuterPort(usize),
    /// Nothing attached; received frames are discarded.
    None,
}

#[derive(EntityDisplay)]
pub struct Aggregator {
    pub entity: Rc<Entity>,
    /// Index of this aggregator within its LinkAgg shim.
    pub index: usize,
    /// Management identifier, `0x200 + index` as conventionally numbered.
    pub aggregator_id: u16,

    pub actor_admin_system: SysId,
    pub actor_system: SysId,
    pub admin_key: u16,
    pub oper_key: u16,
    /// A disabled aggregator is never chosen by selection.
    pub enabled: bool,

    pub client: AggClient,

    pub port_algorithm: LagAlgorithm,
    pub conv_link_map: ConvLinkMap,
    pub admin_conv_links: BTreeMap<u16, Vec<u16>>,
    /// Management-supplied digest; when absent the digest is computed from
    /// the conversation configuration.
    pub admin_digest: Option<ConvListDigest>,

    pub discard_wrong_conversation_admin: bool,
    /// Forced on by the distributed relay while the portal disagrees.
    pub discard_wrong_conversation_forced: bool,
    /// Operational value, recomputed every tick.
    pub discard_wrong_conversation: bool,

    /// Partner's advertised conversation configuration, taken from the
    /// attached ports' version 2 LACPDUs.
    pub partner_algorithm: Option<LagAlgorithm>,
    pub partner_digest: Option<ConvListDigest>,

    conversation_link: Vec<u16>,
    map_fingerprint: u64,
}

impl Aggregator {
    #[must_use]
    pub fn new(parent: &Rc<Entity>, index: usize, system: SysId) -> Self {
        Self {
            entity: Rc::new(Entity::new(parent, &format!("aggregator{index}"))),
            index,
            aggregator_id: 0x200 + index as u16,
            actor_admin_system: system,
            actor_system: system,
            admin_key: DEFAULT_ACTOR_KEY,
            oper_key: DEFAULT_ACTOR_KEY,
            enabled: true,
            client: AggClient::None,
            port_algorithm: LagAlgorithm::Unspecified,
            conv_link_map: ConvLinkMap::Spread,
            admin_conv_links: BTreeMap::new(),
            admin_digest: None,
            discard_wrong_conversation_admin: false,
            discard_wrong_conversation_forced: false,
            discard_wrong_conversation: false,
            partner_algorithm: None,
            partner_digest: None,
            conversation_link: vec![0; CONV_IDS],
            map_fingerprint: 0,
        }
    }

    /// The link number carrying a conversation ID, 0 when none does.
    #[must_use]
    pub fn conversation_link(&self, conv_id: u16) -> u16 {
        self.conversation_link[conv_id as usize & 0xfff]
    }

    /// Digest of the conversation configuration as advertised to the
    /// partner and the portal neighbor.
    #[must_use]
    pub fn digest(&self) -> ConvListDigest {
        if let Some(digest) = self.admin_digest {
            return digest;
        }
        // Fold the conversation configuration; only equality matters
        let mut lo = 0xcbf2_9ce4_8422_2325u64;
        let mut hi = 0x9e37_79b9_7f4a_7c15u64;
        let mut mix = |byte: u8| {
            lo = (lo ^ byte as u64).wrapping_mul(0x0000_0100_0000_01b3);
            hi = hi.rotate_left(7) ^ lo;
        };
        mix(self.port_algorithm.to_wire());
        mix(self.conv_link_map as u8);
        for (cid, links) in &self.admin_conv_links {
            mix((cid >> 8) as u8);
            mix(*cid as u8);
            for link in links {
                mix((link >> 8) as u8);
                mix(*link as u8);
            }
            mix(0xff);
        }
        let mut digest = [0u8; 16];
        digest[..8].copy_from_slice(&lo.to_be_bytes());
        digest[8..].copy_from_slice(&hi.to_be_bytes());
        digest
    }

    /// Recompute the operational discard-wrong-conversation flag from the
    /// admin default, the relay override, and partner agreement.
    pub fn update_dwc(&mut self) {
        let partner_disagrees = match (self.partner_algorithm, self.partner_digest) {
            (Some(algorithm), Some(digest)) => {
                algorithm != self.port_algorithm || digest != self.digest()
            }
            (Some(algorithm), None) => algorithm != self.port_algorithm,
            _ => false,
        };
        self.discard_wrong_conversation = self.discard_wrong_conversation_admin
            || self.discard_wrong_conversation_forced
            || partner_disagrees;
    }

    /// Rebuild the conversation map if the distributing link set or the
    /// conversation configuration changed.
    pub fn update_conversation_map(&mut self, active_links: &[u16]) {
        let mut fingerprint = 0xcbf2_9ce4_8422_2325u64;
        let mut mix = |v: u64| {
            fingerprint = (fingerprint ^ v).wrapping_mul(0x0000_0100_0000_01b3);
        };
        for &link in active_links {
            mix(link as u64 + 1);
        }
        mix(self.conv_link_map as u64 + 0x100);
        mix(self.port_algorithm.to_wire() as u64 + 0x200);
        for (cid, links) in &self.admin_conv_links {
            mix(*cid as u64 + 0x10000);
            for link in links {
                mix(*link as u64 + 0x20000);
            }
        }

        if fingerprint == self.map_fingerprint {
            return;
        }
        self.map_fingerprint = fingerprint;
        self.conversation_link =
            distribution::build_map(self.conv_link_map, active_links, &self.admin_conv_links);
        info!(self.entity ; "conversation map rebuilt over links {active_links:?}");
    }

    // Management operations

    pub fn set_admin_key(&mut self, key: u16) {
        self.admin_key = key;
        self.oper_key = key;
    }

    pub fn set_enabled(&mut self, enabled: bool) {
        self.enabled = enabled;
    }

    pub fn set_port_algorithm(&mut self, algorithm: LagAlgorithm) {
        self.port_algorithm = algorithm;
    }

    pub fn set_conv_link_map(&mut self, map: ConvLinkMap) {
        self.conv_link_map = map;
    }

    pub fn set_conversation_admin_link(&mut self, conv_id: u16, links: Vec<u16>) {
        self.admin_conv_links.insert(conv_id & 0xfff, links);
    }

    pub fn set_conv_list_digest(&mut self, digest: ConvListDigest) {
        self.admin_digest = Some(digest);
    }

    pub fn set_discard_wrong_conversation(&mut self, discard: bool) {
        self.discard_wrong_conversation_admin = discard;
    }

    pub fn set_actor_system(&mut self, system: SysId) {
        self.actor_admin_system = system;
        self.actor_system = system;
    }
}

#[cfg(test)]
mod tests {
    use lagsim_track::entity::toplevel;
    use lagsim_track::test_helpers::create_tracker;

    use super::*;

    fn test_agg() -> Aggregator {
        let tracker = create_tracker(file!());
        let top = toplevel(&tracker, "top");
        Aggregator::new(&top, 0, SysId::new(0, 0xb00))
    }

    #[test]
    fn digest_tracks_configuration() {
        let mut agg = test_agg();
        let before = agg.digest();
        agg.set_port_algorithm(LagAlgorithm::CVid);
        assert_ne!(agg.digest(), before);

        let with_alg = agg.digest();
        agg.set_conversation_admin_link(0, vec![3, 1, 4, 2]);
        assert_ne!(agg.digest(), with_alg);

        // An admin digest overrides the computed one
        agg.set_conv_list_digest([9; 16]);
        assert_eq!(agg.digest(), [9; 16]);
    }

    #[test]
    fn dwc_set_on_partner_mismatch() {
        let mut agg = test_agg();
        agg.partner_algorithm = Some(LagAlgorithm::CVid);
        agg.partner_digest = Some(agg.digest());
        agg.update_dwc();
        assert!(agg.discard_wrong_conversation); // algorithm differs

        agg.set_port_algorithm(LagAlgorithm::CVid);
        agg.partner_digest = Some(agg.digest());
        agg.update_dwc();
        assert!(!agg.discard_wrong_conversation);

        agg.partner_digest = Some([1; 16]);
        agg.update_dwc();
        assert!(agg.discard_wrong_conversation);
    }

    #[test]
    fn map_rebuilds_only_on_change() {
        let mut agg = test_agg();
        agg.update_conversation_map(&[1, 2]);
        assert_eq!(agg.conversation_link(0), 1);
        assert_eq!(agg.conversation_link(1), 2);

        agg.update_conversation_map(&[2]);
        assert_eq!(agg.conversation_link(1), 2);
        assert_eq!(agg.conversation_link(0), 2);

        agg.update_conversation_map(&[]);
        assert_eq!(agg.conversation_link(0), 0);
    }
}

// Copyright (c) 2025 Graphcore Ltd. All rights reserved.

//! Ethernet frame envelope moved across simulated links.
//!
//! The body is carried as bytes: protocol PDUs are encoded when a frame is
//! built and parsed again at the receiver, so the wire codecs are exercised
//! on every exchange.

use std::fmt::Display;
use std::rc::Rc;

use lagsim_track::entity::Entity;
use lagsim_track::id::Unique;
use lagsim_track::{Id, create, create_id};

/// Destination address of the Slow Protocols group (LACP).
pub const SLOW_PROTOCOLS_DA: u64 = 0x0180_c200_0002;
/// Destination address of the Nearest Customer Bridge group.
pub const NEAREST_CUSTOMER_BRIDGE_DA: u64 = 0x0180_c200_0000;
/// Destination address used for DRCPDUs on intra-portal links.
pub const DRCP_DA: u64 = 0x0180_c200_0003;

/// Ethertype carried by LACPDUs and DRCPDUs.
pub const SLOW_PROTOCOLS_ETHERTYPE: u16 = 0x8809;
/// Customer VLAN tag ethertype.
pub const C_VLAN_ETHERTYPE: u16 = 0x8100;
/// Service VLAN tag ethertype.
pub const S_VLAN_ETHERTYPE: u16 = 0x88a8;
/// Ethertype used for generated test traffic (IEEE local experimental).
pub const TEST_DATA_ETHERTYPE: u16 = 0x88b5;

/// A VLAN tag. Only the tag type and the 12-bit VID matter to the models.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct VlanTag {
    pub ether_type: u16,
    pub vid: u16,
}

impl VlanTag {
    #[must_use]
    pub fn customer(vid: u16) -> Self {
        Self {
            ether_type: C_VLAN_ETHERTYPE,
            vid: vid & 0xfff,
        }
    }

    #[must_use]
    pub fn service(vid: u16) -> Self {
        Self {
            ether_type: S_VLAN_ETHERTYPE,
            vid: vid & 0xfff,
        }
    }
}

#[derive(Clone, Debug)]
pub struct Frame {
    id: Id,
    pub da: u64,
    pub sa: u64,
    pub ether_type: u16,
    pub tag: Option<VlanTag>,
    pub body: Vec<u8>,
    /// Tick at which the frame arrived at the current holder.
    pub arrived: u64,
}

impl Frame {
    #[must_use]
    pub fn new(created_by: &Rc<Entity>, da: u64, sa: u64, ether_type: u16) -> Self {
        let frame = Self {
            id: create_id!(created_by),
            da,
            sa,
            ether_type,
            tag: None,
            body: Vec::new(),
            arrived: 0,
        };
        create!(created_by ; frame, frame.total_bytes());
        frame
    }

    #[must_use]
    pub fn set_tag(mut self, tag: VlanTag) -> Self {
        self.tag = Some(tag);
        self
    }

    #[must_use]
    pub fn set_body(mut self, body: Vec<u8>) -> Self {
        self.body = body;
        self
    }

    /// Header plus tag plus body, as counted on the wire.
    #[must_use]
    pub fn total_bytes(&self) -> usize {
        let tag_bytes = if self.tag.is_some() { 4 } else { 0 };
        18 + tag_bytes + self.body.len()
    }

    /// True for Slow Protocols frames whose body starts with `subtype`.
    #[must_use]
    pub fn is_slow_protocol(&self, subtype: u8) -> bool {
        self.ether_type == SLOW_PROTOCOLS_ETHERTYPE && self.body.first() == Some(&subtype)
    }
}

impl Unique for Frame {
    fn id(&self) -> Id {
        self.id
    }
}

impl Display for Frame {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        match self.tag {
            Some(tag) => write!(
                f,
                "{:012x} -> {:012x} vid {} ({} bytes)",
                self.sa,
                self.da,
                tag.vid,
                self.total_bytes()
            ),
            None => write!(
                f,
                "{:012x} -> {:012x} ({} bytes)",
                self.sa,
                self.da,
                self.total_bytes()
            ),
        }
    }
}

// Copyright (c) 2025 Graphcore Ltd. All rights reserved.

//! DRCPDU wire format (version 2).
//!
//! A DRCPDU summarises one portal system's view: portal identity, the state
//! of its DRNI links, its gateway configuration and the digests the peer
//! needs for consistency checks. Everything after the subtype and version
//! is TLV-encoded; parsers skip unknown types. The 4096-bit gateway vectors
//! are split over four TLVs each because a TLV length octet cannot cover
//! 512 bytes.

use crate::types::{ConvListDigest, ConvVector, LagAlgorithm, SysId};

/// Slow Protocols subtype of DRCP.
pub const DRCP_SUBTYPE: u8 = 0x0d;

const TERMINATOR_TLV: u8 = 0x00;
const PORTAL_INFO_TLV: u8 = 0x01;
const HOME_LINKS_TLV: u8 = 0x02;
const NEIGHBOR_ECHO_TLV: u8 = 0x03;
const GATEWAY_ALGORITHM_TLV: u8 = 0x04;
const PORT_ALGORITHM_TLV: u8 = 0x05;
const GATEWAY_DIGEST_TLV: u8 = 0x06;
const PORT_DIGEST_TLV: u8 = 0x07;
const GATEWAY_ENABLE_TLV: u8 = 0x08;
const GATEWAY_PREFERENCE_TLV: u8 = 0x09;

const VECTOR_PART_BYTES: usize = 128;
const LINK_ENTRY_BYTES: usize = 11;

/// State of one DRNI link as reported by its home system.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct HomeLink {
    pub link_number: u16,
    pub up: bool,
    pub distributing: bool,
    pub partner_system: SysId,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Drcpdu {
    pub version: u8,
    pub admin_portal_system: SysId,
    pub admin_portal_key: u16,
    pub home_system: SysId,
    pub home_key: u16,
    pub cscd: bool,
    pub home_links: Vec<HomeLink>,
    /// Echo of the neighbor this system believes it is paired with.
    pub neighbor_system: SysId,
    pub gateway_algorithm: LagAlgorithm,
    pub port_algorithm: LagAlgorithm,
    pub gateway_digest: ConvListDigest,
    pub port_digest: ConvListDigest,
    pub gateway_enable: ConvVector,
    pub gateway_preference: ConvVector,
}

fn push_tlv(b: &mut Vec<u8>, tlv: u8, value: &[u8]) {
    debug_assert!(value.len() + 2 <= u8::MAX as usize);
    b.push(tlv);
    b.push(value.len() as u8 + 2);
    b.extend_from_slice(value);
}

fn push_sysid(value: &mut Vec<u8>, system: SysId) {
    value.extend_from_slice(&system.id().to_be_bytes());
}

fn read_sysid(v: &[u8]) -> SysId {
    SysId::from_id(u64::from_be_bytes(v[..8].try_into().unwrap()))
}

fn push_vector(b: &mut Vec<u8>, tlv: u8, vector: &ConvVector) {
    let bytes = vector.to_bytes();
    for (part, chunk) in bytes.chunks(VECTOR_PART_BYTES).enumerate() {
        let mut value = Vec::with_capacity(1 + VECTOR_PART_BYTES);
        value.push(part as u8);
        value.extend_from_slice(chunk);
        push_tlv(b, tlv, &value);
    }
}

impl Drcpdu {
    #[must_use]
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut b = Vec::with_capacity(1200);
        b.push(DRCP_SUBTYPE);
        b.push(self.version);

        let mut portal = Vec::with_capacity(21);
        push_sysid(&mut portal, self.admin_portal_system);
        portal.extend_from_slice(&self.admin_portal_key.to_be_bytes());
        push_sysid(&mut portal, self.home_system);
        portal.extend_from_slice(&self.home_key.to_be_bytes());
        portal.push(self.cscd as u8);
        push_tlv(&mut b, PORTAL_INFO_TLV, &portal);

        let mut links = Vec::with_capacity(1 + self.home_links.len() * LINK_ENTRY_BYTES);
        links.push(self.home_links.len() as u8);
        for link in &self.home_links {
            links.extend_from_slice(&link.link_number.to_be_bytes());
            links.push(link.up as u8 | (link.distributing as u8) << 1);
            links.extend_from_slice(&link.partner_system.id().to_be_bytes());
        }
        push_tlv(&mut b, HOME_LINKS_TLV, &links);

        let mut echo = Vec::with_capacity(8);
        push_sysid(&mut echo, self.neighbor_system);
        push_tlv(&mut b, NEIGHBOR_ECHO_TLV, &echo);

        push_tlv(&mut b, GATEWAY_ALGORITHM_TLV, &[self.gateway_algorithm.to_wire()]);
        push_tlv(&mut b, PORT_ALGORITHM_TLV, &[self.port_algorithm.to_wire()]);
        push_tlv(&mut b, GATEWAY_DIGEST_TLV, &self.gateway_digest);
        push_tlv(&mut b, PORT_DIGEST_TLV, &self.port_digest);
        push_vector(&mut b, GATEWAY_ENABLE_TLV, &self.gateway_enable);
        push_vector(&mut b, GATEWAY_PREFERENCE_TLV, &self.gateway_preference);

        b.push(TERMINATOR_TLV);
        b.push(0);
        b
    }

    /// Parse a DRCPDU body. `None` for anything malformed.
    #[must_use]
    pub fn from_bytes(bytes: &[u8]) -> Option<Drcpdu> {
        if bytes.len() < 4 || bytes[0] != DRCP_SUBTYPE {
            return None;
        }
        let version = bytes[1];
        if version < 2 {
            return None;
        }

        let mut pdu = Drcpdu {
            version,
            admin_portal_system: SysId::default(),
            admin_portal_key: 0,
            home_system: SysId::default(),
            home_key: 0,
            cscd: false,
            home_links: Vec::new(),
            neighbor_system: SysId::default(),
            gateway_algorithm: LagAlgorithm::Unspecified,
            port_algorithm: LagAlgorithm::Unspecified,
            gateway_digest: [0; 16],
            port_digest: [0; 16],
            gateway_enable: ConvVector::zeroes(),
            gateway_preference: ConvVector::zeroes(),
        };
        let mut enable_bytes = vec![0u8; 512];
        let mut preference_bytes = vec![0u8; 512];
        let mut seen_portal = false;

        let mut at = 2;
        while at + 2 <= bytes.len() {
            let tlv = bytes[at];
            if tlv == TERMINATOR_TLV {
                break;
            }
            let len = bytes[at + 1] as usize;
            if len < 2 || at + len > bytes.len() {
                return None;
            }
            let value = &bytes[at + 2..at + len];
            match tlv {
                PORTAL_INFO_TLV if value.len() == 21 => {
                    pdu.admin_portal_system = read_sysid(&value[0..]);
                    pdu.admin_portal_key = u16::from_be_bytes([value[8], value[9]]);
                    pdu.home_system = read_sysid(&value[10..]);
                    pdu.home_key = u16::from_be_bytes([value[18], value[19]]);
                    pdu.cscd = value[20] != 0;
                    seen_portal = true;
                }
                HOME_LINKS_TLV if !value.is_empty() => {
                    let count = value[0] as usize;
                    if value.len() != 1 + count * LINK_ENTRY_BYTES {
                        return None;
                    }
                    for entry in value[1..].chunks_exact(LINK_ENTRY_BYTES) {
                        pdu.home_links.push(HomeLink {
                            link_number: u16::from_be_bytes([entry[0], entry[1]]),
                            up: entry[2] & 0x01 != 0,
                            distributing: entry[2] & 0x02 != 0,
                            partner_system: read_sysid(&entry[3..]),
                        });
                    }
                }
                NEIGHBOR_ECHO_TLV if value.len() == 8 => {
                    pdu.neighbor_system = read_sysid(value);
                }
                GATEWAY_ALGORITHM_TLV if value.len() == 1 => {
                    pdu.gateway_algorithm = LagAlgorithm::from_wire(value[0]);
                }
                PORT_ALGORITHM_TLV if value.len() == 1 => {
                    pdu.port_algorithm = LagAlgorithm::from_wire(value[0]);
                }
                GATEWAY_DIGEST_TLV if value.len() == 16 => {
                    pdu.gateway_digest = value.try_into().unwrap();
                }
                PORT_DIGEST_TLV if value.len() == 16 => {
                    pdu.port_digest = value.try_into().unwrap();
                }
                GATEWAY_ENABLE_TLV | GATEWAY_PREFERENCE_TLV
                    if value.len() == 1 + VECTOR_PART_BYTES =>
                {
                    let part = value[0] as usize;
                    if part >= 4 {
                        return None;
                    }
                    let dest = if tlv == GATEWAY_ENABLE_TLV {
                        &mut enable_bytes
                    } else {
                        &mut preference_bytes
                    };
                    dest[part * VECTOR_PART_BYTES..(part + 1) * VECTOR_PART_BYTES]
                        .copy_from_slice(&value[1..]);
                }
                _ => {
                    // Unknown TLV type, skip
                }
            }
            at += len;
        }

        if !seen_portal {
            return None;
        }
        pdu.gateway_enable = ConvVector::from_bytes(&enable_bytes)?;
        pdu.gateway_preference = ConvVector::from_bytes(&preference_bytes)?;
        Some(pdu)
    }
}

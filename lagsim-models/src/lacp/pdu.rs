// Copyright (c) 2025 Graphcore Ltd. All rights reserved.

//! LACPDU wire format.
//!
//! Fixed version 1 layout (110 bytes): subtype, version, actor TLV, partner
//! TLV, collector TLV, terminator, pad. Version 2 PDUs insert a port
//! algorithm TLV and a port conversation ID digest TLV before the
//! terminator so the two ends of a LAG can detect conversation-map
//! disagreement. Parsers skip unknown TLVs.

use crate::types::{ConvListDigest, LagAlgorithm, PortId, SysId};

/// Slow Protocols subtype of LACP.
pub const LACP_SUBTYPE: u8 = 0x01;

const ACTOR_TLV: u8 = 0x01;
const PARTNER_TLV: u8 = 0x02;
const COLLECTOR_TLV: u8 = 0x03;
const PORT_ALGORITHM_TLV: u8 = 0x04;
const PORT_CONV_DIGEST_TLV: u8 = 0x05;
const TERMINATOR_TLV: u8 = 0x00;

const ACTOR_INFO_LEN: u8 = 20;
const COLLECTOR_INFO_LEN: u8 = 16;
const VERSION_1_LEN: usize = 110;

// Port state byte bits, shared by LACP and DRCP actor/partner state.
pub const STATE_ACTIVITY: u8 = 0x01;
pub const STATE_TIMEOUT: u8 = 0x02;
pub const STATE_AGGREGATION: u8 = 0x04;
pub const STATE_SYNC: u8 = 0x08;
pub const STATE_COLLECTING: u8 = 0x10;
pub const STATE_DISTRIBUTING: u8 = 0x20;
pub const STATE_DEFAULTED: u8 = 0x40;
pub const STATE_EXPIRED: u8 = 0x80;

/// One participant's view of itself or its partner.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct ParticipantInfo {
    pub system: SysId,
    pub key: u16,
    pub port: PortId,
    pub state: u8,
}

impl ParticipantInfo {
    #[must_use]
    pub fn state_bit(&self, bit: u8) -> bool {
        self.state & bit != 0
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Lacpdu {
    pub version: u8,
    pub actor: ParticipantInfo,
    pub partner: ParticipantInfo,
    pub collector_max_delay: u16,
    /// Version 2 only.
    pub port_algorithm: Option<LagAlgorithm>,
    /// Version 2 only.
    pub conv_digest: Option<ConvListDigest>,
}

fn push_participant(b: &mut Vec<u8>, tlv: u8, info: &ParticipantInfo) {
    b.push(tlv);
    b.push(ACTOR_INFO_LEN);
    b.extend_from_slice(&info.system.priority.to_be_bytes());
    let addr = info.system.addr.to_be_bytes();
    b.extend_from_slice(&addr[2..8]);
    b.extend_from_slice(&info.key.to_be_bytes());
    b.extend_from_slice(&info.port.priority.to_be_bytes());
    b.extend_from_slice(&info.port.number.to_be_bytes());
    b.push(info.state);
    b.extend_from_slice(&[0; 3]);
}

fn parse_participant(v: &[u8]) -> ParticipantInfo {
    let priority = u16::from_be_bytes([v[0], v[1]]);
    let mut addr_bytes = [0u8; 8];
    addr_bytes[2..8].copy_from_slice(&v[2..8]);
    ParticipantInfo {
        system: SysId::new(priority, u64::from_be_bytes(addr_bytes)),
        key: u16::from_be_bytes([v[8], v[9]]),
        port: PortId::new(
            u16::from_be_bytes([v[10], v[11]]),
            u16::from_be_bytes([v[12], v[13]]),
        ),
        state: v[14],
    }
}

impl Lacpdu {
    #[must_use]
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut b = Vec::with_capacity(VERSION_1_LEN);
        b.push(LACP_SUBTYPE);
        b.push(self.version);
        push_participant(&mut b, ACTOR_TLV, &self.actor);
        push_participant(&mut b, PARTNER_TLV, &self.partner);
        b.push(COLLECTOR_TLV);
        b.push(COLLECTOR_INFO_LEN);
        b.extend_from_slice(&self.collector_max_delay.to_be_bytes());
        b.extend_from_slice(&[0; 12]);
        if self.version >= 2 {
            if let Some(algorithm) = self.port_algorithm {
                b.push(PORT_ALGORITHM_TLV);
                b.push(3);
                b.push(algorithm.to_wire());
            }
            if let Some(digest) = self.conv_digest {
                b.push(PORT_CONV_DIGEST_TLV);
                b.push(18);
                b.extend_from_slice(&digest);
            }
        }
        b.push(TERMINATOR_TLV);
        b.push(0);
        b.resize(b.len().max(VERSION_1_LEN), 0);
        b
    }

    /// Parse a LACPDU body. Returns `None` for anything malformed; the
    /// caller drops such frames silently per the no-fail protocol design.
    #[must_use]
    pub fn from_bytes(bytes: &[u8]) -> Option<Lacpdu> {
        if bytes.len() < VERSION_1_LEN || bytes[0] != LACP_SUBTYPE {
            return None;
        }
        let version = bytes[1];
        if version == 0 {
            return None;
        }

        let mut actor = None;
        let mut partner = None;
        let mut collector_max_delay = 0;
        let mut port_algorithm = None;
        let mut conv_digest = None;

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
                ACTOR_TLV if len == ACTOR_INFO_LEN as usize => {
                    actor = Some(parse_participant(value));
                }
                PARTNER_TLV if len == ACTOR_INFO_LEN as usize => {
                    partner = Some(parse_participant(value));
                }
                COLLECTOR_TLV if len == COLLECTOR_INFO_LEN as usize => {
                    collector_max_delay = u16::from_be_bytes([value[0], value[1]]);
                }
                PORT_ALGORITHM_TLV if len == 3 => {
                    port_algorithm = Some(LagAlgorithm::from_wire(value[0]));
                }
                PORT_CONV_DIGEST_TLV if len == 18 => {
                    conv_digest = Some(value[..16].try_into().unwrap());
                }
                _ => {
                    // Unknown TLV type, skip
                }
            }
            at += len;
        }

        Some(Lacpdu {
            version,
            actor: actor?,
            partner: partner?,
            collector_max_delay,
            port_algorithm,
            conv_digest,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample(version: u8) -> Lacpdu {
        Lacpdu {
            version,
            actor: ParticipantInfo {
                system: SysId::new(0x8000, 0xb00),
                key: 0x0a01,
                port: PortId::new(0, 0x101),
                state: STATE_ACTIVITY | STATE_TIMEOUT | STATE_AGGREGATION | STATE_SYNC,
            },
            partner: ParticipantInfo {
                system: SysId::new(0x8000, 0xb01),
                key: 0x0a01,
                port: PortId::new(0, 0x102),
                state: STATE_ACTIVITY | STATE_SYNC | STATE_COLLECTING | STATE_DISTRIBUTING,
            },
            collector_max_delay: 50,
            port_algorithm: (version >= 2).then_some(LagAlgorithm::CVid),
            conv_digest: (version >= 2).then_some([0x5a; 16]),
        }
    }

    #[test]
    fn version_1_round_trip() {
        let pdu = sample(1);
        let bytes = pdu.to_bytes();
        assert_eq!(bytes.len(), 110);
        let back = Lacpdu::from_bytes(&bytes).unwrap();
        assert_eq!(back, pdu);
    }

    #[test]
    fn version_2_round_trip() {
        let pdu = sample(2);
        let back = Lacpdu::from_bytes(&pdu.to_bytes()).unwrap();
        assert_eq!(back, pdu);
        assert_eq!(back.port_algorithm, Some(LagAlgorithm::CVid));
        assert_eq!(back.conv_digest, Some([0x5a; 16]));
    }

    #[test]
    fn unknown_tlv_is_skipped() {
        let mut bytes = sample(2).to_bytes();
        // Splice an unknown TLV in front of the terminator, which for the
        // version 2 sample sits after the digest TLV: 2 header bytes, the
        // 20+20+16 fixed TLVs, then 3 + 18 version 2 bytes
        let term = 2 + 20 + 20 + 16 + 3 + 18;
        assert_eq!(bytes[term], TERMINATOR_TLV);
        bytes.splice(term..term, [0x7f, 4, 0xde, 0xad]);
        let back = Lacpdu::from_bytes(&bytes).unwrap();
        assert_eq!(back, sample(2));
    }

    #[test]
    fn malformed_rejected() {
        assert!(Lacpdu::from_bytes(&[]).is_none());
        assert!(Lacpdu::from_bytes(&[LACP_SUBTYPE, 1, 0, 0]).is_none());

        // Truncated inside a TLV
        let bytes = sample(1).to_bytes();
        assert!(Lacpdu::from_bytes(&bytes[..40]).is_none());

        // Wrong subtype
        let mut bad = sample(1).to_bytes();
        bad[0] = 0x02;
        assert!(Lacpdu::from_bytes(&bad).is_none());

        // TLV with an impossible length
        let mut bad = sample(1).to_bytes();
        bad[3] = 1;
        assert!(Lacpdu::from_bytes(&bad).is_none());
    }
}

// Copyright (c) 2025 Graphcore Ltd. All rights reserved.

//! Conversation-ID computation and the conversation-to-link maps.
//!
//! Every variant is a pure function of the sorted list of distributing link
//! numbers (plus the admin table where applicable), so both ends of a LAG
//! compute identical maps from identical inputs.

use std::collections::BTreeMap;

use crate::frame::{C_VLAN_ETHERTYPE, Frame, S_VLAN_ETHERTYPE};
use crate::types::LagAlgorithm;

/// Number of distinct conversation IDs.
pub const CONV_IDS: usize = 4096;

/// Selects how conversation IDs are spread over the links of a LAG.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum ConvLinkMap {
    /// Modulo spread over the sorted active link numbers.
    #[default]
    Spread,
    /// Even conversation IDs on the lowest link, odd on the highest.
    EvenOdd,
    /// Conversation ID `c` prefers link number `(c % 8) + 1`, falling back
    /// downward with wrap-around. Link numbers above 8 occupy slot
    /// `((n - 1) % 8) + 1`; the lowest number wins a contested slot.
    EightLinkSpread,
    /// Everything on the lowest active link.
    ActiveStandby,
    /// Per-conversation ordered preference lists supplied by management.
    AdminTable,
}

/// Fold a 48-bit address pair to a 12-bit conversation ID.
#[must_use]
pub fn address_hash(da: u64, sa: u64) -> u16 {
    let x = da ^ sa;
    ((x ^ (x >> 12) ^ (x >> 24) ^ (x >> 36)) & 0xfff) as u16
}

/// Compute the conversation ID of a frame under the given algorithm.
#[must_use]
pub fn conversation_id(frame: &Frame, algorithm: LagAlgorithm) -> u16 {
    match algorithm {
        LagAlgorithm::Unspecified => address_hash(frame.da, frame.sa),
        LagAlgorithm::CVid => match frame.tag {
            Some(tag) if tag.ether_type == C_VLAN_ETHERTYPE => tag.vid,
            _ => 0,
        },
        LagAlgorithm::SVid => match frame.tag {
            Some(tag) if tag.ether_type == S_VLAN_ETHERTYPE => tag.vid,
            _ => 0,
        },
        LagAlgorithm::ISid => match frame.tag {
            Some(tag) => tag.vid,
            None => 0,
        },
    }
}

/// Build the 4096-entry conversation-ID to link-number map.
///
/// `active` must be the sorted list of link numbers currently distributing.
/// Entry 0 means no link carries that conversation.
#[must_use]
pub fn build_map(
    map: ConvLinkMap,
    active: &[u16],
    admin: &BTreeMap<u16, Vec<u16>>,
) -> Vec<u16> {
    let mut table = vec![0u16; CONV_IDS];
    if active.is_empty() {
        return table;
    }

    match map {
        ConvLinkMap::Spread => {
            let k = active.len();
            for (cid, entry) in table.iter_mut().enumerate() {
                *entry = active[cid % k];
            }
        }
        ConvLinkMap::EvenOdd => {
            let low = active[0];
            let high = *active.last().unwrap();
            for (cid, entry) in table.iter_mut().enumerate() {
                *entry = if cid % 2 == 0 { low } else { high };
            }
        }
        ConvLinkMap::EightLinkSpread => {
            // Each link claims the slot of its number folded into 1..=8;
            // the lowest number wins a contested slot.
            let mut slots = [0u16; 8];
            for &n in active {
                let slot = ((n as usize - 1) % 8) + 1;
                if slots[slot - 1] == 0 || n < slots[slot - 1] {
                    slots[slot - 1] = n;
                }
            }
            for (cid, entry) in table.iter_mut().enumerate() {
                let mut slot = cid % 8;
                for _ in 0..8 {
                    if slots[slot] != 0 {
                        *entry = slots[slot];
                        break;
                    }
                    slot = (slot + 7) % 8;
                }
            }
        }
        ConvLinkMap::ActiveStandby => {
            table.fill(active[0]);
        }
        ConvLinkMap::AdminTable => {
            for (&cid, preferences) in admin {
                if let Some(&link) = preferences
                    .iter()
                    .find(|&&n| active.binary_search(&n).is_ok())
                {
                    table[cid as usize & 0xfff] = link;
                }
            }
        }
    }
    table
}

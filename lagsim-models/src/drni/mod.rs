// Copyright (c) 2025 Graphcore Ltd. All rights reserved.

//! Distributed Resilient Network Interconnect.
//!
//! Two systems joined by intra-portal links form a portal that presents a
//! single LACP identity to external partners. [`relay`] holds the
//! distributed relay itself, [`ipp`] the per-link DRCP peer machine and
//! [`pdu`] the DRCPDU codec.

pub mod ipp;
pub mod pdu;
pub mod relay;

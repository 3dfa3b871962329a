// Copyright (c) 2024 Graphcore Ltd. All rights reserved.

//! Unique identifiers for simulation entities and tracked objects.

use std::fmt;

/// Type used for unique track identifiers.
///
/// Each _log_/_trace_ event within the application is attributed to an `Id`.
/// There are two reserved values: [`NO_ID`](crate::NO_ID) and
/// [`ROOT`](crate::ROOT).
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Id(pub u64);

impl fmt::Display for Id {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Implemented by objects that carry an [`Id`] so they can be followed
/// through the trace output.
pub trait Unique {
    /// The object's unique id.
    fn id(&self) -> Id;
}

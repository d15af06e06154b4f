#![warn(missing_docs)]
//! Consistency levels and their wire codes.
use crate::error;
use derive_more::Display;
use serde::{Deserialize, Serialize};
use std::str::FromStr;

/// Number of replicas which have to acknowledge a request before the coordinator answers.
#[derive(
    Debug,
    PartialEq,
    Clone,
    Copy,
    Display,
    Ord,
    PartialOrd,
    Eq,
    Hash,
    Default,
    Serialize,
    Deserialize,
)]
#[non_exhaustive]
pub enum Consistency {
    /// Closest replica, as determined by the snitch. Writes only.
    Any,
    /// A single replica must respond.
    #[default]
    One,
    /// Two replicas must respond.
    Two,
    /// Three replicas must respond.
    Three,
    /// A quorum of replicas across all data centers must respond.
    Quorum,
    /// All replicas must respond.
    All,
    /// A quorum of replicas in the data center of the coordinator must respond.
    LocalQuorum,
    /// A quorum of replicas in every data center must respond.
    EachQuorum,
    /// Linearizable consistency for lightweight transactions. Only valid as a serial
    /// consistency.
    Serial,
    /// Same as `Serial`, but confined to the data center of the coordinator.
    LocalSerial,
    /// A single replica in the local data center must respond.
    LocalOne,
}

/// Wire code and name of every consistency level.
const LEVELS: [(Consistency, i16, &str); 11] = [
    (Consistency::Any, 0x0000, "Any"),
    (Consistency::One, 0x0001, "One"),
    (Consistency::Two, 0x0002, "Two"),
    (Consistency::Three, 0x0003, "Three"),
    (Consistency::Quorum, 0x0004, "Quorum"),
    (Consistency::All, 0x0005, "All"),
    (Consistency::LocalQuorum, 0x0006, "LocalQuorum"),
    (Consistency::EachQuorum, 0x0007, "EachQuorum"),
    (Consistency::Serial, 0x0008, "Serial"),
    (Consistency::LocalSerial, 0x0009, "LocalSerial"),
    (Consistency::LocalOne, 0x000A, "LocalOne"),
];

impl FromStr for Consistency {
    type Err = error::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        LEVELS
            .iter()
            .find(|(_, _, name)| *name == s)
            .map(|(consistency, _, _)| *consistency)
            .ok_or_else(|| error::Error::General(format!("Invalid consistency provided: {s}")))
    }
}

impl TryFrom<i16> for Consistency {
    type Error = error::Error;

    fn try_from(value: i16) -> Result<Self, Self::Error> {
        LEVELS
            .iter()
            .find(|(_, code, _)| *code == value)
            .map(|(consistency, _, _)| *consistency)
            .ok_or(error::Error::UnknownConsistency(value))
    }
}

impl From<Consistency> for i16 {
    fn from(value: Consistency) -> Self {
        // LEVELS lists every variant
        LEVELS
            .iter()
            .find(|(consistency, _, _)| *consistency == value)
            .map_or(0x0001, |(_, code, _)| *code)
    }
}

impl Consistency {
    /// Whether only replicas in the coordinator's data center count.
    #[inline]
    pub fn is_dc_local(self) -> bool {
        matches!(
            self,
            Consistency::LocalOne | Consistency::LocalQuorum | Consistency::LocalSerial
        )
    }

    /// Is this a serial consistency, usable only for the conditional phase of lightweight
    /// transactions.
    #[inline]
    pub fn is_serial(self) -> bool {
        matches!(self, Consistency::Serial | Consistency::LocalSerial)
    }
}

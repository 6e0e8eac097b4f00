//! Compute fleet accounting.
//!
//! A [`Resource`] is one node's CPU and memory; a [`ResourceAllocation`] is a
//! claim carved out of one node. The [`ResourceManager`] is the only writer of
//! either, and packs job requests onto the fleet with one of three
//! [`AllocationParadigm`]s.

mod allocation;
mod manager;
mod packing;
mod resource;

pub use allocation::{totals, ResourceAllocation};
pub use manager::ResourceManager;
pub use resource::{Grant, Resource, ResourceAvailability, ResourceState};

use std::fmt;
use std::str::FromStr;

use hydromaas_id::ResourceId;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::store::{Retryable, StoreError};

/// Errors from resource operations.
///
/// Running out of capacity is not an error; allocation methods report it as
/// `Ok(None)`.
#[derive(Debug, Error)]
pub enum ResourceError {
    #[error("invalid allocation parameters: cpus={cpus}, memory={memory}")]
    InvalidParameters { cpus: u32, memory: u64 },

    #[error("unknown resource '{0}'")]
    UnknownResource(ResourceId),

    #[error("store error: {0}")]
    Store(#[from] StoreError),
}

impl Retryable for ResourceError {
    fn is_conflict(&self) -> bool {
        matches!(self, ResourceError::Store(e) if e.is_conflict())
    }
}

/// How a job's request is packed onto the fleet.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum AllocationParadigm {
    /// Everything on the first node that can hold all of it.
    SingleNode,
    /// Greedily fill nodes in fleet order until the request is met.
    FillNodes,
    /// An even share on every active, ready node.
    RoundRobin,
}

impl AllocationParadigm {
    pub fn as_str(&self) -> &'static str {
        match self {
            AllocationParadigm::SingleNode => "SINGLE_NODE",
            AllocationParadigm::FillNodes => "FILL_NODES",
            AllocationParadigm::RoundRobin => "ROUND_ROBIN",
        }
    }
}

impl fmt::Display for AllocationParadigm {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("unrecognized allocation paradigm '{0}'")]
pub struct ParadigmParseError(pub String);

/// Lowercase and drop `-`, `_` and whitespace.
fn normalize(s: &str) -> String {
    s.chars()
        .filter(|c| !matches!(c, '-' | '_') && !c.is_whitespace())
        .flat_map(char::to_lowercase)
        .collect()
}

impl FromStr for AllocationParadigm {
    type Err = ParadigmParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match normalize(s).as_str() {
            "singlenode" => Ok(AllocationParadigm::SingleNode),
            "fillnodes" => Ok(AllocationParadigm::FillNodes),
            "roundrobin" => Ok(AllocationParadigm::RoundRobin),
            _ => Err(ParadigmParseError(s.to_string())),
        }
    }
}

/// Whether a node's share of a request is one allocation or one per CPU.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum AssetGrouping {
    #[default]
    Bundle,
    Silo,
}

impl FromStr for AssetGrouping {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match normalize(s).as_str() {
            "bundle" => Ok(AssetGrouping::Bundle),
            "silo" => Ok(AssetGrouping::Silo),
            _ => Err(format!("unrecognized asset grouping '{s}'")),
        }
    }
}

//! Typed ID definitions for scheduler entities.

use chrono::{DateTime, NaiveDateTime, Utc};

use crate::{define_uuid_id, IdError};

// =============================================================================
// Jobs and Scheduler Processes
// =============================================================================

define_uuid_id!(
    /// Identity of a scheduled job.
    JobId
);

define_uuid_id!(
    /// Token identifying one scheduler process as the holder of a shared lock.
    LockOwnerId
);

// =============================================================================
// Resources
// =============================================================================

/// Name of a compute node, unique within its pool.
///
/// Resource IDs are chosen by whoever maintains the fleet inventory. They are
/// embedded in namespaced store keys, so whitespace and `:` are rejected.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ResourceId(String);

impl ResourceId {
    /// Maximum accepted length.
    pub const MAX_LEN: usize = 128;

    /// Parses and validates a resource ID.
    pub fn parse(s: &str) -> Result<Self, IdError> {
        if s.is_empty() {
            return Err(IdError::Empty);
        }
        if s.len() > Self::MAX_LEN {
            return Err(IdError::TooLong {
                max: Self::MAX_LEN,
                actual: s.len(),
            });
        }
        if let Some(character) = s.chars().find(|c| c.is_whitespace() || *c == ':') {
            return Err(IdError::InvalidCharacter {
                character,
                value: s.to_string(),
            });
        }
        Ok(Self(s.to_string()))
    }

    /// Returns the ID as a string slice.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for ResourceId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

impl std::str::FromStr for ResourceId {
    type Err = IdError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl serde::Serialize for ResourceId {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        serializer.serialize_str(&self.0)
    }
}

impl<'de> serde::Deserialize<'de> for ResourceId {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        Self::parse(&s).map_err(serde::de::Error::custom)
    }
}

// =============================================================================
// Allocations
// =============================================================================

const ALLOCATION_TS_FORMAT: &str = "%Y%m%dT%H%M%S%.9fZ";

/// Identity of a resource allocation: the source resource plus the creation
/// instant, formatted as `{resource_id}_{timestamp}`.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct AllocationId {
    resource_id: ResourceId,
    created: DateTime<Utc>,
}

impl AllocationId {
    /// Derives the ID of an allocation carved out of `resource_id` at `created`.
    #[must_use]
    pub fn new(resource_id: ResourceId, created: DateTime<Utc>) -> Self {
        Self {
            resource_id,
            created,
        }
    }

    /// The resource this allocation was carved from.
    pub fn resource_id(&self) -> &ResourceId {
        &self.resource_id
    }

    /// When the allocation was created.
    pub fn created(&self) -> DateTime<Utc> {
        self.created
    }

    /// Parses an allocation ID from its string form.
    pub fn parse(s: &str) -> Result<Self, IdError> {
        if s.is_empty() {
            return Err(IdError::Empty);
        }

        // Resource IDs may themselves contain underscores; the timestamp never does.
        let Some((resource, ts)) = s.rsplit_once('_') else {
            return Err(IdError::MissingSeparator);
        };

        let resource_id = ResourceId::parse(resource)?;
        let created = NaiveDateTime::parse_from_str(ts, ALLOCATION_TS_FORMAT)
            .map_err(|e| IdError::InvalidFormat {
                message: format!("bad allocation timestamp '{ts}': {e}"),
            })?
            .and_utc();

        Ok(Self {
            resource_id,
            created,
        })
    }
}

impl std::fmt::Display for AllocationId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{}_{}",
            self.resource_id,
            self.created.format(ALLOCATION_TS_FORMAT)
        )
    }
}

impl std::str::FromStr for AllocationId {
    type Err = IdError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl serde::Serialize for AllocationId {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        serializer.collect_str(self)
    }
}

impl<'de> serde::Deserialize<'de> for AllocationId {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        Self::parse(&s).map_err(serde::de::Error::custom)
    }
}

// =============================================================================
// Tests
// =============================================================================

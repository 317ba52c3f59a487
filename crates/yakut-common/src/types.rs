//! Protocol primitive types used across the Yakut workspace.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::{Result, YakutError};

/// Largest valid subject-ID.
pub const SUBJECT_ID_MAX: u16 = 8191;

/// Largest valid service-ID.
pub const SERVICE_ID_MAX: u16 = 511;

/// Identifier of a node on the network.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct NodeId(u16);

impl NodeId {
    /// Creates a node-ID from a raw value.
    #[must_use]
    pub const fn new(id: u16) -> Self {
        Self(id)
    }

    /// Returns the raw value.
    #[must_use]
    pub const fn get(self) -> u16 {
        self.0
    }

    /// Converts a signed integer (as produced by the integer-set parser) into a node-ID.
    ///
    /// # Errors
    ///
    /// Returns an error if the value does not fit into 16 bits.
    pub fn try_from_i64(value: i64) -> Result<Self> {
        u16::try_from(value)
            .map(Self)
            .map_err(|_| YakutError::invalid(format!("{value} is not a valid node-ID")))
    }
}

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Identifier of a subject (publish/subscribe port).
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct SubjectId(u16);

impl SubjectId {
    /// Creates a subject-ID, validating the range.
    ///
    /// # Errors
    ///
    /// Returns an error if the value exceeds [`SUBJECT_ID_MAX`].
    pub fn new(id: u16) -> Result<Self> {
        if id > SUBJECT_ID_MAX {
            return Err(YakutError::invalid(format!("{id} is not a valid subject-ID")));
        }
        Ok(Self(id))
    }

    /// Returns the raw value.
    #[must_use]
    pub const fn get(self) -> u16 {
        self.0
    }
}

impl fmt::Display for SubjectId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Identifier of an RPC-service.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct ServiceId(u16);

impl ServiceId {
    /// Creates a service-ID, validating the range.
    ///
    /// # Errors
    ///
    /// Returns an error if the value exceeds [`SERVICE_ID_MAX`].
    pub fn new(id: u16) -> Result<Self> {
        if id > SERVICE_ID_MAX {
            return Err(YakutError::invalid(format!("{id} is not a valid service-ID")));
        }
        Ok(Self(id))
    }

    /// Returns the raw value.
    #[must_use]
    pub const fn get(self) -> u16 {
        self.0
    }
}

impl fmt::Display for ServiceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Transfer priority; lower numeric value means higher urgency.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Priority {
    /// Level 0.
    Exceptional,
    /// Level 1.
    Immediate,
    /// Level 2.
    Fast,
    /// Level 3.
    High,
    /// Level 4, the default.
    #[default]
    Nominal,
    /// Level 5.
    Low,
    /// Level 6.
    Slow,
    /// Level 7.
    Optional,
}

impl Priority {
    /// All levels ordered from the most to the least urgent.
    pub const ALL: [Self; 8] = [
        Self::Exceptional,
        Self::Immediate,
        Self::Fast,
        Self::High,
        Self::Nominal,
        Self::Low,
        Self::Slow,
        Self::Optional,
    ];

    /// Lower-case name of the level.
    #[must_use]
    pub const fn name(self) -> &'static str {
        match self {
            Self::Exceptional => "exceptional",
            Self::Immediate => "immediate",
            Self::Fast => "fast",
            Self::High => "high",
            Self::Nominal => "nominal",
            Self::Low => "low",
            Self::Slow => "slow",
            Self::Optional => "optional",
        }
    }

    /// Numeric level, 0 through 7.
    #[must_use]
    pub const fn level(self) -> u8 {
        self as u8
    }
}

impl fmt::Display for Priority {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for Priority {
    type Err = YakutError;

    /// Accepts the numeric level, the full name, or an unambiguous prefix, ignoring case.
    fn from_str(s: &str) -> Result<Self> {
        let text = s.trim().to_ascii_lowercase();
        if let Ok(level) = text.parse::<usize>() {
            return Self::ALL
                .get(level)
                .copied()
                .ok_or_else(|| YakutError::invalid(format!("priority level {level} is out of range")));
        }
        if let Some(exact) = Self::ALL.iter().find(|p| p.name() == text) {
            return Ok(*exact);
        }
        let matches: Vec<_> = Self::ALL
            .iter()
            .filter(|p| !text.is_empty() && p.name().starts_with(&text))
            .collect();
        match matches.as_slice() {
            [single] => Ok(**single),
            _ => Err(YakutError::invalid(format!(
                "priority {s:?} not understood; choose one of: {}",
                Self::ALL.map(Self::name).join(", ")
            ))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn subject_id_range_is_enforced() {
        assert!(SubjectId::new(8191).is_ok());
        assert!(SubjectId::new(8192).is_err());
    }

    #[test]
    fn service_id_range_is_enforced() {
        assert!(ServiceId::new(511).is_ok());
        assert!(ServiceId::new(512).is_err());
    }

    #[test]
    fn node_id_rejects_negative_values() {
        assert!(NodeId::try_from_i64(-1).is_err());
        assert_eq!(NodeId::try_from_i64(125).expect("valid").get(), 125);
    }

    #[test]
    fn priority_parses_names_prefixes_and_levels() {
        assert_eq!("nominal".parse::<Priority>().expect("name"), Priority::Nominal);
        assert_eq!("HI".parse::<Priority>().expect("prefix"), Priority::High);
        assert_eq!("7".parse::<Priority>().expect("level"), Priority::Optional);
        assert!("x".parse::<Priority>().is_err());
        assert!("8".parse::<Priority>().is_err());
    }

    #[test]
    fn priority_default_is_nominal() {
        assert_eq!(Priority::default().level(), 4);
        assert_eq!(Priority::Slow.to_string(), "slow");
    }
}

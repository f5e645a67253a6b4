//! Interactions a resource definition declares support for.

use serde::{Deserialize, Serialize};

/// A single interaction a resource definition can take part in.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Capability {
    /// Built from upstream rows by the materialisation worker.
    Materialise,
    /// Takes part in dependency-ordered reference resolution.
    Resolve,
    /// `GET [base]/Type/id`
    Read,
    /// `GET [base]/Type?...`
    Search,
    /// `POST [base]/Type`
    Create,
}

impl Capability {
    pub const ALL: [Capability; 5] = [
        Capability::Materialise,
        Capability::Resolve,
        Capability::Read,
        Capability::Search,
        Capability::Create,
    ];

    fn bit(self) -> u8 {
        match self {
            Capability::Materialise => 1 << 0,
            Capability::Resolve => 1 << 1,
            Capability::Read => 1 << 2,
            Capability::Search => 1 << 3,
            Capability::Create => 1 << 4,
        }
    }
}

/// Immutable set of capabilities, fixed when a definition is constructed.
#[derive(Debug, Copy, Clone, Default, PartialEq, Eq, Hash)]
pub struct CapabilitySet(u8);

impl CapabilitySet {
    pub const fn empty() -> Self {
        Self(0)
    }

    /// Materialise + Resolve, the usual pair for a read-side resource.
    pub fn materialised() -> Self {
        Self::of(&[Capability::Materialise, Capability::Resolve])
    }

    pub fn of(caps: &[Capability]) -> Self {
        caps.iter().fold(Self::empty(), |set, cap| set.with(*cap))
    }

    #[must_use]
    pub fn with(self, cap: Capability) -> Self {
        Self(self.0 | cap.bit())
    }

    pub fn contains(self, cap: Capability) -> bool {
        self.0 & cap.bit() != 0
    }

    pub fn iter(self) -> impl Iterator<Item = Capability> {
        Capability::ALL.into_iter().filter(move |c| self.contains(*c))
    }
}

impl Serialize for CapabilitySet {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_seq(self.iter())
    }
}

impl<'de> Deserialize<'de> for CapabilitySet {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let caps = Vec::<Capability>::deserialize(deserializer)?;
        Ok(Self::of(&caps))
    }
}

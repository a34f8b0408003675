//! Shared value types for the KV surface.

use std::fmt;

use serde::{Deserialize, Serialize};

/// A bucket/scope/collection triple addressing a keyspace in the cluster.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct KeySpace {
    /// Bucket name.
    pub bucket: String,
    /// Scope name within the bucket.
    pub scope: String,
    /// Collection name within the scope.
    pub collection: String,
}

impl KeySpace {
    /// Create a keyspace from its three components.
    pub fn new(
        bucket: impl Into<String>,
        scope: impl Into<String>,
        collection: impl Into<String>,
    ) -> Self {
        KeySpace {
            bucket: bucket.into(),
            scope: scope.into(),
            collection: collection.into(),
        }
    }

    /// Conventional default scope/collection for a bucket.
    pub fn default_for_bucket(bucket: impl Into<String>) -> Self {
        KeySpace::new(bucket, "_default", "_default")
    }
}

impl fmt::Display for KeySpace {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}.{}", self.bucket, self.scope, self.collection)
    }
}

/// A compare-and-swap token.
///
/// Encodes a nanosecond-resolution logical timestamp assigned by the server
/// at mutation time. `0` means "no CAS check".
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize,
)]
pub struct Cas(u64);

impl Cas {
    /// CAS value meaning "no check".
    pub const ZERO: Cas = Cas(0);

    /// Wrap a raw CAS value.
    pub const fn new(value: u64) -> Self {
        Cas(value)
    }

    /// The raw value.
    pub const fn as_u64(&self) -> u64 {
        self.0
    }

    /// Whether this CAS carries a real value.
    pub const fn is_set(&self) -> bool {
        self.0 != 0
    }

    /// Render in the wire form used by server macro expansion (`0x` + 16 hex
    /// digits).
    pub fn to_hex(&self) -> String {
        format!("0x{:016x}", self.0)
    }

    /// Parse the wire form produced by [`Cas::to_hex`].
    pub fn from_hex(s: &str) -> Option<Cas> {
        let digits = s.strip_prefix("0x")?;
        u64::from_str_radix(digits, 16).ok().map(Cas)
    }

    /// The wall-clock milliseconds this CAS encodes.
    pub const fn as_millis(&self) -> u64 {
        self.0 / 1_000_000
    }
}

impl fmt::Display for Cas {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.to_hex())
    }
}

/// Durability requirement attached to a mutation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum DurabilityLevel {
    /// No durability requirement beyond the active node.
    None,
    /// Replicated to a majority of nodes.
    #[default]
    Majority,
    /// Replicated to a majority and persisted on the active node.
    MajorityAndPersistToActive,
    /// Persisted on a majority of nodes.
    PersistToMajority,
}

impl DurabilityLevel {
    /// The single-character shorthand persisted in transaction records.
    pub fn shorthand(&self) -> &'static str {
        match self {
            DurabilityLevel::None => "n",
            DurabilityLevel::Majority => "m",
            DurabilityLevel::MajorityAndPersistToActive => "pa",
            DurabilityLevel::PersistToMajority => "pm",
        }
    }

    /// Parse the shorthand form; unknown strings fall back to `Majority`.
    pub fn from_shorthand(s: &str) -> DurabilityLevel {
        match s {
            "n" => DurabilityLevel::None,
            "m" => DurabilityLevel::Majority,
            "pa" => DurabilityLevel::MajorityAndPersistToActive,
            "pm" => DurabilityLevel::PersistToMajority,
            _ => DurabilityLevel::Majority,
        }
    }
}

/// Read/write unit counts reported by the server for an operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ResourceUnits {
    /// Read units consumed.
    pub read_units: u16,
    /// Write units consumed.
    pub write_units: u16,
}

impl ResourceUnits {
    /// Accumulate another report into this one.
    pub fn add(&mut self, other: ResourceUnits) {
        self.read_units = self.read_units.saturating_add(other.read_units);
        self.write_units = self.write_units.saturating_add(other.write_units);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn cas_hex_round_trip() {
        let cas = Cas::new(1_700_000_123_456_789_000);
        let hex = cas.to_hex();
        assert!(hex.starts_with("0x"));
        assert_eq!(hex.len(), 18);
        assert_eq!(Cas::from_hex(&hex), Some(cas));
    }

    #[test]
    fn cas_millis_truncates_nanos() {
        assert_eq!(Cas::new(1_999_999).as_millis(), 1);
        assert_eq!(Cas::new(2_000_000).as_millis(), 2);
    }

    #[test]
    fn durability_shorthand_round_trip() {
        for level in [
            DurabilityLevel::None,
            DurabilityLevel::Majority,
            DurabilityLevel::MajorityAndPersistToActive,
            DurabilityLevel::PersistToMajority,
        ] {
            assert_eq!(DurabilityLevel::from_shorthand(level.shorthand()), level);
        }
    }

    #[test]
    fn unknown_shorthand_defaults_to_majority() {
        assert_eq!(
            DurabilityLevel::from_shorthand("zz"),
            DurabilityLevel::Majority
        );
    }

    #[test]
    fn resource_units_saturate() {
        let mut units = ResourceUnits {
            read_units: u16::MAX - 1,
            write_units: 0,
        };
        units.add(ResourceUnits {
            read_units: 5,
            write_units: 3,
        });
        assert_eq!(units.read_units, u16::MAX);
        assert_eq!(units.write_units, 3);
    }

    proptest! {
        #[test]
        fn any_cas_survives_the_wire_form(raw in any::<u64>()) {
            let cas = Cas::new(raw);
            prop_assert_eq!(Cas::from_hex(&cas.to_hex()), Some(cas));
        }
    }
}

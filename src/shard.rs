use crate::error::{DataError, DataResult};
use compact_str::CompactString;
use std::fmt;
use std::str::FromStr;

#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Keyspace(CompactString);

impl Keyspace {
    pub fn new(name: impl Into<CompactString>) -> Self {
        Self(name.into())
    }

    pub fn name(&self) -> &str {
        self.0.as_str()
    }
}

impl fmt::Display for Keyspace {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// A half-open range of keyspace ids written with hex prefixes: `-80`, `80-c0`, `c0-`.
/// `-` and `0` both name the full range.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct KeyRange {
    start: Option<u64>,
    end: Option<u64>,
    label: CompactString,
}

fn parse_bound(hex: &str, text: &str) -> DataResult<Option<u64>> {
    if hex.is_empty() {
        return Ok(None);
    }
    if hex.len() > 16 || !hex.chars().all(|c| c.is_ascii_hexdigit()) {
        return Err(DataError::InvalidConfig {
            message: format!("invalid shard range '{text}'"),
        });
    }
    let padded = format!("{hex:0<16}");
    u64::from_str_radix(&padded, 16)
        .map(Some)
        .map_err(|_| DataError::InvalidConfig {
            message: format!("invalid shard range '{text}'"),
        })
}

impl KeyRange {
    pub fn full() -> Self {
        Self {
            start: None,
            end: None,
            label: CompactString::const_new("0"),
        }
    }

    pub fn parse(text: &str) -> DataResult<Self> {
        if text == "0" || text == "-" {
            return Ok(Self {
                start: None,
                end: None,
                label: text.into(),
            });
        }
        let Some((lo, hi)) = text.split_once('-') else {
            return Err(DataError::InvalidConfig {
                message: format!("invalid shard range '{text}'"),
            });
        };
        let start = parse_bound(lo, text)?;
        let end = parse_bound(hi, text)?;
        if let (Some(s), Some(e)) = (start, end)
            && s >= e
        {
            return Err(DataError::InvalidConfig {
                message: format!("invalid shard range '{text}': start must be below end"),
            });
        }
        Ok(Self {
            start,
            end,
            label: text.to_ascii_lowercase().into(),
        })
    }

    pub fn contains(&self, keyspace_id: u64) -> bool {
        self.start.is_none_or(|s| keyspace_id >= s) && self.end.is_none_or(|e| keyspace_id < e)
    }

    pub fn is_full(&self) -> bool {
        self.start.is_none() && self.end.is_none()
    }

    pub fn label(&self) -> &str {
        &self.label
    }
}

impl fmt::Display for KeyRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.label)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Shard {
    pub keyspace: Keyspace,
    pub range: KeyRange,
}

impl Shard {
    pub fn new(keyspace: Keyspace, range: KeyRange) -> Self {
        Self { keyspace, range }
    }

    pub fn single_shard() -> Self {
        Self {
            keyspace: Keyspace(CompactString::const_new("keyspace")),
            range: KeyRange::full(),
        }
    }

    pub fn is_single_shard(&self) -> bool {
        *self == Self::single_shard()
    }

    pub fn contains(&self, keyspace_id: u64) -> bool {
        self.range.contains(keyspace_id)
    }
}

impl fmt::Display for Shard {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.keyspace, self.range)
    }
}

impl FromStr for Shard {
    type Err = DataError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (keyspace, range) = s.split_once('/').ok_or_else(|| DataError::InvalidConfig {
            message: format!("invalid shard '{s}', expected keyspace/range"),
        })?;
        if keyspace.is_empty() {
            return Err(DataError::InvalidConfig {
                message: format!("invalid shard '{s}', empty keyspace"),
            });
        }
        Ok(Shard::new(Keyspace::new(keyspace), KeyRange::parse(range)?))
    }
}

/// Placement hash for a partition key. Roots are placed by their own id and
/// children follow the id of their root.
pub fn keyspace_id(partition_key: i64) -> u64 {
    let mut z = (partition_key as u64).wrapping_add(0x9E37_79B9_7F4A_7C15);
    z = (z ^ (z >> 30)).wrapping_mul(0xBF58_476D_1CE4_E5B9);
    z = (z ^ (z >> 27)).wrapping_mul(0x94D0_49BB_1331_11EB);
    z ^ (z >> 31)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum TabletType {
    Primary,
    Replica,
}

impl fmt::Display for TabletType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TabletType::Primary => f.write_str("primary"),
            TabletType::Replica => f.write_str("replica"),
        }
    }
}

/// Where subsequent statements of a session go. A blank destination leaves
/// routing to the session.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Destination {
    pub shard: Option<Shard>,
    pub tablet: Option<TabletType>,
}

impl Destination {
    pub fn blank() -> Self {
        Self::default()
    }

    pub fn shard(shard: Shard) -> Self {
        Self {
            shard: Some(shard),
            tablet: None,
        }
    }

    pub fn tablet(tablet: TabletType) -> Self {
        Self {
            shard: None,
            tablet: Some(tablet),
        }
    }

    pub fn is_blank(&self) -> bool {
        self.shard.is_none() && self.tablet.is_none()
    }

    /// Values set on `inner` win over values of `self`.
    pub fn merged_with(&self, inner: &Destination) -> Destination {
        Destination {
            shard: inner.shard.clone().or_else(|| self.shard.clone()),
            tablet: inner.tablet.or(self.tablet),
        }
    }
}

impl fmt::Display for Destination {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match (&self.shard, self.tablet) {
            (None, None) => f.write_str("<unpinned>"),
            (Some(shard), None) => write!(f, "{shard}"),
            (None, Some(tablet)) => write!(f, "@{tablet}"),
            (Some(shard), Some(tablet)) => write!(f, "{shard}@{tablet}"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::{Destination, KeyRange, Keyspace, Shard, TabletType, keyspace_id};
    use proptest::prelude::*;

    #[test]
    fn parses_hex_prefix_ranges() {
        let low = KeyRange::parse("-80").expect("low");
        let high = KeyRange::parse("80-").expect("high");
        assert!(low.contains(0));
        assert!(low.contains(0x7fff_ffff_ffff_ffff));
        assert!(!low.contains(0x8000_0000_0000_0000));
        assert!(high.contains(0x8000_0000_0000_0000));
        assert!(high.contains(u64::MAX));

        let mid = KeyRange::parse("40-c0").expect("mid");
        assert!(mid.contains(0x4000_0000_0000_0000));
        assert!(!mid.contains(0xc000_0000_0000_0000));
        assert!(KeyRange::parse("0").expect("full").is_full());
    }

    #[test]
    fn rejects_malformed_ranges() {
        assert!(KeyRange::parse("80").is_err());
        assert!(KeyRange::parse("zz-").is_err());
        assert!(KeyRange::parse("c0-40").is_err());
        assert!("no-slash".parse::<Shard>().is_err());
    }

    #[test]
    fn shard_display_roundtrips() {
        let shard: Shard = "movies/-80".parse().expect("shard");
        assert_eq!(shard.keyspace, Keyspace::new("movies"));
        assert_eq!(shard.to_string(), "movies/-80");
        assert!(Shard::single_shard().is_single_shard());
        assert!(!shard.is_single_shard());
    }

    #[test]
    fn destinations_merge_inner_over_outer() {
        let shard: Shard = "movies/80-".parse().expect("shard");
        let outer = Destination::tablet(TabletType::Replica);
        let inner = Destination::shard(shard.clone());
        let merged = outer.merged_with(&inner);
        assert_eq!(merged.shard, Some(shard));
        assert_eq!(merged.tablet, Some(TabletType::Replica));
        assert!(Destination::blank().is_blank());
        assert_eq!(merged.to_string(), "movies/80-@replica");
    }

    proptest! {
        #[test]
        fn every_keyspace_id_lands_in_exactly_one_of_two_halves(key in any::<i64>()) {
            let low = KeyRange::parse("-80").expect("low");
            let high = KeyRange::parse("80-").expect("high");
            let kid = keyspace_id(key);
            prop_assert!(low.contains(kid) ^ high.contains(kid));
        }

        #[test]
        fn four_way_split_covers_keyspace(key in any::<i64>()) {
            let ranges = ["-40", "40-80", "80-c0", "c0-"]
                .iter()
                .map(|r| KeyRange::parse(r).expect("range"))
                .collect::<Vec<_>>();
            let kid = keyspace_id(key);
            prop_assert_eq!(ranges.iter().filter(|r| r.contains(kid)).count(), 1);
        }
    }
}

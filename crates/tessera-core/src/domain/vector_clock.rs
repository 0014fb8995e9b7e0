//! Per-file causal version
//!
//! A [`VectorClock`] maps every device that ever modified a file to the
//! number of modifications it made. Comparing two clocks tells whether one
//! replica causally follows the other or whether both were modified
//! independently (a conflict).

use std::cmp::Ordering;
use std::collections::BTreeMap;
use std::fmt::{self, Display, Formatter};

use serde::{Deserialize, Serialize};

use super::newtypes::DeviceId;

/// Result of comparing two vector clocks
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ClockOrdering {
    /// Both clocks are identical
    Equal,
    /// `self` dominates `other` pointwise
    Newer,
    /// `other` dominates `self` pointwise
    Older,
    /// Neither dominates: some counters are higher, some lower
    Conflict,
}

impl ClockOrdering {
    /// The ordering seen from the other side of the comparison
    #[must_use]
    pub fn reverse(self) -> Self {
        match self {
            ClockOrdering::Newer => ClockOrdering::Older,
            ClockOrdering::Older => ClockOrdering::Newer,
            other => other,
        }
    }

    /// True unless the clocks are incomparable
    #[must_use]
    pub fn is_comparable(self) -> bool {
        !matches!(self, ClockOrdering::Conflict)
    }
}

/// Mapping `device -> monotonically increasing counter`
///
/// Missing devices count as zero, so `{a:1}` and `{a:1, b:0}` are equal.
/// Counters never decrease: the only mutators are [`increment`] and
/// [`merge`].
///
/// [`increment`]: VectorClock::increment
/// [`merge`]: VectorClock::merge
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct VectorClock(BTreeMap<DeviceId, u64>);

impl VectorClock {
    /// Create an empty clock (every counter at zero)
    #[must_use]
    pub fn new() -> Self {
        Self(BTreeMap::new())
    }

    /// Bump `device`'s counter by one and return the new value
    pub fn increment(&mut self, device: &DeviceId) -> u64 {
        let counter = self.0.entry(device.clone()).or_insert(0);
        *counter += 1;
        *counter
    }

    /// Counter for `device` (zero when absent)
    #[must_use]
    pub fn get(&self, device: &DeviceId) -> u64 {
        self.0.get(device).copied().unwrap_or(0)
    }

    /// Pointwise maximum with `other`
    pub fn merge(&mut self, other: &VectorClock) {
        for (device, &counter) in &other.0 {
            let entry = self.0.entry(device.clone()).or_insert(0);
            *entry = (*entry).max(counter);
        }
    }

    /// True when every counter is zero
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.0.values().all(|&c| c == 0)
    }

    /// Iterate over `(device, counter)` pairs in device order
    pub fn iter(&self) -> impl Iterator<Item = (&DeviceId, u64)> {
        self.0.iter().map(|(d, &c)| (d, c))
    }

    /// Compare `self` against `other`
    #[must_use]
    pub fn compare(&self, other: &VectorClock) -> ClockOrdering {
        let mut ahead = false;
        let mut behind = false;

        for device in self.0.keys().chain(other.0.keys()) {
            match self.get(device).cmp(&other.get(device)) {
                Ordering::Greater => ahead = true,
                Ordering::Less => behind = true,
                Ordering::Equal => {}
            }
            if ahead && behind {
                return ClockOrdering::Conflict;
            }
        }

        match (ahead, behind) {
            (false, false) => ClockOrdering::Equal,
            (true, false) => ClockOrdering::Newer,
            (false, true) => ClockOrdering::Older,
            (true, true) => ClockOrdering::Conflict,
        }
    }
}

impl Display for VectorClock {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.write_str("{")?;
        for (i, (device, counter)) in self.iter().enumerate() {
            if i > 0 {
                f.write_str(", ")?;
            }
            write!(f, "{device}:{counter}")?;
        }
        f.write_str("}")
    }
}

impl FromIterator<(DeviceId, u64)> for VectorClock {
    fn from_iter<I: IntoIterator<Item = (DeviceId, u64)>>(iter: I) -> Self {
        Self(iter.into_iter().collect())
    }
}

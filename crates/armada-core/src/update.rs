//! Update policy: canaries, max-in-flight, watch times, strategy.
//!
//! `canaries` and `max_in_flight` accept either an absolute count (`2`,
//! `"2"`) or a percentage of the instance group (`"50%"`). Watch times
//! accept a single millisecond value or a `"min-max"` range.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::CoreError;

/// An absolute count or a percentage of an instance group's size.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "NumberOrText", into = "String")]
pub enum Quantity {
    Count(u32),
    Percent(u32),
}

impl Quantity {
    /// Resolve against the total number of instances in a group.
    ///
    /// Percentages round down with a floor of one, so `"10%"` of three
    /// instances still yields one. A zero count or `"0%"` resolves to zero.
    pub fn resolve(&self, total: u32) -> u32 {
        match *self {
            Quantity::Count(n) => n,
            Quantity::Percent(0) => 0,
            Quantity::Percent(p) => {
                if total == 0 {
                    return 0;
                }
                let floor = (u64::from(total) * u64::from(p)) / 100;
                (floor as u32).max(1)
            }
        }
    }
}

impl fmt::Display for Quantity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Quantity::Count(n) => write!(f, "{n}"),
            Quantity::Percent(p) => write!(f, "{p}%"),
        }
    }
}

impl FromStr for Quantity {
    type Err = CoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        if let Some(pct) = s.strip_suffix('%') {
            let p: u32 = pct
                .trim()
                .parse()
                .map_err(|_| CoreError::UpdatePolicy(format!("invalid percentage '{s}'")))?;
            if p > 100 {
                return Err(CoreError::UpdatePolicy(format!(
                    "percentage '{s}' must be between 0% and 100%"
                )));
            }
            return Ok(Quantity::Percent(p));
        }
        s.parse()
            .map(Quantity::Count)
            .map_err(|_| CoreError::UpdatePolicy(format!("invalid count '{s}'")))
    }
}

impl From<Quantity> for String {
    fn from(q: Quantity) -> Self {
        q.to_string()
    }
}

/// Wire form for values that may be written as a number or a string.
#[derive(Deserialize)]
#[serde(untagged)]
enum NumberOrText {
    Number(u64),
    Text(String),
}

impl TryFrom<NumberOrText> for Quantity {
    type Error = CoreError;

    fn try_from(value: NumberOrText) -> Result<Self, Self::Error> {
        match value {
            NumberOrText::Number(n) => u32::try_from(n)
                .map(Quantity::Count)
                .map_err(|_| CoreError::UpdatePolicy(format!("count {n} out of range"))),
            NumberOrText::Text(s) => s.parse(),
        }
    }
}

/// Watch window in milliseconds.
///
/// The updater sleeps `min_ms`, then polls the instance until `max_ms`
/// has elapsed before declaring the update failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "NumberOrText", into = "String")]
pub struct WatchTime {
    pub min_ms: u64,
    pub max_ms: u64,
}

impl WatchTime {
    pub fn fixed(ms: u64) -> Self {
        Self {
            min_ms: ms,
            max_ms: ms,
        }
    }
}

impl fmt::Display for WatchTime {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.min_ms == self.max_ms {
            write!(f, "{}", self.min_ms)
        } else {
            write!(f, "{}-{}", self.min_ms, self.max_ms)
        }
    }
}

impl FromStr for WatchTime {
    type Err = CoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let parse = |v: &str| {
            v.trim()
                .parse::<u64>()
                .map_err(|_| CoreError::UpdatePolicy(format!("invalid watch time '{s}'")))
        };
        match s.split_once('-') {
            Some((lo, hi)) => {
                let (min_ms, max_ms) = (parse(lo)?, parse(hi)?);
                if min_ms > max_ms {
                    return Err(CoreError::UpdatePolicy(format!(
                        "watch time range '{s}' has min greater than max"
                    )));
                }
                Ok(Self { min_ms, max_ms })
            }
            None => parse(s).map(Self::fixed),
        }
    }
}

impl From<WatchTime> for String {
    fn from(w: WatchTime) -> Self {
        w.to_string()
    }
}

impl TryFrom<NumberOrText> for WatchTime {
    type Error = CoreError;

    fn try_from(value: NumberOrText) -> Result<Self, Self::Error> {
        match value {
            NumberOrText::Number(n) => Ok(Self::fixed(n)),
            NumberOrText::Text(s) => s.parse(),
        }
    }
}

/// How a VM is replaced when an instance must be recreated.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum UpdateStrategy {
    /// Stop and delete the old VM, then create the new one.
    #[default]
    DeleteCreate,
    /// Create the new VM first, move disks over, then delete the old VM.
    /// Instances holding static IPs fall back to `DeleteCreate`.
    DuplicateAndReplaceVm,
}

/// Deployment-wide update block.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UpdatePolicy {
    pub canaries: Quantity,
    pub max_in_flight: Quantity,
    pub canary_watch_time: WatchTime,
    pub update_watch_time: WatchTime,
    /// When false, this group may converge concurrently with adjacent
    /// non-serial groups.
    #[serde(default = "default_serial")]
    pub serial: bool,
    #[serde(default)]
    pub strategy: UpdateStrategy,
}

fn default_serial() -> bool {
    true
}

impl Default for UpdatePolicy {
    fn default() -> Self {
        Self {
            canaries: Quantity::Count(1),
            max_in_flight: Quantity::Count(1),
            canary_watch_time: WatchTime::fixed(30_000),
            update_watch_time: WatchTime::fixed(30_000),
            serial: true,
            strategy: UpdateStrategy::DeleteCreate,
        }
    }
}

/// Per-instance-group override; unset fields inherit from the deployment.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct UpdatePolicyOverride {
    #[serde(default)]
    pub canaries: Option<Quantity>,
    #[serde(default)]
    pub max_in_flight: Option<Quantity>,
    #[serde(default)]
    pub canary_watch_time: Option<WatchTime>,
    #[serde(default)]
    pub update_watch_time: Option<WatchTime>,
    #[serde(default)]
    pub serial: Option<bool>,
    #[serde(default)]
    pub strategy: Option<UpdateStrategy>,
}

impl UpdatePolicy {
    /// Apply an instance-group override on top of this policy.
    pub fn merged(&self, o: &UpdatePolicyOverride) -> UpdatePolicy {
        UpdatePolicy {
            canaries: o.canaries.unwrap_or(self.canaries),
            max_in_flight: o.max_in_flight.unwrap_or(self.max_in_flight),
            canary_watch_time: o.canary_watch_time.unwrap_or(self.canary_watch_time),
            update_watch_time: o.update_watch_time.unwrap_or(self.update_watch_time),
            serial: o.serial.unwrap_or(self.serial),
            strategy: o.strategy.unwrap_or(self.strategy),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn percentages_floor_with_minimum_one() {
        assert_eq!(Quantity::Percent(50).resolve(4), 2);
        assert_eq!(Quantity::Percent(50).resolve(5), 2);
        assert_eq!(Quantity::Percent(10).resolve(3), 1);
        assert_eq!(Quantity::Percent(100).resolve(3), 3);
        assert_eq!(Quantity::Percent(0).resolve(3), 0);
        assert_eq!(Quantity::Percent(50).resolve(0), 0);
        assert_eq!(Quantity::Count(2).resolve(10), 2);
    }

    #[test]
    fn quantity_parses_numbers_and_strings() {
        let q: Quantity = serde_json::from_str("2").unwrap();
        assert_eq!(q, Quantity::Count(2));
        let q: Quantity = serde_json::from_str("\"4\"").unwrap();
        assert_eq!(q, Quantity::Count(4));
        let q: Quantity = serde_json::from_str("\"25%\"").unwrap();
        assert_eq!(q, Quantity::Percent(25));
        assert!(serde_json::from_str::<Quantity>("\"150%\"").is_err());
        assert!(serde_json::from_str::<Quantity>("\"many\"").is_err());
    }

    #[test]
    fn watch_time_accepts_ranges() {
        let w: WatchTime = serde_json::from_str("\"1000-2000\"").unwrap();
        assert_eq!(w, WatchTime { min_ms: 1000, max_ms: 2000 });
        let w: WatchTime = serde_json::from_str("60000").unwrap();
        assert_eq!(w, WatchTime::fixed(60000));
        assert!(serde_json::from_str::<WatchTime>("\"3000-1000\"").is_err());
    }

    #[test]
    fn override_inherits_unset_fields() {
        let base = UpdatePolicy {
            canaries: Quantity::Count(2),
            max_in_flight: Quantity::Count(4),
            ..UpdatePolicy::default()
        };
        let merged = base.merged(&UpdatePolicyOverride {
            max_in_flight: Some(Quantity::Percent(50)),
            serial: Some(false),
            ..Default::default()
        });
        assert_eq!(merged.canaries, Quantity::Count(2));
        assert_eq!(merged.max_in_flight, Quantity::Percent(50));
        assert!(!merged.serial);
    }

    #[test]
    fn strategy_uses_kebab_case() {
        let s: UpdateStrategy = serde_json::from_str("\"duplicate-and-replace-vm\"").unwrap();
        assert_eq!(s, UpdateStrategy::DuplicateAndReplaceVm);
    }
}

//! Device assignment for runs in a sweep.
//!
//! Assignment is a pure function of the run's position (and seed), so the
//! same sweep always lands on the same devices.

use crate::error::{Result, SweepError};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Ordered set of device ids handed to one run, rendered the way
/// `CUDA_VISIBLE_DEVICES` expects (`"0,1"`).
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct DeviceSet(pub Vec<u32>);

impl DeviceSet {
    pub fn single(id: u32) -> Self {
        DeviceSet(vec![id])
    }

    pub fn env_value(&self) -> String {
        self.0
            .iter()
            .map(|d| d.to_string())
            .collect::<Vec<_>>()
            .join(",")
    }
}

impl fmt::Display for DeviceSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.env_value())
    }
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub enum DevicePolicy {
    /// No device variable is set for the child.
    #[default]
    None,
    /// Every run sees the same device list.
    Fixed(Vec<u32>),
    /// Run `i` gets `list[i % len]`.
    RoundRobin(Vec<u32>),
    /// `base + seed`, one physical device per seed.
    OffsetSeed(u32),
    /// `base + run_index`.
    OffsetIndex(u32),
}

impl DevicePolicy {
    pub fn as_string(&self) -> String {
        match self {
            DevicePolicy::None => "none".to_string(),
            DevicePolicy::Fixed(list) => format!("fixed:{}", join_ids(list)),
            DevicePolicy::RoundRobin(list) => format!("round-robin:{}", join_ids(list)),
            DevicePolicy::OffsetSeed(base) => format!("offset-seed:{}", base),
            DevicePolicy::OffsetIndex(base) => format!("offset-index:{}", base),
        }
    }
}

fn join_ids(list: &[u32]) -> String {
    list.iter()
        .map(|d| d.to_string())
        .collect::<Vec<_>>()
        .join(",")
}

fn parse_id_list(raw: &str, policy: &str) -> Result<Vec<u32>> {
    let ids = raw
        .split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(|s| {
            s.parse::<u32>().map_err(|_| {
                SweepError::config(format!("invalid device id '{}' in {} policy", s, policy))
            })
        })
        .collect::<Result<Vec<_>>>()?;
    if ids.is_empty() {
        return Err(SweepError::config(format!(
            "{} policy needs at least one device id",
            policy
        )));
    }
    Ok(ids)
}

fn parse_base(raw: &str, policy: &str) -> Result<u32> {
    raw.trim()
        .parse::<u32>()
        .map_err(|_| SweepError::config(format!("invalid base offset '{}' in {} policy", raw, policy)))
}

impl FromStr for DevicePolicy {
    type Err = SweepError;

    fn from_str(s: &str) -> Result<Self> {
        let norm = s.trim().to_ascii_lowercase();
        let (kind, arg) = match norm.split_once(':') {
            Some((k, a)) => (k.to_string(), Some(a.to_string())),
            None => (norm.clone(), None),
        };
        match (kind.as_str(), arg) {
            ("none", None) => Ok(DevicePolicy::None),
            ("fixed", Some(a)) => Ok(DevicePolicy::Fixed(parse_id_list(&a, "fixed")?)),
            ("round-robin", Some(a)) => {
                Ok(DevicePolicy::RoundRobin(parse_id_list(&a, "round-robin")?))
            }
            ("offset-seed", a) => Ok(DevicePolicy::OffsetSeed(
                a.map(|a| parse_base(&a, "offset-seed")).transpose()?.unwrap_or(0),
            )),
            ("offset-index", a) => Ok(DevicePolicy::OffsetIndex(
                a.map(|a| parse_base(&a, "offset-index")).transpose()?.unwrap_or(0),
            )),
            _ => Err(SweepError::config(format!(
                "unknown device policy '{}' (expected none|fixed:<ids>|round-robin:<ids>|offset-seed:<base>|offset-index:<base>)",
                s
            ))),
        }
    }
}

impl TryFrom<String> for DevicePolicy {
    type Error = SweepError;

    fn try_from(value: String) -> Result<Self> {
        value.parse()
    }
}

impl From<DevicePolicy> for String {
    fn from(value: DevicePolicy) -> Self {
        value.as_string()
    }
}

/// Returns the devices for the run at `run_index` of a sweep of
/// `sweep_size` runs. `device_count`, when declared, bounds every id to
/// `0..device_count`.
pub fn assign(
    run_index: usize,
    seed: u64,
    sweep_size: usize,
    policy: &DevicePolicy,
    device_count: Option<u32>,
) -> Result<Option<DeviceSet>> {
    if run_index >= sweep_size {
        return Err(SweepError::config(format!(
            "run index {} outside sweep of {} runs",
            run_index, sweep_size
        )));
    }
    let set = match policy {
        DevicePolicy::None => return Ok(None),
        DevicePolicy::Fixed(list) | DevicePolicy::RoundRobin(list) if list.is_empty() => {
            return Err(SweepError::config(format!(
                "device_policy '{}' needs at least one device id",
                policy.as_string()
            )));
        }
        DevicePolicy::Fixed(list) => DeviceSet(list.clone()),
        DevicePolicy::RoundRobin(list) => DeviceSet::single(list[run_index % list.len()]),
        DevicePolicy::OffsetSeed(base) => {
            let id = u64::from(*base)
                .checked_add(seed)
                .and_then(|v| u32::try_from(v).ok())
                .ok_or_else(|| {
                    SweepError::config(format!("device {} + seed {} overflows", base, seed))
                })?;
            DeviceSet::single(id)
        }
        DevicePolicy::OffsetIndex(base) => {
            let id = u32::try_from(run_index)
                .ok()
                .and_then(|i| base.checked_add(i))
                .ok_or_else(|| {
                    SweepError::config(format!(
                        "device {} + run index {} overflows",
                        base, run_index
                    ))
                })?;
            DeviceSet::single(id)
        }
    };
    if let Some(count) = device_count {
        if let Some(bad) = set.0.iter().find(|d| **d >= count) {
            return Err(SweepError::config(format!(
                "device {} assigned to run {} is outside the valid range 0..{}",
                bad, run_index, count
            )));
        }
    }
    Ok(Some(set))
}

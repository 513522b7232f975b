//! The declarative ruleset: three ordered rule lists (`fs`, `net`, `exec`)
//! plus a per-section `defaults` fallback. Deserialized from TOML.

use std::collections::HashSet;
use std::fmt;

use cidr::IpCidr;
use serde::{Deserialize, Deserializer};

/// Deny-wins, warn-beats-allow precedence is expressed directly by
/// declaration order: `Ord` ranks `Deny` highest, so resolving a set of
/// matching rules is `matches.max()`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Action {
    Allow,
    Warn,
    Deny,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FsPerm {
    ReadFile,
    WriteFile,
    ReadDir,
}

#[derive(Debug, Clone, Deserialize)]
pub struct FsRule {
    pub path: String,
    pub perms: HashSet<FsPerm>,
    pub action: Action,
}

#[derive(Debug, Clone, Deserialize)]
pub struct NetRule {
    pub cidr: IpCidr,
    pub proto: String,
    #[serde(deserialize_with = "deserialize_port_spec")]
    pub ports: PortSpec,
    pub action: Action,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ExecRule {
    pub path: String,
    pub action: Action,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct Defaults {
    pub fs: Option<Action>,
    pub net: Option<Action>,
    pub exec: Option<Action>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct Ruleset {
    #[serde(default)]
    pub fs: Vec<FsRule>,
    #[serde(default)]
    pub net: Vec<NetRule>,
    #[serde(default)]
    pub exec: Vec<ExecRule>,
    #[serde(default)]
    pub defaults: Defaults,
}

/// A comma-separated port specification: each element is either a decimal
/// integer or an inclusive `lo-hi` range. Malformed tokens are skipped
/// silently rather than rejecting the whole ruleset (spec: "Malformed
/// tokens are skipped silently").
#[derive(Debug, Clone, Default)]
pub struct PortSpec {
    ranges: Vec<(u16, u16)>,
}

impl PortSpec {
    pub fn matches(&self, port: u16) -> bool {
        self.ranges.iter().any(|(lo, hi)| (*lo..=*hi).contains(&port))
    }
}

impl fmt::Display for PortSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let parts: Vec<String> = self
            .ranges
            .iter()
            .map(|(lo, hi)| if lo == hi { lo.to_string() } else { format!("{lo}-{hi}") })
            .collect();
        write!(f, "{}", parts.join(","))
    }
}

impl std::str::FromStr for PortSpec {
    type Err = std::convert::Infallible;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let ranges = s
            .split(',')
            .filter_map(|token| parse_port_token(token.trim()))
            .collect();
        Ok(Self { ranges })
    }
}

fn parse_port_token(token: &str) -> Option<(u16, u16)> {
    if token.is_empty() {
        return None;
    }
    if let Some((lo, hi)) = token.split_once('-') {
        let lo: u16 = lo.trim().parse().ok()?;
        let hi: u16 = hi.trim().parse().ok()?;
        if lo > hi {
            return None;
        }
        return Some((lo, hi));
    }
    let port: u16 = token.parse().ok()?;
    Some((port, port))
}

fn deserialize_port_spec<'de, D>(deserializer: D) -> Result<PortSpec, D::Error>
where
    D: Deserializer<'de>,
{
    let raw = String::deserialize(deserializer)?;
    Ok(raw.parse().expect("PortSpec::from_str is infallible"))
}

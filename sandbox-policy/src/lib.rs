//! Stateless policy matcher: given a declarative ruleset and a probe
//! (filesystem, network, or exec), returns `allow`/`warn`/`deny`.
//!
//! This is the embedded-evaluator half of the sandbox's policy story: the
//! worker can resolve probes against this matcher locally instead of
//! deferring every decision to the host (see `sandbox-protocol`'s
//! `Mode::Embedded`).

pub mod file;
pub mod probe;
pub mod rule;

use std::fmt;

pub use file::PolicyFile;
pub use probe::Probe;
pub use rule::{Action, Defaults, ExecRule, FsPerm, FsRule, NetRule, PortSpec, Ruleset};

use std::collections::HashMap;

#[derive(Debug)]
pub enum PolicyError {
    Io(std::io::Error),
    Parse(toml::de::Error),
}

impl std::error::Error for PolicyError {}

impl fmt::Display for PolicyError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Io(e) => write!(f, "error reading policy file: {e}"),
            Self::Parse(e) => write!(f, "error parsing policy document: {e}"),
        }
    }
}

impl From<std::io::Error> for PolicyError {
    fn from(e: std::io::Error) -> Self {
        Self::Io(e)
    }
}

impl From<toml::de::Error> for PolicyError {
    fn from(e: toml::de::Error) -> Self {
        Self::Parse(e)
    }
}

/// Matches probes against a ruleset directly, re-scanning the rule lists on
/// every call. This is the reference path: `CompiledEvaluator` must agree
/// with it on every probe.
pub struct Evaluator {
    ruleset: Ruleset,
}

impl Evaluator {
    pub fn new(ruleset: Ruleset) -> Self {
        Self { ruleset }
    }

    pub fn ruleset(&self) -> &Ruleset {
        &self.ruleset
    }

    pub fn evaluate(&self, probe: &Probe) -> Action {
        evaluate_against(&self.ruleset, probe)
    }

    /// Pre-parses the exec rules into a `HashMap` for O(1) lookup; FS and
    /// NET matching stays O(rules) since their rule fields (CIDRs, port
    /// specs) are already parsed at deserialize time.
    pub fn compile(self) -> CompiledEvaluator {
        CompiledEvaluator::new(self.ruleset)
    }
}

/// Same matching semantics as [`Evaluator`], with exec rules indexed by
/// exact path for O(1) resolution. Behavior is identical to `Evaluator` for
/// every probe; only the exec lookup path differs.
#[derive(Clone)]
pub struct CompiledEvaluator {
    ruleset: Ruleset,
    exec_index: HashMap<String, Action>,
}

impl CompiledEvaluator {
    pub fn new(ruleset: Ruleset) -> Self {
        let mut exec_index: HashMap<String, Action> = HashMap::new();
        for rule in &ruleset.exec {
            exec_index
                .entry(rule.path.clone())
                .and_modify(|existing| *existing = (*existing).max(rule.action))
                .or_insert(rule.action);
        }
        Self { ruleset, exec_index }
    }

    pub fn ruleset(&self) -> &Ruleset {
        &self.ruleset
    }

    pub fn evaluate(&self, probe: &Probe) -> Action {
        match probe {
            Probe::Exec { path } => self
                .exec_index
                .get(path)
                .copied()
                .unwrap_or(self.ruleset.defaults.exec.unwrap_or(Action::Allow)),
            other => evaluate_against(&self.ruleset, other),
        }
    }
}

/// Shared matching + resolution logic for FS and NET probes (and the
/// uncompiled exec path): collect matching rules, then resolve by
/// deny-wins, warn-beats-allow precedence; an empty match set falls back
/// to the section's default, or `allow` if the section has none.
fn evaluate_against(ruleset: &Ruleset, probe: &Probe) -> Action {
    match probe {
        Probe::Fs { path, perm } => resolve(
            ruleset
                .fs
                .iter()
                .filter(|rule| path.starts_with(&rule.path) && rule.perms.contains(perm))
                .map(|rule| rule.action),
            ruleset.defaults.fs,
        ),
        // An unresolved (DNS-name) host never matches a NET rule; it
        // resolves directly to the section default, same as an empty
        // match set (see `Probe::Net`'s doc comment).
        Probe::Net { addr: None, .. } => ruleset.defaults.net.unwrap_or(Action::Allow),
        Probe::Net { addr: Some(addr), port, proto } => resolve(
            ruleset.net.iter().filter_map(|rule| {
                let matches = rule.proto == *proto
                    && rule.cidr.contains(addr)
                    && rule.ports.matches(*port);
                matches.then_some(rule.action)
            }),
            ruleset.defaults.net,
        ),
        Probe::Exec { path } => resolve(
            ruleset
                .exec
                .iter()
                .filter(|rule| &rule.path == path)
                .map(|rule| rule.action),
            ruleset.defaults.exec,
        ),
    }
}

fn resolve(matches: impl Iterator<Item = Action>, default: Option<Action>) -> Action {
    matches.max().unwrap_or(default.unwrap_or(Action::Allow))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::IpAddr;

    fn ruleset(toml_src: &str) -> Ruleset {
        toml::from_str(toml_src).unwrap()
    }

    #[test]
    fn deny_dominates_every_other_matching_action() {
        let rs = ruleset(
            r#"
            [[fs]]
            path = "/etc"
            perms = ["read_file"]
            action = "allow"

            [[fs]]
            path = "/etc"
            perms = ["read_file"]
            action = "deny"
            "#,
        );
        let evaluator = Evaluator::new(rs);
        let probe = Probe::Fs {
            path: "/etc/passwd".into(),
            perm: FsPerm::ReadFile,
        };
        assert_eq!(evaluator.evaluate(&probe), Action::Deny);
    }

    #[test]
    fn warn_dominates_allow() {
        let rs = ruleset(
            r#"
            [[fs]]
            path = "/tmp"
            perms = ["read_file"]
            action = "allow"

            [[fs]]
            path = "/tmp"
            perms = ["read_file"]
            action = "warn"
            "#,
        );
        let evaluator = Evaluator::new(rs);
        let probe = Probe::Fs {
            path: "/tmp/x".into(),
            perm: FsPerm::ReadFile,
        };
        assert_eq!(evaluator.evaluate(&probe), Action::Warn);
    }

    #[test]
    fn empty_matches_fall_back_to_section_default() {
        let rs = ruleset(
            r#"
            [defaults]
            fs = "deny"
            "#,
        );
        let evaluator = Evaluator::new(rs);
        let probe = Probe::Fs {
            path: "/anything".into(),
            perm: FsPerm::ReadFile,
        };
        assert_eq!(evaluator.evaluate(&probe), Action::Deny);
    }

    #[test]
    fn empty_matches_with_no_default_allow() {
        let rs = ruleset("");
        let evaluator = Evaluator::new(rs);
        let probe = Probe::Exec {
            path: "/bin/true".into(),
        };
        assert_eq!(evaluator.evaluate(&probe), Action::Allow);
    }

    #[test]
    fn fs_prefix_semantics() {
        let rs = ruleset(
            r#"
            [[fs]]
            path = "/"
            perms = ["read_file"]
            action = "deny"
            "#,
        );
        let evaluator = Evaluator::new(rs);
        assert_eq!(
            evaluator.evaluate(&Probe::Fs {
                path: "/a".into(),
                perm: FsPerm::ReadFile,
            }),
            Action::Deny
        );
    }

    #[test]
    fn fs_path_rule_does_not_match_sibling_path() {
        let rs = ruleset(
            r#"
            [[fs]]
            path = "/b"
            perms = ["read_file"]
            action = "deny"
            "#,
        );
        let evaluator = Evaluator::new(rs);
        assert_eq!(
            evaluator.evaluate(&Probe::Fs {
                path: "/a".into(),
                perm: FsPerm::ReadFile,
            }),
            Action::Allow
        );
    }

    #[test]
    fn cidr_membership_matches_containing_network_not_sibling() {
        let rs = ruleset(
            r#"
            [[net]]
            cidr = "10.0.0.0/8"
            proto = "tcp"
            ports = "80,443,8000-8100"
            action = "deny"
            "#,
        );
        let evaluator = Evaluator::new(rs);
        let addr: IpAddr = "10.0.0.5".parse().unwrap();
        assert_eq!(
            evaluator.evaluate(&Probe::Net {
                addr: Some(addr),
                port: 80,
                proto: "tcp".into(),
            }),
            Action::Deny
        );

        let sibling: IpAddr = "10.1.0.0".parse().unwrap();
        assert_eq!(
            evaluator.evaluate(&Probe::Net {
                addr: Some(sibling),
                port: 80,
                proto: "tcp".into(),
            }),
            Action::Allow
        );
    }

    #[test]
    fn unresolved_host_never_matches_and_falls_back_to_default() {
        let rs = ruleset(
            r#"
            [[net]]
            cidr = "0.0.0.0/0"
            proto = "tcp"
            ports = "1-65535"
            action = "deny"

            [defaults]
            net = "allow"
            "#,
        );
        let evaluator = Evaluator::new(rs);
        assert_eq!(
            evaluator.evaluate(&Probe::Net {
                addr: None,
                port: 443,
                proto: "tcp".into(),
            }),
            Action::Allow
        );
    }

    #[test]
    fn port_spec_matches_list_and_range_but_not_gaps() {
        let rs = ruleset(
            r#"
            [[net]]
            cidr = "127.0.0.1/32"
            proto = "tcp"
            ports = "80,443,8000-8100"
            action = "deny"
            "#,
        );
        let evaluator = Evaluator::new(rs);
        let addr: IpAddr = "127.0.0.1".parse().unwrap();
        for port in [80u16, 443, 8050] {
            assert_eq!(
                evaluator.evaluate(&Probe::Net {
                    addr: Some(addr),
                    port,
                    proto: "tcp".into(),
                }),
                Action::Deny
            );
        }
        assert_eq!(
            evaluator.evaluate(&Probe::Net {
                addr: Some(addr),
                port: 81,
                proto: "tcp".into(),
            }),
            Action::Allow
        );
    }

    #[test]
    fn exec_exact_equality() {
        let rs = ruleset(
            r#"
            [[exec]]
            path = "/bin/bash"
            action = "deny"
            "#,
        );
        let evaluator = Evaluator::new(rs);
        assert_eq!(
            evaluator.evaluate(&Probe::Exec {
                path: "/bin/bash".into()
            }),
            Action::Deny
        );
        assert_eq!(
            evaluator.evaluate(&Probe::Exec {
                path: "/bin/bash2".into()
            }),
            Action::Allow
        );
    }

    proptest::proptest! {
        #[test]
        fn compiled_and_uncompiled_agree_on_exec_probes(
            rule_path in "/(bin|usr/bin|opt)/[a-z]{1,6}",
            rule_action in 0u8..3,
            probe_path in "/(bin|usr/bin|opt)/[a-z]{1,6}",
        ) {
            let action = match rule_action {
                0 => "allow",
                1 => "warn",
                _ => "deny",
            };
            let src = format!(
                "[[exec]]\npath = \"{rule_path}\"\naction = \"{action}\"\n"
            );
            let rs: Ruleset = toml::from_str(&src).unwrap();
            let probe = Probe::Exec { path: probe_path };

            let uncompiled = Evaluator::new(rs.clone()).evaluate(&probe);
            let compiled = CompiledEvaluator::new(rs).evaluate(&probe);
            assert_eq!(uncompiled, compiled);
        }
    }
}

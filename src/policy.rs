//! Declarative egress policy.
//!
//! A [`Policy`] describes what an agent is allowed to do on the network:
//! which operation kinds, which hosts and ports, how large a request body
//! may be, and which operations need explicit human confirmation. Policies
//! are plain data — authored externally (TOML/JSON via serde) and swapped
//! onto the [`Guardian`](crate::guardian::Guardian) at runtime.

use std::collections::HashSet;

use regex::Regex;
use serde::{Deserialize, Serialize};

/// Closed set of network operation kinds an agent can request.
///
/// Matched exhaustively everywhere a decision depends on the operation,
/// so adding a variant is a compile-time event, not a stringly-typed one.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Operation {
    /// HTTP GET.
    Get,
    /// HTTP POST.
    Post,
    /// HTTP PUT.
    Put,
    /// HTTP DELETE.
    Delete,
    /// HTTP HEAD.
    Head,
    /// HTTP OPTIONS.
    Options,
    /// HTTP PATCH.
    Patch,
    /// WebSocket upgrade (risk-assessed here, transported elsewhere).
    WebSocket,
}

impl Operation {
    /// The operation name as it appears in policies and log lines.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Get => "get",
            Self::Post => "post",
            Self::Put => "put",
            Self::Delete => "delete",
            Self::Head => "head",
            Self::Options => "options",
            Self::Patch => "patch",
            Self::WebSocket => "websocket",
        }
    }

    /// The corresponding HTTP method, if this operation is plain HTTP.
    ///
    /// Returns `None` for [`Operation::WebSocket`], which is carried by a
    /// separate transport and only shares the risk assessment path.
    pub fn http_method(self) -> Option<reqwest::Method> {
        match self {
            Self::Get => Some(reqwest::Method::GET),
            Self::Post => Some(reqwest::Method::POST),
            Self::Put => Some(reqwest::Method::PUT),
            Self::Delete => Some(reqwest::Method::DELETE),
            Self::Head => Some(reqwest::Method::HEAD),
            Self::Options => Some(reqwest::Method::OPTIONS),
            Self::Patch => Some(reqwest::Method::PATCH),
            Self::WebSocket => None,
        }
    }
}

impl std::fmt::Display for Operation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Declarative egress policy for a single agent or integration.
///
/// Empty allow-lists mean "no allow-list configured": any host/port that is
/// not explicitly blocked passes that check. A non-empty allow-list makes
/// membership mandatory.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Policy {
    /// Human-readable policy name (shows up in risk reasons and logs).
    pub name: String,
    /// Operations the agent may perform at all.
    pub allowed_operations: HashSet<Operation>,
    /// Host patterns that are always denied (`*` wildcards allowed).
    #[serde(default)]
    pub blocked_hosts: Vec<String>,
    /// If non-empty, hosts must match one of these patterns.
    #[serde(default)]
    pub allowed_hosts: Vec<String>,
    /// Ports that are always denied.
    #[serde(default)]
    pub blocked_ports: HashSet<u16>,
    /// If non-empty, ports must be in this set.
    #[serde(default)]
    pub allowed_ports: HashSet<u16>,
    /// Maximum request body size in bytes, if bounded.
    #[serde(default)]
    pub max_request_bytes: Option<usize>,
    /// Operations that need a manual approval on file before they run.
    #[serde(default)]
    pub require_confirmation: HashSet<Operation>,
    /// Whether the guardian logs each risk decision made under this policy.
    #[serde(default = "default_log_decisions")]
    pub log_decisions: bool,
}

fn default_log_decisions() -> bool {
    true
}

impl Default for Policy {
    /// The baseline policy an agent runtime ships with: every HTTP verb is
    /// known, mutating verbs require confirmation, and loopback/private
    /// addresses are blocked by name. The named blocks stack with the
    /// guardian's dangerous-address scoring, pushing loopback targets past
    /// the rejection threshold.
    fn default() -> Self {
        Self {
            name: "default".to_owned(),
            allowed_operations: HashSet::from([
                Operation::Get,
                Operation::Head,
                Operation::Options,
                Operation::Post,
                Operation::Put,
                Operation::Delete,
                Operation::Patch,
            ]),
            blocked_hosts: vec![
                "localhost".to_owned(),
                "127.*".to_owned(),
                "0.0.0.0".to_owned(),
                "::1".to_owned(),
                "10.*".to_owned(),
                "192.168.*".to_owned(),
                "169.254.*".to_owned(),
            ],
            allowed_hosts: Vec::new(),
            blocked_ports: HashSet::new(),
            allowed_ports: HashSet::new(),
            max_request_bytes: None,
            require_confirmation: HashSet::from([
                Operation::Post,
                Operation::Put,
                Operation::Delete,
                Operation::Patch,
            ]),
            log_decisions: true,
        }
    }
}

impl Policy {
    /// A wide-open policy for tests and trusted integrations: everything
    /// allowed, nothing confirmed.
    pub fn permissive() -> Self {
        Self {
            name: "permissive".to_owned(),
            allowed_operations: HashSet::from([
                Operation::Get,
                Operation::Post,
                Operation::Put,
                Operation::Delete,
                Operation::Head,
                Operation::Options,
                Operation::Patch,
                Operation::WebSocket,
            ]),
            blocked_hosts: Vec::new(),
            allowed_hosts: Vec::new(),
            blocked_ports: HashSet::new(),
            allowed_ports: HashSet::new(),
            max_request_bytes: None,
            require_confirmation: HashSet::new(),
            log_decisions: false,
        }
    }

    /// Whether `host` matches any of the policy's blocked-host patterns.
    pub fn host_blocked(&self, host: &str) -> bool {
        self.blocked_hosts.iter().any(|p| pattern_matches(p, host))
    }

    /// Whether an allow-list is configured and `host` fails to match it.
    pub fn host_outside_allow_list(&self, host: &str) -> bool {
        !self.allowed_hosts.is_empty()
            && !self.allowed_hosts.iter().any(|p| pattern_matches(p, host))
    }
}

/// Match a host against a `*`-wildcard pattern, case-insensitively.
///
/// Patterns without `*` compare as plain strings. `*` matches any run of
/// characters, so `*.internal.example` matches every subdomain. A pattern
/// that fails to compile matches nothing.
pub fn pattern_matches(pattern: &str, host: &str) -> bool {
    if !pattern.contains('*') {
        return pattern.eq_ignore_ascii_case(host);
    }

    let escaped = regex::escape(pattern).replace(r"\*", ".*");
    let anchored = format!("(?i)^{escaped}$");
    match Regex::new(&anchored) {
        Ok(re) => re.is_match(host),
        Err(_) => false,
    }
}

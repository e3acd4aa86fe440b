//! Guardian — additive risk scoring over the active [`Policy`].
//!
//! Every prospective network operation is scored before it runs. Each
//! matching policy condition contributes its weight independently; the
//! weights stack on purpose, so a host that is both explicitly blocked and
//! a loopback address is penalized twice. The total maps onto four ordered
//! risk levels, and anything at or above [`RiskLevel::High`] is rejected
//! outright. Assessment is a pure in-memory function of the policy plus the
//! manual-approval cache — no I/O, no suspension.

use std::collections::HashMap;
use std::net::IpAddr;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::{info, warn};

use crate::policy::{Operation, Policy};

// Scoring weights. Each condition contributes independently.
const SCORE_OPERATION_FORBIDDEN: u32 = 100;
const SCORE_HOST_BLOCKED: u32 = 50;
const SCORE_HOST_NOT_ALLOWED: u32 = 30;
const SCORE_DANGEROUS_ADDRESS: u32 = 40;
const SCORE_PORT_BLOCKED: u32 = 50;
const SCORE_PORT_NOT_ALLOWED: u32 = 30;
const SCORE_PORT_SENSITIVE: u32 = 25;
const SCORE_SIZE_EXCEEDED: u32 = 20;

// Level thresholds over the accumulated score.
const THRESHOLD_CRITICAL: u32 = 100;
const THRESHOLD_HIGH: u32 = 50;
const THRESHOLD_MEDIUM: u32 = 25;

/// Ports that carry remote shells, databases, or remote desktops.
/// Hitting one of these is suspicious for an agent regardless of policy.
const SENSITIVE_PORTS: &[u16] = &[
    22, 23, 135, 139, 445, 1433, 3306, 3389, 5432, 5900, 6379, 27017,
];

/// Ordinal risk classification of a prospective operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RiskLevel {
    /// Nothing of note matched.
    Low,
    /// Some condition matched, but the operation may proceed.
    Medium,
    /// Rejected: too many conditions matched.
    High,
    /// Rejected: a hard policy violation matched.
    Critical,
}

impl RiskLevel {
    fn from_score(score: u32) -> Self {
        if score >= THRESHOLD_CRITICAL {
            Self::Critical
        } else if score >= THRESHOLD_HIGH {
            Self::High
        } else if score >= THRESHOLD_MEDIUM {
            Self::Medium
        } else {
            Self::Low
        }
    }
}

/// The outcome of one risk assessment. Produced per call, never persisted.
#[derive(Debug, Clone, Serialize)]
pub struct RiskAssessment {
    /// Classified risk level.
    pub level: RiskLevel,
    /// Accumulated score behind the level (diagnostic).
    pub score: u32,
    /// Whether the operation may proceed.
    pub approved: bool,
    /// Ordered, human-readable reasons — one per matched condition.
    pub reasons: Vec<String>,
    /// Whether a manual approval must be on file before the operation runs.
    pub requires_confirmation: bool,
    /// Free-form caller-supplied context, echoed back for audit surfaces.
    pub metadata: serde_json::Value,
    /// When the assessment was made.
    pub assessed_at: DateTime<Utc>,
}

/// Manual approvals are scoped to an exact (operation, host, port) triple.
type ApprovalKey = (Operation, String, Option<u16>);

/// Risk/policy engine gating every outbound operation.
///
/// Owns the current [`Policy`] and a small manual-approval cache. Approvals
/// are advisory: they satisfy a confirmation requirement on an otherwise
/// approved assessment, and can never resurrect a rejected one. Swapping
/// the policy wipes the approvals — they are policy-scoped, not durable.
#[derive(Debug)]
pub struct Guardian {
    policy: Policy,
    approvals: HashMap<ApprovalKey, bool>,
}

impl Guardian {
    /// Create a guardian enforcing the given policy.
    pub fn new(policy: Policy) -> Self {
        Self {
            policy,
            approvals: HashMap::new(),
        }
    }

    /// The currently active policy.
    pub fn policy(&self) -> &Policy {
        &self.policy
    }

    /// Replace the active policy. Clears the manual-approval cache.
    pub fn set_policy(&mut self, policy: Policy) {
        info!(policy = %policy.name, "guardian policy replaced, approvals cleared");
        self.policy = policy;
        self.approvals.clear();
    }

    /// Record a manual approval for an exact (operation, host, port) triple.
    pub fn approve_operation(&mut self, operation: Operation, host: &str, port: Option<u16>) {
        info!(%operation, host, ?port, "manual approval recorded");
        self.approvals.insert((operation, host.to_owned(), port), true);
    }

    /// Whether a manual approval is on file for this triple.
    pub fn is_approved(&self, operation: Operation, host: &str, port: Option<u16>) -> bool {
        self.approvals
            .get(&(operation, host.to_owned(), port))
            .copied()
            .unwrap_or(false)
    }

    /// Drop every manual approval.
    pub fn clear_approvals(&mut self) {
        self.approvals.clear();
    }

    /// Score a prospective operation against the active policy.
    ///
    /// Each matching condition contributes its weight and pushes one reason;
    /// conditions are never deduplicated, so a blocked loopback host is
    /// penalized both as a blocked host and as a dangerous address.
    pub fn assess_risk(
        &self,
        operation: Operation,
        host: &str,
        port: Option<u16>,
        data_size: Option<usize>,
        metadata: Option<serde_json::Value>,
    ) -> RiskAssessment {
        let mut score: u32 = 0;
        let mut reasons: Vec<String> = Vec::new();

        if !self.policy.allowed_operations.contains(&operation) {
            score = score.saturating_add(SCORE_OPERATION_FORBIDDEN);
            reasons.push(format!(
                "operation '{operation}' is not allowed by policy '{}'",
                self.policy.name
            ));
        }

        if self.policy.host_blocked(host) {
            score = score.saturating_add(SCORE_HOST_BLOCKED);
            reasons.push(format!("host '{host}' matches a blocked-host pattern"));
        }

        if self.policy.host_outside_allow_list(host) {
            score = score.saturating_add(SCORE_HOST_NOT_ALLOWED);
            reasons.push(format!("host '{host}' is not on the configured allow-list"));
        }

        for category in dangerous_address_categories(host) {
            score = score.saturating_add(SCORE_DANGEROUS_ADDRESS);
            reasons.push(format!("host '{host}' is a {category} address"));
        }

        if let Some(port) = port {
            if self.policy.blocked_ports.contains(&port) {
                score = score.saturating_add(SCORE_PORT_BLOCKED);
                reasons.push(format!("port {port} is explicitly blocked"));
            }
            if !self.policy.allowed_ports.is_empty() && !self.policy.allowed_ports.contains(&port) {
                score = score.saturating_add(SCORE_PORT_NOT_ALLOWED);
                reasons.push(format!("port {port} is outside the configured allow-list"));
            }
            if SENSITIVE_PORTS.contains(&port) {
                score = score.saturating_add(SCORE_PORT_SENSITIVE);
                reasons.push(format!("port {port} is a sensitive service port"));
            }
        }

        if let (Some(size), Some(max)) = (data_size, self.policy.max_request_bytes) {
            if size > max {
                score = score.saturating_add(SCORE_SIZE_EXCEEDED);
                reasons.push(format!(
                    "request size {size} bytes exceeds the policy limit of {max} bytes"
                ));
            }
        }

        let level = RiskLevel::from_score(score);
        let approved = level < RiskLevel::High;
        let requires_confirmation =
            self.policy.require_confirmation.contains(&operation) || level >= RiskLevel::High;

        let assessment = RiskAssessment {
            level,
            score,
            approved,
            reasons,
            requires_confirmation,
            metadata: metadata.unwrap_or(serde_json::Value::Null),
            assessed_at: Utc::now(),
        };

        if self.policy.log_decisions {
            if assessment.approved {
                info!(
                    %operation,
                    host,
                    ?port,
                    level = ?assessment.level,
                    score = assessment.score,
                    "risk assessment approved"
                );
            } else {
                warn!(
                    %operation,
                    host,
                    ?port,
                    level = ?assessment.level,
                    score = assessment.score,
                    reasons = ?assessment.reasons,
                    "risk assessment rejected"
                );
            }
        }

        assessment
    }
}

/// Dangerous-address categories a host can fall into. A host normally
/// matches at most one, but each match contributes independently.
fn dangerous_address_categories(host: &str) -> Vec<&'static str> {
    let mut categories = Vec::new();

    if host.eq_ignore_ascii_case("localhost") {
        categories.push("loopback");
        return categories;
    }

    let addr: IpAddr = match host.parse() {
        Ok(a) => a,
        // Hostnames are judged by the policy's host patterns instead;
        // DNS resolution is out of scope here.
        Err(_) => return categories,
    };

    match addr {
        IpAddr::V4(v4) => {
            let octets = v4.octets();
            if v4.is_loopback() || v4.is_unspecified() {
                categories.push("loopback");
            }
            // RFC1918: 10.0.0.0/8, 172.16.0.0/12, 192.168.0.0/16
            if octets[0] == 10
                || (octets[0] == 172 && (16..=31).contains(&octets[1]))
                || (octets[0] == 192 && octets[1] == 168)
            {
                categories.push("private-range");
            }
            // 169.254.0.0/16
            if octets[0] == 169 && octets[1] == 254 {
                categories.push("link-local");
            }
        }
        IpAddr::V6(v6) => {
            let segments = v6.segments();
            if v6.is_loopback() {
                categories.push("loopback");
            }
            // fc00::/7 — unique local
            if (segments[0] & 0xFE00) == 0xFC00 {
                categories.push("private-range");
            }
            // fe80::/10
            if (segments[0] & 0xFFC0) == 0xFE80 {
                categories.push("link-local");
            }
        }
    }

    categories
}

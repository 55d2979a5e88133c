//! Session binding validation (Zero-Trust).
//!
//! On refresh, the presenting client is compared against the client the
//! session was issued to. Each drift dimension contributes to a risk score;
//! at or above [`RISK_THRESHOLD`] the refresh is refused.
//!
//! IP comparison is subnet-based (/24 for IPv4, /64 for IPv6 after
//! canonicalization, so mixed `::`-notation forms of one address compare
//! equal). Strict mode scores any IP difference at full weight.

use std::collections::HashSet;
use std::net::IpAddr;

use uuid::Uuid;

use super::Session;

/// Risk at or above which the refresh is refused.
pub const RISK_THRESHOLD: u32 = 100;

const RISK_IP_SUBNET_CHANGE: u32 = 30;
const RISK_IP_STRICT_MISMATCH: u32 = 50;
const RISK_UA_MINOR_DRIFT: u32 = 10;
const RISK_UA_MAJOR_DRIFT: u32 = 30;
const RISK_DEVICE_MISMATCH: u32 = 40;

const UA_MINOR_SIMILARITY: f64 = 0.95;
const UA_MAJOR_SIMILARITY: f64 = 0.8;

/// What the refreshing client presented.
#[derive(Debug, Clone, Default)]
pub struct RequestContext {
    pub ip_address: Option<String>,
    pub user_agent: Option<String>,
    pub device_id: Option<Uuid>,
}

/// Scores how much a request context drifted from the bound session.
#[derive(Debug, Clone)]
pub struct BindingValidator {
    strict_ip: bool,
}

impl BindingValidator {
    pub fn new(strict_ip: bool) -> Self {
        Self { strict_ip }
    }

    /// Total risk of the presented context against the session's binding.
    ///
    /// A dimension with nothing recorded on the session contributes zero; a
    /// recorded dimension the client fails to present scores full drift.
    pub fn risk_score(&self, session: &Session, ctx: &RequestContext) -> u32 {
        let mut risk = 0;

        if let Some(stored) = session.ip_address.as_deref() {
            risk += match ctx.ip_address.as_deref() {
                Some(presented) => self.ip_risk(stored, presented),
                None => self.ip_mismatch_weight(),
            };
        }

        if let Some(stored) = session.user_agent.as_deref() {
            risk += match ctx.user_agent.as_deref() {
                Some(presented) => ua_risk(stored, presented),
                None => RISK_UA_MAJOR_DRIFT,
            };
        }

        if let Some(bound_device) = session.device_id {
            if ctx.device_id != Some(bound_device) {
                risk += RISK_DEVICE_MISMATCH;
            }
        }

        risk
    }

    fn ip_mismatch_weight(&self) -> u32 {
        if self.strict_ip {
            RISK_IP_STRICT_MISMATCH
        } else {
            RISK_IP_SUBNET_CHANGE
        }
    }

    fn ip_risk(&self, stored: &str, presented: &str) -> u32 {
        match (parse_canonical(stored), parse_canonical(presented)) {
            (Some(a), Some(b)) => {
                if a == b {
                    0
                } else if self.strict_ip {
                    RISK_IP_STRICT_MISMATCH
                } else if same_subnet(&a, &b) {
                    0
                } else {
                    RISK_IP_SUBNET_CHANGE
                }
            }
            // Unparseable addresses fall back to exact string comparison.
            _ => {
                if stored == presented {
                    0
                } else {
                    self.ip_mismatch_weight()
                }
            }
        }
    }
}

/// Parse and canonicalize, collapsing IPv4-mapped IPv6 to IPv4.
fn parse_canonical(addr: &str) -> Option<IpAddr> {
    addr.trim().parse::<IpAddr>().ok().map(|ip| ip.to_canonical())
}

/// /24 prefix equality for IPv4, /64 prefix equality for IPv6.
fn same_subnet(a: &IpAddr, b: &IpAddr) -> bool {
    match (a, b) {
        (IpAddr::V4(a), IpAddr::V4(b)) => {
            u32::from_be_bytes(a.octets()) >> 8 == u32::from_be_bytes(b.octets()) >> 8
        }
        (IpAddr::V6(a), IpAddr::V6(b)) => {
            u128::from_be_bytes(a.octets()) >> 64 == u128::from_be_bytes(b.octets()) >> 64
        }
        _ => false,
    }
}

fn ua_risk(stored: &str, presented: &str) -> u32 {
    let similarity = jaccard(stored, presented);
    if similarity >= UA_MINOR_SIMILARITY {
        0
    } else if similarity >= UA_MAJOR_SIMILARITY {
        RISK_UA_MINOR_DRIFT
    } else {
        RISK_UA_MAJOR_DRIFT
    }
}

/// Jaccard similarity over lowercased alphanumeric tokens.
fn jaccard(a: &str, b: &str) -> f64 {
    let tokens = |s: &str| -> HashSet<String> {
        s.to_lowercase()
            .split(|c: char| !c.is_ascii_alphanumeric())
            .filter(|t| !t.is_empty())
            .map(str::to_string)
            .collect()
    };

    let a = tokens(a);
    let b = tokens(b);
    if a.is_empty() && b.is_empty() {
        return 1.0;
    }

    let intersection = a.intersection(&b).count() as f64;
    let union = a.union(&b).count() as f64;
    intersection / union
}

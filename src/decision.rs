use crate::authres::ResultValue;
use crate::policy::Policy;
use std::fmt;

/// SMTP reply code sent with every rejection.
pub const REJECT_CODE: &str = "550";

/// Verdict of the upstream DMARC verifier as read back from our own
/// `Authentication-Results` header.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DmarcVerdict {
    pub identifier: String,
    pub outcome: ResultValue,
    /// `header.from` exactly as the verifier wrote it.
    pub claimed_domain: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Rejection {
    pub code: &'static str,
    pub text: String,
}

impl fmt::Display for Rejection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}", self.code, self.text)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Decision {
    Accept,
    Reject(Rejection),
}

impl Decision {
    pub fn label(&self) -> &'static str {
        match self {
            Decision::Accept => "accept",
            Decision::Reject(_) => "reject",
        }
    }
}

/// Anything but a DMARC pass for a listed domain is rejected.
pub fn should_reject(policy: &Policy, verdict: &DmarcVerdict) -> bool {
    verdict.outcome != ResultValue::Pass && policy.reject_domains.contains(&verdict.claimed_domain)
}

pub fn decide(policy: &Policy, verdict: Option<&DmarcVerdict>, reject: bool) -> Decision {
    match verdict {
        Some(verdict) if reject => Decision::Reject(Rejection {
            code: REJECT_CODE,
            text: policy.reject_template.render(&verdict.claimed_domain),
        }),
        _ => Decision::Accept,
    }
}

/// One audit line per evaluated transaction.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuditRecord {
    pub queue_id: String,
    pub decision: &'static str,
    pub outcome: Option<ResultValue>,
    pub domain: Option<String>,
    pub from: String,
}

impl AuditRecord {
    pub fn new(
        queue_id: &str,
        decision: &Decision,
        verdict: Option<&DmarcVerdict>,
        from: String,
    ) -> Self {
        AuditRecord {
            queue_id: queue_id.to_string(),
            decision: decision.label(),
            outcome: verdict.map(|v| v.outcome.clone()),
            domain: verdict
                .map(|v| v.claimed_domain.clone())
                .filter(|d| !d.is_empty()),
            from,
        }
    }
}

impl fmt::Display for AuditRecord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}: {} dmarc={} from={} addr={:?}",
            self.queue_id,
            self.decision,
            self.outcome.as_ref().map_or("unknown", ResultValue::as_str),
            self.domain.as_deref().unwrap_or("unknown"),
            self.from
        )
    }
}

//! Per-transaction evaluation of the message header.
//!
//! A [`Session`] lives from the MAIL stage to the end of the header. It keeps
//! the first `From` field and the first `Authentication-Results` field written
//! by the local verifier that carries a DMARC result, then decides once the
//! header is complete. Header events never reject early.

use crate::authres::{self, AuthResult};
use crate::decision::{self, AuditRecord, Decision, DmarcVerdict, Rejection};
use crate::decode;
use crate::policy::Policy;
use std::sync::Arc;

/// Placeholder used in log lines until the MTA tells us the queue id.
pub const NO_QUEUE_ID: &str = "NOQUEUE";

const FROM: &str = "From";
const AUTHENTICATION_RESULTS: &str = "Authentication-Results";

/// Which of the two interesting fields have been captured so far.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CaptureState {
    Idle,
    PartialCapture,
    FullCapture,
}

/// Answer to a milter event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Response {
    Continue,
    Accept,
    Reject(Rejection),
}

impl From<Decision> for Response {
    fn from(decision: Decision) -> Self {
        match decision {
            Decision::Accept => Response::Accept,
            Decision::Reject(rejection) => Response::Reject(rejection),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum Phase {
    Collecting,
    Exempt,
    Decided(Decision),
}

#[derive(Debug, Clone)]
struct CapturedVerdict {
    verdict: DmarcVerdict,
    reject: bool,
}

#[derive(Debug)]
pub struct Session {
    policy: Arc<Policy>,
    queue_id: String,
    phase: Phase,
    verdict: Option<CapturedVerdict>,
    from: Option<String>,
}

impl Session {
    pub fn new(policy: Arc<Policy>) -> Self {
        Session {
            policy,
            queue_id: NO_QUEUE_ID.to_string(),
            phase: Phase::Collecting,
            verdict: None,
            from: None,
        }
    }

    pub fn queue_id(&self) -> &str {
        &self.queue_id
    }

    pub fn set_queue_id(&mut self, queue_id: impl Into<String>) {
        self.queue_id = queue_id.into();
    }

    pub fn capture_state(&self) -> CaptureState {
        match (self.verdict.is_some(), self.from.is_some()) {
            (false, false) => CaptureState::Idle,
            (true, true) => CaptureState::FullCapture,
            _ => CaptureState::PartialCapture,
        }
    }

    pub fn verdict(&self) -> Option<&DmarcVerdict> {
        self.verdict.as_ref().map(|c| &c.verdict)
    }

    pub fn should_reject(&self) -> bool {
        self.verdict.as_ref().is_some_and(|c| c.reject)
    }

    pub fn raw_from(&self) -> Option<&str> {
        self.from.as_deref()
    }

    pub fn is_exempt(&self) -> bool {
        self.phase == Phase::Exempt
    }

    /// Start of the transaction. Senders that authenticated to the relay are
    /// accepted without looking at the header.
    pub fn on_mail_from(&mut self, authenticated: bool) -> Response {
        if authenticated {
            log::debug!("{}: authenticated sender, skipping", self.queue_id);
            self.phase = Phase::Exempt;
            return Response::Accept;
        }
        Response::Continue
    }

    pub fn on_header(&mut self, name: &str, value: &str) -> Response {
        match self.phase {
            Phase::Exempt => return Response::Accept,
            Phase::Decided(_) => return Response::Continue,
            Phase::Collecting => {}
        }
        if self.capture_state() == CaptureState::FullCapture {
            return Response::Continue;
        }

        if name.eq_ignore_ascii_case(FROM) {
            if self.from.is_none() {
                self.from = Some(value.to_string());
            }
        } else if name.eq_ignore_ascii_case(AUTHENTICATION_RESULTS) && self.verdict.is_none() {
            self.capture_auth_results(name, value);
        }

        Response::Continue
    }

    fn capture_auth_results(&mut self, name: &str, value: &str) {
        let (identifier, results) = match authres::parse(value) {
            Ok(parsed) => parsed,
            Err(e) => {
                // Foreign or broken data must never block delivery.
                log::warn!(
                    "{}: failed to parse header: {}: {:?}",
                    self.queue_id,
                    e,
                    format!("{name}: {value}")
                );
                return;
            }
        };

        if !self.policy.is_local_identifier(&identifier) {
            log::debug!(
                "{}: ignoring {} from authserv-id {}",
                self.queue_id,
                name,
                identifier
            );
            return;
        }

        // Later DMARC entries of the same field override earlier ones.
        let last_dmarc = results.iter().rev().find_map(|result| match result {
            AuthResult::Dmarc { value, from, .. } => Some((value.clone(), from.clone())),
            _ => None,
        });
        let Some((outcome, from)) = last_dmarc else {
            let found: Vec<String> = results
                .iter()
                .map(|result| format!("{}={}", result.method(), result.value()))
                .collect();
            log::debug!(
                "{}: no dmarc result in {}: {}",
                self.queue_id,
                name,
                found.join(" ")
            );
            return;
        };

        let verdict = DmarcVerdict {
            identifier,
            outcome,
            claimed_domain: from.unwrap_or_default(),
        };
        let reject = decision::should_reject(&self.policy, &verdict);
        self.verdict = Some(CapturedVerdict { verdict, reject });
    }

    /// End of the header. Logs the audit line the first time; later calls
    /// return the same answer silently.
    pub fn on_headers_end(&mut self) -> Response {
        match &self.phase {
            Phase::Exempt => return Response::Accept,
            Phase::Decided(decision) => return decision.clone().into(),
            Phase::Collecting => {}
        }

        let decision = decision::decide(&self.policy, self.verdict(), self.should_reject());
        log::info!("{}", self.audit(&decision));
        self.phase = Phase::Decided(decision.clone());
        decision.into()
    }

    pub fn audit(&self, decision: &Decision) -> AuditRecord {
        let from = self
            .from
            .as_deref()
            .map(decode::display_from)
            .unwrap_or_default();
        AuditRecord::new(&self.queue_id, decision, self.verdict(), from)
    }
}

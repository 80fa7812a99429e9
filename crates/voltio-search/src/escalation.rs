//! Escalation detection - decides when a conversation must leave the bot.
//!
//! Evaluated before any pipeline stage on every turn, and again after a
//! failed episode so repeated failures reach a human quickly.

use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::LazyLock;

use crate::text::normalize;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum EscalationReason {
    HumanRequest,
    Refund,
    WarrantyClaim,
    Complaint,
    Urgency,
    RepeatedFailure,
    UpstreamError,
}

impl EscalationReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::HumanRequest => "human_request",
            Self::Refund => "refund",
            Self::WarrantyClaim => "warranty_claim",
            Self::Complaint => "complaint",
            Self::Urgency => "urgency",
            Self::RepeatedFailure => "repeated_failure",
            Self::UpstreamError => "upstream_error",
        }
    }

    /// Message shown to the customer while the hand-off happens.
    pub fn handoff_text(&self) -> &'static str {
        match self {
            Self::HumanRequest => {
                "Claro, te paso con una persona de nuestro equipo. En breve te atenderá un asesor por este mismo chat."
            }
            Self::Refund => {
                "Entiendo que quieres gestionar una devolución. Te paso con el equipo de atención al cliente para que lo tramiten contigo."
            }
            Self::WarrantyClaim => {
                "Siento que el producto esté dando problemas. Te paso con el equipo de garantías para revisar tu caso."
            }
            Self::Complaint => {
                "Lamento mucho la situación. Te paso con una persona del equipo para que lo resuelva contigo personalmente."
            }
            Self::Urgency => {
                "Entiendo que es urgente. Te paso ahora mismo con un asesor para atenderte cuanto antes."
            }
            Self::RepeatedFailure => {
                "Parece que no estoy consiguiendo encontrar lo que necesitas. Te paso con un asesor que te ayudará personalmente."
            }
            Self::UpstreamError => {
                "Estamos teniendo problemas técnicos para consultar el catálogo. Te paso con un asesor para que no tengas que esperar."
            }
        }
    }
}

impl fmt::Display for EscalationReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct EscalationDecision {
    pub escalate: bool,
    pub reason: Option<EscalationReason>,
    pub suggested_handoff_text: Option<String>,
}

impl EscalationDecision {
    fn none() -> Self {
        Self {
            escalate: false,
            reason: None,
            suggested_handoff_text: None,
        }
    }

    fn fire(reason: EscalationReason) -> Self {
        Self {
            escalate: true,
            reason: Some(reason),
            suggested_handoff_text: Some(reason.handoff_text().to_string()),
        }
    }
}

// Patterns run on normalized text (lower-case, accents stripped).
static HUMAN_REQUEST_RE: LazyLock<regex::Regex> = LazyLock::new(|| {
    regex::Regex::new(
        r"\b(hablar|comunicarme|comunicar|contactar|pasame|pasarme|atienda|atender)\b.*\b(persona|humano|humana|asesor|asesora|agente|operador|operadora|vendedor|encargado|alguien)\b|\b(persona real|agente humano|talk to a human|real person|human agent)\b",
    )
    .expect("human request regex is valid")
});

static REFUND_RE: LazyLock<regex::Regex> = LazyLock::new(|| {
    regex::Regex::new(r"\b(reembolso|reembolsar|devolucion|devolver|devuelvan|reintegro|refund)\b")
        .expect("refund regex is valid")
});

static WARRANTY_RE: LazyLock<regex::Regex> = LazyLock::new(|| {
    regex::Regex::new(r"\b(garantia|warranty)\b").expect("warranty regex is valid")
});

static DEFECT_RE: LazyLock<regex::Regex> = LazyLock::new(|| {
    regex::Regex::new(
        r"\b(roto|rota|defectuoso|defectuosa|no funciona|no anda|dejo de funcionar|falla|fallo|quemado|quemada|averiado|averiada|estropeado|estropeada|broken)\b",
    )
    .expect("defect regex is valid")
});

static COMPLAINT_RE: LazyLock<regex::Regex> = LazyLock::new(|| {
    regex::Regex::new(
        r"\b(queja|quejarme|reclamo|reclamacion|denuncia|estafa|verguenza|pesimo|pesima|inaceptable|indignado|indignada|harto|harta|mal servicio|nunca llego|complaint)\b",
    )
    .expect("complaint regex is valid")
});

static URGENCY_RE: LazyLock<regex::Regex> = LazyLock::new(|| {
    regex::Regex::new(r"\b(urgente|urgencia|emergencia|urgent)\b").expect("urgency regex is valid")
});

pub struct EscalationDetector {
    failure_threshold: u32,
    failures: DashMap<String, u32>,
}

impl EscalationDetector {
    pub fn new(failure_threshold: u32) -> Self {
        Self {
            failure_threshold: failure_threshold.max(1),
            failures: DashMap::new(),
        }
    }

    /// Decide whether the conversation must be handed off.
    ///
    /// Message patterns take precedence, then the upstream-error flag, then
    /// the per-session failed-episode counter.
    pub fn should_escalate(
        &self,
        message: &str,
        session_id: &str,
        upstream_error: bool,
    ) -> EscalationDecision {
        let text = normalize(message);

        let reason = if HUMAN_REQUEST_RE.is_match(&text) {
            Some(EscalationReason::HumanRequest)
        } else if REFUND_RE.is_match(&text) {
            Some(EscalationReason::Refund)
        } else if WARRANTY_RE.is_match(&text) && DEFECT_RE.is_match(&text) {
            Some(EscalationReason::WarrantyClaim)
        } else if COMPLAINT_RE.is_match(&text) {
            Some(EscalationReason::Complaint)
        } else if URGENCY_RE.is_match(&text) {
            Some(EscalationReason::Urgency)
        } else {
            self.state_reason(session_id, upstream_error)
        };
        self.decide(session_id, reason)
    }

    /// Escalation from session state alone: the upstream-error flag, then
    /// the failed-episode counter. Used after an episode ends.
    pub fn check_counter(&self, session_id: &str, upstream_error: bool) -> EscalationDecision {
        let reason = self.state_reason(session_id, upstream_error);
        self.decide(session_id, reason)
    }

    fn state_reason(&self, session_id: &str, upstream_error: bool) -> Option<EscalationReason> {
        if upstream_error {
            Some(EscalationReason::UpstreamError)
        } else if self.failure_count(session_id) >= self.failure_threshold {
            Some(EscalationReason::RepeatedFailure)
        } else {
            None
        }
    }

    fn decide(&self, session_id: &str, reason: Option<EscalationReason>) -> EscalationDecision {
        match reason {
            Some(reason) => {
                tracing::info!(session_id = %session_id, reason = %reason, "Escalation triggered");
                EscalationDecision::fire(reason)
            }
            None => EscalationDecision::none(),
        }
    }

    /// Count a failed episode; returns the new count.
    pub fn record_failure(&self, session_id: &str) -> u32 {
        let mut entry = self.failures.entry(session_id.to_string()).or_insert(0);
        *entry += 1;
        *entry
    }

    pub fn reset(&self, session_id: &str) {
        self.failures.remove(session_id);
    }

    pub fn failure_count(&self, session_id: &str) -> u32 {
        self.failures.get(session_id).map(|c| *c).unwrap_or(0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_explicit_human_request() {
        let detector = EscalationDetector::new(2);
        let decision = detector.should_escalate("Quiero hablar con una persona", "s1", false);
        assert!(decision.escalate);
        assert_eq!(decision.reason, Some(EscalationReason::HumanRequest));
        assert!(decision.suggested_handoff_text.is_some());
    }

    #[test]
    fn test_product_requests_do_not_escalate() {
        let detector = EscalationDetector::new(2);
        for msg in [
            "necesito un automático",
            "busco diferencial 2P 40A 30mA",
            "¿dónde está mi pedido 12345?",
            "hola",
        ] {
            assert!(!detector.should_escalate(msg, "s1", false).escalate, "{msg}");
        }
    }

    #[test]
    fn test_counter_check_ignores_message_patterns() {
        let detector = EscalationDetector::new(2);
        assert!(!detector.check_counter("s1", false).escalate);
        detector.record_failure("s1");
        assert!(!detector.check_counter("s1", false).escalate);
        detector.record_failure("s1");
        assert_eq!(
            detector.check_counter("s1", false).reason,
            Some(EscalationReason::RepeatedFailure)
        );
        assert_eq!(
            detector.check_counter("s2", true).reason,
            Some(EscalationReason::UpstreamError)
        );
    }

    #[test]
    fn test_warranty_needs_a_defect() {
        let detector = EscalationDetector::new(2);
        assert!(!detector.should_escalate("¿qué garantía tiene este foco?", "s1", false).escalate);
        let decision = detector.should_escalate("el foco está en garantía y no funciona", "s1", false);
        assert_eq!(decision.reason, Some(EscalationReason::WarrantyClaim));
    }

    #[test]
    fn test_refund_and_complaint() {
        let detector = EscalationDetector::new(2);
        assert_eq!(
            detector.should_escalate("quiero la devolución del dinero", "s1", false).reason,
            Some(EscalationReason::Refund)
        );
        assert_eq!(
            detector.should_escalate("esto es una estafa, pésimo", "s1", false).reason,
            Some(EscalationReason::Complaint)
        );
    }

    #[test]
    fn test_repeated_failure_counter() {
        let detector = EscalationDetector::new(2);
        assert_eq!(detector.record_failure("s1"), 1);
        assert!(!detector.should_escalate("", "s1", false).escalate);
        assert_eq!(detector.record_failure("s1"), 2);
        assert_eq!(
            detector.should_escalate("", "s1", false).reason,
            Some(EscalationReason::RepeatedFailure)
        );
        assert!(!detector.should_escalate("", "s2", false).escalate);

        detector.reset("s1");
        assert_eq!(detector.failure_count("s1"), 0);
    }

    #[test]
    fn test_upstream_error_flag() {
        let detector = EscalationDetector::new(2);
        assert_eq!(
            detector.should_escalate("busco cable", "s1", true).reason,
            Some(EscalationReason::UpstreamError)
        );
    }
}

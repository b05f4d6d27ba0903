use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::peer::types::{IceCandidate, SessionDescription};

pub const FIELD_ANSWER: &str = "answer";
pub const FIELD_CANDIDATES: &str = "candidates";

/// The one shared record per pairing attempt.
///
/// Both participants own it collectively through the relay. `offer` and
/// `answer` are set at most once per generation; `candidates` only grows.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct SessionDocument {
    #[serde(default)]
    pub offer: Option<SessionDescription>,
    #[serde(default)]
    pub answer: Option<SessionDescription>,
    #[serde(default)]
    pub candidates: BTreeMap<String, Value>,
    #[serde(default)]
    pub created: i64,
    #[serde(default)]
    pub offerer: Option<String>,
}

impl SessionDocument {
    /// Fresh document written by the offerer.
    pub fn new_offer(offer: SessionDescription, offerer: &str, created: i64) -> Self {
        Self {
            offer: Some(offer),
            answer: None,
            candidates: BTreeMap::new(),
            created,
            offerer: Some(offerer.to_string()),
        }
    }

    /// Decodes a relay value. `Err` means the document is present but invalid.
    pub fn from_value(value: Value) -> Result<Self, serde_json::Error> {
        serde_json::from_value(value)
    }
}

/// One entry of the `candidates` collection.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct CandidateEntry {
    pub candidate: IceCandidate,
    pub from: String,
    pub timestamp: i64,
}

/// What a participant does after observing the session document.
#[derive(Debug, Clone, PartialEq)]
pub enum PairingDecision {
    /// Absent or invalid document, or no offer yet.
    Offer,
    /// An offer is waiting for an answer.
    Answer(SessionDescription),
    /// Both descriptions exist: a previous attempt finished or was abandoned.
    Evict,
}

/// The role rule: absent/offer-less → offer, offer-only → answer, both → evict.
pub fn decide_role(observed: Option<Value>) -> PairingDecision {
    let Some(value) = observed else {
        return PairingDecision::Offer;
    };
    match SessionDocument::from_value(value) {
        Ok(SessionDocument {
            offer: Some(offer),
            answer: None,
            ..
        }) => PairingDecision::Answer(offer),
        Ok(SessionDocument {
            offer: Some(_),
            answer: Some(_),
            ..
        }) => PairingDecision::Evict,
        Ok(_) => PairingDecision::Offer,
        Err(e) => {
            tracing::warn!(error = %e, "session document is invalid; treating as absent");
            PairingDecision::Offer
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn offer_json() -> Value {
        json!({"type": "offer", "sdp": "v=0 offer"})
    }

    fn answer_json() -> Value {
        json!({"type": "answer", "sdp": "v=0 answer"})
    }

    #[test]
    fn absent_document_means_offer() {
        assert_eq!(decide_role(None), PairingDecision::Offer);
    }

    #[test]
    fn document_without_offer_means_offer() {
        let doc = json!({"answer": null, "created": 5, "candidates": {"-c1": {}}});
        assert_eq!(decide_role(Some(doc)), PairingDecision::Offer);
    }

    #[test]
    fn offer_only_means_answer() {
        let doc = json!({"offer": offer_json(), "answer": null, "offerer": "user_a", "created": 1});
        assert_eq!(
            decide_role(Some(doc)),
            PairingDecision::Answer(SessionDescription::offer("v=0 offer"))
        );

        // field missing entirely behaves like null
        let doc = json!({"offer": offer_json()});
        assert!(matches!(decide_role(Some(doc)), PairingDecision::Answer(_)));
    }

    #[test]
    fn offer_and_answer_means_evict() {
        let doc = json!({"offer": offer_json(), "answer": answer_json()});
        assert_eq!(decide_role(Some(doc)), PairingDecision::Evict);
    }

    #[test]
    fn invalid_document_means_offer() {
        assert_eq!(decide_role(Some(json!("garbage"))), PairingDecision::Offer);
        let doc = json!({"offer": {"type": "nonsense"}});
        assert_eq!(decide_role(Some(doc)), PairingDecision::Offer);
    }

    #[test]
    fn new_offer_document_shape() {
        let doc = SessionDocument::new_offer(SessionDescription::offer("v=0"), "user_a", 42);
        let v = serde_json::to_value(&doc).unwrap();
        assert_eq!(v["answer"], Value::Null);
        assert_eq!(v["offerer"], "user_a");
        assert_eq!(v["created"], 42);
        assert_eq!(v["candidates"], json!({}));
        assert_eq!(v["offer"]["type"], "offer");
    }
}

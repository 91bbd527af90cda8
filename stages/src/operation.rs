//! JSON envelopes carried between stages.

use lambdas_core::{LambdaError, LogMessage};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

/// A client operation as submitted, before sequencing.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct RawOperation {
    /// Document the operation applies to (also the partition key)
    pub document_id: String,
    /// Submitting client
    pub client_id: String,
    /// Per-client counter assigned by the client
    pub client_sequence_number: u64,
    /// Opaque operation contents
    pub contents: serde_json::Value,
}

/// An operation with its document-wide sequence number.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct SequencedOperation {
    /// Document the operation applies to
    pub document_id: String,
    /// Submitting client
    pub client_id: String,
    /// Per-client counter assigned by the client
    pub client_sequence_number: u64,
    /// Total order within the document, starting at 1
    pub sequence_number: u64,
    /// Opaque operation contents
    pub contents: serde_json::Value,
}

impl SequencedOperation {
    /// Stamp `raw` with `sequence_number`.
    #[must_use]
    pub fn sequence(raw: RawOperation, sequence_number: u64) -> Self {
        Self {
            document_id: raw.document_id,
            client_id: raw.client_id,
            client_sequence_number: raw.client_sequence_number,
            sequence_number,
            contents: raw.contents,
        }
    }
}

/// Decode the JSON payload of `message`.
///
/// # Errors
///
/// Returns [`LambdaError::MalformedMessage`] if the payload is not valid JSON
/// for `T`.
pub fn decode<T: DeserializeOwned>(message: &LogMessage) -> Result<T, LambdaError> {
    serde_json::from_slice(&message.payload).map_err(|e| LambdaError::malformed(message, e.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use lambdas_core::TopicPartition;
    use serde_json::json;

    #[test]
    fn decode_rejects_garbage() {
        let message = LogMessage::new(&TopicPartition::new("rawdeltas", 0), 9, "doc", b"{".to_vec());
        let result: Result<RawOperation, _> = decode(&message);
        assert!(matches!(result, Err(LambdaError::MalformedMessage { offset: 9, .. })));
    }

    #[test]
    fn sequencing_keeps_client_fields() {
        let raw = RawOperation {
            document_id: "doc".into(),
            client_id: "alice".into(),
            client_sequence_number: 4,
            contents: json!({"insert": "x"}),
        };
        let sequenced = SequencedOperation::sequence(raw, 12);
        assert_eq!(sequenced.sequence_number, 12);
        assert_eq!(sequenced.client_sequence_number, 4);
        assert_eq!(sequenced.contents, json!({"insert": "x"}));
    }
}

//! Sequencing stage.
//!
//! Deli reads raw client operations and gives every operation of a document a
//! gap-free sequence number. A client that resubmits an operation (same or
//! lower client sequence number) is recognised and the copy is dropped, so the
//! sequenced stream contains each client operation exactly once even though
//! the raw topic is at-least-once.

use crate::operation::{RawOperation, SequencedOperation, decode};
use lambdas_core::{Lambda, LambdaContext, LambdaError, LambdaOutput, LogMessage, OutboundMessage};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Sequencing state of one document.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DocumentSequence {
    /// Last sequence number assigned
    pub sequence_number: u64,
    /// Last client sequence number accepted, per client
    pub clients: BTreeMap<String, u64>,
}

/// Sequencing state of every document in a partition.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeliState {
    /// Per-document state, keyed by document id
    pub documents: BTreeMap<String, DocumentSequence>,
}

/// Sequencing and deduplication lambda.
#[derive(Clone, Debug)]
pub struct DeliLambda {
    output_topic: String,
}

impl DeliLambda {
    /// Create a deli emitting sequenced operations to `output_topic`.
    #[must_use]
    pub fn new(output_topic: impl Into<String>) -> Self {
        Self {
            output_topic: output_topic.into(),
        }
    }
}

impl Lambda for DeliLambda {
    type State = DeliState;

    async fn handle(
        &self,
        message: &LogMessage,
        context: &mut LambdaContext<DeliState>,
    ) -> Result<LambdaOutput, LambdaError> {
        let raw: RawOperation = decode(message)?;
        let document = context
            .state
            .documents
            .entry(raw.document_id.clone())
            .or_default();

        let last_seen = document.clients.get(&raw.client_id).copied();
        if last_seen.is_some_and(|last| raw.client_sequence_number <= last) {
            tracing::debug!(
                document_id = %raw.document_id,
                client_id = %raw.client_id,
                client_sequence_number = raw.client_sequence_number,
                offset = message.offset,
                "Dropping duplicate operation"
            );
            metrics::counter!("lambdas.deli.duplicates").increment(1);
            return Ok(LambdaOutput::advance());
        }

        let sequence_number = document.sequence_number + 1;
        let client_id = raw.client_id.clone();
        let client_sequence_number = raw.client_sequence_number;
        let sequenced = SequencedOperation::sequence(raw, sequence_number);
        let outbound = OutboundMessage::json(&self.output_topic, &sequenced.document_id, &sequenced)
            .map_err(|e| LambdaError::InvariantViolation(format!("Unencodable operation: {e}")))?;

        document.sequence_number = sequence_number;
        document.clients.insert(client_id, client_sequence_number);

        Ok(LambdaOutput::emit([outbound]))
    }
}

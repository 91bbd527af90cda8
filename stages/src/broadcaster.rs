//! Fan-out stage.
//!
//! Re-publishes sequenced operations to the delivery topic that client
//! connections read from. Replays after a restart are suppressed per
//! document by sequence number.

use crate::operation::{SequencedOperation, decode};
use lambdas_core::{Lambda, LambdaContext, LambdaError, LambdaOutput, LogMessage, OutboundMessage};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Last broadcast sequence number per document.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BroadcasterState {
    /// Keyed by document id
    pub broadcast: BTreeMap<String, u64>,
}

/// Fan-out lambda.
#[derive(Clone, Debug)]
pub struct BroadcasterLambda {
    delivery_topic: String,
}

impl BroadcasterLambda {
    /// Create a broadcaster publishing to `delivery_topic`.
    #[must_use]
    pub fn new(delivery_topic: impl Into<String>) -> Self {
        Self {
            delivery_topic: delivery_topic.into(),
        }
    }
}

impl Lambda for BroadcasterLambda {
    type State = BroadcasterState;

    async fn handle(
        &self,
        message: &LogMessage,
        context: &mut LambdaContext<BroadcasterState>,
    ) -> Result<LambdaOutput, LambdaError> {
        let operation: SequencedOperation = decode(message)?;
        let last = context
            .state
            .broadcast
            .get(&operation.document_id)
            .copied()
            .unwrap_or(0);

        if operation.sequence_number <= last {
            tracing::debug!(
                document_id = %operation.document_id,
                sequence_number = operation.sequence_number,
                last,
                "Suppressing replayed broadcast"
            );
            metrics::counter!("lambdas.broadcaster.replays_suppressed").increment(1);
            return Ok(LambdaOutput::advance());
        }

        let outbound = OutboundMessage::new(
            &self.delivery_topic,
            &operation.document_id,
            message.payload.clone(),
        );
        context
            .state
            .broadcast
            .insert(operation.document_id, operation.sequence_number);
        Ok(LambdaOutput::emit([outbound]))
    }
}

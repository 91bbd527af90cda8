//! Stage business logic.
//!
//! A [`Lambda`] is the per-message logic of one stage. The runtime owns
//! everything else: ordering, retries, checkpoints and rebalances. A lambda
//! receives one message at a time together with the partition's
//! [`LambdaContext`] and returns a [`LambdaOutput`] describing what to publish
//! and whether the message's side effects are durable.
//!
//! # Example
//!
//! ```
//! use lambdas_core::{Lambda, LambdaContext, LambdaError, LambdaOutput, LogMessage};
//!
//! struct Counter;
//!
//! impl Lambda for Counter {
//!     type State = u64;
//!
//!     async fn handle(
//!         &self,
//!         _message: &LogMessage,
//!         context: &mut LambdaContext<u64>,
//!     ) -> Result<LambdaOutput, LambdaError> {
//!         context.state += 1;
//!         Ok(LambdaOutput::advance())
//!     }
//! }
//! ```

use crate::SmallVec;
use crate::message::{LogMessage, Offset, OutboundMessage, PartitionAssignment};
use serde::Serialize;
use serde::de::DeserializeOwned;
use std::future::Future;
use thiserror::Error;

/// Errors a lambda can report for a message.
///
/// Every variant faults the partition. Only non-transient errors count
/// towards poison detection.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum LambdaError {
    /// The payload could not be understood
    #[error("Malformed message at offset {offset}: {reason}")]
    MalformedMessage {
        /// Offset of the offending message
        offset: Offset,
        /// What was wrong with it
        reason: String,
    },

    /// The message contradicts the stage's state
    #[error("Invariant violation: {0}")]
    InvariantViolation(String),

    /// A side effect (storage write, external call) failed
    #[error("Side effect failed: {0}")]
    SideEffect(String),
}

impl LambdaError {
    /// Create a malformed-message error for `message`.
    #[must_use]
    pub fn malformed(message: &LogMessage, reason: impl Into<String>) -> Self {
        Self::MalformedMessage {
            offset: message.offset,
            reason: reason.into(),
        }
    }

    /// Whether the failure comes from infrastructure rather than the message.
    #[must_use]
    pub const fn is_transient(&self) -> bool {
        matches!(self, Self::SideEffect(_))
    }
}

/// Per-partition state handed to every [`Lambda::handle`] call.
///
/// Owned by exactly one partition manager for the lifetime of one assignment
/// and rebuilt from the checkpoint store on every rebalance, restart or
/// fault recovery.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct LambdaContext<S> {
    /// The partition being processed
    pub assignment: PartitionAssignment,
    /// Stage state
    pub state: S,
    /// Offset of the last message handed to the lambda, if any
    pub last_offset: Option<Offset>,
}

impl<S> LambdaContext<S> {
    /// Create a context resuming after `last_offset` with `state`.
    #[must_use]
    pub const fn new(assignment: PartitionAssignment, state: S, last_offset: Option<Offset>) -> Self {
        Self {
            assignment,
            state,
            last_offset,
        }
    }
}

impl<S: Default> LambdaContext<S> {
    /// A context for an assignment with no checkpoint.
    #[must_use]
    pub fn fresh(assignment: PartitionAssignment) -> Self {
        Self::new(assignment, S::default(), None)
    }
}

/// Result of handling one message.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct LambdaOutput {
    /// Messages to append downstream, in order
    pub emit: SmallVec<[OutboundMessage; 4]>,
    /// All side effects up to and including this message are durable
    pub checkpoint_advance: bool,
}

impl LambdaOutput {
    /// Nothing emitted, checkpoint may advance.
    #[must_use]
    pub fn advance() -> Self {
        Self {
            emit: SmallVec::new(),
            checkpoint_advance: true,
        }
    }

    /// Nothing emitted, side effects still pending.
    #[must_use]
    pub fn hold() -> Self {
        Self::default()
    }

    /// Emit `messages` and allow the checkpoint to advance.
    #[must_use]
    pub fn emit(messages: impl IntoIterator<Item = OutboundMessage>) -> Self {
        Self {
            emit: messages.into_iter().collect(),
            checkpoint_advance: true,
        }
    }
}

/// Per-message business logic of a stage.
///
/// # Contract
///
/// - Messages arrive in strict offset order for a partition
/// - All stage state lives in [`LambdaContext::state`]; a lambda keeps no
///   hidden per-partition state of its own
/// - Side effects go through capabilities the lambda was built with;
///   publishes are returned in [`LambdaOutput::emit`] and produced by the
///   runtime
/// - Returning `checkpoint_advance = true` promises that every side effect up
///   to this message is durable
///
/// A lambda may see a message again after a crash or fault if the offset was
/// not yet checkpointed, so side effects must be idempotent.
pub trait Lambda: Send + Sync + 'static {
    /// Typed stage state persisted with each checkpoint.
    type State: Serialize + DeserializeOwned + Default + Clone + Send + Sync + 'static;

    /// Handle one message.
    ///
    /// # Errors
    ///
    /// Returns a [`LambdaError`] when the message cannot be processed. The
    /// partition faults and reprocesses from its last checkpoint.
    fn handle(
        &self,
        message: &LogMessage,
        context: &mut LambdaContext<Self::State>,
    ) -> impl Future<Output = Result<LambdaOutput, LambdaError>> + Send;
}

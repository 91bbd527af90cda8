//! # Lambdas Stages
//!
//! Reference lambdas for the collaborative-editing pipeline:
//!
//! ```text
//! rawdeltas ──▶ deli ──▶ deltas ──┬──▶ scriptorium ──▶ snapshot storage
//!                                 └──▶ broadcaster ──▶ delivery
//! ```
//!
//! - [`DeliLambda`]: assigns document sequence numbers and drops resubmitted
//!   client operations
//! - [`ScriptoriumLambda`]: batches sequenced operations into snapshot commits
//! - [`BroadcasterLambda`]: fans sequenced operations out to clients
//!
//! Every stage is an ordinary [`Lambda`](lambdas_core::Lambda) and runs
//! under a `LambdaRunner` from `lambdas-runtime`.

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod broadcaster;
pub mod deli;
pub mod operation;
pub mod scriptorium;

pub use broadcaster::{BroadcasterLambda, BroadcasterState};
pub use deli::{DeliLambda, DeliState, DocumentSequence};
pub use operation::{RawOperation, SequencedOperation, decode};
pub use scriptorium::{ScriptoriumLambda, ScriptoriumState};

/// Default topic of raw client operations.
pub const RAW_DELTAS_TOPIC: &str = "rawdeltas";

/// Default topic of sequenced operations.
pub const DELTAS_TOPIC: &str = "deltas";

/// Default topic client connections read from.
pub const DELIVERY_TOPIC: &str = "delivery";

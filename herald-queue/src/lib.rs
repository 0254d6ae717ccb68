//! Durable queue of outbound messages.
//!
//! The [`QueueStore`] trait is the single source of truth for message state.
//! Delivery attempts take time-bounded claims through
//! [`QueueStore::claim_pending`] and report their outcome with the claim
//! token, so writes from an attempt that lost its claim are ignored.

mod backends;
pub mod config;
pub mod error;
mod lockfile;
pub mod message;
mod row;
pub mod store;
pub mod types;

pub use backends::{FileQueueStore, MemoryQueueStore};
pub use config::QueueConfig;
pub use error::{QueueError, Result, SerializationError, ValidationError};
pub use lockfile::LockFile;
pub use message::{Claim, Failure, Lease, QueuedMessage, WriteOutcome};
pub use store::{ClaimRequest, MessageState, QueueFilter, QueueStore, TimeWindow};
pub use types::{ClaimToken, MessageId, ParseRecipientError, Recipient, RecipientClass, UserId};

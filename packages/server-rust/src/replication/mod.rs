//! Active → passive replication.
//!
//! - [`messages`]: the replication message union and its `MsgPack` codec
//! - [`active`]: sending side, bound to the replication mode
//! - [`transport`]: the transport seam and the in-process implementation
//! - [`passive`]: applying side, shadow invalidation bookkeeping, promotion

pub mod active;
pub mod error;
pub mod messages;
pub mod passive;
pub mod transport;

pub use active::{ActiveReplicator, PendingReplication, ReplicationFailure};
pub use error::{ProtocolMisuse, ReplicationError};
pub use messages::{ConcurrencyKey, ReplicationMessage};
pub use passive::{BucketState, PassiveReplica, PromotedState};
pub use transport::{InProcessTransport, ReplicationReceipt, ReplicationTransport};

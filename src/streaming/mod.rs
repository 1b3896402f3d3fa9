//! Server-streaming calls.
//!
//! # Data Flow
//! ```text
//! Client::subscribe(factory)
//!     → subscription.rs (node pick, stream, reconnect with backoff)
//!     → chunks.rs (reassemble multi-part messages by correlation id)
//!     → mpsc receiver: Message* then one Completed | Failed
//! ```

pub mod chunks;
pub mod subscription;

pub use chunks::{ChunkAssembler, ChunkInfo, Message, StreamPart};
pub use subscription::{
    subscribe, subscribe_tracked, PartStream, SubscribeContext, SubscriptionEvent,
    SubscriptionHandle, SubscriptionId, SubscriptionRegistry,
};

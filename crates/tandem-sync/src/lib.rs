//! Realtime channel management and offline mutation sync for the Tandem
//! client.
//!
//! This crate provides:
//! - Resilient WebSocket channels to the calendar service (heartbeat
//!   liveness, exponential-backoff reconnection, outbound buffering)
//! - Inbound frame routing (control frames handled internally, application
//!   frames delivered to one registered consumer)
//! - A durable SQLite-backed queue of offline mutations
//! - A sync engine that replays queued mutations in creation order and
//!   resolves conflicts against server state
//!
//! # Example
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use tandem_sync::{
//!     channel_url, connectivity, ChannelConnection, OfflineAction, ActionPayload,
//!     OfflineQueue, ServerFrame, StaticChannelUrl, SyncEngine,
//! };
//! use tandem_core::NewMessage;
//!
//! # async fn example(
//! #     api: Arc<dyn tandem_core::CalendarApi>,
//! #     notifier: Arc<dyn tandem_sync::SyncNotifier>,
//! # ) -> tandem_sync::Result<()> {
//! // Live channel for one event's chat room.
//! let url = channel_url("https://api.tandem.app/api", "/api/events/e1/ws", "token")?;
//! let connection = ChannelConnection::new(
//!     Arc::new(StaticChannelUrl(url)),
//!     Arc::new(|frame: ServerFrame| {
//!         println!("inbound: {frame:?}");
//!     }),
//! );
//! connection.connect().await?;
//!
//! // Durable queue + engine for offline writes.
//! let queue = Arc::new(OfflineQueue::open("tandem-queue.db")?);
//! let (handle, monitor) = connectivity(true);
//! let engine = SyncEngine::new(api, queue, monitor, notifier);
//! engine
//!     .submit(OfflineAction::new(
//!         "e1",
//!         ActionPayload::SendMessage {
//!             message: NewMessage { content: "running late!".into() },
//!         },
//!     ))
//!     .await?;
//! # Ok(())
//! # }
//! ```

mod connection;
mod connectivity;
mod error;
mod message;
mod queue;
mod router;
mod sync;

pub use connection::{
    AUTH_CLOSE_CODES, ChannelConnection, ChannelUrlProvider, ConnectionConfig, ConnectionHealth,
    ConnectionPhase, StaticChannelUrl, channel_url,
};
pub use connectivity::{ConnectivityHandle, ConnectivityMonitor, connectivity};
pub use error::{Result, SyncError};
pub use message::{ClientFrame, EventRef, ItemRef, MessageRef, ServerFrame};
pub use queue::{
    ActionKind, ActionPayload, DEFAULT_MAX_RETRIES, OfflineAction, OfflineQueue,
};
pub use router::FrameCallback;
pub use sync::{ActionOutcome, DrainReport, SyncEngine, SyncNotifier};

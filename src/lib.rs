//! Offline-first sync core for the field-service app.
//!
//! Local writes land in the [`EntityStore`] immediately and are sent to the
//! remote store when possible, or kept in the durable [`OperationLog`] until
//! the [`Reconciler`] can replay them. The [`ChangeFeedListener`] folds
//! server-pushed changes into the same store. [`SyncClient`] ties one
//! authenticated session together; [`SessionScope`] swaps it on sign-in and
//! sign-out.

pub mod audit;
pub mod cache;
pub mod config;
pub mod connectivity;
pub mod error;
pub mod feed;
pub mod ffi;
pub mod logging;
pub mod memory;
pub mod merge;
pub mod model;
pub mod oplog;
pub mod reconciler;
pub mod remote;
pub mod session;
pub mod storage;
pub mod store;
pub mod sync;

pub use config::SyncConfig;
pub use connectivity::{Connectivity, ConnectivityMonitor, ManualProbe, ReachabilityProbe};
pub use error::{RemoteError, SyncError};
pub use feed::ChangeFeedListener;
pub use model::{Collection, OpType};
pub use oplog::{OperationLog, PendingOperation, QueuedOperation};
pub use reconciler::{ReconcileOutcome, ReconcileReport, Reconciler};
pub use remote::{ChangeEvent, RemoteStore, Subscription};
pub use session::{Session, SessionEvent, SessionScope};
pub use storage::{LocalStore, MemoryStore, ScopedStore, SqliteStore};
pub use store::{EntityStore, SyncState};
pub use sync::{FetchOutcome, Notification, SyncClient, SyncDeps, SyncEvent, WriteOutcome};

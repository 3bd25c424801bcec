// chatpresence presence
//
// Keeps the durable copy of each user's presence in line with the ephemeral
// connection store: the client-side connection watcher, the change-driven
// reconciler, and the dispatcher that feeds it.

pub mod reconciler;
pub mod session;
pub mod triggers;
pub mod watcher;

pub use reconciler::{reconcile, PresenceReconciler, Reconciliation, StatusWrite};
pub use session::{PresenceSession, SessionManager};
pub use triggers::{DispatchReport, TriggerDispatcher};
pub use watcher::{ConnectionState, ConnectionWatcher};

//! Client side: HTTP transport, background listener, local cache and the
//! per-window sessions built on them.

mod cache;
mod listener;
mod remote;
mod session;
mod table;

pub use cache::{notice_for, ClientCache, Effect, Reconciliation};
pub use listener::{BroadcastListener, EventSource};
pub use remote::{HttpClient, RemoteSubscription};
pub use session::RecordSession;
pub use table::{TableSession, TableUpdate};

//! In-process change bus.
//!
//! Two topics are carried: `rn_channel` for record mutations and
//! `table_updates` for whole-table saves. Each subscriber owns a bounded
//! buffer; a subscriber that overflows it is dropped.
//!
//! # Example
//!
//! ```ignore
//! let bus = ChangeBus::new();
//! let handle = bus.subscribe(SubscriptionConfig::default().excluding(my_id));
//!
//! loop {
//!     match handle.recv() {
//!         Ok(BusMessage::RecordChanged { event }) => apply(event),
//!         Ok(BusMessage::TableChanged { change }) => reload(change),
//!         Ok(BusMessage::Dropped { .. }) | Err(_) => break,
//!     }
//! }
//! ```

mod manager;
mod types;

pub use manager::ChangeBus;
pub use types::{
    BusMessage, DropReason, SubscriptionConfig, SubscriptionHandle, SubscriptionId, Topic,
};

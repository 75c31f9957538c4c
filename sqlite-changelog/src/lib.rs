pub mod change;
pub mod introspect;
pub mod notify;
pub mod store;

pub use change::{Change, TOMBSTONE_CID};
pub use notify::{NotificationHub, SubscriptionGuard, UPDATE_DELETE, UPDATE_INSERT, UPDATE_UPDATE};
pub use store::ChangeLogStore;

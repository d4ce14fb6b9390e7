pub mod notifier;
pub mod timer;

pub use self::notifier::{Notifier, Subscription};

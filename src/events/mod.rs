//! Rate limit events and the observers reacting to them.

mod dispatcher;
mod headers;
mod observer;
mod reject;

pub use dispatcher::EventDispatcher;
pub use headers::{HeaderValues, RateLimitHeadersObserver, RetryAfterHeaderObserver};
pub use observer::{Decision, Filtered, ObserverExt, RateLimitEvent, RateLimitObserver};
pub use reject::{DenyObserver, TooManyRequestsObserver};

//! Attribute Protocol (ATT) client side
//!
//! This module provides the ATT wire codec, the request multiplexer that
//! serializes requests over one bearer, and the registry that routes
//! server-initiated notifications and indications.

pub mod constants;
pub mod error;
pub mod multiplexer;
pub mod subscriber;
pub mod types;

// Re-export the public API
pub use self::constants::*;
pub use self::error::AttErrorCode;
pub use self::multiplexer::{MismatchPolicy, MultiplexerConfig, RequestMultiplexer};
pub use self::subscriber::{Dispatcher, NotificationCallback, SubscriptionRegistry};
pub use self::types::*;

use std::sync::{Mutex, MutexGuard, PoisonError};

/// Lock a mutex, recovering the data if a panicking callback poisoned it.
pub(crate) fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

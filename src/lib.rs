pub mod blob;
pub mod capability;
pub mod codec;
pub mod config;
pub mod dispatcher;
pub mod endpoint;
pub mod error;
pub mod executor;
pub mod message;
pub mod metrics;
pub mod request;
/// Open sessions, their cancellation tokens and outbound routing.
pub mod session;
pub mod worker;

pub use capability::{CapabilityRegistry, PluginDeclaration, PluginModule};
pub use config::RuntimeConfig;
pub use dispatcher::PluginRuntime;
pub use error::{CapabilityError, ErrorCode, InvocationError, RuntimeError};
pub use message::InvokeMessage;
pub use session::SessionHandle;

use std::sync::{Mutex, MutexGuard};

/// Lock a std mutex, recovering the data if a panicking holder poisoned it.
pub(crate) fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

//! Timeout defaults and async deadline helpers.

use std::future::Future;
use std::time::Duration;

use tokio::time::timeout;

use crate::error::{ProtocolError, Result};

/// Default time allowed for the transport to open and the session to become ready
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(10);

/// Default wait for a command response
pub const COMMAND_TIMEOUT: Duration = Duration::from_secs(5);

/// Default wait for the server to assign an identity
pub const IDENTITY_TIMEOUT: Duration = Duration::from_secs(10);

/// Time allowed for the worker to drain during close
pub const SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(5);

/// Await `fut`, mapping expiry to the error built by `on_timeout`.
pub async fn with_timeout_error<F, T, E>(fut: F, duration: Duration, on_timeout: E) -> Result<T>
where
    F: Future<Output = Result<T>>,
    E: FnOnce() -> ProtocolError,
{
    match timeout(duration, fut).await {
        Ok(result) => result,
        Err(_) => Err(on_timeout()),
    }
}

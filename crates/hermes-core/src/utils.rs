/*!
 * Utility functions and helpers for Hermes.
 *
 * This module provides the timeout and task helpers shared by the relay and
 * the stream bridge.
 */
use std::future::Future;
use std::time::Duration;

use tokio::time::timeout;
use tracing::{debug, warn};

use crate::error::{Error, Result};

/// Run a future with a timeout
///
/// # Arguments
///
/// * `duration` - The timeout duration
/// * `future` - The future to run
///
/// # Returns
///
/// The output of the future, or a timeout error if the timeout is reached
pub async fn with_timeout<F, T>(duration: Duration, future: F) -> Result<T>
where
    F: Future<Output = T>,
{
    timeout(duration, future).await.map_err(|_| {
        Error::timeout(format!(
            "Operation timed out after {}ms",
            duration_to_millis(duration)
        ))
    })
}

/// Create a task that runs in the background and logs its outcome
///
/// # Arguments
///
/// * `name` - A name for the task (for logging)
/// * `fut` - The future to run
///
/// # Returns
///
/// A handle resolving to the task's own result
pub fn spawn_and_log<F, T, E>(name: &str, fut: F) -> tokio::task::JoinHandle<std::result::Result<T, E>>
where
    F: Future<Output = std::result::Result<T, E>> + Send + 'static,
    T: Send + 'static,
    E: std::fmt::Display + Send + 'static,
{
    let task_name = name.to_string();
    tokio::spawn(async move {
        let result = fut.await;
        match &result {
            Ok(_) => debug!("Task '{}' completed successfully", task_name),
            Err(e) => warn!("Task '{}' failed: {}", task_name, e),
        }
        result
    })
}

/// Convert a Duration to milliseconds
pub fn duration_to_millis(duration: Duration) -> u64 {
    duration.as_secs() * 1000 + u64::from(duration.subsec_millis())
}

/// Convert milliseconds to a Duration
pub fn millis_to_duration(millis: u64) -> Duration {
    Duration::from_millis(millis)
}

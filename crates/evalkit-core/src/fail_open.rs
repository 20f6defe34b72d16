//! Fail-open helper for cleanup work
//!
//! Cleanup that must never abort an eval (process teardown, eval finalization)
//! goes through [`fail_open`]: the error is logged and the caller carries on.
//!
//! Never use this for stage execution or repair requests.

use std::future::Future;
use tracing::warn;

use crate::Result;

/// Run a cleanup operation, logging instead of propagating its failure
///
/// ```no_run
/// use evalkit_core::fail_open::fail_open;
/// use evalkit_core::Result;
///
/// async fn kill_serve_process() -> Result<()> {
///     Ok(())
/// }
///
/// async fn example() {
///     let done = fail_open("serve teardown", || kill_serve_process()).await;
///     assert!(done.is_some());
/// }
/// ```
pub async fn fail_open<F, Fut, T>(operation_name: &str, f: F) -> Option<T>
where
    F: FnOnce() -> Fut,
    Fut: Future<Output = Result<T>>,
{
    match f().await {
        Ok(val) => Some(val),
        Err(e) => {
            warn!("{} failed (fail-open): {}", operation_name, e);
            None
        }
    }
}

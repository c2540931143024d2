use std::future::Future;

use tokio::runtime::Handle;

/// Spawns a fire-and-forget task when a runtime is available, e.g. from `Drop`.
pub(crate) fn spawn_detached<F>(future: F)
where
    F: Future<Output = ()> + Send + 'static,
{
    if Handle::try_current().is_ok() {
        tokio::spawn(future);
    }
}

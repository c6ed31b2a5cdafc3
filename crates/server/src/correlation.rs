//! Ambient per-connection correlation.
//!
//! Work done on behalf of a connection runs inside [`with_correlation`]; any
//! code it reaches, including code resumed after an `.await`, can read the
//! connection id through [`current`] without it being passed along. Bindings
//! live in tokio task-local storage, so concurrently running connections never
//! observe each other's id and tasks spawned from inside a scope start unbound.

use std::future::Future;

use tracing::Instrument;

tokio::task_local! {
    static CURRENT: String;
    static SUPPRESS_LOGS: bool;
}

/// Binds `id` for the dynamic extent of `task`. Nested calls shadow the outer
/// binding and restore it once they complete.
pub async fn with_correlation<F>(id: impl Into<String>, task: F) -> F::Output
where
    F: Future,
{
    let id = id.into();
    let span = tracing::info_span!("ws.connection", connection_id = %id);
    CURRENT.scope(id, task.instrument(span)).await
}

/// Marks everything `task` logs as eligible for suppression at info/debug.
/// Independent of the correlation binding, so re-binding an id inside keeps
/// the flag.
pub async fn with_log_suppression<F>(suppress: bool, task: F) -> F::Output
where
    F: Future,
{
    SUPPRESS_LOGS.scope(suppress, task).await
}

pub fn current() -> Option<String> {
    CURRENT.try_with(String::clone).ok()
}

pub fn logs_suppressed() -> bool {
    SUPPRESS_LOGS.try_with(|suppress| *suppress).unwrap_or(false)
}

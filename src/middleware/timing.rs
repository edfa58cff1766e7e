//! Timing wrapper for middleware hooks.

use axum::http::Method;
use std::{future::Future, time::Instant};
use tracing::{Instrument, info, info_span};

/// Run `fut` inside a `blob` middleware span and log how long it took.
pub async fn timed<F>(
    action: &'static str,
    stage: &'static str,
    method: &Method,
    url: &str,
    fut: F,
) -> F::Output
where
    F: Future,
{
    let span = info_span!("middleware", middleware = "blob", action, %method, url);
    let started = Instant::now();
    let output = fut.instrument(span.clone()).await;
    info!(parent: &span, stage, elapsed = ?started.elapsed(), "blob middleware step finished");
    output
}

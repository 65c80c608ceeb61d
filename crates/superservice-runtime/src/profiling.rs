//! Profiling endpoints under `/debug/pprof`

use axum::extract::Query;
use axum::http::{header, StatusCode};
use axum::response::{Html, IntoResponse, Response};
use axum::routing::get;
use axum::Router;
use serde::Deserialize;
use std::time::Duration;
use tracing::{error, info};

/// Mount prefix of the profiling routes
pub(crate) const PREFIX: &str = "/debug/pprof";

const DEFAULT_PROFILE_SECONDS: u64 = 30;
const MAX_PROFILE_SECONDS: u64 = 300;
const SAMPLING_FREQUENCY: i32 = 100;

const INDEX: &str = r#"<html>
<head><title>/debug/pprof/</title></head>
<body>
/debug/pprof/<br>
<br>
<a href="cmdline">cmdline</a>: the command line invocation of the current program<br>
<a href="profile">profile</a>: CPU profile rendered as a flame graph. Add ?seconds=N to set the sampling window<br>
</body>
</html>
"#;

/// Profiling routes at their full paths
pub(crate) fn router() -> Router {
    Router::new()
        .route(PREFIX, get(index))
        .route("/debug/pprof/", get(index))
        .route("/debug/pprof/cmdline", get(cmdline))
        .route("/debug/pprof/profile", get(profile))
}

async fn index() -> Html<&'static str> {
    Html(INDEX)
}

/// Arguments separated by NUL bytes
async fn cmdline() -> impl IntoResponse {
    let args: Vec<String> = std::env::args().collect();
    (
        [(header::CONTENT_TYPE, "text/plain; charset=utf-8")],
        args.join("\0"),
    )
}

#[derive(Debug, Deserialize)]
struct ProfileParams {
    seconds: Option<u64>,
}

async fn profile(Query(params): Query<ProfileParams>) -> Response {
    let seconds = params
        .seconds
        .unwrap_or(DEFAULT_PROFILE_SECONDS)
        .clamp(1, MAX_PROFILE_SECONDS);
    info!(seconds, "Collecting CPU profile");

    match tokio::task::spawn_blocking(move || flamegraph(Duration::from_secs(seconds))).await {
        Ok(Ok(svg)) => ([(header::CONTENT_TYPE, "image/svg+xml")], svg).into_response(),
        Ok(Err(e)) => {
            error!(error = %e, "Could not enable CPU profiling");
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                format!("Could not enable CPU profiling: {e}"),
            )
                .into_response()
        }
        Err(e) => (StatusCode::INTERNAL_SERVER_ERROR, e.to_string()).into_response(),
    }
}

fn flamegraph(duration: Duration) -> Result<Vec<u8>, pprof::Error> {
    let guard = pprof::ProfilerGuardBuilder::default()
        .frequency(SAMPLING_FREQUENCY)
        .blocklist(&["libc", "libgcc", "pthread", "vdso"])
        .build()?;

    std::thread::sleep(duration);

    let report = guard.report().build()?;
    let mut svg = Vec::new();
    report.flamegraph(&mut svg)?;
    Ok(svg)
}

pub mod backoff;
pub mod metrics;
pub mod shutdown;

/// Process-wide startup: color output override, nothing else required since
/// this core has no outbound TLS clients to configure.
pub fn init() {
    let disable_colors = ["1", "true"].contains(
        &std::env::var("DISABLE_COLORS")
            .unwrap_or_else(|_| String::new())
            .to_lowercase()
            .as_str(),
    );
    owo_colors::set_override(!disable_colors);
}

/// Best-effort readiness marker for orchestrators that check for a file
/// rather than an HTTP probe. Failure to write it is logged, not fatal —
/// most deployments rely on `/healthz` instead.
pub fn signal_ready() {
    if let Err(e) = std::fs::write("/tmp/ironhold-ready", "ready") {
        tracing::warn!(error = %e, "failed to write readiness marker");
    }
}

pub mod response {
    use anyhow::Error;
    use axum::Json;
    use axum::http::StatusCode;
    use axum::response::{IntoResponse, Response};
    use owo_colors::OwoColorize;
    use std::fmt::{Debug, Display};

    pub fn print_error<T>(e: T)
    where
        T: Into<Error> + Display + Debug,
    {
        eprintln!(
            "\u{274c} {}",
            format!("{:?}", e.into())
                .split('\n')
                .map(|s| s.red().to_string())
                .collect::<Vec<_>>()
                .join("\n"),
        );
    }

    pub fn err_resp<T>(e: T, code: StatusCode) -> Response
    where
        T: Into<Error> + Display + Debug,
    {
        let reason = format!("{}", e);
        print_error(e);
        (code, Json(serde_json::json!({"reason": reason}))).into_response()
    }

    pub fn internal_server_error<T>(e: T) -> Response
    where
        T: Into<Error> + Display + Debug,
    {
        err_resp(e, StatusCode::INTERNAL_SERVER_ERROR)
    }
}

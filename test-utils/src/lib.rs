//! `test-utils` is used for testing in both `bucketeer-lib` and `bucketeer-bin`.
//! This crate does not depend on `bucketeer-lib` or `bucketeer-bin`, else we would get dependency cycles.
//! Macros are used instead, so that the importer is responsible for providing the dependencies.

/// Create a mock web server, which responds with a predefined status to
/// every request regardless of method or path
#[macro_export]
macro_rules! mock_server {
    ($status:expr $(, $func:tt ($($arg:expr),*))*) => {{
        let mock_server = wiremock::MockServer::start().await;
        let response_template = wiremock::ResponseTemplate::new($status);
        let template = response_template$(.$func($($arg),*))*;
        wiremock::Mock::given(wiremock::matchers::any()).respond_with(template).mount(&mock_server).await;
        mock_server
    }};
}

/// Mount a sequence of responses on `$server`. Each template answers exactly
/// one request, in the given order. Requests past the end of the sequence
/// fall through to whatever else is mounted (or a 404).
#[macro_export]
macro_rules! mount_sequence {
    ($server:expr, [$($template:expr),+ $(,)?]) => {{
        $(
            wiremock::Mock::given(wiremock::matchers::any())
                .respond_with($template)
                .up_to_n_times(1)
                .mount(&$server)
                .await;
        )+
    }};
}

/// A response template carrying the vendor's rate limit headers.
#[macro_export]
macro_rules! rate_limited_template {
    ($status:expr, limit = $limit:expr, remaining = $remaining:expr, reset_after = $reset_after:expr) => {{
        wiremock::ResponseTemplate::new($status)
            .insert_header("x-ratelimit-limit", $limit.to_string().as_str())
            .insert_header("x-ratelimit-remaining", $remaining.to_string().as_str())
            .insert_header("x-ratelimit-reset-after", $reset_after.to_string().as_str())
    }};
}

/// Get the root path of the project.
#[macro_export]
macro_rules! root_path {
    () => {
        std::path::Path::new(env!("CARGO_MANIFEST_DIR"))
            .parent()
            .unwrap()
            .to_path_buf()
    };
}

/// Gets the "main" binary command (`bucketeer`)
#[macro_export]
macro_rules! main_command {
    () => {
        assert_cmd::cargo::cargo_bin_cmd!("bucketeer")
    };
}

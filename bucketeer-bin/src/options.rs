use crate::verbosity::Verbosity;
use anyhow::{Context, Result};
use bucketeer_lib::{
    Auth, DEFAULT_BASE_URL, DEFAULT_TIMEOUT, DEFAULT_USER_AGENT, FileAttachment, RateLimitConfig,
    RequestOptions,
};
use clap::Parser;
use secrecy::SecretString;
use serde::Deserialize;
use std::path::Path;
use std::{fs, path::PathBuf, time::Duration};

pub(crate) const BUCKETEER_CONFIG_FILE: &str = "bucketeer.toml";

// clap wants a `&str` default, serde the `Duration` itself
const DEFAULT_TIMEOUT_STR: &str = "15s";

// Macro for generating default functions to be used by serde
macro_rules! default_function {
    ( $( $name:ident : $T:ty = $e:expr; )* ) => {
        $(
            #[allow(clippy::missing_const_for_fn)]
            fn $name() -> $T {
                $e
            }
        )*
    };
}

// Generate the functions for serde defaults
default_function! {
    base_url: String = DEFAULT_BASE_URL.to_string();
    timeout: Duration = DEFAULT_TIMEOUT;
    user_agent: String = DEFAULT_USER_AGENT.to_string();
    verbosity: Verbosity = Verbosity::default();
}

// Macro for merging configuration values
macro_rules! fold_in {
    ($cli:ident , $toml:ident ; $ty:ident { $(..$ignore:ident,)* $( $key:ident : $default:expr, )* } ) => {
        if (false) {
            #[allow(dead_code, unused, clippy::diverging_sub_expression)]
            let _check_fold_in_exhaustivity = $ty {
                $($key: unreachable!(), )*
                $($ignore: unreachable!(), )*
            };
        };
        $(
            if $cli.$key == $default && $toml.$key != $default {
                $cli.$key = $toml.$key;
            }
        )*
    };
}

fn parse_json(value: &str) -> Result<serde_json::Value, serde_json::Error> {
    serde_json::from_str(value)
}

/// bucketeer sends a request to a rate limited HTTP API, waiting out and
/// retrying rate limits and transient server errors the way a long-running
/// client would.
///
/// bucketeer is powered by bucketeer-lib, a client-side request scheduler.
#[derive(Parser, Debug)]
#[command(version, about, next_display_order = None)]
pub(crate) struct BucketeerOptions {
    /// HTTP method: GET, POST, PUT, PATCH or DELETE (case-insensitive)
    pub(crate) method: String,

    /// Path below the base URL, e.g. `/gateway/bot`
    pub(crate) path: String,

    /// JSON request body. Sent as `payload_json` when files are attached
    #[arg(long, value_parser = parse_json)]
    pub(crate) json: Option<serde_json::Value>,

    /// Attach a file. Can be given multiple times
    #[arg(long = "file", value_name = "PATH")]
    pub(crate) files: Vec<PathBuf>,

    /// Audit log reason
    #[arg(long)]
    pub(crate) reason: Option<String>,

    /// Count the request against this route key instead of the computed one
    #[arg(long)]
    pub(crate) route: Option<String>,

    /// Send the request without an `Authorization` header
    #[arg(long)]
    pub(crate) no_auth: bool,

    /// Jump ahead of requests already waiting for the same route
    #[arg(long)]
    pub(crate) priority: bool,

    /// Configuration file to use
    ///
    /// [default: bucketeer.toml]
    #[arg(short, long = "config")]
    pub(crate) config_file: Option<PathBuf>,

    #[clap(flatten)]
    pub(crate) config: Config,
}

impl BucketeerOptions {
    /// Build the request to dispatch, reading attachments from disk
    pub(crate) async fn request_options(&self) -> Result<RequestOptions> {
        let mut files = Vec::with_capacity(self.files.len());
        for path in &self.files {
            files.push(FileAttachment::from_path(path).await?);
        }

        let auth = if self.no_auth || self.config.token.is_none() {
            Auth::None
        } else {
            Auth::Default
        };

        let mut options = RequestOptions::builder()
            .method(self.method.clone())
            .path(self.path.clone())
            .files(files)
            .auth(auth)
            .priority(self.priority)
            .build();
        options.json.clone_from(&self.json);
        options.reason.clone_from(&self.reason);
        options.route.clone_from(&self.route);
        Ok(options)
    }
}

/// Dispatcher configuration, from the command line or `bucketeer.toml`
#[derive(Parser, Debug, Deserialize, Clone, Default)]
#[serde(deny_unknown_fields)]
pub(crate) struct Config {
    /// Verbose program output
    #[clap(flatten)]
    #[serde(default = "verbosity")]
    pub(crate) verbose: Verbosity,

    /// API root requests are sent to
    #[arg(long, default_value = DEFAULT_BASE_URL)]
    #[serde(default = "base_url")]
    pub(crate) base_url: String,

    /// Authorization header value, including its scheme (e.g. `Bot <token>`)
    #[arg(long, env = "BUCKETEER_TOKEN", hide_env_values = true)]
    #[serde(default)]
    pub(crate) token: Option<SecretString>,

    /// Time a single attempt may take, e.g. `15s` or `500ms`. `0s` disables
    /// the timeout
    #[arg(short, long, default_value = DEFAULT_TIMEOUT_STR, value_parser = humantime::parse_duration)]
    #[serde(default = "timeout", with = "humantime_serde")]
    pub(crate) timeout: Duration,

    /// User agent
    #[arg(short, long, default_value = DEFAULT_USER_AGENT)]
    #[serde(default = "user_agent")]
    pub(crate) user_agent: String,

    /// Override the `Host` header
    #[arg(long)]
    #[serde(default)]
    pub(crate) host: Option<String>,

    /// Rate limiting knobs. Only configurable in TOML, as `[ratelimit]`
    #[arg(skip)]
    #[serde(default)]
    pub(crate) ratelimit: RateLimitConfig,
}

impl Config {
    /// Load configuration from a file
    pub(crate) fn load_from_file(path: &Path) -> Result<Config> {
        let contents = fs::read_to_string(path)?;
        toml::from_str(&contents).with_context(|| "Failed to parse configuration file")
    }

    /// Merge the configuration from TOML into the CLI configuration
    pub(crate) fn merge(&mut self, toml: Config) {
        // SecretString has no `PartialEq`, so the token is merged by hand
        if self.token.is_none() && toml.token.is_some() {
            self.token = toml.token;
        }

        // Not available on the command line
        self.ratelimit = toml.ratelimit;

        // NOTE: if you see an error within this macro call, check to make sure that
        // that the fields provided to fold_in! match all the fields of the Config struct.
        fold_in! {
            // Destination and source configs
            self, toml;

            Config {
                // Keys which are handled outside of fold_in
                ..token,
                ..ratelimit,

                // Keys with defaults to assign
                base_url: DEFAULT_BASE_URL,
                host: None,
                timeout: DEFAULT_TIMEOUT,
                user_agent: DEFAULT_USER_AGENT,
                verbose: Verbosity::default(),
            }
        }
    }
}

//! `bucketeer` sends requests to a rate limited HTTP API from the command
//! line.
//!
//! The binary is a thin wrapper around bucketeer-lib: it builds a dispatcher
//! from the command line and `bucketeer.toml`, issues one request and prints
//! the response body.
//!
//! Fetch the gateway URL:
//! ```sh
//! BUCKETEER_TOKEN="Bot <token>" bucketeer GET /gateway/bot
//! ```
//!
//! Send a message with an attachment, watching the rate limit narrative:
//! ```sh
//! bucketeer -vv POST /channels/123456789012345678/messages \
//!     --json '{"content": "report attached"}' --file report.txt
//! ```
#![warn(clippy::all, clippy::pedantic)]
#![warn(
    absolute_paths_not_starting_with_crate,
    rustdoc::invalid_html_tags,
    missing_copy_implementations,
    missing_debug_implementations,
    semicolon_in_expressions_from_macros,
    unreachable_pub,
    unused_extern_crates,
    variant_size_differences,
    clippy::missing_const_for_fn
)]
#![deny(anonymous_parameters, macro_use_extern_crate)]
#![deny(missing_docs)]

use std::io::{self, Write};
use std::path::PathBuf;

use anyhow::{Result, bail};
use bucketeer_lib::ResponseBody;
use clap::Parser;
use log::error;

mod client;
mod logging;
mod options;
mod verbosity;

use crate::logging::init_logging;
use crate::options::{BUCKETEER_CONFIG_FILE, BucketeerOptions, Config};

/// A C-like enum that can be cast to `i32` and used as process exit code.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ExitCode {
    Success = 0,
    // NOTE: exit code 1 is used for any `Result::Err` bubbled up to `main()`
    // using the `?` operator, e.g. timeouts and transport failures.
    #[allow(unused)]
    UnexpectedFailure = 1,
    RequestRejected = 2,
    ConfigFile = 3,
}

fn main() -> Result<()> {
    // std::process::exit doesn't guarantee that all destructors will be run,
    // therefore we wrap the main code in another function to ensure that.
    let exit_code = run_main()?;
    std::process::exit(exit_code);
}

/// Merge all provided config options into one.
/// This includes a potential config file, command-line- and environment variables
fn load_config() -> Result<BucketeerOptions> {
    let mut opts = BucketeerOptions::parse();

    // An explicitly given config file must exist; the default one is optional
    let config_file = match &opts.config_file {
        Some(path) => Some(path.clone()),
        None => Some(PathBuf::from(BUCKETEER_CONFIG_FILE)).filter(|path| path.is_file()),
    };

    if let Some(config_file) = config_file {
        match Config::load_from_file(&config_file) {
            Ok(c) => opts.config.merge(c),
            Err(e) => {
                bail!(
                    "Cannot load configuration file `{}`: {e:?}",
                    config_file.display()
                );
            }
        }
    }

    Ok(opts)
}

/// Set up runtime and call bucketeer entrypoint
fn run_main() -> Result<i32> {
    use std::process::exit;

    let opts = match load_config() {
        Ok(opts) => opts,
        Err(e) => {
            // Logging is not set up yet
            eprintln!("[ERROR] Error while loading config: {e}");
            exit(ExitCode::ConfigFile as i32);
        }
    };

    init_logging(&opts.config.verbose);

    let runtime = tokio::runtime::Runtime::new()?;
    runtime.block_on(run(&opts))
}

/// Issue the request and print its outcome
async fn run(opts: &BucketeerOptions) -> Result<i32> {
    let dispatcher = client::create(&opts.config)?;
    let options = opts.request_options().await?;

    let exit_code = match dispatcher.request(options).await {
        Ok(body) => {
            print_body(&body)?;
            ExitCode::Success
        }
        Err(e) if e.status().is_some() => {
            error!("{e}");
            ExitCode::RequestRejected
        }
        Err(e) => return Err(e.into()),
    };

    Ok(exit_code as i32)
}

/// Pretty JSON for JSON bodies, raw text otherwise, nothing for empty ones
fn print_body(body: &ResponseBody) -> Result<()> {
    let mut stdout = io::stdout().lock();
    match body {
        ResponseBody::Empty => {}
        ResponseBody::Json(value) => writeln!(stdout, "{}", serde_json::to_string_pretty(value)?)?,
        ResponseBody::Text(text) => writeln!(stdout, "{text}")?,
    }
    Ok(())
}

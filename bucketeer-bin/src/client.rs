use crate::options::Config;
use anyhow::{Context, Result};
use bucketeer_lib::{DispatcherBuilder, RequestDispatcher};

/// Creates a dispatcher according to the command-line config
pub(crate) fn create(cfg: &Config) -> Result<RequestDispatcher> {
    DispatcherBuilder::builder()
        .base_url(cfg.base_url.clone())
        .token(cfg.token.clone())
        .timeout(cfg.timeout)
        .host(cfg.host.clone())
        .user_agent(cfg.user_agent.clone())
        .rate_limit_config(cfg.ratelimit)
        .build()
        .dispatcher()
        .context("Failed to create request dispatcher")
}

//! Node construction extracted from `main.rs`.
//!
//! Shared by `serve` (which then mounts the HTTP surface) and by the
//! integration tests, which boot a node against an in-process primary.

use std::sync::Arc;

use anyhow::Context;

use wsp_domain::config::{Config, ConfigSeverity, ValidationErrors};
use wsp_sdk::{PrimaryClient, PrimaryClientBuilder};

use crate::node::{NodeOptions, ProxyNode};
use crate::state::AppState;

/// Validate config, connect to the primary and bring a node up.
pub async fn build_app_state(config: Arc<Config>) -> anyhow::Result<AppState> {
    // ── Config validation ────────────────────────────────────────────
    let issues = config.validate();
    for issue in &issues {
        match issue.severity {
            ConfigSeverity::Warning => tracing::warn!("config: {issue}"),
            ConfigSeverity::Error => tracing::error!("config: {issue}"),
        }
    }
    if let Some(errors) = ValidationErrors::from_issues(&issues) {
        return Err(errors.into());
    }

    // ── Primary client ───────────────────────────────────────────────
    let primary = Arc::new(primary_client(&config)?);
    tracing::info!(primary_url = %config.proxy.primary_url, "primary client ready");

    // ── Node ─────────────────────────────────────────────────────────
    let node = ProxyNode::start(NodeOptions::from_config(&config), primary.clone(), primary)
        .await
        .context("starting workspace proxy")?;

    Ok(AppState::new(config, node))
}

/// Build the authenticated client for the configured primary.
pub fn primary_client(config: &Config) -> anyhow::Result<PrimaryClient> {
    let token = config
        .proxy
        .resolve_session_token()
        .with_context(|| {
            format!(
                "no session token: set proxy.session_token or ${}",
                config.proxy.session_token_env
            )
        })?;
    PrimaryClientBuilder::new()
        .primary_url(config.proxy.primary_url.clone())
        .session_token(token)
        .build()
        .context("creating primary client")
}

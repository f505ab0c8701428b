//! `wsp-sdk` — client side of the proxy ↔ primary contract.
//!
//! A workspace proxy has no identity of its own: it authenticates to the
//! primary with a pre-shared session token, registers, and keeps that
//! registration alive.  This crate provides the pieces every proxy needs so
//! the node itself only wires hooks together.
//!
//! # Architecture
//!
//! ```text
//! ┌────────────────────────────────────────────────────────────┐
//! │  ProxyNode                                                 │
//! │                                                            │
//! │   let client = Arc::new(PrimaryClientBuilder::new()        │
//! │       .primary_url("https://coder.example.com")            │
//! │       .session_token(token)                                │
//! │       .build()?);                                          │
//! │                                                            │
//! │   let (first, handle) = RegisterLoop::start(               │
//! │       client, request, opts, hooks, cancel).await?;        │
//! │   ...                                                      │
//! │   cancel.cancel();                                         │
//! │   handle.wait_timeout(grace).await;                        │
//! └────────────────────────────────────────────────────────────┘
//! ```
//!
//! # Registration flow (hard-coded by the SDK)
//!
//! 1. One synchronous attempt; failure aborts startup, nothing is spawned
//! 2. Every `interval`: clone base request → `mutate` → dispatch with
//!    `attempt_timeout` → `on_success` or `on_failure`
//! 3. The loop never stops itself; only cancellation ends it
//! 4. Completion is reported through [`RegisterLoopHandle`]

pub mod agent_dial;
pub mod builder;
pub mod client;
pub mod register_loop;
pub mod types;

// ── Re-exports for ergonomic imports ─────────────────────────────────

pub use agent_dial::{AgentStream, DialAgent};
pub use builder::PrimaryClientBuilder;
pub use client::{PrimaryApi, PrimaryClient};
pub use register_loop::{RegisterHooks, RegisterLoop, RegisterLoopHandle, RegisterLoopOptions};
pub use types::{DialError, RegistrationFailure, SdkError};

// Re-export protocol types so callers rarely import wsp-protocol directly.
pub use wsp_protocol::{
    AgentConnectionInfo, BuildInfoResponse, ProxyHealthReport, RegisterProxyRequest,
    RegisterProxyResponse, RelayMap, SiblingReplica,
};

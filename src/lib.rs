//! AuthGate - HTTP proxy filter that defers authorization to an external
//! check service.
//!
//! Every exchange runs through one stream filter. The external
//! authorization filter suspends the request (and optionally the response)
//! while an asynchronous check call is in flight, then resumes, rewrites
//! headers, or replies locally depending on the outcome.
//!
//! # Layout
//!
//! - [`check`]: check request/response model, HTTP and JSON-RPC backends,
//!   and cancellable dispatch.
//! - [`filter`]: the filter interface, the decode/encode state machines and
//!   the shared outcome handling.
//! - [`scope`]: scope-claim authorization over pre-validated tokens.
//! - [`config`] and [`route`]: filter configuration, per-route overrides and
//!   the route table.
//! - [`registry`]: filter type tags to constructors.
//! - [`proxy_service`]: the exchange driver and the upstream client.

pub mod admin;
pub mod check;
pub mod config;
pub mod error;
pub mod filter;
pub mod logging_layer;
pub mod metrics;
pub mod proxy_service;
pub mod registry;
pub mod route;
pub mod scope;
pub mod timeout;

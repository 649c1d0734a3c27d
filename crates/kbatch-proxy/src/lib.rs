//! HTTP surface of the kbatch proxy.
//!
//! The proxy sits between interactive-notebook users and the cluster API:
//! it authenticates each request against JupyterHub, hands submissions to
//! the [`kbatch_core`] pipeline, and relays status and logs back. All state
//! lives in the cluster; the proxy itself only holds its startup
//! configuration and a short-lived token cache.

pub mod auth;
pub mod config;
pub mod server;

//! authgate - Authorization-enforcing reverse proxy.
//!
//! authgate sits in front of a downstream HTTP service (the "target
//! service") and decides, for every incoming request, whether the request
//! is permitted by evaluating a declarative Rego policy against an input
//! document assembled from the request, the caller's identity, and
//! (optionally) RBAC data loaded from a MongoDB store.
//!
//! # Request Pipeline
//!
//! ```text
//! Request ──► RouteRegistry ──► PolicyHandler
//!                                    │
//!                         identity + RBAC bindings/roles
//!                                    │
//!                              Input Builder
//!                                    │
//!                    allow eval │ partial eval (residual query)
//!                                    │
//!                    403 (deny) │ proxy to target service
//!                                    │
//!                        optional response-flow policy
//!                                    │
//!                                 Response
//! ```
//!
//! Routes and policy modules are loaded once at startup and are immutable
//! afterwards; RBAC documents are fetched per request.

pub mod config;
pub mod error;
pub mod handler;
pub mod input;
pub mod lifecycle;
pub mod metrics;
pub mod openapi;
pub mod policy;
pub mod rbac;
pub mod router;
pub mod server;
pub mod transport;

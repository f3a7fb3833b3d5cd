//! Middleware and helpers shared by the rental services.
//!
//! Services sit behind an edge gateway that authenticates end users. The
//! gateway forwards the verified identity in headers and proves itself with a
//! shared internal secret; [`caller_auth`] enforces that contract and turns the
//! headers into an [`caller_auth::Actor`] available to handlers.

pub mod caller_auth;
pub mod request_id;
pub mod secret_policy;

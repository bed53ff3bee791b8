//! `pipeline-idp` HTTP server.
//!
//! Wires the core control loops to an Axum JWKS server and serves the two
//! discovery routes.

pub mod error;
pub mod routes;
pub mod state;

//! OAuth 2.0 authorization code flow with PKCE
//!
//! # Module Layout
//!
//! - [`pkce`]            -- PKCE `S256` challenge and `state` generation
//! - [`token_store`]     -- Token sets, in-memory and on-disk storage
//! - [`flow`]            -- Token endpoint client (exchange, refresh, registration)
//! - [`strategy`]        -- Header provider with single-flight refresh
//! - [`callback_server`] -- Local status page, connect route and OAuth callback

pub mod callback_server;
pub mod flow;
pub mod pkce;
pub mod strategy;
pub mod token_store;

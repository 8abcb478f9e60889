//! Core data models for the chunked upload relay.
//!
//! `upload_session` holds the server-side session record; `wire` holds the
//! JSON bodies shared by the HTTP handlers and the upload client.

pub mod upload_session;
pub mod wire;

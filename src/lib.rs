#![forbid(unsafe_code)]

//! Video catalogue API for NewTube.
//!
//! The crate is split the same way requests flow: [`query`] turns the raw
//! query string into a storage query, [`store`] runs it against SQLite,
//! [`media`] talks to the media host, and [`api`] glues them to HTTP and wraps
//! every outcome in an [`envelope::Envelope`].

pub mod api;
pub mod config;
pub mod envelope;
pub mod media;
pub mod models;
pub mod multipart;
pub mod query;
pub mod store;

//! Core library for `jupyter-forward`: remote Jupyter Lab launch and SSH
//! port forwarding.
//!
//! The binary in `main.rs` is a thin CLI over [`runner::RemoteRunner`].

pub mod auth;
pub mod envmgr;
pub mod errors;
pub mod helpers;
pub mod output;
pub mod parser;
pub mod runner;
pub mod session;

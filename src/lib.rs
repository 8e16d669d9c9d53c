//! SMTP server for debugging mail flows.
//!
//! Every message a client delivers is handed to a chain of [`hooks::Hook`]s
//! and, when a relay is configured, forwarded to a downstream SMTP server.
//! The server runs in the foreground or as a daemon tracked by a pid file.

pub mod config;
pub mod daemon;
pub mod hooks;
pub mod mail_sender;
pub mod pidfile;
pub mod smtp;
pub mod smtp_server;

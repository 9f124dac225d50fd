pub mod auth;
pub mod broker;
pub mod config;
pub mod connection;
pub mod dispatcher;
pub mod inflight;
pub mod protocol;
pub mod retained;
pub mod router;
pub mod server;
pub mod session;
pub mod sys;
pub mod topic;
pub mod transport;

pub mod auth;
pub mod config;
pub mod database;
pub mod dispatcher;
pub mod error;
pub mod host;
pub mod retry;
pub mod session;
pub mod setup;
pub mod skills;
pub mod tdlib;
pub mod telegram;

// src/lib.rs
//! A brokerage simulator: users hold cash, buy and sell shares at quoted
//! prices, and review their transaction history.

pub mod api;
pub mod auth;
pub mod broker;
pub mod config;
pub mod db;
pub mod error;
pub mod models;
pub mod money;
pub mod oracle;
pub mod session;

pub mod bar_utils;
pub mod cache;
pub mod commands;
pub mod config;
pub mod data_context;
pub mod engine;
pub mod error;
pub mod indicators;
pub mod live;
pub mod models;
pub mod optimizer;
pub mod optimizer_status;
pub mod param_utils;
pub mod performance;
pub mod risk_manager;
pub mod strategy;

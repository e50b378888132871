pub mod approval;
pub mod config;
pub mod control;
pub mod daemon;
pub mod db;
pub mod error;
pub mod gateway;
pub mod handlers;
pub mod hook;
pub mod logging;
pub mod models;
pub mod relay;
pub mod sink;

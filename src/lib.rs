pub mod auth;
pub mod config;
pub mod db;
pub mod error;
pub mod executions;
pub mod models;
pub mod queries;
pub mod reconciler;
pub mod response;
pub mod routes;
pub mod schema;
pub mod state;
pub mod storage;
pub mod utils;

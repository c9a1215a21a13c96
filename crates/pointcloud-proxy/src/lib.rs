pub mod app;
pub mod cache;
pub mod config;
pub mod database;
pub mod errors;
pub mod job_scheduling;
pub mod pipeline;
pub mod progress;
pub mod services;
pub mod state_store;
pub mod tiles;
pub mod web;

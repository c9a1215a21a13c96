//! HTTP handlers organized by domain

pub mod events;
pub mod health;
pub mod jobs;
pub mod tiles;

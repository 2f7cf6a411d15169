// src/lib.rs

use std::sync::Arc;

use services::{blob_store::BlobStore, health::HealthChecker, index::Index, profile_cache::ProfileCache};

pub use error::{Error, Result};

#[derive(Clone)]
pub struct AppState {
    pub index: Arc<dyn Index>,
    pub blobs: Arc<BlobStore>,
    pub profiles: ProfileCache,
    pub health: Arc<HealthChecker>,
}

pub mod entities {
    pub mod distributed_at;
    pub mod height;
    pub mod pdv;
    pub mod profile;
    pub mod rewards_queue;
}

pub mod services {
    pub mod antifraud;
    pub mod blob_store;
    pub mod chain;
    pub mod dare;
    pub mod health;
    pub mod index;
    pub mod object_store;
    pub mod profile_cache;
    pub mod queue;
    pub mod submitter;
}

pub mod config;
pub mod error;
pub mod handlers;
pub mod jobs;
pub mod models;

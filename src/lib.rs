//! Homeproxy - A per-user reverse proxy that provisions home page containers on demand
//!
//! This library provides a reverse proxy that:
//! - Routes `/~identity/...` requests to a container dedicated to that user
//! - Resolves the user's home directory through the local account database or LDAP
//! - Creates and starts the user's container on first request, serving a wait page meanwhile
//! - Reuses containers that survived a restart instead of creating duplicates
//! - Stops and removes containers that stayed idle or that nothing tracks anymore
//! - Uses connection pooling for efficient backend communication

pub mod admin;
pub mod config;
pub mod cull;
pub mod directory;
pub mod docker;
pub mod error;
pub mod forward;
pub mod mounts;
pub mod pool;
pub mod provision;
pub mod proxy;
pub mod registry;
pub mod router;
pub mod runtime;
pub mod wait_page;

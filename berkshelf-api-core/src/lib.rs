#![doc = "berkshelf-api-core: the cookbook aggregation engine behind berkshelf-api."]

//! Source workers crawl remote cookbook stores, the cache builder merges their reports into
//! one universe, the cache manager serves it, and the supervisor keeps the whole pipeline
//! running. The `berkshelf-api` binary crate only parses arguments and configuration.
//!
//! # Usage
//! Build a [`supervisor::GroupSpec`] from a [`config::Config`] and hand it to a
//! [`supervisor::Supervisor`].

pub mod archive;
pub mod cache_builder;
pub mod cache_manager;
pub mod config;
pub mod contract;
pub mod error;
pub mod gateway;
pub mod metadata_rb;
pub mod model;
pub mod persistence;
pub mod supervisor;
pub mod worker;

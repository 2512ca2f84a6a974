//! Backup lifecycle orchestration engine
//!
//! Creates, encrypts, catalogues, retains, remotely syncs, and restores
//! full-database backups. The admin-facing HTTP layer lives elsewhere and
//! calls into [`service::BackupService`] and [`jobs::JobTracker`].

pub mod catalog;
pub mod config;
pub mod crypto;
pub mod engine;
pub mod errors;
pub mod jobs;
pub mod process;
pub mod retention;
pub mod scheduler;
pub mod service;
pub mod sync;

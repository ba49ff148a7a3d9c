pub mod applier;
pub mod archive;
pub mod backup;
pub mod config;
pub mod control;
pub mod daemon;
pub mod error;
pub mod health;
pub mod marker;
pub mod observability;
pub mod resolver;
pub mod retry;
pub mod rollback;
pub mod self_update;
pub mod sources;
pub mod status;
pub mod verifier;
pub mod version;

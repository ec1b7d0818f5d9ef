// Infrastructure layer - configuration, persistence and collaborator adapters
pub mod config;
pub mod history;
pub mod simulated;
pub mod temperature;

pub mod api;
pub mod app;
pub mod config;
pub mod db;
pub mod files;
pub mod logger;
pub mod notifier;
pub mod scheduler;
pub mod services;
pub mod utils;
pub mod workers;

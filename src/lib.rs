pub mod config;
pub mod db;
pub mod importer;
pub mod job;
pub mod log;
pub mod mapping;
pub mod model;
pub mod source;
pub mod store;

pub mod client;
pub mod config;
pub mod db;
pub mod enrich;
pub mod indexer;
pub mod runlog;
pub mod source;

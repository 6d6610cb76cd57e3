pub mod assets;
pub mod config;
pub mod database;
pub mod errors;
pub mod ingestor;
pub mod matching;
pub mod models;
pub mod services;
pub mod sources;
pub mod utils;

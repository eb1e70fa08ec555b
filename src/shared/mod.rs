pub mod archive;
pub mod classifier;
pub mod config;
pub mod corpus;
pub mod error;
pub mod explain;
pub mod logging;
pub mod manifest;
pub mod models;
pub mod output;
pub mod patterns;
pub mod rules;
pub mod schema;
pub mod scoring;
pub mod training;

pub mod app;
pub mod biom;
pub mod cache;
pub mod config;
pub mod db;
pub mod error;
pub mod export;
pub mod filter;
pub mod ontology;
pub mod output;
pub mod query;
pub mod request;
pub mod schema;
pub mod taxonomy;

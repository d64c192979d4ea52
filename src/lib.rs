pub mod config;
pub mod error;
pub mod ingest;
pub mod ledger;
pub mod logging;
pub mod metrics;
pub mod model;
pub mod retry;
pub mod rpc;
pub mod schedule;
pub mod service;
pub mod store;

//! Library surface for `indexer-core`'s components, exposed so integration
//! tests and `src/main.rs` share one module tree.
pub mod async_writer;
pub mod config;
pub mod error;
pub mod fetcher;
pub mod metrics;
pub mod orchestrator;
pub mod processor;
pub mod rpc;
pub mod sequencer;
pub mod store;
pub mod telemetry;
pub mod types;
pub mod watchdog;

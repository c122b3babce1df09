pub mod adapters;
pub mod batch;
pub mod catalog;
pub mod config;
pub mod distributed;
pub mod engine;
pub mod executors;
pub mod ledger;
pub mod sync;

#[cfg(test)]
mod testing;

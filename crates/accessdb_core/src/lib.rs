pub mod alias;
pub mod config;
pub mod error;
pub mod hash;
pub mod lease;
pub mod migrate;
pub mod model;
pub mod pipeline;
pub mod reconcile;
pub mod runtime;
pub mod steps;
pub mod store;
pub mod validators;

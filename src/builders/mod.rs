//! Builders to construct the manager from configuration.

pub mod manager_builder;

pub use manager_builder::ManagerBuilder;

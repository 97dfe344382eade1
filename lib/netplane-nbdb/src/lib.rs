//! Northbound database access
//!
//! This library provides:
//! - Typed rows for the load balancer related tables
//! - The `NbClient` interface: predicate lookups and atomic transactions
//! - Operation builders that coalesce logical changes into one transaction
//! - An in-memory transactional client

pub mod client;
pub mod error;
pub mod memory;
pub mod model;
pub mod ops;

pub use client::NbClient;
pub use error::{Result, StoreError};
pub use memory::MemoryNbClient;
pub use model::{
    LoadBalancer, LoadBalancerGroup, LoadBalancerHolder, LogicalRouter, LogicalSwitch, Table,
};
pub use ops::{Mutation, Operation, OperationResult, RowRef};

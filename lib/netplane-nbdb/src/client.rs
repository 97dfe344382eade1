//! Client interface to the northbound database

use async_trait::async_trait;

use crate::model::{LoadBalancer, LoadBalancerGroup, LogicalRouter, LogicalSwitch};
use crate::ops::{Operation, OperationResult};
use crate::Result;

/// Row filter evaluated against the client's view of a table
pub type Predicate<'a, T> = &'a (dyn Fn(&T) -> bool + Send + Sync);

/// NbClient reads rows and commits multi-operation transactions.
///
/// A transaction either applies every operation or none of them. The
/// connection is shared; implementations must not assume exclusive access
/// beyond the boundary of a single `transact` call.
#[async_trait]
pub trait NbClient: Send + Sync {
    async fn find_load_balancers(
        &self,
        predicate: Predicate<'_, LoadBalancer>,
    ) -> Result<Vec<LoadBalancer>>;

    async fn find_switches(&self, predicate: Predicate<'_, LogicalSwitch>)
        -> Result<Vec<LogicalSwitch>>;

    async fn find_routers(&self, predicate: Predicate<'_, LogicalRouter>)
        -> Result<Vec<LogicalRouter>>;

    async fn find_groups(
        &self,
        predicate: Predicate<'_, LoadBalancerGroup>,
    ) -> Result<Vec<LoadBalancerGroup>>;

    /// Commit all operations atomically, returning one result per operation
    async fn transact(&self, ops: Vec<Operation>) -> Result<Vec<OperationResult>>;
}

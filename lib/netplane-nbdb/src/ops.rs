//! Operation builders and lookups
//!
//! Builders append to a caller-owned operation list so that several logical
//! changes can be coalesced and committed with a single `transact_and_check`.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};

use tracing::debug;

use crate::client::NbClient;
use crate::model::{
    LoadBalancer, LoadBalancerGroup, LoadBalancerHolder, LogicalRouter, LogicalSwitch, Table,
};
use crate::{Result, StoreError};

static NAMED_UUID_COUNTER: AtomicU64 = AtomicU64::new(0);

/// Generate a transaction-local name for a row that does not exist yet
pub fn build_named_uuid() -> String {
    format!("u{:010}", NAMED_UUID_COUNTER.fetch_add(1, Ordering::Relaxed))
}

/// Named UUIDs are placeholders that are not valid UUIDs
pub fn is_named_uuid(id: &str) -> bool {
    !id.is_empty() && uuid::Uuid::parse_str(id).is_err()
}

/// Reference to a row from within a transaction
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum RowRef {
    /// Committed row
    Uuid(String),
    /// Row inserted earlier in the same transaction
    Named(String),
    /// Committed row looked up by its `name` column
    Name(String),
}

impl RowRef {
    pub fn for_uuid(id: &str) -> RowRef {
        if is_named_uuid(id) {
            RowRef::Named(id.to_string())
        } else {
            RowRef::Uuid(id.to_string())
        }
    }

    fn for_load_balancer(lb: &LoadBalancer) -> Result<RowRef> {
        if lb.uuid.is_empty() {
            return Err(StoreError::InvalidOperation(format!(
                "load balancer {} has no UUID to reference",
                lb.name
            )));
        }
        Ok(RowRef::for_uuid(&lb.uuid))
    }

    fn for_holder<T: LoadBalancerHolder>(row: &T) -> Result<RowRef> {
        if !row.uuid().is_empty() {
            return Ok(RowRef::for_uuid(row.uuid()));
        }
        if !row.name().is_empty() {
            return Ok(RowRef::Name(row.name().to_string()));
        }
        Err(StoreError::InvalidOperation(format!(
            "{} row has neither UUID nor name",
            T::TABLE
        )))
    }
}

impl fmt::Display for RowRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RowRef::Uuid(id) => write!(f, "{}", id),
            RowRef::Named(id) => write!(f, "named:{}", id),
            RowRef::Name(name) => write!(f, "name:{}", name),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Mutation {
    /// Add load balancer references to a holder's set
    InsertLoadBalancers(Vec<RowRef>),
    /// Remove load balancer references from a holder's set
    DeleteLoadBalancers(Vec<RowRef>),
    /// Remove keys from a load balancer's VIP map
    DeleteVips(Vec<String>),
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Operation {
    Insert {
        uuid_name: String,
        row: LoadBalancer,
    },
    Update {
        uuid: String,
        row: LoadBalancer,
    },
    Mutate {
        table: Table,
        target: RowRef,
        mutation: Mutation,
    },
    Delete {
        table: Table,
        uuid: String,
    },
}

impl Operation {
    pub fn kind(&self) -> &'static str {
        match self {
            Operation::Insert { .. } => "insert",
            Operation::Update { .. } => "update",
            Operation::Mutate { .. } => "mutate",
            Operation::Delete { .. } => "delete",
        }
    }

    pub fn table(&self) -> Table {
        match self {
            Operation::Insert { .. } | Operation::Update { .. } => Table::LoadBalancer,
            Operation::Mutate { table, .. } | Operation::Delete { table, .. } => *table,
        }
    }
}

/// Outcome of one committed operation
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct OperationResult {
    /// UUID assigned by an insert
    pub uuid: Option<String>,
    /// Rows affected
    pub count: usize,
}

/// Update load balancers that carry a committed UUID, create the others
pub fn create_or_update_load_balancers_ops(
    ops: &mut Vec<Operation>,
    lbs: &mut [LoadBalancer],
) -> Result<()> {
    for lb in lbs.iter_mut() {
        if lb.uuid.is_empty() || is_named_uuid(&lb.uuid) {
            create_load_balancers_ops(ops, std::slice::from_mut(lb))?;
            continue;
        }
        ops.push(Operation::Update {
            uuid: lb.uuid.clone(),
            row: lb.clone(),
        });
    }
    Ok(())
}

/// Insert new load balancers, assigning each a named UUID so later
/// operations in the same transaction can reference it
pub fn create_load_balancers_ops(ops: &mut Vec<Operation>, lbs: &mut [LoadBalancer]) -> Result<()> {
    for lb in lbs.iter_mut() {
        if lb.name.is_empty() {
            return Err(StoreError::InvalidOperation(
                "load balancers must be named".to_string(),
            ));
        }
        if !lb.uuid.is_empty() && !is_named_uuid(&lb.uuid) {
            return Err(StoreError::InvalidOperation(format!(
                "load balancer {} already exists as {}",
                lb.name, lb.uuid
            )));
        }
        if lb.uuid.is_empty() {
            lb.uuid = build_named_uuid();
        }
        ops.push(Operation::Insert {
            uuid_name: lb.uuid.clone(),
            row: lb.clone(),
        });
    }
    Ok(())
}

/// Reference `lbs` from `target`'s load balancer set
pub fn add_load_balancers_ops<T: LoadBalancerHolder>(
    ops: &mut Vec<Operation>,
    target: &T,
    lbs: &[LoadBalancer],
) -> Result<()> {
    if lbs.is_empty() {
        return Ok(());
    }
    let refs = lbs
        .iter()
        .map(RowRef::for_load_balancer)
        .collect::<Result<Vec<_>>>()?;
    ops.push(Operation::Mutate {
        table: T::TABLE,
        target: RowRef::for_holder(target)?,
        mutation: Mutation::InsertLoadBalancers(refs),
    });
    Ok(())
}

/// Drop `lbs` from `target`'s load balancer set
pub fn remove_load_balancers_ops<T: LoadBalancerHolder>(
    ops: &mut Vec<Operation>,
    target: &T,
    lbs: &[LoadBalancer],
) -> Result<()> {
    if lbs.is_empty() {
        return Ok(());
    }
    let refs = lbs
        .iter()
        .map(RowRef::for_load_balancer)
        .collect::<Result<Vec<_>>>()?;
    ops.push(Operation::Mutate {
        table: T::TABLE,
        target: RowRef::for_holder(target)?,
        mutation: Mutation::DeleteLoadBalancers(refs),
    });
    Ok(())
}

/// Delete committed load balancers. References held by switches, routers
/// and groups are weak and go away with the row.
pub fn delete_load_balancers_ops(ops: &mut Vec<Operation>, lbs: &[LoadBalancer]) -> Result<()> {
    for lb in lbs {
        if lb.uuid.is_empty() || is_named_uuid(&lb.uuid) {
            return Err(StoreError::InvalidOperation(format!(
                "cannot delete uncommitted load balancer {}",
                lb.name
            )));
        }
        ops.push(Operation::Delete {
            table: Table::LoadBalancer,
            uuid: lb.uuid.clone(),
        });
    }
    Ok(())
}

/// Remove VIP keys from a load balancer
pub fn remove_load_balancer_vips_ops(
    ops: &mut Vec<Operation>,
    lb: &LoadBalancer,
    vips: &[String],
) -> Result<()> {
    if vips.is_empty() {
        return Ok(());
    }
    ops.push(Operation::Mutate {
        table: Table::LoadBalancer,
        target: RowRef::for_load_balancer(lb)?,
        mutation: Mutation::DeleteVips(vips.to_vec()),
    });
    Ok(())
}

/// Load balancers whose external IDs include every entry of `external_ids`
pub async fn find_load_balancers_by_external_ids<C: NbClient + ?Sized>(
    client: &C,
    external_ids: &BTreeMap<String, String>,
) -> Result<Vec<LoadBalancer>> {
    let predicate = |lb: &LoadBalancer| {
        external_ids
            .iter()
            .all(|(k, v)| lb.external_ids.get(k) == Some(v))
    };
    client.find_load_balancers(&predicate).await
}

/// Look up exactly one load balancer by UUID
pub async fn get_load_balancer<C: NbClient + ?Sized>(client: &C, uuid: &str) -> Result<LoadBalancer> {
    let predicate = |lb: &LoadBalancer| lb.uuid == uuid;
    let mut found = client.find_load_balancers(&predicate).await?;
    match found.len() {
        0 => Err(StoreError::NotFound {
            table: Table::LoadBalancer,
            key: uuid.to_string(),
        }),
        1 => Ok(found.remove(0)),
        n => Err(StoreError::RowCount {
            table: Table::LoadBalancer,
            expected: 1,
            found: n,
        }),
    }
}

pub async fn list_switches_with_load_balancers<C: NbClient + ?Sized>(
    client: &C,
) -> Result<Vec<LogicalSwitch>> {
    let predicate = |sw: &LogicalSwitch| !sw.load_balancer.is_empty();
    client.find_switches(&predicate).await
}

pub async fn list_routers_with_load_balancers<C: NbClient + ?Sized>(
    client: &C,
) -> Result<Vec<LogicalRouter>> {
    let predicate = |rtr: &LogicalRouter| !rtr.load_balancer.is_empty();
    client.find_routers(&predicate).await
}

pub async fn list_groups_with_load_balancers<C: NbClient + ?Sized>(
    client: &C,
) -> Result<Vec<LoadBalancerGroup>> {
    let predicate = |group: &LoadBalancerGroup| !group.load_balancer.is_empty();
    client.find_groups(&predicate).await
}

/// Commit `ops` and verify one result came back per operation
pub async fn transact_and_check<C: NbClient + ?Sized>(
    client: &C,
    ops: Vec<Operation>,
) -> Result<Vec<OperationResult>> {
    if ops.is_empty() {
        return Ok(Vec::new());
    }
    let count = ops.len();
    debug!("Committing transaction with {} operations", count);
    let results = client.transact(ops).await?;
    if results.len() != count {
        return Err(StoreError::ResultMismatch {
            ops: count,
            results: results.len(),
        });
    }
    Ok(results)
}

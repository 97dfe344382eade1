//! In-memory northbound database
//!
//! Transactions are applied to a copy of the database and swapped in only
//! when every operation succeeded. Load balancer references held by switches,
//! routers and groups are weak: deleting a load balancer removes it from
//! every holder.

use std::collections::{BTreeMap, HashMap};

use async_trait::async_trait;
use tokio::sync::Mutex;
use tracing::debug;

use crate::client::{NbClient, Predicate};
use crate::model::{
    LoadBalancer, LoadBalancerGroup, LoadBalancerHolder, LogicalRouter, LogicalSwitch, Table,
};
use crate::ops::{Mutation, Operation, OperationResult, RowRef};
use crate::{Result, StoreError};

#[derive(Clone, Debug, Default)]
struct Database {
    load_balancers: BTreeMap<String, LoadBalancer>,
    switches: BTreeMap<String, LogicalSwitch>,
    routers: BTreeMap<String, LogicalRouter>,
    groups: BTreeMap<String, LoadBalancerGroup>,
}

/// MemoryNbClient keeps every table in process memory
#[derive(Default)]
pub struct MemoryNbClient {
    db: Mutex<Database>,
    committed: Mutex<Vec<Vec<Operation>>>,
    fail_next: Mutex<Option<String>>,
}

impl MemoryNbClient {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert a load balancer outside of any transaction, returning its UUID.
    /// Names are not unique, as in the real table.
    pub async fn insert_load_balancer(&self, mut lb: LoadBalancer) -> String {
        let uuid = new_uuid();
        lb.uuid = uuid.clone();
        self.db.lock().await.load_balancers.insert(uuid.clone(), lb);
        uuid
    }

    pub async fn insert_switch(&self, name: &str, lbs: &[&str]) -> String {
        let mut db = self.db.lock().await;
        insert_holder(&mut db.switches, name, lbs)
    }

    pub async fn insert_router(&self, name: &str, lbs: &[&str]) -> String {
        let mut db = self.db.lock().await;
        insert_holder(&mut db.routers, name, lbs)
    }

    pub async fn insert_group(&self, name: &str, lbs: &[&str]) -> String {
        let mut db = self.db.lock().await;
        insert_holder(&mut db.groups, name, lbs)
    }

    pub async fn load_balancers(&self) -> Vec<LoadBalancer> {
        self.db.lock().await.load_balancers.values().cloned().collect()
    }

    pub async fn load_balancer_by_name(&self, name: &str) -> Option<LoadBalancer> {
        self.db
            .lock()
            .await
            .load_balancers
            .values()
            .find(|lb| lb.name == name)
            .cloned()
    }

    pub async fn switch(&self, name: &str) -> Option<LogicalSwitch> {
        find_by_name(&self.db.lock().await.switches, name)
    }

    pub async fn router(&self, name: &str) -> Option<LogicalRouter> {
        find_by_name(&self.db.lock().await.routers, name)
    }

    pub async fn group(&self, name: &str) -> Option<LoadBalancerGroup> {
        find_by_name(&self.db.lock().await.groups, name)
    }

    /// Every successfully committed transaction, oldest first
    pub async fn transactions(&self) -> Vec<Vec<Operation>> {
        self.committed.lock().await.clone()
    }

    /// Make the next `transact` call fail without applying anything
    pub async fn fail_next_transaction(&self, reason: &str) {
        *self.fail_next.lock().await = Some(reason.to_string());
    }
}

fn new_uuid() -> String {
    uuid::Uuid::new_v4().to_string()
}

fn insert_holder<T: LoadBalancerHolder>(
    table: &mut BTreeMap<String, T>,
    name: &str,
    lbs: &[&str],
) -> String {
    let uuid = new_uuid();
    let mut row = T::stub(name, Some(uuid.as_str()));
    row.load_balancers_mut()
        .extend(lbs.iter().map(|lb| lb.to_string()));
    table.insert(uuid.clone(), row);
    uuid
}

fn find_by_name<T: LoadBalancerHolder>(table: &BTreeMap<String, T>, name: &str) -> Option<T> {
    table.values().find(|row| row.name() == name).cloned()
}

fn filter<T: Clone>(table: &BTreeMap<String, T>, predicate: Predicate<'_, T>) -> Vec<T> {
    table.values().filter(|row| predicate(*row)).cloned().collect()
}

/// Applies operations to a scratch copy of the database
struct TxnApplier {
    db: Database,
    named: HashMap<String, String>,
}

impl TxnApplier {
    fn apply(&mut self, op: Operation) -> Result<OperationResult> {
        match op {
            Operation::Insert { uuid_name, mut row } => {
                if self.named.contains_key(&uuid_name) {
                    return Err(StoreError::InvalidOperation(format!(
                        "duplicate named UUID {}",
                        uuid_name
                    )));
                }
                let uuid = new_uuid();
                row.uuid = uuid.clone();
                self.db.load_balancers.insert(uuid.clone(), row);
                self.named.insert(uuid_name, uuid.clone());
                Ok(OperationResult {
                    uuid: Some(uuid),
                    count: 1,
                })
            }
            Operation::Update { uuid, mut row } => {
                let existing = self.db.load_balancers.get_mut(&uuid).ok_or_else(|| {
                    StoreError::NotFound {
                        table: Table::LoadBalancer,
                        key: uuid.clone(),
                    }
                })?;
                row.uuid = uuid;
                *existing = row;
                Ok(OperationResult {
                    uuid: None,
                    count: 1,
                })
            }
            Operation::Mutate {
                table,
                target,
                mutation,
            } => self.mutate(table, target, mutation),
            Operation::Delete { table, uuid } => {
                let removed = match table {
                    Table::LoadBalancer => {
                        let removed = self.db.load_balancers.remove(&uuid).is_some();
                        if removed {
                            self.drop_weak_references(&uuid);
                        }
                        removed
                    }
                    Table::LogicalSwitch => self.db.switches.remove(&uuid).is_some(),
                    Table::LogicalRouter => self.db.routers.remove(&uuid).is_some(),
                    Table::LoadBalancerGroup => self.db.groups.remove(&uuid).is_some(),
                };
                Ok(OperationResult {
                    uuid: None,
                    count: usize::from(removed),
                })
            }
        }
    }

    fn mutate(&mut self, table: Table, target: RowRef, mutation: Mutation) -> Result<OperationResult> {
        match (table, mutation) {
            (Table::LoadBalancer, Mutation::DeleteVips(vips)) => {
                let Some(uuid) = self.resolve_target(&self.db.load_balancers, table, &target)? else {
                    return Ok(OperationResult::default());
                };
                if let Some(lb) = self.db.load_balancers.get_mut(&uuid) {
                    for vip in &vips {
                        lb.vips.remove(vip);
                    }
                }
                Ok(OperationResult {
                    uuid: None,
                    count: 1,
                })
            }
            (Table::LogicalSwitch, mutation) => {
                let uuid = self.resolve_target(&self.db.switches, table, &target)?;
                let refs = self.resolve_refs(&mutation)?;
                Ok(mutate_holder(&mut self.db.switches, uuid, mutation, refs))
            }
            (Table::LogicalRouter, mutation) => {
                let uuid = self.resolve_target(&self.db.routers, table, &target)?;
                let refs = self.resolve_refs(&mutation)?;
                Ok(mutate_holder(&mut self.db.routers, uuid, mutation, refs))
            }
            (Table::LoadBalancerGroup, mutation) => {
                let uuid = self.resolve_target(&self.db.groups, table, &target)?;
                let refs = self.resolve_refs(&mutation)?;
                Ok(mutate_holder(&mut self.db.groups, uuid, mutation, refs))
            }
            (table, mutation) => Err(StoreError::InvalidOperation(format!(
                "mutation {:?} not supported on {}",
                mutation, table
            ))),
        }
    }

    /// A UUID target that matches nothing affects zero rows; a name lookup
    /// that matches nothing is an error.
    fn resolve_target<T: Named>(
        &self,
        rows: &BTreeMap<String, T>,
        table: Table,
        target: &RowRef,
    ) -> Result<Option<String>> {
        match target {
            RowRef::Uuid(uuid) => Ok(rows.contains_key(uuid).then(|| uuid.clone())),
            RowRef::Named(name) => self.named.get(name).cloned().map(Some).ok_or_else(|| {
                StoreError::InvalidOperation(format!("unknown named UUID {}", name))
            }),
            RowRef::Name(name) => {
                let matches: Vec<&String> = rows
                    .iter()
                    .filter(|(_, row)| row.row_name() == name)
                    .map(|(uuid, _)| uuid)
                    .collect();
                match matches.len() {
                    0 => Err(StoreError::NotFound {
                        table,
                        key: name.clone(),
                    }),
                    1 => Ok(Some(matches[0].clone())),
                    n => Err(StoreError::RowCount {
                        table,
                        expected: 1,
                        found: n,
                    }),
                }
            }
        }
    }

    fn resolve_refs(&self, mutation: &Mutation) -> Result<Vec<String>> {
        let (refs, strict) = match mutation {
            Mutation::InsertLoadBalancers(refs) => (refs, true),
            Mutation::DeleteLoadBalancers(refs) => (refs, false),
            Mutation::DeleteVips(_) => {
                return Err(StoreError::InvalidOperation(
                    "VIP mutations only apply to load balancers".to_string(),
                ))
            }
        };
        refs.iter()
            .map(|r| match r {
                RowRef::Uuid(uuid) => {
                    if strict && !self.db.load_balancers.contains_key(uuid) {
                        return Err(StoreError::NotFound {
                            table: Table::LoadBalancer,
                            key: uuid.clone(),
                        });
                    }
                    Ok(uuid.clone())
                }
                RowRef::Named(name) => self.named.get(name).cloned().ok_or_else(|| {
                    StoreError::InvalidOperation(format!("unknown named UUID {}", name))
                }),
                RowRef::Name(name) => Err(StoreError::InvalidOperation(format!(
                    "load balancers cannot be referenced by name ({})",
                    name
                ))),
            })
            .collect()
    }

    fn drop_weak_references(&mut self, lb_uuid: &str) {
        for sw in self.db.switches.values_mut() {
            sw.load_balancer.remove(lb_uuid);
        }
        for rtr in self.db.routers.values_mut() {
            rtr.load_balancer.remove(lb_uuid);
        }
        for group in self.db.groups.values_mut() {
            group.load_balancer.remove(lb_uuid);
        }
    }
}

fn mutate_holder<T: LoadBalancerHolder>(
    rows: &mut BTreeMap<String, T>,
    uuid: Option<String>,
    mutation: Mutation,
    refs: Vec<String>,
) -> OperationResult {
    let Some(row) = uuid.and_then(|uuid| rows.get_mut(&uuid)) else {
        return OperationResult::default();
    };
    let set = row.load_balancers_mut();
    match mutation {
        Mutation::InsertLoadBalancers(_) => set.extend(refs),
        Mutation::DeleteLoadBalancers(_) => {
            for r in &refs {
                set.remove(r);
            }
        }
        Mutation::DeleteVips(_) => {}
    }
    OperationResult {
        uuid: None,
        count: 1,
    }
}

/// Rows addressable by their `name` column
trait Named {
    fn row_name(&self) -> &str;
}

impl Named for LoadBalancer {
    fn row_name(&self) -> &str {
        &self.name
    }
}

impl Named for LogicalSwitch {
    fn row_name(&self) -> &str {
        &self.name
    }
}

impl Named for LogicalRouter {
    fn row_name(&self) -> &str {
        &self.name
    }
}

impl Named for LoadBalancerGroup {
    fn row_name(&self) -> &str {
        &self.name
    }
}

#[async_trait]
impl NbClient for MemoryNbClient {
    async fn find_load_balancers(
        &self,
        predicate: Predicate<'_, LoadBalancer>,
    ) -> Result<Vec<LoadBalancer>> {
        Ok(filter(&self.db.lock().await.load_balancers, predicate))
    }

    async fn find_switches(
        &self,
        predicate: Predicate<'_, LogicalSwitch>,
    ) -> Result<Vec<LogicalSwitch>> {
        Ok(filter(&self.db.lock().await.switches, predicate))
    }

    async fn find_routers(
        &self,
        predicate: Predicate<'_, LogicalRouter>,
    ) -> Result<Vec<LogicalRouter>> {
        Ok(filter(&self.db.lock().await.routers, predicate))
    }

    async fn find_groups(
        &self,
        predicate: Predicate<'_, LoadBalancerGroup>,
    ) -> Result<Vec<LoadBalancerGroup>> {
        Ok(filter(&self.db.lock().await.groups, predicate))
    }

    async fn transact(&self, ops: Vec<Operation>) -> Result<Vec<OperationResult>> {
        if let Some(reason) = self.fail_next.lock().await.take() {
            return Err(StoreError::Transaction(reason));
        }

        let mut db = self.db.lock().await;
        let mut applier = TxnApplier {
            db: db.clone(),
            named: HashMap::new(),
        };
        let mut results = Vec::with_capacity(ops.len());
        for op in ops.iter().cloned() {
            results.push(applier.apply(op)?);
        }

        *db = applier.db;
        debug!("Committed {} operations", ops.len());
        self.committed.lock().await.push(ops);
        Ok(results)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ops::{
        add_load_balancers_ops, create_load_balancers_ops, delete_load_balancers_ops,
        get_load_balancer, remove_load_balancer_vips_ops, transact_and_check,
    };

    fn lb(name: &str) -> LoadBalancer {
        LoadBalancer {
            name: name.to_string(),
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn test_insert_and_attach_in_one_transaction() {
        let client = MemoryNbClient::new();
        client.insert_switch("node1", &[]).await;

        let mut ops = Vec::new();
        let mut lbs = vec![lb("svc")];
        create_load_balancers_ops(&mut ops, &mut lbs).unwrap();
        add_load_balancers_ops(&mut ops, &LogicalSwitch::stub("node1", None), &lbs).unwrap();
        let results = transact_and_check(&client, ops).await.unwrap();

        let uuid = results[0].uuid.clone().unwrap();
        let sw = client.switch("node1").await.unwrap();
        assert!(sw.load_balancer.contains(&uuid));
    }

    #[tokio::test]
    async fn test_failed_operation_rolls_back_transaction() {
        let client = MemoryNbClient::new();

        let mut ops = Vec::new();
        let mut lbs = vec![lb("svc")];
        create_load_balancers_ops(&mut ops, &mut lbs).unwrap();
        // switch does not exist
        add_load_balancers_ops(&mut ops, &LogicalSwitch::stub("missing", None), &lbs).unwrap();

        let err = transact_and_check(&client, ops).await.unwrap_err();
        assert!(err.is_not_found());
        assert!(client.load_balancers().await.is_empty());
        assert!(client.transactions().await.is_empty());
    }

    #[tokio::test]
    async fn test_delete_drops_weak_references() {
        let client = MemoryNbClient::new();
        let uuid = client.insert_load_balancer(lb("svc")).await;
        client.insert_switch("node1", &[&uuid]).await;
        client.insert_router("GR_node1", &[&uuid]).await;
        client.insert_group("clusterLBGroup", &[&uuid]).await;

        let mut existing = lb("svc");
        existing.uuid = uuid.clone();
        let mut ops = Vec::new();
        delete_load_balancers_ops(&mut ops, &[existing]).unwrap();
        transact_and_check(&client, ops).await.unwrap();

        assert!(client.switch("node1").await.unwrap().load_balancer.is_empty());
        assert!(client.router("GR_node1").await.unwrap().load_balancer.is_empty());
        assert!(client.group("clusterLBGroup").await.unwrap().load_balancer.is_empty());
    }

    #[tokio::test]
    async fn test_delete_missing_row_is_noop() {
        let client = MemoryNbClient::new();
        let mut missing = lb("gone");
        missing.uuid = new_uuid();
        let mut ops = Vec::new();
        delete_load_balancers_ops(&mut ops, &[missing]).unwrap();

        let results = transact_and_check(&client, ops).await.unwrap();
        assert_eq!(results[0].count, 0);
    }

    #[tokio::test]
    async fn test_remove_vips() {
        let client = MemoryNbClient::new();
        let mut row = lb("svc");
        row.vips.insert("10.0.0.1:80".to_string(), "10.1.0.1:8080".to_string());
        row.vips.insert("10.0.0.1:443".to_string(), "10.1.0.1:8443".to_string());
        let uuid = client.insert_load_balancer(row.clone()).await;
        row.uuid = uuid;

        let mut ops = Vec::new();
        remove_load_balancer_vips_ops(&mut ops, &row, &["10.0.0.1:80".to_string()]).unwrap();
        transact_and_check(&client, ops).await.unwrap();

        let stored = client.load_balancer_by_name("svc").await.unwrap();
        assert_eq!(stored.vips.len(), 1);
        assert!(stored.vips.contains_key("10.0.0.1:443"));
    }

    #[tokio::test]
    async fn test_injected_failure_applies_nothing() {
        let client = MemoryNbClient::new();
        client.fail_next_transaction("connection reset").await;

        let mut ops = Vec::new();
        create_load_balancers_ops(&mut ops, &mut [lb("svc")]).unwrap();
        let err = transact_and_check(&client, ops).await.unwrap_err();

        assert_eq!(err, StoreError::Transaction("connection reset".to_string()));
        assert!(client.load_balancers().await.is_empty());
    }

    #[tokio::test]
    async fn test_get_load_balancer() {
        let client = MemoryNbClient::new();
        let uuid = client.insert_load_balancer(lb("svc")).await;
        assert_eq!(get_load_balancer(&client, &uuid).await.unwrap().name, "svc");

        let missing = new_uuid();
        assert_eq!(
            get_load_balancer(&client, &missing).await.unwrap_err(),
            StoreError::NotFound {
                table: Table::LoadBalancer,
                key: missing,
            }
        );
    }

    #[tokio::test]
    async fn test_name_target_must_match_one_row() {
        let client = MemoryNbClient::new();
        client.insert_switch("node1", &[]).await;
        client.insert_switch("node1", &[]).await;
        let mut row = lb("svc");
        row.uuid = client.insert_load_balancer(row.clone()).await;

        let mut ops = Vec::new();
        add_load_balancers_ops(&mut ops, &LogicalSwitch::stub("node1", None), &[row.clone()]).unwrap();
        assert_eq!(
            transact_and_check(&client, ops).await.unwrap_err(),
            StoreError::RowCount {
                table: Table::LogicalSwitch,
                expected: 1,
                found: 2,
            }
        );

        let mut ops = Vec::new();
        add_load_balancers_ops(&mut ops, &LogicalSwitch::stub("node2", None), &[row]).unwrap();
        assert_eq!(
            transact_and_check(&client, ops).await.unwrap_err(),
            StoreError::NotFound {
                table: Table::LogicalSwitch,
                key: "node2".to_string(),
            }
        );
        assert!(client.transactions().await.is_empty());
    }
}

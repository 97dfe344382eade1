use netplane_nbdb::model::selection_fields;
use netplane_nbdb::ops::{
    add_load_balancers_ops, build_named_uuid, create_load_balancers_ops,
    create_or_update_load_balancers_ops, delete_load_balancers_ops,
    find_load_balancers_by_external_ids, list_groups_with_load_balancers,
    list_routers_with_load_balancers, list_switches_with_load_balancers,
    remove_load_balancer_vips_ops, remove_load_balancers_ops, transact_and_check,
};
use netplane_nbdb::{
    LoadBalancer, LoadBalancerGroup, LoadBalancerHolder, LogicalRouter, LogicalSwitch, NbClient,
    Operation,
};
use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, error, info};

use super::{Lb, LbRule};
use crate::metrics::ReconcilerMetrics;
use crate::Result;

/// VIPs to remove from one load balancer
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DeleteVipEntry {
    pub lb_uuid: String,
    /// "ip:port" keys, IPv6 in brackets
    pub vips: Vec<String>,
}

/// Attachments of load balancers to one holder table, as found in the
/// database at the start of a reconciliation
#[derive(Default)]
struct AttachmentSnapshot {
    lb_to_names: HashMap<String, BTreeSet<String>>,
    name_to_uuid: HashMap<String, String>,
}

impl AttachmentSnapshot {
    fn from_rows<T: LoadBalancerHolder>(rows: &[T]) -> Self {
        let mut snapshot = Self::default();
        for row in rows {
            if row.name().is_empty() {
                continue;
            }
            snapshot
                .name_to_uuid
                .insert(row.name().to_string(), row.uuid().to_string());
            for lb in row.load_balancers() {
                snapshot
                    .lb_to_names
                    .entry(lb.clone())
                    .or_default()
                    .insert(row.name().to_string());
            }
        }
        snapshot
    }

    fn names_for(&self, lb_uuid: &str) -> Option<&BTreeSet<String>> {
        self.lb_to_names.get(lb_uuid)
    }

    /// Operation target for the holder called `name`. Holders without load
    /// balancers were not listed and are looked up by name at commit time.
    fn target<T: LoadBalancerHolder>(&self, name: &str) -> T {
        T::stub(name, self.name_to_uuid.get(name).map(String::as_str))
    }
}

/// Per holder name, the load balancers to attach and detach
#[derive(Default)]
struct AttachmentDiff {
    add: BTreeMap<String, Vec<LoadBalancer>>,
    remove: BTreeMap<String, Vec<LoadBalancer>>,
}

impl AttachmentDiff {
    fn record(&mut self, want: &[String], have: Option<&BTreeSet<String>>, lb: &LoadBalancer) {
        let want: BTreeSet<&str> = want.iter().map(String::as_str).collect();
        let have: BTreeSet<&str> = have
            .map(|names| names.iter().map(String::as_str).collect())
            .unwrap_or_default();

        for name in want.difference(&have) {
            self.add.entry(name.to_string()).or_default().push(lb.clone());
        }
        for name in have.difference(&want) {
            self.remove
                .entry(name.to_string())
                .or_default()
                .push(lb.clone());
        }
    }

    fn build_ops<T: LoadBalancerHolder>(
        &self,
        ops: &mut Vec<Operation>,
        snapshot: &AttachmentSnapshot,
    ) -> Result<()> {
        for (name, lbs) in &self.add {
            add_load_balancers_ops(ops, &snapshot.target::<T>(name), lbs)?;
        }
        for (name, lbs) in &self.remove {
            remove_load_balancers_ops(ops, &snapshot.target::<T>(name), lbs)?;
        }
        Ok(())
    }
}

/// LbReconciler keeps the load balancers of an ownership tag in the
/// northbound database equal to a desired set.
///
/// Stateless between calls. Callers must not run two `ensure_lbs` calls for
/// the same tag concurrently; calls for disjoint tags are independent.
pub struct LbReconciler {
    client: Arc<dyn NbClient>,
    metrics: Option<ReconcilerMetrics>,
}

impl LbReconciler {
    pub fn new(client: Arc<dyn NbClient>) -> Self {
        Self {
            client,
            metrics: None,
        }
    }

    pub fn with_metrics(mut self, metrics: ReconcilerMetrics) -> Self {
        self.metrics = Some(metrics);
        self
    }

    /// Make `lbs` the only load balancers carrying `external_ids`. Existing
    /// rows are matched by name and updated, missing ones created and the
    /// rest deleted, all in a single transaction. No retries.
    pub async fn ensure_lbs(
        &self,
        external_ids: &BTreeMap<String, String>,
        lbs: &[Lb],
    ) -> Result<()> {
        let start = Instant::now();
        let result = self.reconcile(external_ids, lbs).await;
        let elapsed = start.elapsed();
        debug!("Finished EnsureLBs: {:?}", elapsed);

        if let Some(metrics) = &self.metrics {
            let label = if result.is_ok() { "success" } else { "error" };
            metrics.observe_ensure_lbs(label, elapsed.as_secs_f64());
        }
        result
    }

    /// Rows sharing a name are all deleted, however many copies exist, and
    /// the desired load balancer of that name is created afresh. No copy is
    /// kept and updated, not even the third or later one.
    async fn reconcile(&self, external_ids: &BTreeMap<String, String>, lbs: &[Lb]) -> Result<()> {
        let client = self.client.as_ref();
        let existing = find_load_balancers_by_external_ids(client, external_ids).await?;

        let switches = AttachmentSnapshot::from_rows(&list_switches_with_load_balancers(client).await?);
        let routers = AttachmentSnapshot::from_rows(&list_routers_with_load_balancers(client).await?);
        let groups = AttachmentSnapshot::from_rows(&list_groups_with_load_balancers(client).await?);

        // Every tagged row is stale until a desired load balancer claims it
        let mut to_delete: BTreeSet<String> = BTreeSet::new();
        let mut existing_by_name: HashMap<String, LoadBalancer> = HashMap::new();
        let mut collided: HashSet<String> = HashSet::new();
        for lb in existing {
            to_delete.insert(lb.uuid.clone());
            if collided.contains(&lb.name) {
                continue;
            }
            if existing_by_name.remove(&lb.name).is_some() {
                info!(
                    "Name collision for load balancer {}: deleting all copies and re-creating",
                    lb.name
                );
                collided.insert(lb.name.clone());
                continue;
            }
            existing_by_name.insert(lb.name.clone(), lb);
        }

        let mut updates = Vec::new();
        let mut creates = Vec::new();
        let mut switch_diff = AttachmentDiff::default();
        let mut router_diff = AttachmentDiff::default();
        let mut group_diff = AttachmentDiff::default();

        for lb in lbs {
            let mut row = build_lb(lb);
            let (have_switches, have_routers, have_groups) = match existing_by_name.get(&lb.name) {
                Some(existing) => {
                    row.uuid = existing.uuid.clone();
                    to_delete.remove(&existing.uuid);
                    (
                        switches.names_for(&existing.uuid),
                        routers.names_for(&existing.uuid),
                        groups.names_for(&existing.uuid),
                    )
                }
                None => {
                    // Referenced by attachment operations before the insert commits
                    row.uuid = build_named_uuid();
                    (None, None, None)
                }
            };

            switch_diff.record(&lb.switches, have_switches, &row);
            router_diff.record(&lb.routers, have_routers, &row);
            group_diff.record(&lb.groups, have_groups, &row);

            if existing_by_name.contains_key(&lb.name) {
                updates.push(row);
            } else {
                creates.push(row);
            }
        }

        let mut ops = Vec::new();
        create_or_update_load_balancers_ops(&mut ops, &mut updates)?;
        create_load_balancers_ops(&mut ops, &mut creates)?;
        switch_diff.build_ops::<LogicalSwitch>(&mut ops, &switches)?;
        router_diff.build_ops::<LogicalRouter>(&mut ops, &routers)?;
        group_diff.build_ops::<LoadBalancerGroup>(&mut ops, &groups)?;

        let stale: Vec<LoadBalancer> = to_delete
            .iter()
            .map(|uuid| LoadBalancer {
                uuid: uuid.clone(),
                ..Default::default()
            })
            .collect();
        delete_load_balancers_ops(&mut ops, &stale)?;

        self.count_operations(&ops);
        transact_and_check(client, ops).await?;

        debug!("Deleted {} stale LBs for {:?}", stale.len(), external_ids);
        Ok(())
    }

    /// Delete load balancers by UUID. They are detached from every switch,
    /// router and group along with the row.
    pub async fn delete_lbs(&self, uuids: &[String]) -> Result<()> {
        if uuids.is_empty() {
            return Ok(());
        }

        let lbs: Vec<LoadBalancer> = uuids
            .iter()
            .map(|uuid| LoadBalancer {
                uuid: uuid.clone(),
                ..Default::default()
            })
            .collect();
        let mut ops = Vec::new();
        delete_load_balancers_ops(&mut ops, &lbs)?;

        self.count_operations(&ops);
        transact_and_check(self.client.as_ref(), ops).await?;
        Ok(())
    }

    /// Remove VIPs from several load balancers in one transaction
    pub async fn delete_load_balancer_vips(&self, entries: &[DeleteVipEntry]) -> Result<()> {
        let mut ops = Vec::new();
        for entry in entries {
            let lb = LoadBalancer {
                uuid: entry.lb_uuid.clone(),
                ..Default::default()
            };
            remove_load_balancer_vips_ops(&mut ops, &lb, &entry.vips)?;
        }

        self.count_operations(&ops);
        transact_and_check(self.client.as_ref(), ops)
            .await
            .map_err(|e| {
                error!("Failed to remove vips from load_balancer: {}", e);
                e
            })?;
        Ok(())
    }

    fn count_operations(&self, ops: &[Operation]) {
        if let Some(metrics) = &self.metrics {
            for op in ops {
                metrics.count_operation(op.kind());
            }
        }
    }
}

/// Database row for a desired load balancer, without a UUID
pub fn build_lb(lb: &Lb) -> LoadBalancer {
    let (reject, event) = if lb.opts.unidling {
        ("false", "true")
    } else {
        ("true", "false")
    };
    let options: BTreeMap<String, String> = [
        ("reject", reject),
        ("event", event),
        ("skip_snat", if lb.opts.skip_snat { "true" } else { "false" }),
    ]
    .into_iter()
    .map(|(k, v)| (k.to_string(), v.to_string()))
    .collect();

    // Affinity buckets flows by (proto, src ip, dst ip); otherwise OVN's default
    let selection = if lb.opts.affinity {
        vec![
            selection_fields::IP_SRC.to_string(),
            selection_fields::IP_DST.to_string(),
        ]
    } else {
        Vec::new()
    };

    netplane_nbdb::model::build_load_balancer(
        &lb.name,
        &lb.protocol.to_lowercase(),
        selection,
        build_vip_map(&lb.rules),
        options,
        lb.external_ids.clone(),
    )
}

/// VIP to comma separated targets
pub fn build_vip_map(rules: &[LbRule]) -> BTreeMap<String, String> {
    rules
        .iter()
        .map(|rule| {
            let targets: Vec<String> = rule.targets.iter().map(ToString::to_string).collect();
            (rule.source.to_string(), targets.join(","))
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::loadbalancer::{Addr, LbOpts};
    use crate::CoreError;
    use netplane_nbdb::{MemoryNbClient, Mutation, RowRef, StoreError, Table};
    use std::net::SocketAddr;

    fn tag() -> BTreeMap<String, String> {
        [
            ("k8s.ovn.org/kind", "Service"),
            ("k8s.ovn.org/owner", "default/kubernetes"),
        ]
        .into_iter()
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .collect()
    }

    fn addr(s: &str) -> Addr {
        let sa: SocketAddr = s.parse().unwrap();
        Addr::new(sa.ip(), sa.port())
    }

    fn desired(name: &str, switches: &[&str]) -> Lb {
        Lb {
            name: name.to_string(),
            protocol: "TCP".to_string(),
            external_ids: tag(),
            rules: vec![LbRule {
                source: addr("10.96.0.1:443"),
                targets: vec![addr("172.18.0.2:6443"), addr("172.18.0.3:6443")],
            }],
            switches: switches.iter().map(|s| s.to_string()).collect(),
            ..Default::default()
        }
    }

    async fn seed(db: &MemoryNbClient, name: &str) -> String {
        db.insert_load_balancer(build_lb(&desired(name, &[]))).await
    }

    fn reconciler(db: &Arc<MemoryNbClient>) -> LbReconciler {
        let client: Arc<dyn NbClient> = db.clone();
        LbReconciler::new(client)
    }

    async fn last_transaction(db: &MemoryNbClient) -> Vec<Operation> {
        db.transactions().await.pop().unwrap_or_default()
    }

    fn count(ops: &[Operation], kind: &str) -> usize {
        ops.iter().filter(|op| op.kind() == kind).count()
    }

    #[test]
    fn test_build_lb() {
        let mut lb = desired("Service_default/kubernetes_TCP_cluster", &[]);
        lb.rules.push(LbRule {
            source: addr("[fd00:10:96::1]:443"),
            targets: vec![addr("[fc00:f853::2]:6443")],
        });
        lb.opts = LbOpts {
            unidling: true,
            affinity: true,
            skip_snat: false,
        };

        let row = build_lb(&lb);
        assert!(row.uuid.is_empty());
        assert_eq!(row.protocol.as_deref(), Some("tcp"));
        assert_eq!(row.selection_fields, vec!["ip_src", "ip_dst"]);
        assert_eq!(row.options["reject"], "false");
        assert_eq!(row.options["event"], "true");
        assert_eq!(row.options["skip_snat"], "false");
        assert_eq!(row.vips["10.96.0.1:443"], "172.18.0.2:6443,172.18.0.3:6443");
        assert_eq!(row.vips["[fd00:10:96::1]:443"], "[fc00:f853::2]:6443");
        assert_eq!(row.external_ids, tag());

        lb.opts = LbOpts::default();
        let row = build_lb(&lb);
        assert!(row.selection_fields.is_empty());
        assert_eq!(row.options["reject"], "true");
        assert_eq!(row.options["event"], "false");
    }

    #[tokio::test]
    async fn test_attach_missing_switch_only() {
        let db = Arc::new(MemoryNbClient::new());
        let a = seed(&db, "A").await;
        db.insert_switch("s1", &[a.as_str()]).await;
        db.insert_switch("s2", &[]).await;

        reconciler(&db)
            .ensure_lbs(&tag(), &[desired("A", &["s1", "s2"])])
            .await
            .unwrap();

        let ops = last_transaction(&db).await;
        assert_eq!(ops.len(), 2);
        assert!(matches!(&ops[0], Operation::Update { uuid, .. } if *uuid == a));
        assert_eq!(
            ops[1],
            Operation::Mutate {
                table: Table::LogicalSwitch,
                target: RowRef::Name("s2".to_string()),
                mutation: Mutation::InsertLoadBalancers(vec![RowRef::Uuid(a.clone())]),
            }
        );
        assert_eq!(count(&ops, "delete"), 0);
        assert!(db.switch("s2").await.unwrap().load_balancer.contains(&a));
    }

    #[tokio::test]
    async fn test_stale_load_balancer_deleted() {
        let db = Arc::new(MemoryNbClient::new());
        let a = seed(&db, "A").await;
        let b = seed(&db, "B").await;
        db.insert_switch("s1", &[a.as_str(), b.as_str()]).await;

        reconciler(&db)
            .ensure_lbs(&tag(), &[desired("A", &["s1"])])
            .await
            .unwrap();

        let ops = last_transaction(&db).await;
        assert_eq!(count(&ops, "update"), 1);
        assert_eq!(count(&ops, "mutate"), 0);
        assert_eq!(
            ops.last(),
            Some(&Operation::Delete {
                table: Table::LoadBalancer,
                uuid: b.clone(),
            })
        );

        let remaining: Vec<String> = db.load_balancers().await.into_iter().map(|lb| lb.uuid).collect();
        assert_eq!(remaining, vec![a.clone()]);
        let s1 = db.switch("s1").await.unwrap();
        assert_eq!(s1.load_balancer, [a].into_iter().collect());
    }

    #[tokio::test]
    async fn test_name_collision_deletes_every_copy() {
        let db = Arc::new(MemoryNbClient::new());
        let copies = vec![seed(&db, "X").await, seed(&db, "X").await, seed(&db, "X").await];

        reconciler(&db)
            .ensure_lbs(&tag(), &[desired("X", &[])])
            .await
            .unwrap();

        let ops = last_transaction(&db).await;
        assert_eq!(count(&ops, "insert"), 1);
        assert_eq!(count(&ops, "update"), 0);
        assert_eq!(count(&ops, "delete"), 3);

        let rows = db.load_balancers().await;
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].name, "X");
        assert!(!copies.contains(&rows[0].uuid));
    }

    #[tokio::test]
    async fn test_create_with_attachments() {
        let db = Arc::new(MemoryNbClient::new());
        db.insert_switch("s1", &[]).await;
        db.insert_router("GR_node1", &[]).await;
        db.insert_group("clusterLBGroup", &[]).await;

        let mut lb = desired("A", &["s1"]);
        lb.routers = vec!["GR_node1".to_string()];
        lb.groups = vec!["clusterLBGroup".to_string()];
        reconciler(&db).ensure_lbs(&tag(), &[lb]).await.unwrap();

        let ops = last_transaction(&db).await;
        assert!(matches!(&ops[0], Operation::Insert { .. }));
        let tables: Vec<Table> = ops[1..].iter().map(Operation::table).collect();
        assert_eq!(
            tables,
            vec![Table::LogicalSwitch, Table::LogicalRouter, Table::LoadBalancerGroup]
        );

        let uuid = db.load_balancer_by_name("A").await.unwrap().uuid;
        assert!(db.switch("s1").await.unwrap().load_balancer.contains(&uuid));
        assert!(db.router("GR_node1").await.unwrap().load_balancer.contains(&uuid));
        assert!(db.group("clusterLBGroup").await.unwrap().load_balancer.contains(&uuid));
    }

    #[tokio::test]
    async fn test_detach_unwanted_targets() {
        let db = Arc::new(MemoryNbClient::new());
        let a = seed(&db, "A").await;
        let s2 = db.insert_switch("s2", &[a.as_str()]).await;
        db.insert_switch("s1", &[a.as_str()]).await;
        db.insert_router("GR_node1", &[a.as_str()]).await;

        reconciler(&db)
            .ensure_lbs(&tag(), &[desired("A", &["s1"])])
            .await
            .unwrap();

        let ops = last_transaction(&db).await;
        assert!(ops.contains(&Operation::Mutate {
            table: Table::LogicalSwitch,
            target: RowRef::Uuid(s2),
            mutation: Mutation::DeleteLoadBalancers(vec![RowRef::Uuid(a.clone())]),
        }));
        assert!(db.switch("s2").await.unwrap().load_balancer.is_empty());
        assert!(db.router("GR_node1").await.unwrap().load_balancer.is_empty());
        assert!(db.switch("s1").await.unwrap().load_balancer.contains(&a));
    }

    #[tokio::test]
    async fn test_other_tags_untouched() {
        let db = Arc::new(MemoryNbClient::new());
        let mut foreign = build_lb(&desired("A", &[]));
        foreign.external_ids.insert("k8s.ovn.org/owner".to_string(), "ns/other".to_string());
        let foreign_uuid = db.insert_load_balancer(foreign).await;

        reconciler(&db).ensure_lbs(&tag(), &[]).await.unwrap();

        // Nothing tagged, nothing to do
        assert!(db.transactions().await.is_empty());
        assert_eq!(db.load_balancers().await[0].uuid, foreign_uuid);
    }

    #[tokio::test]
    async fn test_second_call_only_updates() {
        let db = Arc::new(MemoryNbClient::new());
        db.insert_switch("s1", &[]).await;
        let lr = reconciler(&db);

        lr.ensure_lbs(&tag(), &[desired("A", &["s1"])]).await.unwrap();
        lr.ensure_lbs(&tag(), &[desired("A", &["s1"])]).await.unwrap();

        let ops = last_transaction(&db).await;
        assert_eq!(ops.len(), 1);
        assert_eq!(ops[0].kind(), "update");
        assert_eq!(db.load_balancers().await.len(), 1);
    }

    #[tokio::test]
    async fn test_failed_commit_applies_nothing() {
        let db = Arc::new(MemoryNbClient::new());
        let a = seed(&db, "A").await;
        db.fail_next_transaction("connection reset").await;

        let err = reconciler(&db)
            .ensure_lbs(&tag(), &[desired("B", &[])])
            .await
            .unwrap_err();
        assert!(matches!(err, CoreError::Store(_)));
        assert!(err.is_retryable());

        let rows = db.load_balancers().await;
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].uuid, a);
    }

    #[tokio::test]
    async fn test_unknown_switch_fails_whole_transaction() {
        let db = Arc::new(MemoryNbClient::new());
        let a = seed(&db, "A").await;

        let err = reconciler(&db)
            .ensure_lbs(&tag(), &[desired("B", &["missing"])])
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            CoreError::Store(StoreError::NotFound { table: Table::LogicalSwitch, .. })
        ));
        // A was not deleted and B not created
        let rows = db.load_balancers().await;
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].uuid, a);
    }

    #[tokio::test]
    async fn test_delete_lbs() {
        let db = Arc::new(MemoryNbClient::new());
        let a = seed(&db, "A").await;
        let b = seed(&db, "B").await;
        let c = seed(&db, "C").await;
        db.insert_router("GR_node1", &[a.as_str(), c.as_str()]).await;
        let lr = reconciler(&db);

        lr.delete_lbs(&[]).await.unwrap();
        assert!(db.transactions().await.is_empty());

        lr.delete_lbs(&[a.clone(), b.clone()]).await.unwrap();
        assert_eq!(db.transactions().await.len(), 1);
        let remaining: Vec<String> = db.load_balancers().await.into_iter().map(|lb| lb.uuid).collect();
        assert_eq!(remaining, vec![c.clone()]);
        assert_eq!(
            db.router("GR_node1").await.unwrap().load_balancer,
            [c].into_iter().collect()
        );

        // Already gone
        lr.delete_lbs(&[a]).await.unwrap();
    }

    #[tokio::test]
    async fn test_delete_load_balancer_vips() {
        let db = Arc::new(MemoryNbClient::new());
        let mut lb = desired("A", &[]);
        lb.rules.push(LbRule {
            source: addr("10.96.0.2:80"),
            targets: vec![addr("10.244.1.4:8080")],
        });
        let a = db.insert_load_balancer(build_lb(&lb)).await;
        let b = seed(&db, "B").await;

        reconciler(&db)
            .delete_load_balancer_vips(&[
                DeleteVipEntry {
                    lb_uuid: a.clone(),
                    vips: vec!["10.96.0.2:80".to_string()],
                },
                DeleteVipEntry {
                    lb_uuid: b,
                    vips: vec!["10.96.0.1:443".to_string()],
                },
            ])
            .await
            .unwrap();

        assert_eq!(db.transactions().await.len(), 1);
        let vips: Vec<String> = db
            .load_balancer_by_name("A")
            .await
            .unwrap()
            .vips
            .into_keys()
            .collect();
        assert_eq!(vips, vec!["10.96.0.1:443"]);
        assert!(db.load_balancer_by_name("B").await.unwrap().vips.is_empty());
    }

    #[tokio::test]
    async fn test_metrics_recorded() {
        let db = Arc::new(MemoryNbClient::new());
        let metrics = ReconcilerMetrics::new().unwrap();
        let client: Arc<dyn NbClient> = db.clone();
        let lr = LbReconciler::new(client).with_metrics(metrics.clone());

        lr.ensure_lbs(&tag(), &[desired("A", &[])]).await.unwrap();

        let text = metrics.gather().unwrap();
        assert!(text.contains("netplane_ensure_lbs_total{result=\"success\"} 1"));
        assert!(text.contains("netplane_store_operations_total{kind=\"insert\"} 1"));
    }
}

//! End-to-end reconciliation passes against the in-memory collaborators.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use async_trait::async_trait;
use plugin_deploy_core::batch::{BatchAction, BatchItem};
use plugin_deploy_core::config::RetryConfig;
use plugin_deploy_core::ports::{ProcessDefinition, ProcessRegistry, StateStore};
use plugin_deploy_core::store_memory::{
    MemoryProcessRegistry, MemoryResourceStore, MemoryStateStore, StateSnapshot,
};
use plugin_deploy_core::types::{ArtifactRecord, OwnedArtifact};
use plugin_deploy_core::{
    ArtifactIdentity, DeclaredArtifact, DeployConfig, DeployError, Deployer, LifecycleState,
    PluginProcess, ProcessKey, ProcessPlugin, ResourceKind,
};
use serde_json::json;
use tokio::sync::Notify;
use uuid::Uuid;

// ---------------------------------------------------------------------------
// Fixtures
// ---------------------------------------------------------------------------

struct Node {
    registry: Arc<MemoryProcessRegistry>,
    state: Arc<MemoryStateStore>,
    resources: Arc<MemoryResourceStore>,
    deployer: Deployer,
}

fn config() -> DeployConfig {
    DeployConfig {
        tenant_tag: "node-a".to_string(),
        retry: RetryConfig {
            attempts: Some(1),
            delay_ms: 0,
        },
        ..Default::default()
    }
}

fn node_with(config: DeployConfig) -> Node {
    let registry = Arc::new(MemoryProcessRegistry::new());
    let state = Arc::new(MemoryStateStore::new());
    let resources = Arc::new(MemoryResourceStore::new());
    let deployer = Deployer::new(registry.clone(), state.clone(), resources.clone(), config);
    Node {
        registry,
        state,
        resources,
        deployer,
    }
}

fn node() -> Node {
    node_with(config())
}

fn key(s: &str) -> ProcessKey {
    s.parse().unwrap()
}

fn naming_system(name: &str) -> ArtifactIdentity {
    ArtifactIdentity::name(ResourceKind::NamingSystem, name)
}

fn code_system(url: &str) -> ArtifactIdentity {
    ArtifactIdentity::url_version(ResourceKind::CodeSystem, url, "1.0")
}

fn task(value: &str) -> ArtifactIdentity {
    ArtifactIdentity::identifier(ResourceKind::Task, value)
}

fn declared(identity: &ArtifactIdentity) -> DeclaredArtifact {
    DeclaredArtifact {
        identity: identity.clone(),
        payload: json!({
            "resourceType": identity.kind().as_str(),
            "status": "unknown",
            "title": identity.to_string(),
        }),
    }
}

fn plugin(name: &str, draft: bool, processes: &[(&str, &[ArtifactIdentity])]) -> ProcessPlugin {
    ProcessPlugin {
        name: name.to_string(),
        version: "1.0.0".to_string(),
        draft,
        processes: processes
            .iter()
            .map(|(k, artifacts)| PluginProcess {
                key: key(k),
                model: format!("<process id=\"{k}\" plugin=\"{name}\"/>"),
                artifacts: artifacts.iter().map(declared).collect(),
            })
            .collect(),
    }
}

fn last_batch(node: &Node) -> Vec<BatchItem> {
    node.resources
        .history()
        .unwrap()
        .last()
        .cloned()
        .unwrap_or_default()
}

fn is_read_only(batch: &[BatchItem]) -> bool {
    batch
        .iter()
        .all(|item| matches!(item, BatchItem::CountQuery { .. } | BatchItem::Read { .. }))
}

async fn definition(node: &Node, k: &str) -> ProcessDefinition {
    node.registry
        .list_known_process_definitions()
        .await
        .unwrap()
        .into_iter()
        .filter(|d| d.key == key(k))
        .max_by_key(|d| d.revision)
        .unwrap()
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[tokio::test]
async fn first_pass_creates_everything_and_persists() {
    let node = node();
    let ns = naming_system("ping-system");
    let cs = code_system("http://example.org/cs/ping");
    let plugins = [plugin("ping", false, &[("ping|1.0", &[ns.clone(), cs.clone()])])];

    let report = node.deployer.run(&plugins).await.unwrap();
    assert_eq!(report.created, 2);
    assert_eq!(report.updated, 0);
    assert_eq!(report.deleted, 0);
    assert_eq!(report.changes.len(), 1);
    assert_eq!(report.changes[0].old_state, LifecycleState::New);
    assert_eq!(report.changes[0].new_state, LifecycleState::Active);

    let (ns_id, ns_resource) = node.resources.get(&ns).unwrap().unwrap();
    assert_eq!(ns_resource["status"], "active");

    let snapshot = node.state.snapshot().unwrap();
    assert_eq!(snapshot.process_states[&key("ping|1.0")], LifecycleState::Active);
    let records = &snapshot.artifacts[&key("ping|1.0")];
    assert_eq!(records.len(), 2);
    assert!(records.iter().any(|r| r.identity == ns && r.store_id == ns_id));

    let def = definition(&node, "ping|1.0").await;
    assert!(!def.suspended);
    assert_eq!(
        node.registry.tenant_of(&def.definition_id).unwrap().as_deref(),
        Some("node-a")
    );
}

#[tokio::test]
async fn second_unchanged_pass_is_idempotent() {
    let node = node();
    let plugins = [plugin(
        "ping",
        false,
        &[("ping|1.0", &[naming_system("ns"), code_system("http://x/cs")])],
    )];

    node.deployer.run(&plugins).await.unwrap();
    let batches_after_first = node.resources.history().unwrap().len();

    let report = node.deployer.run(&plugins).await.unwrap();
    assert_eq!((report.created, report.updated, report.deleted), (0, 0, 0));
    assert_eq!(report.healed, 0);

    // Only the existence check talked to the store.
    let history = node.resources.history().unwrap();
    assert_eq!(history.len(), batches_after_first + 1);
    assert!(is_read_only(&last_batch(&node)));

    let plan = node.deployer.plan(&plugins).await.unwrap();
    assert!(plan.batch.is_empty());
}

#[tokio::test]
async fn new_draft_artifact_is_created_then_resynced() {
    let node = node();
    let ns = naming_system("draft-system");
    let plugins = [plugin("p1", true, &[("p1|1.0", &[ns.clone()])])];

    // NEW → DRAFT.
    let report = node.deployer.run(&plugins).await.unwrap();
    assert_eq!(report.created, 1);

    // DRAFT → DRAFT on a known artifact: rewritten, not created.
    let report = node.deployer.run(&plugins).await.unwrap();
    assert_eq!(report.created, 0);
    assert_eq!(report.updated, 1);
    assert!(matches!(
        last_batch(&node).as_slice(),
        [BatchItem::ConditionalUpdate { .. }]
    ));

    // A second draft artifact appears while the process stays draft. It is
    // unknown to the store, so its old state is forced to NEW.
    let added = code_system("http://x/new-in-draft");
    let plugins = [plugin("p1", true, &[("p1|1.0", &[ns.clone(), added.clone()])])];
    let plan = node.deployer.plan(&plugins).await.unwrap();
    let actions: Vec<(ResourceKind, BatchAction)> = plan
        .batch
        .entries
        .iter()
        .map(|e| (e.identity.kind(), e.action))
        .collect();
    assert_eq!(
        actions,
        [
            (ResourceKind::NamingSystem, BatchAction::Update),
            (ResourceKind::CodeSystem, BatchAction::Create)
        ]
    );
    assert_eq!(plan.batch.entries[1].expected_statuses(), &[200, 201]);

    let (_, resource) = node.resources.get(&ns).unwrap().unwrap();
    assert_eq!(resource["status"], "draft");
}

#[tokio::test]
async fn artifact_dropped_from_draft_is_deleted() {
    let node = node();
    let kept = naming_system("kept");
    let dropped = code_system("http://x/dropped");

    node.deployer
        .run(&[plugin("p1", true, &[("p1|1.0", &[kept.clone(), dropped.clone()])])])
        .await
        .unwrap();
    assert!(node.resources.get(&dropped).unwrap().is_some());

    let report = node
        .deployer
        .run(&[plugin("p1", true, &[("p1|1.0", &[kept.clone()])])])
        .await
        .unwrap();
    assert_eq!(report.deleted, 1);
    assert!(node.resources.get(&dropped).unwrap().is_none());
    assert!(node.resources.get(&kept).unwrap().is_some());

    let records = node.state.get_artifact_records().await.unwrap();
    assert_eq!(records[&key("p1|1.0")].len(), 1);
}

#[tokio::test]
async fn shared_artifact_survives_one_owner_leaving() {
    let node = node();
    let shared = code_system("http://x/shared");
    let own = naming_system("p2-only");

    node.deployer
        .run(&[
            plugin("p2", false, &[("p2|1.0", &[shared.clone(), own.clone()])]),
            plugin("p3", false, &[("p3|1.0", &[shared.clone()])]),
        ])
        .await
        .unwrap();

    // p2 is unloaded: ACTIVE → EXCLUDED, while p3 stays ACTIVE.
    let report = node
        .deployer
        .run(&[plugin("p3", false, &[("p3|1.0", &[shared.clone()])])])
        .await
        .unwrap();

    assert_eq!(report.deleted, 1);
    assert!(node.resources.get(&own).unwrap().is_none());
    assert!(node.resources.get(&shared).unwrap().is_some());

    // The shared artifact keeps its max state and gets no item at all.
    let deleted: Vec<ArtifactIdentity> = last_batch(&node)
        .into_iter()
        .map(|item| match item {
            BatchItem::ConditionalDelete { identity } => identity,
            other => panic!("unexpected item {other}"),
        })
        .collect();
    assert_eq!(deleted, vec![own.clone()]);

    let snapshot = node.state.snapshot().unwrap();
    assert_eq!(snapshot.process_states[&key("p2|1.0")], LifecycleState::Excluded);
    assert!(!snapshot.artifacts.contains_key(&key("p2|1.0")));
    assert!(definition(&node, "p2|1.0").await.suspended);
    assert!(!definition(&node, "p3|1.0").await.suspended);
}

#[tokio::test]
async fn artifact_deleted_out_of_band_is_recreated() {
    let node = node();
    let cs = code_system("http://x/cs");
    let plugins = [plugin("ping", false, &[("ping|1.0", &[cs.clone()])])];

    node.deployer.run(&plugins).await.unwrap();
    let (first_id, _) = node.resources.get(&cs).unwrap().unwrap();
    assert!(node.resources.remove(&cs).unwrap());

    let report = node.deployer.run(&plugins).await.unwrap();
    assert_eq!(report.healed, 1);
    assert_eq!(report.created, 1);
    assert_eq!(report.updated, 0);
    assert!(matches!(
        last_batch(&node).as_slice(),
        [BatchItem::ConditionalCreate { .. }]
    ));

    let (second_id, resource) = node.resources.get(&cs).unwrap().unwrap();
    assert_ne!(first_id, second_id);
    assert_eq!(resource["status"], "active");

    let records = node.state.get_artifact_records().await.unwrap();
    assert_eq!(records[&key("ping|1.0")][0].store_id, second_id);
}

#[tokio::test]
async fn retired_process_suspends_and_marks_artifacts_retired() {
    let node = node();
    let cs = code_system("http://x/cs");
    let plugins = [plugin("ping", false, &[("ping|1.0", &[cs.clone()])])];
    node.deployer.run(&plugins).await.unwrap();

    let retiring = node_sharing(&node, DeployConfig {
        retire: vec![key("ping|1.0")],
        ..config()
    });
    let report = retiring.run(&plugins).await.unwrap();
    assert_eq!(report.updated, 1);
    assert_eq!(report.changes[0].new_state, LifecycleState::Retired);

    let (_, resource) = node.resources.get(&cs).unwrap().unwrap();
    assert_eq!(resource["status"], "retired");
    assert!(definition(&node, "ping|1.0").await.suspended);

    // Back to active: RETIRED → ACTIVE reactivates and updates.
    let report = node.deployer.run(&plugins).await.unwrap();
    assert_eq!(report.updated, 1);
    assert!(!definition(&node, "ping|1.0").await.suspended);
    let (_, resource) = node.resources.get(&cs).unwrap().unwrap();
    assert_eq!(resource["status"], "active");
}

#[tokio::test]
async fn retiring_unloaded_process_rewrites_stored_status() {
    let node = node();
    let cs = code_system("http://x/cs");
    node.deployer
        .run(&[plugin("ping", false, &[("ping|1.0", &[cs.clone()])])])
        .await
        .unwrap();

    // The plugin is gone; only its stored records remain.
    let retiring = node_sharing(&node, DeployConfig {
        retire: vec![key("ping|1.0")],
        ..config()
    });
    let report = retiring.run(&[]).await.unwrap();
    assert_eq!(report.changes[0].new_state, LifecycleState::Retired);
    assert_eq!(report.updated, 1);

    let (_, resource) = node.resources.get(&cs).unwrap().unwrap();
    assert_eq!(resource["status"], "retired");
    assert_eq!(resource["title"], cs.to_string());
    assert!(definition(&node, "ping|1.0").await.suspended);

    let report = retiring.run(&[]).await.unwrap();
    assert_eq!((report.created, report.updated, report.deleted), (0, 0, 0));
    assert!(is_read_only(&last_batch(&node)));

    // Deleted out-of-band: nothing declares it any more, so it stays gone
    // and the pass still succeeds.
    node.resources.remove(&cs).unwrap();
    let report = retiring.run(&[]).await.unwrap();
    assert_eq!((report.healed, report.created), (0, 0));
    assert!(node.resources.get(&cs).unwrap().is_none());
    let snapshot = node.state.snapshot().unwrap();
    assert_eq!(snapshot.process_states[&key("ping|1.0")], LifecycleState::Retired);
    assert_eq!(snapshot.artifacts[&key("ping|1.0")].len(), 1);
}

#[tokio::test]
async fn artifact_dropped_by_draft_but_shared_stays_with_its_claimant() {
    let node = node();
    let shared = code_system("http://x/shared");
    let own = naming_system("a-only");
    let claimant = plugin("b", false, &[("b|1", &[shared.clone()])]);

    node.deployer
        .run(&[
            plugin("a", true, &[("a|1", &[shared.clone(), own.clone()])]),
            claimant.clone(),
        ])
        .await
        .unwrap();

    // a|1 sorts first and drops the shared artifact while staying draft.
    let plugins = [plugin("a", true, &[("a|1", &[own.clone()])]), claimant];
    let report = node.deployer.run(&plugins).await.unwrap();
    assert_eq!(report.deleted, 0);
    assert!(node.resources.get(&shared).unwrap().is_some());

    let records = node.state.get_artifact_records().await.unwrap();
    let owned = |k: &str| -> Vec<ArtifactIdentity> {
        records[&key(k)].iter().map(|r| r.identity.clone()).collect()
    };
    assert_eq!(owned("a|1"), vec![own.clone()]);
    assert_eq!(owned("b|1"), vec![shared.clone()]);

    // Nothing left to drop on the next draft pass.
    let plan = node.deployer.plan(&plugins).await.unwrap();
    assert_eq!(plan.batch.len(), 1);
    assert_eq!(plan.batch.entries[0].identity, own);
    assert_eq!(plan.batch.entries[0].action, BatchAction::Update);
}

#[tokio::test]
async fn pass_is_persisted_in_one_commit() {
    let state = Arc::new(CommitOnly {
        inner: MemoryStateStore::new(),
        fail: false,
    });
    let deployer = Deployer::new(
        Arc::new(MemoryProcessRegistry::new()),
        state.clone(),
        Arc::new(MemoryResourceStore::new()),
        config(),
    );
    let plugins = [plugin("ping", false, &[("ping|1.0", &[code_system("http://x/cs")])])];

    deployer.run(&plugins).await.unwrap();
    let snapshot = state.inner.snapshot().unwrap();
    assert_eq!(snapshot.process_states[&key("ping|1.0")], LifecycleState::Active);
    assert_eq!(snapshot.artifacts[&key("ping|1.0")].len(), 1);
}

#[tokio::test]
async fn failed_commit_leaves_prior_state() {
    // Active with no artifact records: the artifact is re-created and the
    // records would change on commit.
    let prior = StateSnapshot {
        process_states: BTreeMap::from([(key("ping|1.0"), LifecycleState::Active)]),
        artifacts: BTreeMap::new(),
    };
    let state = Arc::new(CommitOnly {
        inner: MemoryStateStore::from_snapshot(prior.clone()),
        fail: true,
    });
    let deployer = Deployer::new(
        Arc::new(MemoryProcessRegistry::new()),
        state.clone(),
        Arc::new(MemoryResourceStore::new()),
        config(),
    );
    let plugins = [plugin("ping", false, &[("ping|1.0", &[code_system("http://x/cs")])])];

    let err = deployer.run(&plugins).await.unwrap_err();
    assert!(matches!(err, DeployError::StateStore(_)));

    let after = state.inner.snapshot().unwrap();
    assert_eq!(after.process_states, prior.process_states);
    assert_eq!(after.artifacts, prior.artifacts);
}

#[tokio::test]
async fn excluded_by_config_even_when_loaded() {
    let node = node_with(DeployConfig {
        exclude: vec![key("ping|1.0")],
        ..config()
    });
    let plugins = [plugin("ping", false, &[("ping|1.0", &[code_system("http://x/cs")])])];

    let report = node.deployer.run(&plugins).await.unwrap();
    // NEW → EXCLUDED: nobody ever created it, nobody wants it.
    assert_eq!((report.created, report.deleted), (0, 0));
    assert!(node.resources.is_empty().unwrap());
    assert!(definition(&node, "ping|1.0").await.suspended);
}

#[tokio::test]
async fn batch_orders_naming_system_before_task() {
    let node = node();
    let plugins = [plugin(
        "ping",
        false,
        &[("ping|1.0", &[task("ping-task"), naming_system("ping-system")])],
    )];

    node.deployer.run(&plugins).await.unwrap();
    let kinds: Vec<ResourceKind> = last_batch(&node)
        .iter()
        .map(|item| item.identity().kind())
        .collect();
    assert_eq!(kinds, [ResourceKind::NamingSystem, ResourceKind::Task]);
}

#[tokio::test]
async fn failed_batch_persists_nothing() {
    let node = node();
    let plugins = [plugin("ping", false, &[("ping|1.0", &[code_system("http://x/cs")])])];

    node.resources.fail_next_batch("transaction rolled back").unwrap();
    let err = node.deployer.run(&plugins).await.unwrap_err();
    assert!(matches!(err, DeployError::ResourceStore(_)));

    let snapshot = node.state.snapshot().unwrap();
    assert!(snapshot.process_states.is_empty());
    assert!(snapshot.artifacts.is_empty());
    assert!(node.resources.is_empty().unwrap());

    // The next pass starts from the same prior state and converges.
    let report = node.deployer.run(&plugins).await.unwrap();
    assert_eq!(report.created, 1);
    assert_eq!(report.changes[0].old_state, LifecycleState::New);
}

#[tokio::test]
async fn redeployed_draft_suspends_superseded_definitions() {
    let node = node();
    node.deployer
        .run(&[plugin("p1", true, &[("p1|1.0", &[])])])
        .await
        .unwrap();

    // Same key, changed model: a second revision is deployed.
    let mut changed = plugin("p1", true, &[("p1|1.0", &[])]);
    changed.processes[0].model = "<process id=\"p1|1.0\" changed=\"true\"/>".to_string();
    node.deployer.run(&[changed]).await.unwrap();

    let defs = node.registry.definitions().unwrap();
    assert_eq!(defs.len(), 2);
    let suspended: BTreeSet<u32> = defs.iter().filter(|d| d.suspended).map(|d| d.revision).collect();
    assert_eq!(suspended, BTreeSet::from([1]));
}

#[tokio::test]
async fn plan_has_no_side_effects() {
    let node = node();
    let plugins = [plugin("ping", false, &[("ping|1.0", &[code_system("http://x/cs")])])];

    let plan = node.deployer.plan(&plugins).await.unwrap();
    assert_eq!(plan.batch.len(), 1);
    assert_eq!(plan.changes[0].new_state, LifecycleState::Active);

    assert!(node.registry.definitions().unwrap().is_empty());
    assert!(node.resources.history().unwrap().is_empty());
    assert!(node.state.snapshot().unwrap().process_states.is_empty());
}

#[tokio::test]
async fn concurrent_pass_is_rejected() {
    let registry = Arc::new(GatedRegistry {
        inner: MemoryProcessRegistry::new(),
        gate: Notify::new(),
    });
    let deployer = Deployer::new(
        registry.clone(),
        Arc::new(MemoryStateStore::new()),
        Arc::new(MemoryResourceStore::new()),
        config(),
    );
    let plugins = [plugin("ping", false, &[("ping|1.0", &[])])];

    let first = deployer.run(&plugins);
    let second = async {
        tokio::task::yield_now().await;
        let result = deployer.plan(&plugins).await;
        registry.gate.notify_one();
        result
    };
    let (first, second) = tokio::join!(first, second);

    assert!(first.is_ok());
    assert!(matches!(second, Err(DeployError::PassInProgress)));
}

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

/// A second deployer over the same collaborators, with another config.
fn node_sharing(node: &Node, config: DeployConfig) -> Deployer {
    Deployer::new(
        node.registry.clone(),
        node.state.clone(),
        node.resources.clone(),
        config,
    )
}

/// Registry whose deploy blocks until the gate is opened.
struct GatedRegistry {
    inner: MemoryProcessRegistry,
    gate: Notify,
}

#[async_trait]
impl ProcessRegistry for GatedRegistry {
    async fn deploy(&self, key: &ProcessKey, model: &[u8], tenant_tag: &str) -> anyhow::Result<String> {
        self.gate.notified().await;
        self.inner.deploy(key, model, tenant_tag).await
    }

    async fn list_known_process_definitions(&self) -> anyhow::Result<Vec<ProcessDefinition>> {
        self.inner.list_known_process_definitions().await
    }

    async fn activate(&self, definition_id: &str) -> anyhow::Result<()> {
        self.inner.activate(definition_id).await
    }

    async fn suspend(&self, definition_id: &str) -> anyhow::Result<()> {
        self.inner.suspend(definition_id).await
    }
}

/// State store that only accepts whole-pass commits.
struct CommitOnly {
    inner: MemoryStateStore,
    fail: bool,
}

#[async_trait]
impl StateStore for CommitOnly {
    async fn get_process_states(&self) -> anyhow::Result<BTreeMap<ProcessKey, LifecycleState>> {
        self.inner.get_process_states().await
    }

    async fn update_process_states(
        &self,
        _states: &BTreeMap<ProcessKey, LifecycleState>,
    ) -> anyhow::Result<()> {
        panic!("process states written outside commit_pass");
    }

    async fn get_artifact_records(&self) -> anyhow::Result<BTreeMap<ProcessKey, Vec<ArtifactRecord>>> {
        self.inner.get_artifact_records().await
    }

    async fn add_or_remove_artifacts(
        &self,
        _merged: &[OwnedArtifact],
        _deleted_ids: &[Uuid],
        _excluded_keys: &[ProcessKey],
    ) -> anyhow::Result<()> {
        panic!("artifact records written outside commit_pass");
    }

    async fn commit_pass(
        &self,
        merged: &[OwnedArtifact],
        deleted_ids: &[Uuid],
        excluded_keys: &[ProcessKey],
        states: &BTreeMap<ProcessKey, LifecycleState>,
    ) -> anyhow::Result<()> {
        if self.fail {
            anyhow::bail!("commit rejected");
        }
        self.inner
            .commit_pass(merged, deleted_ids, excluded_keys, states)
            .await
    }
}

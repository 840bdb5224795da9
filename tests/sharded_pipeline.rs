//! Pipeline tests: schedule, assemble, run and merge across shard borders.

use std::collections::BTreeMap;
use std::sync::Arc;

use sharded_checks::checks::{OneMemberRelationCheck, OrphanEdgeCheck};
use sharded_checks::scheduler::Execution;
use sharded_checks::{
    Candidate, Check, CheckContext, CheckError, CheckOutcome, CheckRunner, CheckScratch,
    CheckSettings, BoundaryAwareGraphLoader, Distance, Entity, EntityId, Flag, GraphFragment,
    InMemoryAtlasFetcher, LoaderPolicy, Location, Shard, ShardId, AvailableShards, TaskScheduler,
};

// ─────────────────────────────────────────────────────────────────────────────
// Fixtures
// ─────────────────────────────────────────────────────────────────────────────

// Two adjacent zoom-10 tiles at the equator.
fn s1() -> Shard {
    Shard::from_id(ShardId::new(10, 512, 511))
}

fn s2() -> Shard {
    Shard::from_id(ShardId::new(10, 513, 511))
}

/// Road crossing the S1/S2 border: edge 1 lives in S1, edge 2 in S2, and
/// they meet at node 3 on the border. Relation 7 has a single member
/// (node 1) and is stored in both fragments.
fn border_fetcher() -> Arc<InMemoryAtlasFetcher> {
    let lat = 0.1;
    let border = s1().bounds.upper_right.lon;
    let a = Location::new(lat, border - 0.05);
    let n = Location::new(lat, border);
    let b = Location::new(lat, border + 0.05);
    let relation = Entity::relation(7, vec![EntityId::node(1)], vec![a, b]);

    let mut fetcher = InMemoryAtlasFetcher::new();
    fetcher.add_fragment(GraphFragment::new(
        "XYZ",
        s1().id,
        vec![
            Entity::node(1, a),
            Entity::node(3, n),
            Entity::edge(1, EntityId::node(1), EntityId::node(3), vec![a, n]),
            relation.clone(),
        ],
    ));
    fetcher.add_fragment(GraphFragment::new(
        "XYZ",
        s2().id,
        vec![
            Entity::node(2, b),
            Entity::edge(2, EntityId::node(2), EntityId::node(3), vec![b, n]),
            relation,
        ],
    ));
    Arc::new(fetcher)
}

fn catalog() -> BTreeMap<String, Vec<Shard>> {
    BTreeMap::from([("XYZ".to_string(), vec![s1(), s2()])])
}

fn countries() -> Vec<String> {
    vec!["XYZ".to_string()]
}

fn builtin_checks() -> Vec<Arc<dyn Check>> {
    vec![
        Arc::new(OrphanEdgeCheck::new(CheckSettings::default())),
        Arc::new(OneMemberRelationCheck::new(CheckSettings::default())),
    ]
}

/// Edge 11 lies wholly inside S1, more than the buffer away from the border.
/// Edge 12 is anchored in S2 and runs into S1 to end at edge 11's node 12.
fn interior_crossing_fetcher() -> Arc<InMemoryAtlasFetcher> {
    let lat = 0.1;
    let a = Location::new(lat, 0.10);
    let n = Location::new(lat, 0.15);
    let b = Location::new(lat, 0.40);

    let mut fetcher = InMemoryAtlasFetcher::new();
    fetcher.add_fragment(GraphFragment::new(
        "XYZ",
        s1().id,
        vec![
            Entity::node(11, a),
            Entity::node(12, n),
            Entity::edge(11, EntityId::node(11), EntityId::node(12), vec![a, n]),
        ],
    ));
    fetcher.add_fragment(GraphFragment::new(
        "XYZ",
        s2().id,
        vec![
            Entity::node(13, b),
            Entity::edge(12, EntityId::node(13), EntityId::node(12), vec![b, n]),
        ],
    ));
    Arc::new(fetcher)
}

async fn run_pipeline(policy: LoaderPolicy, checks: Vec<Arc<dyn Check>>, parallel: usize) -> Execution {
    run_pipeline_with(border_fetcher(), policy, checks, parallel).await
}

async fn run_pipeline_with(
    fetcher: Arc<InMemoryAtlasFetcher>,
    policy: LoaderPolicy,
    checks: Vec<Arc<dyn Check>>,
    parallel: usize,
) -> Execution {
    let sharding = Arc::new(AvailableShards::new([s1(), s2()]));
    let loader = Arc::new(BoundaryAwareGraphLoader::new(fetcher, sharding, policy));
    let scheduler = TaskScheduler::new().with_max_concurrent_tasks(parallel);
    let by_country = BTreeMap::from([("XYZ".to_string(), checks)]);

    let schedule = scheduler
        .schedule(&countries(), &catalog(), &by_country)
        .unwrap();
    assert_eq!(schedule.tasks.len(), 2);
    scheduler
        .execute(schedule, loader, Arc::new(CheckRunner::new()), None)
        .await
}

struct Exploding;

impl Check for Exploding {
    fn name(&self) -> &str {
        "Exploding"
    }

    fn valid_for_country(&self, _country: &str) -> bool {
        true
    }

    fn evaluate(
        &self,
        _ctx: &CheckContext<'_>,
        candidate: Candidate<'_>,
        _scratch: &mut CheckScratch,
    ) -> Result<Option<Flag>, CheckError> {
        Err(CheckError::Evaluation {
            check: "Exploding".into(),
            candidate: candidate.to_string(),
            message: "bad geometry".into(),
        })
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────

#[tokio::test]
async fn border_edges_are_not_orphans_with_eager_loading() {
    let execution = run_pipeline(LoaderPolicy::eager(Distance::kilometers(10.0)), builtin_checks(), 2).await;
    let merged = &execution.containers["XYZ"];
    assert_eq!(merged.flags_for(OrphanEdgeCheck::NAME).count(), 0);
}

#[tokio::test]
async fn border_edges_are_not_orphans_with_deferred_loading() {
    for relation_aware in [false, true] {
        let execution = run_pipeline(
            LoaderPolicy::deferred(Distance::kilometers(10.0), relation_aware),
            builtin_checks(),
            2,
        )
        .await;
        let merged = &execution.containers["XYZ"];
        assert_eq!(merged.flags_for(OrphanEdgeCheck::NAME).count(), 0);
    }
}

#[tokio::test]
async fn owned_shards_only_reports_false_orphans() {
    let mut policy = LoaderPolicy::deferred(Distance::kilometers(10.0), false);
    policy.max_iterations = 0;
    let execution = run_pipeline(policy, builtin_checks(), 2).await;
    let merged = &execution.containers["XYZ"];
    let ids: Vec<_> = merged
        .flags_for(OrphanEdgeCheck::NAME)
        .map(|f| f.identifier.clone())
        .collect();
    assert_eq!(ids, vec!["E1", "E2"]);
}

#[tokio::test]
async fn cross_border_relation_flagged_once() {
    let execution = run_pipeline(LoaderPolicy::eager(Distance::kilometers(10.0)), builtin_checks(), 2).await;

    // Both tasks own the relation and flag it.
    let posted: usize = execution
        .summaries
        .iter()
        .map(|s| match &s.outcomes[OneMemberRelationCheck::NAME] {
            CheckOutcome::Completed { flags, .. } => *flags,
            other => panic!("unexpected outcome {:?}", other),
        })
        .sum();
    assert_eq!(posted, 2);

    let merged = &execution.containers["XYZ"];
    let flags: Vec<_> = merged.flags_for(OneMemberRelationCheck::NAME).collect();
    assert_eq!(flags.len(), 1);
    assert_eq!(flags[0].identifier, "R7");
}

#[tokio::test]
async fn strategies_agree_within_buffer() {
    let eager = run_pipeline(LoaderPolicy::eager(Distance::kilometers(10.0)), builtin_checks(), 2).await;
    let deferred = run_pipeline(
        LoaderPolicy::deferred(Distance::kilometers(10.0), true),
        builtin_checks(),
        2,
    )
    .await;
    assert_eq!(
        eager.containers["XYZ"].fingerprint(),
        deferred.containers["XYZ"].fingerprint()
    );
}

#[tokio::test]
async fn strategies_agree_on_edges_crossing_from_a_neighbor() {
    let buffer = Distance::kilometers(10.0);
    let eager = run_pipeline_with(
        interior_crossing_fetcher(),
        LoaderPolicy::eager(buffer),
        builtin_checks(),
        2,
    )
    .await;
    assert_eq!(eager.containers["XYZ"].flags_for(OrphanEdgeCheck::NAME).count(), 0);

    for relation_aware in [false, true] {
        let deferred = run_pipeline_with(
            interior_crossing_fetcher(),
            LoaderPolicy::deferred(buffer, relation_aware),
            builtin_checks(),
            2,
        )
        .await;
        let merged = &deferred.containers["XYZ"];
        assert_eq!(merged.flags_for(OrphanEdgeCheck::NAME).count(), 0);
        assert_eq!(merged.fingerprint(), eager.containers["XYZ"].fingerprint());
    }
}

#[tokio::test]
async fn merge_independent_of_concurrency() {
    let policy = LoaderPolicy::eager(Distance::kilometers(10.0));
    let serial = run_pipeline(policy.clone(), builtin_checks(), 1).await;
    let parallel = run_pipeline(policy, builtin_checks(), 8).await;
    assert_eq!(serial.containers, parallel.containers);
}

#[tokio::test]
async fn failing_check_does_not_affect_others() {
    let mut checks = builtin_checks();
    checks.insert(1, Arc::new(Exploding));
    let execution = run_pipeline(LoaderPolicy::eager(Distance::kilometers(10.0)), checks, 2).await;

    assert!(execution.excluded.is_empty());
    for summary in &execution.summaries {
        assert_eq!(summary.failed(), vec!["Exploding"]);
        assert_eq!(summary.completed(), 2);
    }
    let merged = &execution.containers["XYZ"];
    assert_eq!(merged.flags_for(OneMemberRelationCheck::NAME).count(), 1);
    assert_eq!(merged.flags_for("Exploding").count(), 0);
}

#[tokio::test]
async fn country_with_unloadable_shards_is_excluded() {
    let mut fetcher = InMemoryAtlasFetcher::new();
    fetcher.fail_on("XYZ", s1().id);
    fetcher.fail_on("XYZ", s2().id);
    let sharding = Arc::new(AvailableShards::new([s1(), s2()]));
    let loader = Arc::new(BoundaryAwareGraphLoader::new(
        Arc::new(fetcher),
        sharding,
        LoaderPolicy::default(),
    ));
    let scheduler = TaskScheduler::new();
    let by_country = BTreeMap::from([("XYZ".to_string(), builtin_checks())]);
    let schedule = scheduler
        .schedule(&countries(), &catalog(), &by_country)
        .unwrap();

    let execution = scheduler
        .execute(schedule, loader, Arc::new(CheckRunner::new()), None)
        .await;
    assert!(execution.containers.is_empty());
    assert!(execution.excluded.contains_key("XYZ"));
}

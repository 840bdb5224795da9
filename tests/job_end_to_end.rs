//! End-to-end job runs over fragments on disk.

use std::path::Path;

use sharded_checks::checks::CheckSettings;
use sharded_checks::{
    CheckEvent, CheckJob, ChecksConfig, DirectoryAtlasFetcher, Distance, Entity, EntityId,
    GraphFragment, GroupingMode, JobConfig, JobError, LoaderPolicy, Location, OutputFormat,
    SchedulerError, ShardId,
};

fn write_border_fixture(input: &Path, country: &str) {
    let fetcher = DirectoryAtlasFetcher::new(input);
    let s1 = ShardId::new(10, 512, 511);
    let s2 = ShardId::new(10, 513, 511);
    let lat = 0.1;
    let border = s1.bounds().upper_right.lon;
    let a = Location::new(lat, border - 0.05);
    let n = Location::new(lat, border);
    let b = Location::new(lat, border + 0.05);
    let relation = Entity::relation(7, vec![EntityId::node(1)], vec![a, b]);

    let left = GraphFragment::new(
        country,
        s1,
        vec![
            Entity::node(1, a),
            Entity::node(3, n),
            Entity::edge(1, EntityId::node(1), EntityId::node(3), vec![a, n]),
            relation.clone(),
        ],
    );
    let right = GraphFragment::new(
        country,
        s2,
        vec![
            Entity::node(2, b),
            Entity::edge(2, EntityId::node(2), EntityId::node(3), vec![b, n]),
            // Dangling edge far from the border.
            Entity::edge(
                5,
                EntityId::node(50),
                EntityId::node(51),
                vec![s2.bounds().center(), Location::new(lat, s2.bounds().center().lon + 0.01)],
            ),
            relation,
        ],
    );
    fetcher.write_fragment(&left).unwrap();
    fetcher.write_fragment(&right).unwrap();
}

fn base_config(root: &Path, countries: &[&str]) -> JobConfig {
    JobConfig {
        countries: countries.iter().map(|c| c.to_string()).collect(),
        input: root.join("input"),
        output: root.join("output"),
        loader: LoaderPolicy::deferred(Distance::kilometers(10.0), true),
        max_concurrent_tasks: 2,
        ..JobConfig::default()
    }
}

fn read_flags(path: &Path) -> Vec<CheckEvent> {
    std::fs::read_to_string(path)
        .unwrap()
        .lines()
        .map(|line| serde_json::from_str(line).unwrap())
        .collect()
}

#[tokio::test]
async fn merged_flags_are_written_once_per_issue() {
    let dir = tempfile::tempdir().unwrap();
    write_border_fixture(&dir.path().join("input"), "XYZ");

    let report = CheckJob::new(base_config(dir.path(), &["XYZ"]))
        .run()
        .await
        .unwrap();

    let xyz = &report.countries["XYZ"];
    assert_eq!(xyz.tasks, 2);
    assert_eq!(xyz.flags_by_check.get("OrphanEdge"), Some(&1));
    assert_eq!(xyz.flags_by_check.get("OneMemberRelation"), Some(&1));
    assert!(report.failed_checks.is_empty());

    let output = dir.path().join("output");
    let events = read_flags(&output.join("flags/XYZ/XYZ.jsonl"));
    assert_eq!(events.len(), 2);
    let identifiers: Vec<_> = events
        .iter()
        .filter_map(|e| match e {
            CheckEvent::FlagProduced { flag, .. } => Some(flag.identifier.as_str()),
            _ => None,
        })
        .collect();
    assert_eq!(identifiers, vec!["R7", "E5"]);

    for stream in ["XYZ_10-512-511", "XYZ_10-513-511"] {
        let metrics = std::fs::read_to_string(output.join(format!("metrics/XYZ/{}.csv", stream))).unwrap();
        assert!(metrics.starts_with("check_name,elapsed_ms\n"));
        assert_eq!(metrics.lines().count(), 4);
    }
    assert!(!output.join("_temporary").exists());
}

#[tokio::test]
async fn bounded_grouping_gives_same_flags() {
    let dir = tempfile::tempdir().unwrap();
    write_border_fixture(&dir.path().join("input"), "XYZ");

    let per_shard = CheckJob::new(base_config(dir.path(), &["XYZ"]))
        .run()
        .await
        .unwrap();

    let mut config = base_config(dir.path(), &["XYZ"]);
    config.output = dir.path().join("bounded");
    config.grouping = GroupingMode::Bounded;
    config.output_formats = vec![OutputFormat::Flags];
    let bounded = CheckJob::new(config).run().await.unwrap();

    assert_eq!(bounded.countries["XYZ"].tasks, 1);
    assert_eq!(
        bounded.countries["XYZ"].fingerprint,
        per_shard.countries["XYZ"].fingerprint
    );
    assert!(!dir.path().join("bounded/metrics").exists());
}

#[tokio::test]
async fn countries_without_checks_or_data_are_excluded() {
    let dir = tempfile::tempdir().unwrap();
    let input = dir.path().join("input");
    write_border_fixture(&input, "XYZ");
    write_border_fixture(&input, "ABC");

    let mut config = base_config(dir.path(), &["ABC", "XYZ", "DEF"]);
    config.checks = ChecksConfig {
        permitlist: vec!["OrphanEdge".into()],
        checks: [(
            "OrphanEdge".to_string(),
            CheckSettings {
                except_countries: vec!["ABC".into()],
                ..CheckSettings::default()
            },
        )]
        .into_iter()
        .collect(),
        ..ChecksConfig::default()
    };
    let report = CheckJob::new(config).run().await.unwrap();

    assert_eq!(report.countries.keys().collect::<Vec<_>>(), vec!["XYZ"]);
    assert_eq!(report.excluded["ABC"], "no checks loaded");
    assert_eq!(report.excluded["DEF"], "no shard data");
    assert_eq!(report.countries["XYZ"].flags_by_check.len(), 1);
    assert!(!dir.path().join("output/flags/ABC").exists());
}

#[tokio::test]
async fn fatal_errors_stop_the_job() {
    let dir = tempfile::tempdir().unwrap();
    write_border_fixture(&dir.path().join("input"), "XYZ");

    let err = CheckJob::new(base_config(dir.path(), &[])).run().await.unwrap_err();
    assert!(matches!(err, JobError::Scheduler(SchedulerError::NoCountries)));

    let mut config = base_config(dir.path(), &["XYZ"]);
    config.checks.permitlist = vec!["NoSuchCheck".into()];
    let err = CheckJob::new(config).run().await.unwrap_err();
    assert!(matches!(err, JobError::Scheduler(SchedulerError::NoChecks)));

    let mut config = base_config(dir.path(), &["xyz"]);
    config.max_concurrent_tasks = 1;
    let err = CheckJob::new(config).run().await.unwrap_err();
    assert!(matches!(err, JobError::Config(_)));
}

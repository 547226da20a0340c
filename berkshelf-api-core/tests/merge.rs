use std::collections::BTreeMap;

use berkshelf_api_core::cache_builder::{merge, Candidate, WorkerReport};
use berkshelf_api_core::model::{CookbookKey, LocationType, RemoteCookbook};
use pretty_assertions::assert_eq;

fn remote(name: &str, version: &str, path: &str, priority: i64) -> RemoteCookbook {
    RemoteCookbook::new(name, version, LocationType::Uri, path, priority)
}

fn report(worker: usize, cookbooks: Vec<RemoteCookbook>) -> WorkerReport {
    WorkerReport { worker, cookbooks }
}

fn winner_path(reports: &[WorkerReport], name: &str, version: &str) -> Option<String> {
    merge(reports)
        .get(&CookbookKey::new(name, version))
        .map(|c| c.remote.location_path().to_string())
}

#[test]
fn lowest_priority_wins_regardless_of_order() {
    let a = report(0, vec![remote("foo", "1.0.0", "source-1", 1)]);
    let b = report(1, vec![remote("foo", "1.0.0", "source-2", 2)]);

    let forward = [a.clone(), b.clone()];
    let backward = [b, a];
    assert_eq!(winner_path(&forward, "foo", "1.0.0").as_deref(), Some("source-1"));
    assert_eq!(winner_path(&backward, "foo", "1.0.0").as_deref(), Some("source-1"));
}

#[test]
fn priority_beats_registration_order() {
    // Registered second, but with the better priority.
    let first = report(0, vec![remote("foo", "1.0.0", "first", 5)]);
    let second = report(1, vec![remote("foo", "1.0.0", "second", 1)]);
    assert_eq!(
        winner_path(&[first, second], "foo", "1.0.0").as_deref(),
        Some("second")
    );
}

#[test]
fn ties_resolve_to_first_registered() {
    let cases = vec![
        ("registered first listed last", vec![(1, "late"), (0, "early")]),
        ("registered first listed first", vec![(0, "early"), (1, "late")]),
        ("three-way tie", vec![(2, "third"), (0, "early"), (1, "late")]),
    ];
    for (name, workers) in cases {
        let reports: Vec<_> = workers
            .into_iter()
            .map(|(index, path)| report(index, vec![remote("foo", "1.0.0", path, 3)]))
            .collect();
        assert_eq!(
            winner_path(&reports, "foo", "1.0.0").as_deref(),
            Some("early"),
            "{name}"
        );
    }
}

#[test]
fn merge_is_idempotent() {
    let single = report(
        0,
        vec![
            remote("foo", "1.0.0", "a", 0),
            remote("foo", "2.0.0", "b", 0),
            remote("bar", "0.1.0", "c", 0),
        ],
    );
    let once = merge(std::slice::from_ref(&single));
    let twice = merge(&[single.clone(), single]);

    let remotes = |m: &BTreeMap<CookbookKey, Candidate>| -> Vec<RemoteCookbook> {
        m.values().map(|c| c.remote.clone()).collect()
    };
    assert_eq!(remotes(&once), remotes(&twice));
    assert_eq!(once.len(), 3);
}

#[test]
fn distinct_versions_are_kept_side_by_side() {
    let merged = merge(&[
        report(0, vec![remote("foo", "1.0.0", "a", 1)]),
        report(1, vec![remote("foo", "1.1.0", "b", 2)]),
    ]);
    assert_eq!(merged.len(), 2);
    assert_eq!(merged[&CookbookKey::new("foo", "1.0.0")].worker, 0);
    assert_eq!(merged[&CookbookKey::new("foo", "1.1.0")].worker, 1);
}

#[test]
fn empty_reports_merge_to_empty() {
    assert!(merge(&[]).is_empty());
    assert!(merge(&[report(0, vec![])]).is_empty());
}

use std::fs::write;

use berkshelf_api_core::error::PersistenceLoadError;
use berkshelf_api_core::model::{LocationType, Metadata, RemoteCookbook, Universe};
use berkshelf_api_core::persistence::{load, save, SAVE_FILE};
use pretty_assertions::assert_eq;
use tempfile::tempdir;

#[test]
fn missing_file_is_save_not_found() {
    let dir = tempdir().unwrap();
    let err = load(&dir.path().join(SAVE_FILE)).unwrap_err();
    assert!(matches!(err, PersistenceLoadError::SaveNotFound(_)));
    assert!(!err.is_invalid_save());
}

#[test]
fn invalid_content_is_invalid_save() {
    struct TestCase {
        name: &'static str,
        body: &'static str,
    }
    let cases = vec![
        TestCase { name: "not json", body: "this is not json" },
        TestCase { name: "truncated", body: "{\"tea\": {" },
        TestCase { name: "array", body: "[1, 2, 3]" },
        TestCase { name: "string", body: "\"universe\"" },
    ];
    let dir = tempdir().unwrap();
    for case in cases {
        let path = dir.path().join(case.name);
        write(&path, case.body).unwrap();
        let err = load(&path).unwrap_err();
        assert!(err.is_invalid_save(), "{}: {err:?}", case.name);
    }
}

#[test]
fn malformed_entries_are_skipped() {
    let dir = tempdir().unwrap();
    let path = dir.path().join(SAVE_FILE);
    write(
        &path,
        r#"{
            "brooke": "winsor",
            "tea": {
                "1.0": {"location_type": "uri", "location_path": "https://x/tea", "dependencies": {"milk": ">= 1.0"}, "platforms": {}},
                "not-a-version": {"location_type": "uri", "location_path": "https://x/bad"},
                "2.0.0": {"location_type": "spaceship"}
            }
        }"#,
    )
    .unwrap();

    let universe = load(&path).expect("valid JSON object loads");
    assert_eq!(universe.len(), 1);
    let entry = universe.get("tea", "1.0.0").expect("version normalised");
    assert_eq!(entry.location_path, "https://x/tea");
    assert_eq!(entry.dependencies["milk"], ">= 1.0");
}

#[test]
fn valid_json_object_without_cookbooks_is_empty() {
    let dir = tempdir().unwrap();
    let path = dir.path().join(SAVE_FILE);
    write(&path, r#"{"brooke": "winsor"}"#).unwrap();
    let universe = load(&path).unwrap();
    assert!(universe.is_empty());
    assert!(universe.cookbooks().is_empty());
}

#[test]
fn save_then_load_preserves_entries() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("nested").join(SAVE_FILE);

    let mut universe = Universe::new();
    let mut metadata = Metadata::default();
    metadata
        .platforms
        .insert("ubuntu".to_string(), ">= 14.04".to_string());
    universe.insert(
        &RemoteCookbook::new("nginx", "2.7.6", LocationType::Uri, "https://chef/nginx", 0),
        metadata,
    );

    save(&path, &universe).expect("save succeeds");
    assert_eq!(load(&path).unwrap(), universe);

    // Saving over an existing file replaces it.
    save(&path, &Universe::new()).unwrap();
    assert!(load(&path).unwrap().is_empty());
}

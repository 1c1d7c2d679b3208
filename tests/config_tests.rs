use loungecast::config::Store;

#[test]
fn test_set_and_get() {
    let dir = tempfile::tempdir().unwrap();
    let store = Store::open(dir.path().join("loungecast.json")).unwrap();

    assert_eq!(store.get("apps.youtube.uuid"), None);
    store.set("apps.youtube.uuid", "uuid-value").unwrap();
    assert_eq!(
        store.get("apps.youtube.uuid").as_deref(),
        Some("uuid-value")
    );
}

#[test]
fn test_values_survive_reopen() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("loungecast.json");

    {
        let store = Store::open(&path).unwrap();
        store.set("apps.youtube.screenId", "screen-1").unwrap();
        store.set("apps.youtube.volume", "85").unwrap();
    }

    let reopened = Store::open(&path).unwrap();
    assert_eq!(
        reopened.get("apps.youtube.screenId").as_deref(),
        Some("screen-1")
    );
    assert_eq!(reopened.get("apps.youtube.volume").as_deref(), Some("85"));
}

#[test]
fn test_get_or_insert_is_stable() {
    let dir = tempfile::tempdir().unwrap();
    let store = Store::open(dir.path().join("loungecast.json")).unwrap();

    let first = store
        .get_or_insert("apps.youtube.uuid", "generated-1".into())
        .unwrap();
    assert_eq!(first, "generated-1");

    // A later insert with a different fallback keeps the original.
    let second = store
        .get_or_insert("apps.youtube.uuid", "generated-2".into())
        .unwrap();
    assert_eq!(second, "generated-1");
}

#[test]
fn test_no_temp_file_left_behind() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("loungecast.json");

    let store = Store::open(&path).unwrap();
    store.set("key", "value").unwrap();

    assert!(path.exists());
    assert!(!path.with_extension("tmp").exists());
}

#[test]
fn test_rewriting_same_value_is_a_noop() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("loungecast.json");

    let store = Store::open(&path).unwrap();
    store.set("key", "value").unwrap();
    let modified = std::fs::metadata(&path).unwrap().modified().unwrap();

    store.set("key", "value").unwrap();
    assert_eq!(
        std::fs::metadata(&path).unwrap().modified().unwrap(),
        modified
    );
}

#[test]
fn test_open_creates_parent_directories() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("nested/config/loungecast.json");

    let store = Store::open(&path).unwrap();
    store.set("key", "value").unwrap();
    assert!(path.exists());
}

#[test]
fn test_corrupt_file_is_an_error() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("loungecast.json");
    std::fs::write(&path, "{not json").unwrap();

    assert!(Store::open(&path).is_err());
}

use rewind_proto::catalog::{CatalogError, Station, StationCatalog};

fn temp_catalog() -> (tempfile::TempDir, StationCatalog) {
    let dir = tempfile::tempdir().expect("tempdir");
    let catalog = StationCatalog::open(dir.path().join("stations.json")).expect("open catalog");
    (dir, catalog)
}

#[test]
fn insert_assigns_increasing_ids_and_persists() {
    let (dir, mut catalog) = temp_catalog();

    let a = catalog
        .insert("Station A", "http://example.com/a", None)
        .unwrap();
    let b = catalog
        .insert("Station B", "http://example.com/b", Some("🎷".into()))
        .unwrap();
    assert!(a > 0);
    assert!(b > a);

    // Reopen from disk and check the records survived.
    let reopened = StationCatalog::open(dir.path().join("stations.json")).unwrap();
    let stations = reopened.list();
    assert_eq!(stations.len(), 2);
    assert_eq!(stations[0].name, "Station A");
    assert_eq!(stations[1].icon.as_deref(), Some("🎷"));
}

#[test]
fn list_orders_by_name_ascending() {
    let (_dir, mut catalog) = temp_catalog();
    catalog.insert("Z Station", "http://example.com/z", None).unwrap();
    catalog.insert("A Station", "http://example.com/a", None).unwrap();
    catalog.insert("M Station", "http://example.com/m", None).unwrap();

    let names: Vec<_> = catalog.list().into_iter().map(|s| s.name).collect();
    assert_eq!(names, vec!["A Station", "M Station", "Z Station"]);
}

#[test]
fn find_by_name_respects_exclude_id() {
    let (_dir, mut catalog) = temp_catalog();
    // Pad ids so the station named "X" lands on id 5.
    for i in 1..=4 {
        catalog
            .insert(&format!("Pad {i}"), &format!("http://example.com/{i}"), None)
            .unwrap();
    }
    let id = catalog.insert("X", "http://example.com/x", None).unwrap();
    assert_eq!(id, 5);

    // Excluding the record's own id: no match (editing station 5 itself).
    assert!(catalog.find_by_name("X", 5).is_none());
    // exclude_id = 0 means no exclusion: the match is found.
    let found = catalog.find_by_name("X", 0).expect("match expected");
    assert_eq!(found.id, 5);
}

#[test]
fn duplicate_name_and_url_rejected() {
    let (_dir, mut catalog) = temp_catalog();
    catalog.insert("One", "http://example.com/1", None).unwrap();

    assert!(matches!(
        catalog.insert("One", "http://example.com/other", None),
        Err(CatalogError::DuplicateName(_))
    ));
    assert!(matches!(
        catalog.insert("Two", "http://example.com/1", None),
        Err(CatalogError::DuplicateUrl(_))
    ));
    // Trimmed comparison: whitespace around the name still collides.
    assert!(matches!(
        catalog.insert("  One  ", "http://example.com/2", None),
        Err(CatalogError::DuplicateName(_))
    ));
}

#[test]
fn update_excludes_own_record_from_duplicate_check() {
    let (_dir, mut catalog) = temp_catalog();
    let id = catalog.insert("Keep", "http://example.com/keep", None).unwrap();
    catalog.insert("Other", "http://example.com/other", None).unwrap();

    // Renaming a station to its current name is not a duplicate.
    catalog
        .update(Station {
            id,
            name: "Keep".into(),
            url: "http://example.com/keep2".into(),
            icon: None,
        })
        .unwrap();
    assert_eq!(catalog.get(id).unwrap().url, "http://example.com/keep2");

    // Colliding with another station still fails.
    assert!(matches!(
        catalog.update(Station {
            id,
            name: "Other".into(),
            url: "http://example.com/keep2".into(),
            icon: None,
        }),
        Err(CatalogError::DuplicateName(_))
    ));
}

#[test]
fn delete_removes_and_errors_on_missing() {
    let (_dir, mut catalog) = temp_catalog();
    let id = catalog.insert("Gone", "http://example.com/g", None).unwrap();
    catalog.delete(id).unwrap();
    assert!(catalog.get(id).is_none());
    assert!(matches!(catalog.delete(id), Err(CatalogError::NotFound(_))));
}

#[test]
fn invalid_urls_rejected_on_insert() {
    let (_dir, mut catalog) = temp_catalog();
    assert!(matches!(
        catalog.insert("Bad", "ftp://example.com/x", None),
        Err(CatalogError::InvalidUrl(_))
    ));
    assert!(matches!(
        catalog.insert("Bad", "http://example.com/a b", None),
        Err(CatalogError::InvalidUrl(_))
    ));
    assert!(matches!(
        catalog.insert("", "http://example.com/x", None),
        Err(CatalogError::EmptyName)
    ));
}

//! End-to-end tests for the instance database over a real backing file.

use std::collections::HashSet;
use std::path::PathBuf;

use instancedb::{DbError, Filter, Instance, InstanceDatabase, InstanceGroup};
use tempfile::TempDir;

/// Test context with an isolated backing file and automatic cleanup.
struct TestContext {
    db: InstanceDatabase,
    backing_file: PathBuf,
    _temp_dir: TempDir,
}

impl TestContext {
    fn new() -> Self {
        let temp_dir = TempDir::new().expect("create temp dir");
        let backing_file = temp_dir.path().join("instance_db.json");
        Self {
            db: InstanceDatabase::new(&backing_file),
            backing_file,
            _temp_dir: temp_dir,
        }
    }

    fn file_bytes(&self) -> Vec<u8> {
        std::fs::read(&self.backing_file).expect("read backing file")
    }
}

fn group(name: &str, home: &str, instances: &[(u32, &str)]) -> InstanceGroup {
    InstanceGroup::new(name, home, "/opt/artifacts").with_instances(
        instances
            .iter()
            .map(|(id, name)| Instance::new(*id, *name))
            .collect(),
    )
}

#[test]
fn empty_database_reports_empty() {
    let ctx = TestContext::new();
    assert!(ctx.db.is_empty().unwrap());
    assert!(ctx.db.instance_groups().unwrap().is_empty());
}

#[test]
fn add_then_list_returns_the_group() {
    let ctx = TestContext::new();
    assert!(ctx.db.is_empty().unwrap());

    let added = ctx
        .db
        .add_instance_group(group("g1", "/h/1", &[(1, "cvd-1")]))
        .unwrap();
    assert!(!ctx.db.is_empty().unwrap());

    let groups = ctx.db.instance_groups().unwrap();
    assert_eq!(groups.len(), 1);
    assert_eq!(groups[0], added);
    assert_eq!(groups[0].instances[0].group_name, "g1");
}

#[test]
fn duplicate_group_name_rejected_and_file_untouched() {
    let ctx = TestContext::new();
    ctx.db
        .add_instance_group(group("g1", "/h/1", &[(1, "cvd-1")]))
        .unwrap();
    let before = ctx.file_bytes();

    let res = ctx.db.add_instance_group(group("g1", "/h/2", &[]));
    assert!(matches!(res, Err(DbError::InvariantViolation(_))));

    assert_eq!(ctx.db.instance_groups().unwrap().len(), 1);
    assert_eq!(ctx.file_bytes(), before, "failed add must not rewrite the file");
}

#[test]
fn duplicate_home_rejected() {
    let ctx = TestContext::new();
    ctx.db
        .add_instance_group(group("g1", "/h/1", &[(1, "cvd-1")]))
        .unwrap();
    let res = ctx.db.add_instance_group(group("g2", "/h/1", &[]));
    assert!(matches!(res, Err(DbError::InvariantViolation(_))));
}

#[test]
fn duplicate_instance_id_across_groups_rejected() {
    let ctx = TestContext::new();
    ctx.db
        .add_instance_group(group("g1", "/h/1", &[(7, "a")]))
        .unwrap();
    let res = ctx.db.add_instance_group(group("g2", "/h/2", &[(7, "b")]));
    assert!(matches!(res, Err(DbError::InvariantViolation(_))));
}

#[test]
fn unset_instance_ids_are_exempt_from_uniqueness() {
    let ctx = TestContext::new();
    ctx.db
        .add_instance_group(group("g1", "/h/1", &[(0, "a")]))
        .unwrap();
    ctx.db
        .add_instance_group(group("g2", "/h/2", &[(0, "b")]))
        .unwrap();
    assert_eq!(ctx.db.instance_groups().unwrap().len(), 2);
}

#[test]
fn empty_name_gets_generated() {
    let ctx = TestContext::new();
    let first = ctx.db.add_instance_group(group("", "/h/1", &[])).unwrap();
    let second = ctx.db.add_instance_group(group("", "/h/2", &[])).unwrap();
    assert_eq!(first.name, "group_1");
    assert_eq!(second.name, "group_2");
}

#[test]
fn ill_formed_names_rejected() {
    let ctx = TestContext::new();
    let res = ctx.db.add_instance_group(group("0invalid_group_name", "/h/1", &[]));
    assert!(matches!(res, Err(DbError::InvariantViolation(_))));

    let res = ctx.db.add_instance_group(group("g1", "/h/1", &[(1, "bad name")]));
    assert!(matches!(res, Err(DbError::InvariantViolation(_))));
}

#[test]
fn find_group_exactness() {
    let ctx = TestContext::new();
    ctx.db
        .add_instance_group(group("g1", "/h/1", &[(1, "a")]))
        .unwrap();
    ctx.db
        .add_instance_group(group("g2", "/h/2", &[(2, "a"), (3, "b")]))
        .unwrap();

    let found = ctx
        .db
        .find_group(&Filter {
            instance_names: HashSet::from(["a".to_string(), "b".to_string()]),
            ..Default::default()
        })
        .unwrap();
    assert_eq!(found.name, "g2");

    let res = ctx.db.find_group(&Filter {
        instance_names: HashSet::from(["a".to_string()]),
        ..Default::default()
    });
    assert!(matches!(res, Err(DbError::Ambiguous(_))));

    let found = ctx
        .db
        .find_group(&Filter {
            instance_id: Some(3),
            ..Default::default()
        })
        .unwrap();
    assert_eq!(found.name, "g2");

    let res = ctx.db.find_group(&Filter {
        instance_id: Some(99),
        ..Default::default()
    });
    assert!(matches!(res, Err(DbError::NotFound(_))));
}

#[test]
fn find_groups_returns_matching_subset() {
    let ctx = TestContext::new();
    ctx.db
        .add_instance_group(group("g1", "/h/1", &[(1, "a")]))
        .unwrap();
    ctx.db
        .add_instance_group(group("g2", "/h/2", &[(2, "a"), (3, "b")]))
        .unwrap();

    let all = ctx.db.find_groups(&Filter::default()).unwrap();
    assert_eq!(all.len(), 2, "empty filter matches all records");

    let by_home = ctx
        .db
        .find_groups(&Filter {
            home: Some("/h/2".into()),
            ..Default::default()
        })
        .unwrap();
    assert_eq!(by_home.len(), 1);
    assert_eq!(by_home[0].name, "g2");
}

#[test]
fn find_instance_with_group_exactness() {
    let ctx = TestContext::new();
    ctx.db
        .add_instance_group(group("g1", "/h/1", &[(1, "a")]))
        .unwrap();
    ctx.db
        .add_instance_group(group("g2", "/h/2", &[(2, "a"), (3, "b")]))
        .unwrap();

    let (instance, owner) = ctx
        .db
        .find_instance_with_group(&Filter {
            instance_id: Some(3),
            ..Default::default()
        })
        .unwrap();
    assert_eq!(instance.name, "b");
    assert_eq!(instance.group_name, "g2");
    assert_eq!(owner.name, "g2");

    // Two instances named "a" exist across groups.
    let res = ctx.db.find_instance_with_group(&Filter {
        instance_names: HashSet::from(["a".to_string()]),
        ..Default::default()
    });
    assert!(matches!(res, Err(DbError::Ambiguous(_))));

    // More than one instance name can never resolve to a single instance.
    let res = ctx.db.find_instance_with_group(&Filter {
        instance_names: HashSet::from(["a".to_string(), "b".to_string()]),
        ..Default::default()
    });
    assert!(matches!(res, Err(DbError::Ambiguous(_))));

    let res = ctx.db.find_instance_with_group(&Filter {
        group_name: Some("g1".to_string()),
        instance_id: Some(3),
        ..Default::default()
    });
    assert!(matches!(res, Err(DbError::NotFound(_))));
}

#[test]
fn clear_returns_prior_content() {
    let ctx = TestContext::new();
    ctx.db.add_instance_group(group("g1", "/h/1", &[])).unwrap();
    ctx.db.add_instance_group(group("g2", "/h/2", &[])).unwrap();

    let cleared = ctx.db.clear().unwrap();
    assert_eq!(cleared.len(), 2);
    assert!(ctx.db.is_empty().unwrap());
    assert!(ctx.db.instance_groups().unwrap().is_empty());
}

#[test]
fn remove_is_idempotent() {
    let ctx = TestContext::new();
    ctx.db.add_instance_group(group("g1", "/h/1", &[])).unwrap();

    assert!(ctx.db.remove_instance_group("g1").unwrap());
    assert!(!ctx.db.remove_instance_group("g1").unwrap());
    assert!(ctx.db.is_empty().unwrap());
}

#[test]
fn update_group_replaces_by_name() {
    let ctx = TestContext::new();
    ctx.db
        .add_instance_group(group("g1", "/h/1", &[(1, "a")]))
        .unwrap();

    let updated = group("g1", "/h/1b", &[(1, "a"), (2, "c")]);
    ctx.db.update_instance_group(updated).unwrap();

    let stored = ctx.db.instance_groups().unwrap();
    assert_eq!(stored[0].home_dir, PathBuf::from("/h/1b"));
    assert_eq!(stored[0].instances.len(), 2);

    let res = ctx.db.update_instance_group(group("missing", "/h/9", &[]));
    assert!(matches!(res, Err(DbError::InvariantViolation(_))));
}

#[test]
fn update_group_cannot_steal_home() {
    let ctx = TestContext::new();
    ctx.db.add_instance_group(group("g1", "/h/1", &[])).unwrap();
    ctx.db.add_instance_group(group("g2", "/h/2", &[])).unwrap();
    let before = ctx.file_bytes();

    let res = ctx.db.update_instance_group(group("g2", "/h/1", &[]));
    assert!(matches!(res, Err(DbError::InvariantViolation(_))));
    assert_eq!(ctx.file_bytes(), before);
}

#[test]
fn update_instance_replaces_in_place() {
    let ctx = TestContext::new();
    ctx.db
        .add_instance_group(group("g1", "/h/1", &[(1, "a"), (2, "b")]))
        .unwrap();

    ctx.db
        .update_instance("g1", Instance::new(2, "b-renamed"))
        .unwrap();
    let stored = ctx.db.instance_groups().unwrap();
    let renamed = stored[0].instance_by_id(2).unwrap();
    assert_eq!(renamed.name, "b-renamed");
    assert_eq!(renamed.group_name, "g1");

    let res = ctx.db.update_instance("g1", Instance::new(9, "x"));
    assert!(matches!(res, Err(DbError::InvariantViolation(_))));
    let res = ctx.db.update_instance("missing", Instance::new(1, "x"));
    assert!(matches!(res, Err(DbError::InvariantViolation(_))));
    // Renaming onto a sibling's name collides.
    let res = ctx.db.update_instance("g1", Instance::new(2, "a"));
    assert!(matches!(res, Err(DbError::InvariantViolation(_))));
}

#[test]
fn translator_optout_round_trips() {
    let ctx = TestContext::new();
    assert!(!ctx.db.translator_optout().unwrap());
    ctx.db.set_translator_optout(true).unwrap();
    assert!(ctx.db.translator_optout().unwrap());
}

#[test]
fn load_groups_is_all_or_nothing() {
    let ctx = TestContext::new();
    ctx.db.add_instance_group(group("g1", "/h/1", &[])).unwrap();
    let before = ctx.file_bytes();

    // Second import entry collides with g1's home; nothing must land.
    let res = ctx.db.load_groups(vec![
        group("g2", "/h/2", &[]),
        group("g3", "/h/1", &[]),
    ]);
    assert!(matches!(res, Err(DbError::InvariantViolation(_))));
    assert_eq!(ctx.file_bytes(), before);

    ctx.db
        .load_groups(vec![group("g2", "/h/2", &[]), group("g3", "/h/3", &[])])
        .unwrap();
    assert_eq!(ctx.db.instance_groups().unwrap().len(), 3);
}

#[test]
fn unknown_fields_survive_mutations() {
    let ctx = TestContext::new();
    std::fs::write(
        &ctx.backing_file,
        r#"{"instance_groups": [], "translator_optout": false, "written_by": "vNEXT"}"#,
    )
    .unwrap();

    ctx.db.add_instance_group(group("g1", "/h/1", &[])).unwrap();

    let raw: serde_json::Value = serde_json::from_slice(&ctx.file_bytes()).unwrap();
    assert_eq!(raw["written_by"], "vNEXT");
    assert_eq!(raw["instance_groups"][0]["name"], "g1");
}

#[test]
fn corrupt_file_surfaces_as_parse_error() {
    let ctx = TestContext::new();
    std::fs::write(&ctx.backing_file, b"\x00\x01garbage").unwrap();
    assert!(matches!(ctx.db.is_empty(), Err(DbError::Parse(_))));
}

#[test]
fn concurrent_adds_preserve_invariants() {
    let ctx = TestContext::new();
    let backing_file = ctx.backing_file.clone();

    let mut handles = vec![];
    for t in 0..8 {
        let path = backing_file.clone();
        handles.push(std::thread::spawn(move || {
            // Separate handles, as independent processes would have.
            let db = InstanceDatabase::new(path);
            for k in 0..5 {
                let name = format!("g{t}_{k}");
                let home = format!("/h/{t}/{k}");
                db.add_instance_group(group(&name, &home, &[])).unwrap();
            }
        }));
    }
    for handle in handles {
        handle.join().unwrap();
    }

    let groups = ctx.db.instance_groups().unwrap();
    assert_eq!(groups.len(), 40);
    let unique_names: HashSet<_> = groups.iter().map(|g| g.name.clone()).collect();
    let unique_homes: HashSet<_> = groups.iter().map(|g| g.home_dir.clone()).collect();
    assert_eq!(unique_names.len(), 40);
    assert_eq!(unique_homes.len(), 40);
}

#[test]
fn concurrent_generated_names_never_collide() {
    let ctx = TestContext::new();
    let backing_file = ctx.backing_file.clone();

    let mut handles = vec![];
    for t in 0..4 {
        let path = backing_file.clone();
        handles.push(std::thread::spawn(move || {
            let db = InstanceDatabase::new(path);
            for k in 0..4 {
                db.add_instance_group(group("", &format!("/h/{t}/{k}"), &[]))
                    .unwrap();
            }
        }));
    }
    for handle in handles {
        handle.join().unwrap();
    }

    let groups = ctx.db.instance_groups().unwrap();
    let unique: HashSet<_> = groups.iter().map(|g| g.name.clone()).collect();
    assert_eq!(unique.len(), 16, "generated names are unique under contention");
}

//! Integration tests for the team data store.
//!
//! These tests open real sessions against a database file and verify:
//! - User lifecycle and the grants it implies
//! - Table lifecycle and its side effects
//! - Entry locking across sessions
//! - Reserved-name and permission guards

use std::path::PathBuf;
use std::time::Duration;

use pretty_assertions::assert_eq;
use serde_json::json;
use serial_test::serial;
use team_store::config::SecretString;
use team_store::error::StoreError;
use team_store::storage::{
    Access, Filter, GrantObject, LoginInfo, Minimize, Role, Routine, TeamStore, Value, VarType,
};
use team_store::traits::GrantEngine;
use tempfile::TempDir;

const ROOT_PASSWORD: &str = "integration-root";

// ============================================================================
// Test Utilities
// ============================================================================

/// Bootstrap a database file as root in a temporary directory.
async fn create_root_store() -> (TeamStore, TempDir) {
    let temp_dir = TempDir::new().expect("Failed to create temp dir");
    let store = TeamStore::open_path(db_path(&temp_dir), LoginInfo::superuser(ROOT_PASSWORD))
        .await
        .expect("Failed to open root store");
    (store, temp_dir)
}

fn db_path(dir: &TempDir) -> PathBuf {
    dir.path().join("team.db")
}

/// Open a second session on the same database.
async fn open_as(dir: &TempDir, user: &str, passwd: &str) -> Result<TeamStore, StoreError> {
    TeamStore::open_path(
        db_path(dir),
        LoginInfo::new("10.0.0.7", user, SecretString::new(passwd)),
    )
    .await
}

/// Register and initialize a two-variable, two-objective table.
async fn init_zdt(store: &TeamStore, name: &str) {
    store.create_table(name).await.expect("create_table");
    store
        .init_table(name, VarType::Real, 2, 2, 0, true)
        .await
        .expect("init_table");
}

async fn assert_grants_match_policy(root: &TeamStore, name: &str) {
    let expected = root.expected_grants(name).await.expect("expected_grants");
    let actual = root
        .grant_engine()
        .grants_for(name)
        .await
        .expect("grants_for");
    assert_eq!(actual, expected);
}

// ============================================================================
// User Lifecycle Tests
// ============================================================================

#[tokio::test]
#[serial]
async fn test_create_user_grants_exactly_the_policy() {
    let (root, _dir) = create_root_store().await;
    init_zdt(&root, "zdt1").await;
    init_zdt(&root, "zdt2").await;

    let cases = [
        ("v_none", Role::Viewer, Access::None),
        ("v_all", Role::Viewer, Access::All),
        ("o_one", Role::Operator, Access::Table("zdt1".to_string())),
        ("o_all", Role::Operator, Access::All),
        ("a_one", Role::Admin, Access::Table("zdt2".to_string())),
    ];

    for (name, role, access) in &cases {
        root.create_user(name, "pw", *role, access)
            .await
            .expect("create_user");
        assert!(root.get_user_list(None).await.unwrap().contains(&(*name).to_string()));
        assert_grants_match_policy(&root, name).await;
    }

    let o_one = root.grant_engine().grants_for("o_one").await.unwrap();
    assert!(o_one.contains(&GrantObject::Table("zdt1".to_string())));
    assert!(!o_one.contains(&GrantObject::Table("zdt2".to_string())));
    assert!(o_one.contains(&GrantObject::Routine(Routine::LockEntry)));

    let v_all = root.grant_engine().grants_for("v_all").await.unwrap();
    assert!(v_all.contains(&GrantObject::Table("zdt2".to_string())));
    assert!(!v_all.contains(&GrantObject::Routine(Routine::InitTable)));
    assert!(v_all.contains(&GrantObject::Routine(Routine::QueryProblem)));
}

#[tokio::test]
#[serial]
async fn test_update_user_is_idempotent() {
    let (root, _dir) = create_root_store().await;
    init_zdt(&root, "zdt1").await;
    root.create_user("alice", "pw", Role::Viewer, &Access::None)
        .await
        .unwrap();

    let target = Access::Table("zdt1".to_string());
    assert!(root
        .update_user("alice", "pw2", Role::Operator, &target)
        .await
        .unwrap());
    let once = root.grant_engine().grants_for("alice").await.unwrap();

    assert!(!root
        .update_user("alice", "pw2", Role::Operator, &target)
        .await
        .unwrap());
    let twice = root.grant_engine().grants_for("alice").await.unwrap();

    assert_eq!(once, twice);
    assert_grants_match_policy(&root, "alice").await;
}

#[tokio::test]
#[serial]
async fn test_update_user_access_transitions() {
    let (root, _dir) = create_root_store().await;
    init_zdt(&root, "zdt1").await;
    init_zdt(&root, "zdt2").await;
    root.create_user("bob", "pw", Role::Operator, &Access::All)
        .await
        .unwrap();

    for access in [
        Access::Table("zdt2".to_string()),
        Access::Table("zdt1".to_string()),
        Access::None,
        Access::All,
    ] {
        root.update_user("bob", "pw", Role::Operator, &access)
            .await
            .unwrap();
        assert_grants_match_policy(&root, "bob").await;
    }
}

#[tokio::test]
#[serial]
async fn test_remove_user_guards() {
    let (root, _dir) = create_root_store().await;

    assert_eq!(
        root.remove_user("root").await.unwrap_err(),
        StoreError::SuperuserImmutable {
            name: "root".to_string()
        }
    );
    assert_eq!(
        root.remove_user("ghost").await.unwrap_err(),
        StoreError::UserNotFound {
            name: "ghost".to_string()
        }
    );

    root.create_user("carol", "pw", Role::Viewer, &Access::None)
        .await
        .unwrap();
    root.remove_user("carol").await.unwrap();
    assert!(!root.check_user_exist("carol").await.unwrap());
    assert!(root.grant_engine().grants_for("carol").await.unwrap().is_empty());
}

#[tokio::test]
#[serial]
async fn test_login_and_authentication() {
    let (root, dir) = create_root_store().await;
    root.create_user("dave", "secret", Role::Viewer, &Access::None)
        .await
        .unwrap();

    assert!(matches!(
        open_as(&dir, "dave", "wrong").await,
        Err(StoreError::AuthenticationFailed { .. })
    ));

    let dave = open_as(&dir, "dave", "secret").await.unwrap();
    assert_eq!(dave.get_current_user(), "dave");
    assert!(dave.login_verify("dave", Role::Viewer, "").await.unwrap());
    assert!(!dave.login_verify("dave", Role::Admin, "").await.unwrap());

    let active = root.get_active_user_list(None).await.unwrap();
    assert!(active.iter().any(|u| u.name == "dave" && u.host == "10.0.0.7"));

    dave.quit().await.unwrap();
    let active = root.get_active_user_list(Some(Role::Viewer)).await.unwrap();
    assert!(active.is_empty());
}

#[tokio::test]
#[serial]
async fn test_non_root_on_empty_database_fails() {
    let temp_dir = TempDir::new().unwrap();
    assert!(matches!(
        open_as(&temp_dir, "eve", "pw").await,
        Err(StoreError::CatalogMissing { .. })
    ));
}

#[tokio::test]
#[serial]
async fn test_bootstrap_is_idempotent() {
    let (root, dir) = create_root_store().await;
    root.bootstrap().await.unwrap();
    root.quit().await.unwrap();

    let again = TeamStore::open_path(db_path(&dir), LoginInfo::superuser(ROOT_PASSWORD))
        .await
        .unwrap();
    assert_eq!(again.get_user_list(None).await.unwrap(), vec!["root"]);
}

// ============================================================================
// Table Lifecycle Tests
// ============================================================================

#[tokio::test]
#[serial]
async fn test_create_table_duplicate_and_recreate() {
    let (root, _dir) = create_root_store().await;

    root.create_table("X").await.unwrap();
    assert_eq!(
        root.create_table("X").await.unwrap_err(),
        StoreError::TableExists {
            name: "X".to_string()
        }
    );
    root.remove_table("X").await.unwrap();
    root.create_table("X").await.unwrap();
    assert!(root.check_table_exist("X").await.unwrap());
    assert!(!root.check_inited_table_exist("X").await.unwrap());
}

#[tokio::test]
#[serial]
async fn test_case_variant_table_name_is_taken() {
    let (root, _dir) = create_root_store().await;
    root.create_table("Foo").await.unwrap();
    assert!(matches!(
        root.create_table("foo").await,
        Err(StoreError::TableExists { .. })
    ));
    assert!(root.check_table_exist("FOO").await.unwrap());
    assert_eq!(root.get_table_list().await.unwrap(), vec!["Foo"]);
}

#[tokio::test]
#[serial]
async fn test_init_table_then_query_problem() {
    let (root, _dir) = create_root_store().await;
    root.create_table("dtlz2").await.unwrap();
    root.init_table("dtlz2", VarType::Real, 3, 2, 0, vec![true, false])
        .await
        .unwrap();

    let info = root.query_problem("dtlz2").await.unwrap().unwrap();
    assert_eq!(info.var_type, VarType::Real);
    assert_eq!(info.n_var, 3);
    assert_eq!(info.n_obj, 2);
    assert_eq!(info.n_constr, 0);
    assert_eq!(info.minimize, Minimize::PerObjective(vec![true, false]));
    assert_eq!(info.minimize.flags(info.n_obj), vec![true, false]);
}

#[tokio::test]
#[serial]
async fn test_config_round_trip() {
    let (root, _dir) = create_root_store().await;
    init_zdt(&root, "zdt1").await;

    let cfg = json!({
        "algorithm": "nsga2",
        "population": 100,
        "mutation": {"eta": 20.0, "prob": null},
        "seeds": [1, 2, 3]
    });
    root.update_config("zdt1", &cfg).await.unwrap();
    assert_eq!(root.query_config("zdt1").await.unwrap(), Some(cfg));
}

#[tokio::test]
#[serial]
async fn test_remove_table_clears_every_side_effect() {
    let (root, _dir) = create_root_store().await;
    init_zdt(&root, "zdt1").await;
    root.update_config("zdt1", &json!({"k": 1})).await.unwrap();
    root.create_user("frank", "pw", Role::Operator, &Access::Table("zdt1".to_string()))
        .await
        .unwrap();

    root.remove_table("zdt1").await.unwrap();

    let frank = root.get_user("frank").await.unwrap().unwrap();
    assert_eq!(frank.access, Access::None);
    assert!(root.query_problem("zdt1").await.unwrap().is_none());
    assert!(root.query_config("zdt1").await.unwrap().is_none());
    assert!(!root
        .grant_engine()
        .has_grant("frank", &GrantObject::Table("zdt1".to_string()))
        .await
        .unwrap());
    assert!(!root.check_table_exist("zdt1").await.unwrap());
}

// ============================================================================
// Entry Lock Tests
// ============================================================================

#[tokio::test]
#[serial]
async fn test_lock_check_release() {
    let (root, _dir) = create_root_store().await;
    init_zdt(&root, "zdt1").await;
    let rows: Vec<Vec<Value>> = (0..5)
        .map(|i| vec![Value::Real(f64::from(i)), Value::Real(0.0)])
        .collect();
    root.insert_multiple_data("zdt1", &["x1", "x2"], &rows)
        .await
        .unwrap();

    root.lock_entry("zdt1", 5).await.unwrap();
    assert!(root.check_entry("zdt1", 5).await.unwrap());

    // Locking is a set, not a queued acquire.
    root.lock_entry("zdt1", 5).await.unwrap();

    root.release_entry("zdt1", 5).await.unwrap();
    assert!(!root.check_entry("zdt1", 5).await.unwrap());

    assert!(matches!(
        root.check_entry("zdt1", 99).await,
        Err(StoreError::EntryNotFound { row: 99, .. })
    ));
}

#[tokio::test]
#[serial]
async fn test_claim_entry_succeeds_once_across_sessions() {
    let (root, dir) = create_root_store().await;
    init_zdt(&root, "zdt1").await;
    root.insert_data("zdt1", &["x1", "x2"], &[Value::Real(0.1), Value::Real(0.2)])
        .await
        .unwrap();
    for name in ["w1", "w2"] {
        root.create_user(name, "pw", Role::Operator, &Access::All)
            .await
            .unwrap();
    }

    let w1 = open_as(&dir, "w1", "pw").await.unwrap();
    let w2 = open_as(&dir, "w2", "pw").await.unwrap();

    let (a, b) = tokio::join!(w1.claim_entry("zdt1", 1), w2.claim_entry("zdt1", 1));
    let wins = [a.unwrap(), b.unwrap()].iter().filter(|won| **won).count();
    assert_eq!(wins, 1);

    let lock = root.entry_lock("zdt1", 1).await.unwrap();
    assert!(lock.locked);
    assert!(matches!(lock.locked_by.as_deref(), Some("w1" | "w2")));
}

#[tokio::test]
#[serial]
async fn test_optimistic_write_and_stale_release() {
    let (root, _dir) = create_root_store().await;
    init_zdt(&root, "zdt1").await;
    root.insert_data("zdt1", &["x1", "x2"], &[Value::Real(0.1), Value::Real(0.2)])
        .await
        .unwrap();

    root.lock_entry("zdt1", 1).await.unwrap();
    let version = root.entry_version("zdt1", 1).await.unwrap();

    assert!(root
        .update_entry_if_version("zdt1", 1, version, &["f1", "f2"], &[
            Value::Real(1.0),
            Value::Real(2.0)
        ])
        .await
        .unwrap());
    assert!(!root
        .update_entry_if_version("zdt1", 1, version, &["f1"], &[Value::Real(9.0)])
        .await
        .unwrap());

    tokio::time::sleep(Duration::from_millis(20)).await;
    assert_eq!(
        root.release_stale_entries("zdt1", Duration::from_millis(1))
            .await
            .unwrap(),
        1
    );
    assert!(!root.check_entry("zdt1", 1).await.unwrap());

    let status = root
        .select_data("zdt1", &["status"], &Filter::new().eq("id", 1_i64))
        .await
        .unwrap();
    assert_eq!(status, vec![vec![Value::from("evaluated")]]);
}

#[tokio::test]
#[serial]
async fn test_checksum_detects_other_workers() {
    let (root, dir) = create_root_store().await;
    init_zdt(&root, "zdt1").await;
    root.create_user("w1", "pw", Role::Operator, &Access::All)
        .await
        .unwrap();
    let w1 = open_as(&dir, "w1", "pw").await.unwrap();

    let before = root.get_checksum("zdt1").await.unwrap();
    assert_eq!(w1.get_checksum("zdt1").await.unwrap(), before);

    w1.insert_data("zdt1", &["x1", "x2"], &[Value::Real(0.4), Value::Real(0.6)])
        .await
        .unwrap();
    let after = root.get_checksum("zdt1").await.unwrap();
    assert_ne!(after, before);

    w1.lock_entry("zdt1", 1).await.unwrap();
    assert_ne!(root.get_checksum("zdt1").await.unwrap(), after);
}

// ============================================================================
// Guard Tests
// ============================================================================

#[tokio::test]
#[serial]
async fn test_reserved_names_fail_before_authorization() {
    let (root, dir) = create_root_store().await;
    root.create_user("grace", "pw", Role::Viewer, &Access::None)
        .await
        .unwrap();
    let grace = open_as(&dir, "grace", "pw").await.unwrap();

    for name in ["_user", "_grant", "_Session", "sqlite_master"] {
        let reserved = StoreError::ReservedName {
            name: name.to_string(),
        };
        assert_eq!(grace.check_table_exist(name).await.unwrap_err(), reserved);
        assert_eq!(grace.check_inited_table_exist(name).await.unwrap_err(), reserved);
        assert_eq!(grace.query_problem(name).await.unwrap_err(), reserved);
        assert_eq!(grace.query_config(name).await.unwrap_err(), reserved);
        assert_eq!(grace.check_entry(name, 1).await.unwrap_err(), reserved);
        assert_eq!(grace.load_table(name).await.unwrap_err(), reserved);
        assert_eq!(root.create_table(name).await.unwrap_err(), reserved);
        assert_eq!(root.remove_table(name).await.unwrap_err(), reserved);
        assert_eq!(
            root.init_table(name, VarType::Real, 1, 1, 0, true)
                .await
                .unwrap_err(),
            reserved
        );
    }
}

#[tokio::test]
#[serial]
async fn test_non_root_without_grants_is_denied() {
    let (root, dir) = create_root_store().await;
    init_zdt(&root, "zdt1").await;
    root.insert_data("zdt1", &["x1", "x2"], &[Value::Real(0.1), Value::Real(0.2)])
        .await
        .unwrap();
    root.create_user("henry", "pw", Role::Viewer, &Access::None)
        .await
        .unwrap();
    let henry = open_as(&dir, "henry", "pw").await.unwrap();

    assert!(matches!(
        henry.create_table("zdt9").await,
        Err(StoreError::PermissionDenied { .. })
    ));
    assert!(matches!(
        henry.lock_entry("zdt1", 1).await,
        Err(StoreError::PermissionDenied { .. })
    ));
    assert!(matches!(
        henry.select_data("zdt1", &[], &Filter::new()).await,
        Err(StoreError::PermissionDenied { .. })
    ));
    assert!(matches!(
        henry.get_user_list(None).await,
        Err(StoreError::PermissionDenied { .. })
    ));

    // Viewer routines still work.
    assert!(henry.check_inited_table_exist("zdt1").await.unwrap());
    assert!(!henry.check_entry("zdt1", 1).await.unwrap());
}

#[tokio::test]
#[serial]
async fn test_reconciliation_repairs_drift() {
    let (root, _dir) = create_root_store().await;
    init_zdt(&root, "zdt1").await;
    root.create_user("ivy", "pw", Role::Operator, &Access::All)
        .await
        .unwrap();

    root.grant_engine()
        .revoke("ivy", &GrantObject::Table("zdt1".to_string()))
        .await
        .unwrap();
    root.grant_engine()
        .grant("ivy", &GrantObject::Table("_user".to_string()))
        .await
        .unwrap();

    let changed = root.reconcile_all_grants().await.unwrap();
    assert_eq!(changed.len(), 1);
    let (name, diff) = &changed[0];
    assert_eq!(name, "ivy");
    assert_eq!(diff.granted, vec![GrantObject::Table("zdt1".to_string())]);
    assert_eq!(diff.revoked, vec![GrantObject::Table("_user".to_string())]);

    assert_grants_match_policy(&root, "ivy").await;
    assert!(root.reconcile_grants("ivy").await.unwrap().is_empty());
}

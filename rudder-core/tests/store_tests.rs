//! Store error-message, atomic-write and definition-loading tests.
//! Layout: ~/.rudder/apps/<name>.yaml and ~/.rudder/status/<name>.json

use assert_fs::prelude::*;
use predicates::prelude::predicate;
use rudder_core::{
    store,
    types::{AppName, AppRecord, OperationPhase, SyncOperation, Trigger},
    StoreError,
};

const GUESTBOOK: &str = r#"
apiVersion: rudder.dev/v1
kind: Application
metadata:
  name: guestbook
spec:
  source:
    repoURL: /srv/gitops
    path: guestbook
  destination:
    server: local
    namespace: guestbook
  syncPolicy:
    automated:
      prune: true
"#;

// ---------------------------------------------------------------------------
// 1. Root definitions
// ---------------------------------------------------------------------------

#[test]
fn root_definitions_are_loaded_sorted_and_non_yaml_ignored() {
    let home = assert_fs::TempDir::new().expect("tempdir");
    let apps = home.child(".rudder/apps");
    apps.child("b.yaml").write_str(GUESTBOOK).expect("write");
    apps.child("a.yml")
        .write_str(&GUESTBOOK.replace("name: guestbook", "name: alpha"))
        .expect("write");
    apps.child("README.md").write_str("# notes").expect("write");
    apps.child("b.yaml.tmp").write_str("garbage").expect("write");

    let scan = store::scan_root_apps_at(home.path()).expect("scan");
    let names: Vec<_> = scan.definitions.iter().map(|d| d.app.name.0.as_str()).collect();
    assert_eq!(names, vec!["alpha", "guestbook"]);
    assert!(scan.definitions[0].path.ends_with("a.yml"));
    assert!(scan.definitions[1].app.sync_policy.automated);
    assert!(scan.errors.is_empty());
}

#[test]
fn invalid_definition_reports_file_path() {
    let home = assert_fs::TempDir::new().expect("tempdir");
    home.child(".rudder/apps/broken.yaml")
        .write_str("kind: Application\nmetadata:\n  name: broken\nspec: {}\n")
        .expect("write");

    let scan = store::scan_root_apps_at(home.path()).expect("scan");
    assert!(scan.definitions.is_empty());
    let err = &scan.errors[0];
    assert!(matches!(err, StoreError::Definition { .. }), "got: {err}");
    assert!(err.to_string().contains("broken.yaml"));
    assert!(scan.unreadable.contains(&AppName::from("broken")));
}

#[test]
fn one_bad_definition_does_not_hide_the_others() {
    let home = assert_fs::TempDir::new().expect("tempdir");
    let apps = home.child(".rudder/apps");
    apps.child("guestbook.yaml").write_str(GUESTBOOK).expect("write");
    apps.child("legacy.yaml")
        .write_str("kind: Application\nmetadata:\n  name: billing\nspec: {}\n")
        .expect("write");

    let scan = store::scan_root_apps_at(home.path()).expect("scan");
    assert_eq!(scan.apps().len(), 1);
    assert_eq!(scan.apps()[0].name, AppName::from("guestbook"));
    assert_eq!(scan.errors.len(), 1);
    assert!(scan.unreadable.contains(&AppName::from("legacy")));
    assert!(scan.unreadable.contains(&AppName::from("billing")));
    assert!(!scan.unreadable.contains(&AppName::from("guestbook")));
}

#[test]
fn corrupt_yaml_is_a_parse_error() {
    let home = assert_fs::TempDir::new().expect("tempdir");
    home.child(".rudder/apps/bad.yaml")
        .write_str(": : corrupt : yaml : !!!\n  - broken: [unclosed")
        .expect("write");
    let scan = store::scan_root_apps_at(home.path()).expect("scan");
    assert!(matches!(scan.errors[0], StoreError::Parse { .. }), "got: {:?}", scan.errors);
    assert!(scan.unreadable.contains(&AppName::from("bad")));
}

#[test]
fn duplicate_application_name_keeps_the_first_file() {
    let home = assert_fs::TempDir::new().expect("tempdir");
    let apps = home.child(".rudder/apps");
    apps.child("one.yaml").write_str(GUESTBOOK).expect("write");
    apps.child("two.yaml").write_str(GUESTBOOK).expect("write");
    let scan = store::scan_root_apps_at(home.path()).expect("scan");
    assert_eq!(scan.definitions.len(), 1);
    assert!(scan.definitions[0].path.ends_with("one.yaml"));
    assert_eq!(scan.errors.len(), 1);
    let message = scan.errors[0].to_string();
    assert!(message.contains("duplicate application 'guestbook'"), "{message}");
    assert!(message.contains("two.yaml"), "{message}");
}

// ---------------------------------------------------------------------------
// 2. Status records
// ---------------------------------------------------------------------------

#[test]
fn record_with_operation_survives_restart() {
    let home = assert_fs::TempDir::new().expect("tempdir");
    home.child(".rudder/apps/guestbook.yaml")
        .write_str(GUESTBOOK)
        .expect("write");
    let app = store::scan_root_apps_at(home.path())
        .expect("scan")
        .definitions
        .remove(0)
        .app;

    let mut record = AppRecord::new(app, None);
    let mut op = SyncOperation::new(record.app.name.clone(), Trigger::Manual, "abc123", false);
    op.finish(OperationPhase::Succeeded, "successfully synced");
    record.status.operation = Some(op);
    record.status.synced_revision = Some("abc123".into());
    store::save_record_at(home.path(), &mut record).expect("save");

    home.child(".rudder/status/guestbook.json")
        .assert(predicate::path::exists());
    home.child(".rudder/status/guestbook.json")
        .assert(predicate::str::contains("\"Succeeded\""));

    let back = store::load_record_at(home.path(), &AppName::from("guestbook")).expect("load");
    assert_eq!(back, record);
}

#[test]
fn corrupt_record_is_a_parse_error_with_path() {
    let home = assert_fs::TempDir::new().expect("tempdir");
    home.child(".rudder/status/guestbook.json")
        .write_str("{ not json")
        .expect("write");
    let err = store::load_record_at(home.path(), &AppName::from("guestbook")).unwrap_err();
    assert!(matches!(err, StoreError::Parse { .. }), "got: {err}");
    assert!(err.to_string().contains("guestbook.json"));
}

#[cfg(unix)]
#[test]
fn record_file_is_private() {
    use std::os::unix::fs::PermissionsExt;
    let home = assert_fs::TempDir::new().expect("tempdir");
    home.child(".rudder/apps/guestbook.yaml")
        .write_str(GUESTBOOK)
        .expect("write");
    let app = store::scan_root_apps_at(home.path())
        .expect("scan")
        .definitions
        .remove(0)
        .app;
    let mut record = AppRecord::new(app, None);
    store::save_record_at(home.path(), &mut record).expect("save");

    let path = store::record_path_at(home.path(), &record.app.name);
    let mode = std::fs::metadata(path).expect("meta").permissions().mode() & 0o777;
    assert_eq!(mode, 0o600);
}

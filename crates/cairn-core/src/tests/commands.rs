use std::fs;

use crate::commands::create::{self, CreateOptions};
use crate::commands::key;
use crate::commands::list;
use crate::commands::{break_lock, open_session};
use crate::crypto::key::KeyMode;
use crate::repo::Access;
use crate::testutil::TestEnv;
use cairn_types::error::CairnError;

fn backup(env: &TestEnv, name: &str) -> create::CreateResult {
    create::run(
        &env.repo_path(),
        &CreateOptions {
            archive_name: name.into(),
            paths: vec![env.src_path()],
            ..Default::default()
        },
        &env.runtime,
        None,
    )
    .unwrap()
}

#[test]
fn keyfile_mode_end_to_end() {
    let env = TestEnv::new(KeyMode::Keyfile);
    fs::write(env.src_path().join("doc.txt"), b"keyfile-protected").unwrap();

    backup(&env, "snap");
    let archives = list::archives(&env.repo_path(), false, &env.runtime, None).unwrap();
    assert_eq!(archives.len(), 1);
    assert_eq!(archives[0].name, "snap");

    // The key file lives client-side; without it the repo cannot open.
    let key_dir = env.runtime.key_dir().unwrap();
    let key_file = fs::read_dir(&key_dir).unwrap().next().unwrap().unwrap();
    fs::remove_file(key_file.path()).unwrap();
    assert!(matches!(
        list::archives(&env.repo_path(), false, &env.runtime, None),
        Err(CairnError::KeyFileNotFound(_))
    ));
}

#[test]
fn repokey_change_passphrase() {
    let env = TestEnv::new(KeyMode::Repokey);
    fs::write(env.src_path().join("f"), b"data").unwrap();
    backup(&env, "before-change");

    let mut runtime = env.runtime.clone();
    runtime.new_passphrase = Some("rotated".into());
    key::change_passphrase(&env.repo_path(), &runtime, None).unwrap();

    // Old passphrase no longer unlocks.
    assert!(matches!(
        list::archives(&env.repo_path(), false, &env.runtime, None),
        Err(CairnError::DecryptionFailed)
    ));

    // New one does, and the data is untouched.
    let mut rotated = env.runtime.clone();
    rotated.passphrase = Some("rotated".into());
    let archives = list::archives(&env.repo_path(), false, &rotated, None).unwrap();
    assert_eq!(archives[0].name, "before-change");
}

#[test]
fn key_export_writes_a_loadable_file() {
    let env = TestEnv::new(KeyMode::Repokey);
    let dest = env.dir.path().join("exported-key");
    key::export(&env.repo_path(), &dest, &env.runtime, None).unwrap();

    let exported = crate::crypto::key::load_keyfile(&dest).unwrap();
    assert_eq!(exported.version, 1);
    assert_eq!(exported.repo_id.len(), 32);
}

#[test]
fn break_lock_clears_a_stale_holder() {
    let env = TestEnv::new(KeyMode::None);
    // Forge a foreign exclusive lock (alive pid on another host, so it is
    // not auto-broken).
    let lock_dir = env.repo_path().join("lock.exclusive");
    fs::create_dir(&lock_dir).unwrap();
    fs::write(
        lock_dir.join("owner"),
        serde_json::to_vec(&serde_json::json!({
            "host_id": "elsewhere",
            "pid": 1,
            "time": chrono::Utc::now(),
        }))
        .unwrap(),
    )
    .unwrap();

    assert!(matches!(
        open_session(&env.repo_path(), Access::ReadWrite, &env.runtime, None, ""),
        Err(CairnError::Locked(_))
    ));

    assert_eq!(break_lock(&env.repo_path()).unwrap(), 1);
    let session = open_session(&env.repo_path(), Access::ReadWrite, &env.runtime, None, "").unwrap();
    drop(session);
}

#[test]
fn tam_upgrade_is_idempotent() {
    let env = TestEnv::new(KeyMode::Repokey);
    // Fresh repositories already require and carry a TAM; the upgrade is
    // a no-op that must not disturb anything.
    key::tam_upgrade(&env.repo_path(), &env.runtime, None).unwrap();
    fs::write(env.src_path().join("f"), b"x").unwrap();
    backup(&env, "after-upgrade");
}

#[test]
fn duplicate_archive_name_is_refused() {
    let env = TestEnv::new(KeyMode::None);
    fs::write(env.src_path().join("f"), b"x").unwrap();
    backup(&env, "same");
    let err = create::run(
        &env.repo_path(),
        &CreateOptions {
            archive_name: "same".into(),
            paths: vec![env.src_path()],
            ..Default::default()
        },
        &env.runtime,
        None,
    )
    .unwrap_err();
    assert!(matches!(err, CairnError::ArchiveAlreadyExists(_)));
}

#[test]
fn archive_names_with_slash_are_refused() {
    let env = TestEnv::new(KeyMode::None);
    let err = create::run(
        &env.repo_path(),
        &CreateOptions {
            archive_name: "bad/name".into(),
            paths: vec![env.src_path()],
            ..Default::default()
        },
        &env.runtime,
        None,
    )
    .unwrap_err();
    assert!(matches!(err, CairnError::InvalidArchiveName(_)));
}

#[test]
fn relocated_repository_is_refused_until_acknowledged() {
    let env = TestEnv::new(KeyMode::Repokey);
    fs::write(env.src_path().join("f"), b"x").unwrap();
    backup(&env, "pre-move");

    // Move the repository directory.
    let moved = env.dir.path().join("repo-moved");
    fs::rename(env.repo_path(), &moved).unwrap();

    assert!(matches!(
        list::archives(&moved, false, &env.runtime, None),
        Err(CairnError::RepositoryRelocated { .. })
    ));

    let mut acked = env.runtime.clone();
    acked.relocated_repo_ok = true;
    let archives = list::archives(&moved, false, &acked, None).unwrap();
    assert_eq!(archives[0].name, "pre-move");
}

//! End-to-end lifecycle tests: init, backup, restore, dedup, delete,
//! prune, corruption recovery.

use std::fs;
use std::path::{Path, PathBuf};

use cairn_core::commands::check::{self, CheckOptions};
use cairn_core::commands::create::{self, CreateOptions};
use cairn_core::commands::delete::{self, DeleteOptions};
use cairn_core::commands::extract::{self, ExtractOptions};
use cairn_core::commands::info;
use cairn_core::commands::init::{self, InitOptions};
use cairn_core::commands::list;
use cairn_core::commands::prune::{self, PruneOptions};
use cairn_core::commands::recreate::{self, RecreateOptions};
use cairn_core::config::{ChunkerParams, RuntimeConfig};
use cairn_core::crypto::key::KeyMode;
use cairn_core::crypto::CipherSuite;
use cairn_core::prune::RetentionPolicy;
use cairn_core::repo::{Access, Repository};
use cairn_core::CairnError;

const PASSPHRASE: &str = "pw";

fn runtime(base: &Path) -> RuntimeConfig {
    RuntimeConfig {
        passphrase: Some(PASSPHRASE.to_string()),
        cache_dir: Some(base.join("cache")),
        config_dir: Some(base.join("cfg")),
        security_dir: Some(base.join("security")),
        unknown_unencrypted_repo_ok: true,
        ..Default::default()
    }
}

fn small_params() -> ChunkerParams {
    ChunkerParams {
        min_size: 128,
        max_size: 4096,
        mask_bits: 8,
        window_size: 63,
    }
}

struct Env {
    _dir: tempfile::TempDir,
    base: PathBuf,
    runtime: RuntimeConfig,
}

impl Env {
    fn new() -> Self {
        let dir = tempfile::tempdir().unwrap();
        let base = dir.path().to_path_buf();
        let runtime = runtime(&base);
        init::run(
            &base.join("repo"),
            &InitOptions {
                key_mode: KeyMode::Repokey,
                suite: CipherSuite::Chacha20Poly1305,
                chunker_params: small_params(),
                compression: Some("auto,lz4".into()),
            },
            &runtime,
            None,
        )
        .unwrap();
        Self {
            _dir: dir,
            base,
            runtime,
        }
    }

    fn repo(&self) -> PathBuf {
        self.base.join("repo")
    }

    fn src(&self) -> PathBuf {
        let p = self.base.join("src");
        fs::create_dir_all(&p).unwrap();
        p
    }

    fn create(&self, name: &str) -> create::CreateResult {
        create::run(
            &self.repo(),
            &CreateOptions {
                archive_name: name.to_string(),
                paths: vec![self.src()],
                ..Default::default()
            },
            &self.runtime,
            None,
        )
        .unwrap()
    }

    fn archive_names(&self) -> Vec<String> {
        list::archives(&self.repo(), false, &self.runtime, None)
            .unwrap()
            .into_iter()
            .map(|a| a.name)
            .collect()
    }

    /// Number of objects in the repository (manifest included).
    fn object_count(&self) -> usize {
        let repo = Repository::open(&self.repo(), Access::ReadOnly, "census").unwrap();
        repo.len()
    }
}

fn patterned(len: usize, seed: u64) -> Vec<u8> {
    let mut state = seed.wrapping_add(0x9e37_79b9_7f4a_7c15);
    let mut out = Vec::with_capacity(len + 8);
    while out.len() < len {
        state ^= state << 13;
        state ^= state >> 7;
        state ^= state << 17;
        out.extend_from_slice(&state.to_le_bytes());
    }
    out.truncate(len);
    out
}

#[test]
fn backup_and_restore_roundtrip() {
    let env = Env::new();
    let src = env.src();

    fs::create_dir_all(src.join("sub/deep")).unwrap();
    fs::write(src.join("a.bin"), patterned(300_000, 1)).unwrap();
    fs::write(src.join("sub/b.txt"), b"short text file").unwrap();
    fs::write(src.join("sub/deep/c.bin"), patterned(10_000, 2)).unwrap();
    fs::write(src.join("empty"), b"").unwrap();
    #[cfg(unix)]
    std::os::unix::fs::symlink("a.bin", src.join("link")).unwrap();

    let result = env.create("roundtrip");
    assert!(!result.cancelled);
    assert_eq!(result.stats.nfiles, 4);

    let dest = env.base.join("restore");
    let stats = extract::run(
        &env.repo(),
        &ExtractOptions {
            archive: "roundtrip".into(),
            dest: dest.clone(),
            matcher: None,
        },
        &env.runtime,
        None,
    )
    .unwrap();
    assert_eq!(stats.errors, 0);
    assert_eq!(stats.files, 4);

    // Items store source-relative normalised paths, so the tree comes
    // back under its original (root-stripped) layout.
    let restored = dest.join(src.strip_prefix("/").unwrap_or(&src));
    assert_eq!(
        fs::read(restored.join("a.bin")).unwrap(),
        patterned(300_000, 1)
    );
    assert_eq!(
        fs::read(restored.join("sub/b.txt")).unwrap(),
        b"short text file"
    );
    assert_eq!(
        fs::read(restored.join("sub/deep/c.bin")).unwrap(),
        patterned(10_000, 2)
    );
    assert_eq!(fs::read(restored.join("empty")).unwrap(), b"");
    #[cfg(unix)]
    {
        let target = fs::read_link(restored.join("link")).unwrap();
        assert_eq!(target, PathBuf::from("a.bin"));
    }
}

#[test]
fn shared_content_deduplicates_within_archive() {
    let env = Env::new();
    let src = env.src();

    // Two 1 MiB files differing only by a trailing byte share all their
    // full chunks.
    let zeros = vec![0u8; 1024 * 1024];
    let mut zeros_x = zeros.clone();
    zeros_x.push(b'x');
    fs::write(src.join("a"), &zeros).unwrap();
    fs::write(src.join("b"), &zeros_x).unwrap();

    let result = env.create("M");
    assert!(
        result.stats.deduplicated_size < result.stats.original_size / 2,
        "dedup {} vs original {}",
        result.stats.deduplicated_size,
        result.stats.original_size
    );

    let mut paths = Vec::new();
    list::items(&env.repo(), "M", &env.runtime, None, |item| {
        paths.push(item.path);
        Ok(())
    })
    .unwrap();
    assert!(paths.iter().any(|p| p.ends_with("/a") || p == "a"));
    assert!(paths.iter().any(|p| p.ends_with("/b") || p == "b"));

    let repo_info = info::repository(&env.repo(), &env.runtime, None).unwrap();
    assert!(repo_info.deduplicated_size < repo_info.original_size);
}

#[test]
fn identical_create_adds_archives_but_no_data() {
    let env = Env::new();
    let src = env.src();
    fs::write(src.join("data.bin"), patterned(500_000, 3)).unwrap();

    env.create("first");
    let before = env.object_count();

    let second = env.create("second");
    let after = env.object_count();

    assert_eq!(env.archive_names(), vec!["first", "second"]);
    assert_eq!(
        second.stats.deduplicated_size, 0,
        "identical tree must write no new data"
    );
    // Only the archive metadata object is new: the item stream bytes are
    // identical (same items), so even the meta-chunks deduplicate.
    assert!(
        after - before <= 2,
        "second identical backup added {} objects",
        after - before
    );
}

#[test]
fn appending_one_byte_stores_only_the_tail() {
    let env = Env::new();
    let src = env.src();

    let zeros = vec![0u8; 1024 * 1024];
    fs::write(src.join("a"), &zeros).unwrap();
    let mut b_content = zeros.clone();
    b_content.push(b'x');
    fs::write(src.join("b"), &b_content).unwrap();

    env.create("T1");
    let before = env.object_count();

    b_content.push(b'y');
    fs::write(src.join("b"), &b_content).unwrap();

    env.create("T2");
    let after = env.object_count();

    // One new tail chunk, one or two item-stream chunks, one archive
    // object. The shared megabyte of zeros stays put.
    let added = after - before;
    assert!(
        (2..=4).contains(&added),
        "T2 added {added} objects, expected the tail plus metadata"
    );
}

#[test]
fn delete_removes_solely_referenced_chunks() {
    let env = Env::new();
    let src = env.src();

    fs::write(src.join("shared.bin"), patterned(200_000, 4)).unwrap();
    env.create("M");
    env.create("T1");

    fs::write(src.join("only-t2.bin"), patterned(150_000, 5)).unwrap();
    env.create("T2");
    let with_t2 = env.object_count();

    let stats = delete::run(
        &env.repo(),
        &DeleteOptions {
            archives: vec!["T2".into()],
            dry_run: false,
        },
        &env.runtime,
        None,
    )
    .unwrap();
    assert_eq!(stats.archives_deleted, 1);
    assert!(stats.chunks_deleted > 0, "T2's unique chunks must go");

    assert_eq!(env.archive_names(), vec!["M", "T1"]);
    assert!(env.object_count() < with_t2);

    // Shared data still restores through the surviving archives.
    let dest = env.base.join("after-delete");
    let stats = extract::run(
        &env.repo(),
        &ExtractOptions {
            archive: "T1".into(),
            dest: dest.clone(),
            matcher: None,
        },
        &env.runtime,
        None,
    )
    .unwrap();
    assert_eq!(stats.errors, 0);
}

#[test]
fn deleting_unknown_archive_is_a_clean_error() {
    let env = Env::new();
    let src = env.src();
    fs::write(src.join("f"), b"content").unwrap();
    env.create("real");
    let before = env.object_count();

    let err = delete::run(
        &env.repo(),
        &DeleteOptions {
            archives: vec!["no-such-archive".into()],
            dry_run: false,
        },
        &env.runtime,
        None,
    )
    .unwrap_err();
    assert!(matches!(err, CairnError::ArchiveNotFound(_)));
    assert_eq!(err.exit_code(), 2);
    assert_eq!(env.object_count(), before, "failed delete had side effects");
}

#[test]
fn corruption_is_found_repaired_and_reconverges() {
    let env = Env::new();
    let src = env.src();
    fs::write(src.join("data.bin"), patterned(100_000, 6)).unwrap();
    env.create("A");

    // Find a data chunk's physical location and flip one byte in it.
    let mut victim = None;
    list::items(&env.repo(), "A", &env.runtime, None, |item| {
        if let Some(first) = item.chunks.first() {
            victim = Some(first.id);
        }
        Ok(())
    })
    .unwrap();
    let victim = victim.expect("archive has a file with chunks");
    {
        let repo = Repository::open(&env.repo(), Access::ReadOnly, "surgeon").unwrap();
        let location = repo.index().get(&victim).unwrap();
        let path = repo.segment_path(location.segment);
        drop(repo);
        let mut raw = fs::read(&path).unwrap();
        raw[location.offset as usize + 60] ^= 0xFF;
        fs::write(&path, &raw).unwrap();
    }

    // check: the CRC failure is reported.
    let report = check::run(&env.repo(), &CheckOptions::default(), &env.runtime, None).unwrap();
    assert!(!report.is_ok(), "corruption went unnoticed");
    assert!(!report.repo.issues.is_empty());

    // check --repair: the object is dropped, the item marked broken with
    // a zero-chunk substitute.
    let report = check::run(
        &env.repo(),
        &CheckOptions {
            repair: true,
            verify_data: true,
            max_duration: None,
        },
        &env.runtime,
        None,
    )
    .unwrap();
    assert!(!report.errors.is_empty());

    let mut broken_items = 0;
    list::items(&env.repo(), "A", &env.runtime, None, |item| {
        if item.broken {
            broken_items += 1;
        }
        Ok(())
    })
    .unwrap();
    assert_eq!(broken_items, 1);

    // A new backup of the same tree restores the lost plaintext.
    env.create("B");

    // Repair again: the broken item heals from the reappeared chunk.
    check::run(
        &env.repo(),
        &CheckOptions {
            repair: true,
            verify_data: true,
            max_duration: None,
        },
        &env.runtime,
        None,
    )
    .unwrap();

    let report = check::run(
        &env.repo(),
        &CheckOptions {
            repair: false,
            verify_data: true,
            max_duration: None,
        },
        &env.runtime,
        None,
    )
    .unwrap();
    assert!(report.is_ok(), "repo still dirty: {:?}", report.errors);

    let mut broken_items = 0;
    list::items(&env.repo(), "A", &env.runtime, None, |item| {
        if item.broken {
            broken_items += 1;
        }
        Ok(())
    })
    .unwrap();
    assert_eq!(broken_items, 0, "item did not heal");

    // The healed archive restores bit-identical content.
    let dest = env.base.join("healed");
    extract::run(
        &env.repo(),
        &ExtractOptions {
            archive: "A".into(),
            dest: dest.clone(),
            matcher: None,
        },
        &env.runtime,
        None,
    )
    .unwrap();
    let restored = walk_single_file(&dest, "data.bin");
    assert_eq!(fs::read(restored).unwrap(), patterned(100_000, 6));
}

fn walk_single_file(root: &Path, name: &str) -> PathBuf {
    let mut stack = vec![root.to_path_buf()];
    while let Some(dir) = stack.pop() {
        for entry in fs::read_dir(&dir).unwrap().flatten() {
            let path = entry.path();
            if path.is_dir() {
                stack.push(path);
            } else if path.file_name().is_some_and(|n| n == name) {
                return path;
            }
        }
    }
    panic!("{name} not found under {}", root.display());
}

#[test]
fn prune_keep_last_two() {
    let env = Env::new();
    let src = env.src();
    fs::write(src.join("f.bin"), patterned(50_000, 7)).unwrap();

    for name in ["t1", "t2", "t3", "t4"] {
        env.create(name);
    }

    let result = prune::run(
        &env.repo(),
        &PruneOptions {
            policy: RetentionPolicy {
                keep_last: Some(2),
                ..Default::default()
            },
            dry_run: false,
        },
        &env.runtime,
        None,
    )
    .unwrap();
    assert_eq!(result.archives_deleted, 2);
    assert_eq!(env.archive_names(), vec!["t3", "t4"]);

    // Idempotent: a second run deletes nothing.
    let again = prune::run(
        &env.repo(),
        &PruneOptions {
            policy: RetentionPolicy {
                keep_last: Some(2),
                ..Default::default()
            },
            dry_run: false,
        },
        &env.runtime,
        None,
    )
    .unwrap();
    assert_eq!(again.archives_deleted, 0);
}

#[test]
fn interrupted_transaction_rolls_back_to_last_commit() {
    let env = Env::new();
    let src = env.src();
    fs::write(src.join("f.bin"), patterned(80_000, 8)).unwrap();
    env.create("stable");
    let committed = env.object_count();

    // Simulate a crash mid-backup: raw uncommitted writes, then drop.
    {
        let mut repo = Repository::open(&env.repo(), Access::ReadWrite, "crasher").unwrap();
        repo.put(&cairn_core::ChunkId([0xEE; 32]), b"doomed object")
            .unwrap();
        // dropped without commit
    }

    assert_eq!(env.object_count(), committed);
    let report = check::run(&env.repo(), &CheckOptions::default(), &env.runtime, None).unwrap();
    assert!(report.is_ok());
    assert_eq!(env.archive_names(), vec!["stable"]);
}

#[test]
fn cancelled_backup_leaves_hidden_checkpoint() {
    let env = Env::new();
    let src = env.src();
    fs::write(src.join("f.bin"), patterned(60_000, 9)).unwrap();

    let cancel = std::sync::Arc::new(std::sync::atomic::AtomicBool::new(true));
    let result = create::run(
        &env.repo(),
        &CreateOptions {
            archive_name: "interrupted".into(),
            paths: vec![env.src()],
            cancel: Some(cancel),
            ..Default::default()
        },
        &env.runtime,
        None,
    )
    .unwrap();
    assert!(result.cancelled);
    assert_eq!(result.name, "interrupted.checkpoint");

    // Hidden from normal listings, visible on request.
    assert!(env.archive_names().is_empty());
    let all: Vec<String> = list::archives(&env.repo(), true, &env.runtime, None)
        .unwrap()
        .into_iter()
        .map(|a| a.name)
        .collect();
    assert_eq!(all, vec!["interrupted.checkpoint"]);
}

#[test]
fn recreate_with_new_compression_preserves_content() {
    let env = Env::new();
    let src = env.src();
    let content = patterned(250_000, 10);
    fs::write(src.join("payload.bin"), &content).unwrap();
    env.create("original");

    recreate::run(
        &env.repo(),
        &RecreateOptions {
            archives: vec!["original".into()],
            chunker_params: Some(ChunkerParams {
                min_size: 256,
                max_size: 8192,
                mask_bits: 9,
                window_size: 63,
            }),
            compression: Some("zstd,3".into()),
            comment: Some("recompressed".into()),
        },
        &env.runtime,
        None,
    )
    .unwrap();

    assert_eq!(env.archive_names(), vec!["original"]);

    let dest = env.base.join("recreated");
    let stats = extract::run(
        &env.repo(),
        &ExtractOptions {
            archive: "original".into(),
            dest: dest.clone(),
            matcher: None,
        },
        &env.runtime,
        None,
    )
    .unwrap();
    assert_eq!(stats.errors, 0);
    assert_eq!(fs::read(walk_single_file(&dest, "payload.bin")).unwrap(), content);

    let report = check::run(
        &env.repo(),
        &CheckOptions {
            repair: false,
            verify_data: true,
            max_duration: None,
        },
        &env.runtime,
        None,
    )
    .unwrap();
    assert!(report.is_ok(), "recreate left dangling state: {:?}", report.errors);
}

#[test]
fn wrong_passphrase_is_rejected() {
    let env = Env::new();
    let src = env.src();
    fs::write(src.join("f"), b"secret").unwrap();
    env.create("locked");

    let mut bad = env.runtime.clone();
    bad.passphrase = Some("not-the-passphrase".into());
    let err = list::archives(&env.repo(), false, &bad, None).unwrap_err();
    assert!(matches!(err, CairnError::DecryptionFailed));
}

#[test]
fn placeholder_archive_names_expand() {
    let env = Env::new();
    let src = env.src();
    fs::write(src.join("f"), b"x").unwrap();

    let result = create::run(
        &env.repo(),
        &CreateOptions {
            archive_name: "{hostname}-snap".into(),
            paths: vec![env.src()],
            ..Default::default()
        },
        &env.runtime,
        None,
    )
    .unwrap();
    assert!(result.name.ends_with("-snap"));
    assert!(!result.name.contains('{'));
    assert_eq!(env.archive_names(), vec![result.name]);
}

//! End-to-end saves through the repository facade.

use std::collections::BTreeMap;
use std::fs;
use std::path::Path;
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use keepfile_backup::{BackupSettings, GitBackuper};
use keepfile_formats::{JsonSerializer, YamlSerializer};
use keepfile_persistence::Serializer;
use keepfile_repository::{ensure_directories, Repository, RepositorySettings, SaveOutcome};
use serde::{Deserialize, Serialize};
use tempfile::tempdir;

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
struct Dummy {
    value: i64,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
struct Profile {
    name: String,
    nickname: Option<String>,
    ratio: f64,
    limits: BTreeMap<String, Vec<u64>>,
    tags: Vec<String>,
}

fn dummy_settings(dir: &Path) -> RepositorySettings {
    RepositorySettings::new(dir)
        .with_extension(".cfg")
        .with_temp_extension(".tmp")
}

fn file_names(dir: &Path) -> Vec<String> {
    let mut names: Vec<String> = fs::read_dir(dir)
        .unwrap()
        .map(|entry| entry.unwrap().file_name().to_string_lossy().into_owned())
        .collect();
    names.sort();
    names
}

#[test]
fn test_overwrite_without_backups() {
    let dir = tempdir().unwrap();
    let serializer = JsonSerializer::default();
    let repo: Repository<Dummy, _> = Repository::new(dummy_settings(dir.path()), serializer);
    let target = dir.path().join("dummy.cfg");

    repo.save("dummy", &Dummy { value: 1 }).unwrap();
    assert_eq!(
        fs::read(&target).unwrap(),
        serializer.serialize(&Dummy { value: 1 }).unwrap()
    );

    repo.save("dummy", &Dummy { value: 2 }).unwrap();
    assert_eq!(
        fs::read(&target).unwrap(),
        serializer.serialize(&Dummy { value: 2 }).unwrap()
    );
    assert_eq!(file_names(dir.path()), ["dummy.cfg"]);
}

#[test]
fn test_overwrite_with_backups() {
    let dir = tempdir().unwrap();
    let serializer = JsonSerializer::default();
    let settings = dummy_settings(dir.path()).with_backups(BackupSettings::default());
    ensure_directories(&settings).unwrap();
    let repo: Repository<Dummy, _> = Repository::new(settings, serializer);

    repo.save("dummy", &Dummy { value: 1 }).unwrap();
    repo.save("dummy", &Dummy { value: 2 }).unwrap();

    assert_eq!(file_names(dir.path()), ["backup", "dummy.cfg"]);
    let backups = file_names(&dir.path().join("backup"));
    assert_eq!(backups.len(), 1);
    assert!(backups[0].starts_with("dummy.cfg."));
    assert!(backups[0].ends_with(".bak"));
    assert_eq!(
        fs::read(dir.path().join("backup").join(&backups[0])).unwrap(),
        serializer.serialize(&Dummy { value: 1 }).unwrap()
    );
}

#[test]
fn test_restore_after_bad_edit() {
    let dir = tempdir().unwrap();
    let settings = dummy_settings(dir.path()).with_backups(BackupSettings::default());
    let repo: Repository<Dummy, _> = Repository::new(settings, JsonSerializer::default());
    repo.save("dummy", &Dummy { value: 1 }).unwrap();
    repo.save("dummy", &Dummy { value: 2 }).unwrap();

    assert!(repo.can_restore("dummy"));
    assert!(repo.restore("dummy").unwrap());

    let restored = repo.read("dummy").unwrap();
    assert_eq!(*restored.read().unwrap(), Dummy { value: 1 });
}

#[test]
fn test_yaml_round_trip() {
    let dir = tempdir().unwrap();
    let settings = RepositorySettings::new(dir.path()).with_extension("yaml");
    let repo: Repository<Profile, _> = Repository::new(settings, YamlSerializer);

    let mut limits = BTreeMap::new();
    limits.insert("daily".to_string(), vec![0, u64::MAX]);
    limits.insert("empty".to_string(), Vec::new());
    let profile = Profile {
        name: "Zoë \"quoted\"\nsecond line".to_string(),
        nickname: None,
        ratio: -0.125,
        limits,
        tags: vec![String::new(), "a: b".to_string()],
    };

    repo.save("profile", &profile).unwrap();
    repo.clear_cache().unwrap();

    let loaded = repo.read("profile").unwrap();
    assert_eq!(*loaded.read().unwrap(), profile);
    assert!(!repo.is_dirty("profile", &profile));
}

#[test]
fn test_repositories_share_one_file() {
    let dir = tempdir().unwrap();
    let settings = dummy_settings(dir.path()).with_lock_timeout(Duration::from_secs(10));
    Repository::<Dummy, _>::new(settings.clone(), JsonSerializer::default())
        .save("dummy", &Dummy { value: 0 })
        .unwrap();

    let handles: Vec<_> = (1..=4)
        .map(|worker| {
            let settings = settings.clone();
            thread::spawn(move || {
                let repo: Repository<Dummy, _> =
                    Repository::new(settings, JsonSerializer::compact());
                for round in 0..5 {
                    let outcome = repo
                        .save("dummy", &Dummy { value: worker * 100 + round })
                        .unwrap();
                    assert_eq!(outcome, SaveOutcome::Saved);
                }
            })
        })
        .collect();
    for handle in handles {
        handle.join().unwrap();
    }

    let repo: Repository<Dummy, _> = Repository::new(settings, JsonSerializer::default());
    let value = repo.read("dummy").unwrap().read().unwrap().value;
    assert!((100..=404).contains(&value));
    assert_eq!(value % 100, 4);
    assert_eq!(file_names(dir.path()), ["dummy.cfg"]);
}

#[test]
fn test_git_backed_repository() {
    if which::which("git").is_err() {
        return;
    }
    let dir = tempdir().unwrap();
    let repo: Repository<Dummy, _> =
        Repository::new(dummy_settings(dir.path()), JsonSerializer::default())
            .with_backuper(Arc::new(GitBackuper::new()));

    repo.save("dummy", &Dummy { value: 1 }).unwrap();
    repo.save("dummy", &Dummy { value: 2 }).unwrap();
    fs::write(dir.path().join("dummy.cfg"), b"garbage").unwrap();

    assert!(repo.restore("dummy").unwrap());
    assert_eq!(*repo.read("dummy").unwrap().read().unwrap(), Dummy { value: 2 });

    repo.rename("dummy", "renamed", false).unwrap();
    assert!(repo.can_restore("renamed"));
    assert!(!repo.can_restore("dummy"));
}

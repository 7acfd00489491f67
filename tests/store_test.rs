//! End-to-end store scenarios across all key families.

mod common;

use std::collections::BTreeMap;
use std::io::{Read, Seek, SeekFrom, Write};
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};

use krin::{Algorithm, KeyOptions, MasterKey, Store, StoreError, TxnValue};

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
struct Foo {
    foo: String,
}

#[test]
fn test_open_for_update_all_families() {
    for (label, key) in common::key_families() {
        let dir = tempfile::tempdir().unwrap();
        let s = common::new_store(dir.path(), key);

        let foo = Foo { foo: "foo".into() };
        s.save_data_file("test.json", &foo).unwrap();

        let mut bar = Foo::default();
        let mut update = s.open_for_update("test.json", &mut bar).unwrap();
        assert_eq!(bar, foo, "family {label}");
        bar.foo = "bar".into();
        update.commit(&[&bar]).unwrap();
        assert!(matches!(
            update.rollback(),
            Err(StoreError::AlreadyCommitted)
        ));

        let got: Foo = s.read_data_file("test.json").unwrap();
        assert_eq!(got, bar, "family {label}");
    }
}

#[test]
fn test_rollback_restores_and_is_idempotent() {
    let dir = tempfile::tempdir().unwrap();
    let s = common::new_store(
        dir.path(),
        MasterKey::create_for_test(Algorithm::Aes256).unwrap(),
    );
    let foo = Foo { foo: "foo".into() };
    s.save_data_file("test.json", &foo).unwrap();

    let mut bar = Foo::default();
    let mut update = s.open_for_update("test.json", &mut bar).unwrap();
    bar.foo = "bar".into();
    assert!(matches!(update.rollback(), Err(StoreError::RolledBack)));
    assert!(matches!(
        update.commit(&[&bar]),
        Err(StoreError::AlreadyRolledBack)
    ));

    let got: Foo = s.read_data_file("test.json").unwrap();
    assert_eq!(got, foo);
}

#[test]
fn test_commit_reports_missing_lock_file() {
    let dir = tempfile::tempdir().unwrap();
    let s = common::new_store(
        dir.path(),
        MasterKey::create_for_test(Algorithm::Aes256).unwrap(),
    );
    s.create_empty_file("sub/test.json", &Foo::default()).unwrap();

    let mut foo = Foo::default();
    let mut update = s.open_for_update("sub/test.json", &mut foo).unwrap();
    // Pull the directory out from under the update; the write recreates it
    // but the lock file is gone.
    std::fs::remove_dir_all(dir.path().join("sub")).unwrap();
    let err = update.commit(&[&foo]).unwrap_err();
    assert!(err.is_not_found(), "unexpected error: {err}");
}

#[test]
fn test_raw_bytes_all_families() {
    for (label, key) in common::key_families() {
        let dir = tempfile::tempdir().unwrap();
        let s = common::new_store(dir.path(), key);
        s.save_raw_file("file", b"Hello world").unwrap();
        assert_eq!(
            s.read_raw_file("file").unwrap(),
            b"Hello world",
            "family {label}"
        );
    }
}

#[test]
fn test_binary_record_all_families() {
    struct Timestamp(u64);
    impl krin::BinaryRecord for Timestamp {
        fn to_bytes(&self) -> krin::Result<Vec<u8>> {
            Ok(self.0.to_be_bytes().to_vec())
        }
        fn from_bytes(bytes: &[u8]) -> krin::Result<Self> {
            Ok(Timestamp(u64::from_be_bytes(bytes.try_into().map_err(
                |_| StoreError::Serialization("timestamp must be 8 bytes".into()),
            )?)))
        }
    }

    let now = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap()
        .as_nanos() as u64;
    for (label, key) in common::key_families() {
        let dir = tempfile::tempdir().unwrap();
        let s = common::new_store(dir.path(), key);
        s.save_binary_file("file", &Timestamp(now)).unwrap();
        let got: Timestamp = s.read_binary_file("file").unwrap();
        assert_eq!(got.0, now, "family {label}");
    }
}

#[test]
fn test_blobs_all_families() {
    const CONTENT: &[u8] = b"ABCDEFGHIJKLMNOPQRSTUVWXYZ";
    for (label, key) in common::key_families() {
        let dir = tempfile::tempdir().unwrap();
        let s = common::new_store(dir.path(), key);

        let mut w = s.open_blob_write("tempfile", "finalfile").unwrap();
        w.write_all(CONTENT).unwrap();
        w.close().unwrap();

        // Until the caller renames it, the blob is not readable under
        // either name.
        assert!(s.read_raw_file("finalfile").is_err(), "family {label}");
        std::fs::rename(s.dir().join("tempfile"), s.dir().join("finalfile")).unwrap();
        assert_eq!(s.read_raw_file("finalfile").unwrap(), CONTENT);

        let mut r = s.open_blob_read("finalfile").unwrap();
        assert_eq!(r.seek(SeekFrom::Start(5)).unwrap(), 5);
        let mut rest = Vec::new();
        r.read_to_end(&mut rest).unwrap();
        assert_eq!(rest, &CONTENT[5..], "family {label}");

        assert_eq!(
            r.seek(SeekFrom::End(-3)).unwrap(),
            (CONTENT.len() - 3) as u64
        );
        rest.clear();
        r.read_to_end(&mut rest).unwrap();
        assert_eq!(rest, b"XYZ", "family {label}");
    }
}

#[test]
fn test_tampered_data_file_fails_closed() {
    let dir = tempfile::tempdir().unwrap();
    let s = common::new_store(
        dir.path(),
        MasterKey::create_for_test(Algorithm::Aes256).unwrap(),
    );
    s.save_data_file("test.json", &Foo { foo: "secret".into() })
        .unwrap();

    let path = dir.path().join("test.json");
    let mut bytes = std::fs::read(&path).unwrap();
    let last = bytes.len() - 1;
    bytes[last] ^= 0x01;
    std::fs::write(&path, &bytes).unwrap();

    assert!(matches!(
        s.read_data_file::<Foo>("test.json"),
        Err(StoreError::DecryptFailed)
    ));
}

#[test]
fn test_multi_file_commit_is_atomic() {
    let dir = tempfile::tempdir().unwrap();
    let s = common::new_store(
        dir.path(),
        MasterKey::create_for_test(Algorithm::Aes256).unwrap(),
    );
    let names: Vec<String> = (0..5).map(|i| format!("data/file{i}")).collect();
    for name in &names {
        s.save_data_file(name, &Foo { foo: name.clone() }).unwrap();
    }

    let mut objs: Vec<Foo> = vec![Foo::default(); names.len()];
    let name_refs: Vec<&str> = names.iter().map(String::as_str).collect();
    let mut update = {
        let mut obj_refs: Vec<&mut dyn TxnValue> =
            objs.iter_mut().map(|o| o as &mut dyn TxnValue).collect();
        s.open_many_for_update(&name_refs, &mut obj_refs).unwrap()
    };
    for obj in &mut objs {
        obj.foo.push_str("-updated");
    }
    let write_refs: Vec<&dyn TxnValue> = objs.iter().map(|o| o as &dyn TxnValue).collect();
    update.commit(&write_refs).unwrap();

    for name in &names {
        let got: Foo = s.read_data_file(name).unwrap();
        assert_eq!(got.foo, format!("{name}-updated"));
        assert!(!dir.path().join(format!("{name}.lock")).exists());
    }
}

#[test]
fn test_concurrent_updates_are_serialized() {
    #[derive(Debug, Clone, Default, Serialize, Deserialize)]
    struct Counter {
        n: u64,
    }

    let dir = tempfile::tempdir().unwrap();
    let s = std::sync::Arc::new(common::new_store(
        dir.path(),
        MasterKey::create_for_test(Algorithm::Aes256).unwrap(),
    ));
    s.create_empty_file("counter", &Counter::default()).unwrap();

    let threads: Vec<_> = (0..3)
        .map(|_| {
            let s = std::sync::Arc::clone(&s);
            std::thread::spawn(move || {
                for _ in 0..4 {
                    let mut counter = Counter::default();
                    let mut update = s.open_for_update("counter", &mut counter).unwrap();
                    counter.n += 1;
                    update.commit(&[&counter]).unwrap();
                }
            })
        })
        .collect();
    for t in threads {
        t.join().unwrap();
    }

    let got: Counter = s.read_data_file("counter").unwrap();
    assert_eq!(got.n, 12);
}

#[test]
fn test_failed_multi_file_commit_restores_everything() {
    // An object whose serializer always fails, making one of the two writes
    // fail deterministically mid-commit.
    #[derive(Default)]
    struct Poison;
    impl Serialize for Poison {
        fn serialize<S: serde::Serializer>(&self, _: S) -> Result<S::Ok, S::Error> {
            Err(serde::ser::Error::custom("poisoned"))
        }
    }
    impl<'de> Deserialize<'de> for Poison {
        fn deserialize<D: serde::Deserializer<'de>>(d: D) -> Result<Self, D::Error> {
            serde::de::IgnoredAny::deserialize(d)?;
            Ok(Poison)
        }
    }

    let dir = tempfile::tempdir().unwrap();
    let s = common::new_store(
        dir.path(),
        MasterKey::create_for_test(Algorithm::Aes256).unwrap(),
    );
    s.save_data_file("a", &Foo { foo: "a".into() }).unwrap();
    s.save_data_file("b", &Foo { foo: "b".into() }).unwrap();

    let mut a = Foo::default();
    let mut poison = Poison;
    let mut update = s
        .open_many_for_update(&["a", "b"], &mut [&mut a, &mut poison])
        .unwrap();
    a.foo = "a-new".into();
    let err = update.commit(&[&a, &poison]).unwrap_err();
    assert!(matches!(
        err,
        StoreError::Serialization(_) | StoreError::Aggregate { .. }
    ));

    // Neither file changed: the write of `a` was rolled back from backup.
    assert_eq!(s.read_data_file::<Foo>("a").unwrap().foo, "a");
    assert_eq!(s.read_data_file::<Foo>("b").unwrap().foo, "b");
    assert!(!dir.path().join("a.lock").exists());
    assert!(!dir.path().join("b.lock").exists());
}

#[test]
fn test_tpm_master_key_file_round_trip() {
    use std::sync::Arc;

    let dir = tempfile::tempdir().unwrap();
    let key_path = dir.path().join("master.key");
    let options = KeyOptions {
        strict_wipe: false,
        tpm: Some(Arc::new(common::FakeTpm::new())),
    };
    let mk = MasterKey::create(Algorithm::Aes256Tpm, &options).unwrap();
    mk.save(b"foo", &key_path).unwrap();

    // Version 3 requires the TPM device to be supplied on read.
    assert!(matches!(
        MasterKey::read(b"foo", &key_path, &KeyOptions::default()),
        Err(StoreError::DecryptFailed)
    ));

    let got = MasterKey::read(b"foo", &key_path, &options).unwrap();
    let enc = mk.encrypt(b"bound to hardware").unwrap();
    assert_eq!(got.decrypt(&enc).unwrap(), b"bound to hardware");

    // Wrong passphrase still fails before the TPM is consulted.
    assert!(matches!(
        MasterKey::read(b"bar", &key_path, &options),
        Err(StoreError::DecryptFailed)
    ));
}

#[test]
fn test_flag_tamper_breaks_anchor() {
    let dir = tempfile::tempdir().unwrap();
    let s = common::new_store(
        dir.path(),
        MasterKey::create_for_test(Algorithm::Aes256).unwrap(),
    );
    s.save_data_file("test.json", &Foo { foo: "x".into() }).unwrap();

    // Clearing a flag bit leaves the stream decryptable but breaks the
    // magic+flags anchor repeated inside it.
    let path = dir.path().join("test.json");
    let mut bytes = std::fs::read(&path).unwrap();
    bytes[4] &= !0x40;
    std::fs::write(&path, &bytes).unwrap();

    assert!(matches!(
        s.read_data_file::<Foo>("test.json"),
        Err(StoreError::HeaderMismatch)
    ));
}

#[test]
fn test_crash_recovery_restores_pre_update_state() {
    let dir = tempfile::tempdir().unwrap();
    let key_path = dir.path().join("keys/master.key");
    let mk = MasterKey::create_for_test(Algorithm::Aes256).unwrap();
    mk.save(b"pw", &key_path).unwrap();

    #[derive(Serialize)]
    struct Pending {
        ts: u64,
        files: Vec<String>,
    }

    let names: Vec<String> = (0..3).map(|i| format!("data/file{i}")).collect();
    let ts;
    {
        let s = Store::new(dir.path(), Some(mk)).unwrap();
        for name in &names {
            s.save_data_file(name, &Foo { foo: format!("original {name}") })
                .unwrap();
        }

        // Simulate a crash mid-commit: backups and the pending record are on
        // disk, the live files already hold the new values, and the locks
        // are still held.
        ts = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap()
            .as_nanos() as u64;
        for name in &names {
            std::fs::copy(
                dir.path().join(name),
                dir.path().join(format!("{name}.bck-{ts}")),
            )
            .unwrap();
            s.lock(name).unwrap();
        }
        for name in &names {
            s.save_data_file(name, &Foo { foo: "mutated".into() }).unwrap();
        }
        s.save_data_file(
            &format!("pending/{ts}"),
            &Pending {
                ts,
                files: names.clone(),
            },
        )
        .unwrap();
    }

    let mk = MasterKey::read(b"pw", &key_path, &KeyOptions::default()).unwrap();
    let started = Instant::now();
    let s = Store::new(dir.path(), Some(mk)).unwrap();
    // Recovery honors the grace period before stealing the pending op.
    assert!(started.elapsed() >= Duration::from_secs(3));
    assert!(started.elapsed() <= Duration::from_secs(10));

    for name in &names {
        let got: Foo = s.read_data_file(name).unwrap();
        assert_eq!(got.foo, format!("original {name}"));
        assert!(!dir.path().join(format!("{name}.bck-{ts}")).exists());
        assert!(!dir.path().join(format!("{name}.lock")).exists());
    }
    assert!(!dir.path().join(format!("pending/{ts}")).exists());
}

#[test]
fn test_map_update_pattern() {
    // The pattern an autocert-style cache layers on top of the store: a
    // JSON map read, mutated, and committed under the file lock.
    #[derive(Debug, Clone, Default, Serialize, Deserialize)]
    struct CacheContent {
        entries: BTreeMap<String, String>,
    }

    let dir = tempfile::tempdir().unwrap();
    let s = common::new_store(
        dir.path(),
        MasterKey::create_for_test(Algorithm::Aes256).unwrap(),
    );
    s.create_empty_file("autocert", &CacheContent::default())
        .unwrap();

    for (k, v) in [("example.com", "cert-1"), ("example.org", "cert-2")] {
        let mut cache = CacheContent::default();
        let mut update = s.open_for_update("autocert", &mut cache).unwrap();
        cache.entries.insert(k.into(), v.into());
        update.commit(&[&cache]).unwrap();
    }

    let cache: CacheContent = s.read_data_file("autocert").unwrap();
    assert_eq!(cache.entries.len(), 2);
    assert_eq!(cache.entries["example.com"], "cert-1");

    let mut cache = CacheContent::default();
    let mut update = s.open_for_update("autocert", &mut cache).unwrap();
    cache.entries.remove("example.com");
    update.commit(&[&cache]).unwrap();

    let cache: CacheContent = s.read_data_file("autocert").unwrap();
    assert_eq!(cache.entries.len(), 1);
}

#[test]
fn test_hashed_file_names() {
    let dir = tempfile::tempdir().unwrap();
    let s = common::new_store(
        dir.path(),
        MasterKey::create_for_test(Algorithm::Aes256).unwrap(),
    );
    let name = s.hash_string("users/alice");
    assert_eq!(name.len(), 64);
    s.save_data_file(&name, &Foo { foo: "alice".into() }).unwrap();
    let got: Foo = s.read_data_file(&name).unwrap();
    assert_eq!(got.foo, "alice");
}

#[test]
fn test_wrong_master_key_cannot_read() {
    let dir = tempfile::tempdir().unwrap();
    let s = common::new_store(
        dir.path(),
        MasterKey::create_for_test(Algorithm::Aes256).unwrap(),
    );
    s.save_data_file("test.json", &Foo { foo: "secret".into() })
        .unwrap();
    drop(s);

    let other = common::new_store(
        dir.path(),
        MasterKey::create_for_test(Algorithm::Aes256).unwrap(),
    );
    assert!(matches!(
        other.read_data_file::<Foo>("test.json"),
        Err(StoreError::DecryptFailed)
    ));
}

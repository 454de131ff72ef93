//! End-to-end scenarios, one per literal walkthrough.

use std::thread;
use std::time::{Duration, SystemTime};

use sbkt::{BucketOptions, Config, Database, Entry, EntryOptions, IndexValueType};
use tempfile::tempdir;

fn probe(key: &str) -> Entry {
    Entry::new(key, "{}", EntryOptions::new())
}

#[test]
fn primary_ordering() {
    let db = Database::open(Config::new()).unwrap();
    db.create_bucket("b", BucketOptions::new().set_btdeg(32)).unwrap();
    db.update("b", |tx| {
        for k in ["a", "c", "b"] {
            tx.set(Entry::new(k, "{}", EntryOptions::new()))?;
        }
        Ok(())
    })
    .unwrap();

    let seen = db
        .view("b", |tx| {
            let mut seen = Vec::new();
            tx.ascend(None, |e| {
                seen.push(e.key().to_string());
                true
            });
            Ok(seen)
        })
        .unwrap();
    assert_eq!(seen, vec!["a".to_string(), "b".to_string(), "c".to_string()]);
    db.close().unwrap();
}

#[test]
fn persist_and_recover() {
    let dir = tempdir().unwrap();
    let mut cfg = Config::new();
    cfg.set_persist(true)
        .set_dir_path(dir.path().to_str().unwrap().to_string())
        .set_sync_freq(sbkt::IoFrequency::EachCommit);

    let db = Database::open(cfg.clone()).unwrap();
    db.create_bucket("x", BucketOptions::new()).unwrap();
    db.update("x", |tx| {
        tx.set(Entry::new("k1", r#"{"v":1}"#, EntryOptions::new()))?;
        Ok(())
    })
    .unwrap();
    db.update("x", |tx| {
        tx.delete(&probe("k1"))?;
        tx.set(Entry::new("k2", r#"{"v":2}"#, EntryOptions::new()))?;
        Ok(())
    })
    .unwrap();
    db.close().unwrap();

    let db = Database::open(cfg).unwrap();
    assert_eq!(db.view("x", |tx| Ok(tx.size(None))).unwrap(), 1);
    let k2 = db.view("x", |tx| Ok(tx.get(&probe("k2")))).unwrap();
    assert_eq!(k2.unwrap().value(), r#"{"v":2}"#);
    assert!(db.view("x", |tx| Ok(tx.get(&probe("k1")))).unwrap().is_none());
    db.close().unwrap();
}

#[test]
fn rollback_integrity() {
    let db = Database::open(Config::new()).unwrap();
    db.create_bucket("b", BucketOptions::new()).unwrap();
    db.update("b", |tx| {
        for i in 0..100 {
            tx.set(Entry::new(format!("k{:03}", i), "{}", EntryOptions::new()))?;
        }
        Ok(())
    })
    .unwrap();

    let result = db.update("b", |tx| {
        tx.set(Entry::new("k100", "{}", EntryOptions::new()))?;
        tx.delete(&probe("k050"))?;
        Err::<(), sbkt::Error>(sbkt::Error::InvalidArgument("abort".to_string()))
    });
    assert!(result.is_err());

    assert_eq!(db.view("b", |tx| Ok(tx.size(None))).unwrap(), 100);
    assert!(db.view("b", |tx| Ok(tx.has(None, &probe("k050")))).unwrap());
    assert!(!db.view("b", |tx| Ok(tx.has(None, &probe("k100")))).unwrap());
    db.close().unwrap();
}

#[test]
fn secondary_index_range_queries() {
    let db = Database::open(Config::new()).unwrap();
    db.create_bucket("b", BucketOptions::new().set_geo(true).set_dims(2).set_georincl(false))
        .unwrap();
    db.update("b", |tx| {
        for i in 0..256 {
            let value = format!(
                r#"{{"value":{},"coords":[{},{}]}}"#,
                256 - i,
                i,
                256 - i
            );
            tx.set(Entry::new(format!("key-{}", i), value, EntryOptions::new()))?;
        }
        tx.create_index("value", IndexValueType::Int)?;
        Ok(())
    })
    .unwrap();

    let ge_count = db
        .view("b", |tx| {
            let mut n = 0;
            tx.ascend_ge(Some("value"), "100", |_| {
                n += 1;
                true
            })?;
            Ok(n)
        })
        .unwrap();
    assert_eq!(ge_count, 157);

    let range_count = db
        .view("b", |tx| {
            let mut n = 0;
            tx.ascend_range(Some("value"), "100", "200", |_| {
                n += 1;
                true
            })?;
            Ok(n)
        })
        .unwrap();
    assert_eq!(range_count, 100);
    db.close().unwrap();
}

#[test]
fn spatial_radius_and_nearest_neighbor() {
    let db = Database::open(Config::new()).unwrap();
    db.create_bucket("b", BucketOptions::new().set_geo(true).set_dims(2).set_georincl(false))
        .unwrap();
    db.update("b", |tx| {
        for i in 0..256 {
            let value = format!(r#"{{"value":{},"coords":[{},{}]}}"#, 256 - i, i, 256 - i);
            tx.set(Entry::new(format!("key-{}", i), value, EntryOptions::new()))?;
        }
        Ok(())
    })
    .unwrap();

    let hits = db.view("b", |tx| tx.search_within_radius(&[1.0, 256.0], 10.0)).unwrap();
    assert_eq!(hits.len(), 8);

    let nn = db.view("b", |tx| tx.nearest_neighbor(&[1.0, 256.0])).unwrap().unwrap();
    assert!(nn.key() == "key-0" || nn.key() == "key-1");
    db.close().unwrap();
}

#[test]
fn expiration_sweep() {
    let mut cfg = Config::new();
    cfg.set_manage_frequency(Duration::from_millis(30));
    let db = Database::open(cfg).unwrap();
    db.create_bucket("b", BucketOptions::new()).unwrap();

    let past = SystemTime::now() - Duration::from_secs(1);
    db.update("b", |tx| {
        tx.set(Entry::new("gone", "{}", EntryOptions::new().expires_at(past)))?;
        Ok(())
    })
    .unwrap();

    thread::sleep(Duration::from_millis(150));

    assert!(db.view("b", |tx| Ok(tx.get(&probe("gone")))).unwrap().is_none());
    assert_eq!(db.view("b", |tx| Ok(tx.size(None))).unwrap(), 0);
    db.close().unwrap();
}

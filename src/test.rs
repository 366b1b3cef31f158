use crate::*;
use std::path::PathBuf;

fn schema(sql: &str) -> Meta {
    Meta::parse(sql).unwrap()
}

/// Insert a row of values into a table.
fn put(t: &Table, values: Vec<Variant>, upsert: bool) -> Result<i64> {
    let mut r = Row::new(t.meta.clone());
    r.values = values;
    t.apply(&mut r, upsert)?;
    Ok(r.id)
}

/// Run a WHERE query and format one column of every matching row.
fn col_of(t: &Table, q: &Query, col: usize) -> Vec<String> {
    t.find(q)
        .unwrap()
        .map(|id| t.read(id.unwrap()).unwrap().values[col].to_string())
        .collect()
}

#[test]
fn duplicate_key_and_upsert() {
    let t = Table::open_mem(schema(
        "CREATE TABLE t (id uint, name string(10), INDEX primary (id))",
    ))
    .unwrap();
    let s = |x: &str| Variant::Str(Rc::new(x.to_string()));

    put(&t, vec![Variant::UInt64(1), s("a")], false).unwrap();
    put(&t, vec![Variant::UInt64(2), s("b")], false).unwrap();
    // Third insert collides on the primary key.
    let r = put(&t, vec![Variant::UInt64(1), s("c")], false);
    assert!(matches!(r, Err(Error::DuplicateKey)));
    assert_eq!(col_of(&t, &Query::wher("id = 1"), 1), vec!["a"]);
    assert_eq!(t.rows(), 2);

    // With upsert the row is replaced in place.
    put(&t, vec![Variant::UInt64(1), s("c")], true).unwrap();
    assert_eq!(col_of(&t, &Query::wher("id = 1"), 1), vec!["c"]);
    assert_eq!(t.rows(), 2);
}

#[test]
fn range_scan_10k() {
    let t = Table::open_mem(schema(
        "CREATE TABLE t (k uint, v uint, INDEX primary (k))",
    ))
    .unwrap();
    for i in 0..10_000_u64 {
        put(&t, vec![Variant::UInt64(i), Variant::UInt64(i * 2)], false).unwrap();
    }
    assert_eq!(t.rows(), 10_000);

    let ids: Vec<i64> = t
        .find(&Query::wher("k >= 100 AND k < 110"))
        .unwrap()
        .map(|r| r.unwrap())
        .collect();
    assert_eq!(ids.len(), 10);
    let mut prev = None;
    for id in ids {
        let row = t.read(id).unwrap();
        let k = row.values[0].uint().unwrap();
        assert!((100..110).contains(&k));
        assert_eq!(row.values[1].uint().unwrap(), k * 2);
        if let Some(p) = prev {
            assert!(k > p, "scan must be ascending");
        }
        prev = Some(k);
    }

    // Point query through one().
    let row = t.one("primary", &["5000"]).unwrap();
    assert_eq!(row.values[1].uint().unwrap(), 10_000);
    assert!(matches!(
        t.one("primary", &["10001"]),
        Err(Error::NotFound)
    ));
    assert!(matches!(
        t.one("nosuch", &["1"]),
        Err(Error::IndexMissing(_))
    ));
}

#[test]
fn limit_offset_and_order() {
    let t = Table::open_mem(schema(
        "CREATE TABLE t (k uint, v uint, INDEX primary (k))",
    ))
    .unwrap();
    for i in 0..50_u64 {
        put(&t, vec![Variant::UInt64(i), Variant::UInt64(i)], false).unwrap();
    }

    // LIMIT offset,count.
    let q = Query {
        wher: Some("k >= 10".to_string()),
        limit: Some((2, 3)),
        ..Query::default()
    };
    let ks = col_of(&t, &q, 0);
    assert_eq!(ks, vec!["12", "13", "14"]);

    // ORDER BY k DESC rides the primary index backwards.
    let q = Query {
        order_by: vec![("k".to_string(), true)],
        limit: Some((0, 3)),
        ..Query::default()
    };
    assert_eq!(col_of(&t, &q, 0), vec!["49", "48", "47"]);

    // USE INDEX hint with explicit direction.
    let q = Query {
        use_index: Some(("primary".to_string(), true)),
        wher: Some("k < 3".to_string()),
        ..Query::default()
    };
    assert_eq!(col_of(&t, &q, 0), vec!["2", "1", "0"]);

    // Hinting an unknown index is an error.
    let q = Query {
        use_index: Some(("nosuch".to_string(), false)),
        ..Query::default()
    };
    assert!(matches!(t.find(&q), Err(Error::IndexMissing(_))));
}

#[test]
fn secondary_index_pushdown() {
    let t = Table::open_mem(schema(
        "CREATE TABLE t (id uint, a uint, b string(5), INDEX primary (id), INDEX by_a (a))",
    ))
    .unwrap();
    let s = |x: &str| Variant::Str(Rc::new(x.to_string()));
    for i in 0..100_u64 {
        let b = if i % 10 == 5 && i % 20 == 5 { "x" } else { "y" };
        put(
            &t,
            vec![Variant::UInt64(i), Variant::UInt64(i % 10), s(b)],
            false,
        )
        .unwrap();
    }
    // a = 5 selects ten rows by index; b = 'x' filters them down.
    let ids: Vec<i64> = t
        .find(&Query::wher("a = 5 AND b = 'x'"))
        .unwrap()
        .map(|r| r.unwrap())
        .collect();
    assert_eq!(ids.len(), 5);
    for id in ids {
        let row = t.read(id).unwrap();
        assert_eq!(row.values[1].uint().unwrap(), 5);
        assert_eq!(&**row.values[2].str().unwrap(), "x");
    }

    // Constructs outside the grammar fail to compile.
    assert!(matches!(
        t.find(&Query::wher("a BETWEEN 1 AND 5")),
        Err(Error::Unsupported(_))
    ));
}

#[test]
fn secondary_index_maintained_on_update_and_delete() {
    let t = Table::open_mem(schema(
        "CREATE TABLE t (id uint, a uint, INDEX primary (id), INDEX by_a (a))",
    ))
    .unwrap();
    for i in 0..20_u64 {
        put(&t, vec![Variant::UInt64(i), Variant::UInt64(i % 2)], false).unwrap();
    }
    assert_eq!(col_of(&t, &Query::wher("a = 1"), 0).len(), 10);

    // Upsert moves a row from a=1 to a=0.
    put(&t, vec![Variant::UInt64(1), Variant::UInt64(0)], true).unwrap();
    assert_eq!(col_of(&t, &Query::wher("a = 1"), 0).len(), 9);
    assert_eq!(col_of(&t, &Query::wher("a = 0"), 0).len(), 11);

    // Delete drops the row from every index.
    let row = t.one("primary", &["3"]).unwrap();
    let id = row.id;
    t.delete_at(id).unwrap();
    assert!(matches!(t.read(id), Err(Error::NotFound)));
    for q in ["a = 1", "a = 0"] {
        for got in t.find(&Query::wher(q)).unwrap() {
            assert_ne!(got.unwrap(), id);
        }
    }
    assert_eq!(t.rows(), 19);
}

#[test]
fn apply_at_rewrites_in_place() {
    let t = Table::open_mem(schema(
        "CREATE TABLE t (id uint, v uint, INDEX primary (id))",
    ))
    .unwrap();
    let a = put(&t, vec![Variant::UInt64(1), Variant::UInt64(10)], false).unwrap();
    let b = put(&t, vec![Variant::UInt64(2), Variant::UInt64(20)], false).unwrap();

    let mut r = Row::new(t.meta.clone());
    r.values = vec![Variant::UInt64(1), Variant::UInt64(11)];
    t.apply_at(a, &mut r).unwrap();
    assert_eq!(t.read(a).unwrap().values[1].uint().unwrap(), 11);

    // Rewriting row a with row b's primary key collides.
    let mut r = Row::new(t.meta.clone());
    r.values = vec![Variant::UInt64(2), Variant::UInt64(99)];
    assert!(matches!(t.apply_at(a, &mut r), Err(Error::DuplicateKey)));
    // The failed statement rolled back; both rows are intact.
    assert_eq!(t.read(b).unwrap().values[1].uint().unwrap(), 20);
    assert_eq!(t.rows(), 2);
}

#[test]
fn decimal_column_round_trip() {
    let t = Table::open_mem(schema(
        "CREATE TABLE t (id uint, price decimal(2), INDEX primary (id))",
    ))
    .unwrap();
    let d = |s: &str| Variant::Dec(Decimal::from_string(s, 2).unwrap());
    put(&t, vec![Variant::UInt64(1), d("12.30")], false).unwrap();
    put(&t, vec![Variant::UInt64(2), d("0.05")], false).unwrap();

    let row = t.one("primary", &["1"]).unwrap();
    assert_eq!(row.values[1].dec().unwrap().to_string(), "12.30");
    assert_eq!(col_of(&t, &Query::wher("price = 0.05"), 0), vec!["2"]);
    assert_eq!(col_of(&t, &Query::wher("price > 1"), 0), vec!["1"]);
}

#[test]
fn like_filters() {
    let t = Table::open_mem(schema(
        "CREATE TABLE t (id uint, name string(20), INDEX primary (id))",
    ))
    .unwrap();
    let s = |x: &str| Variant::Str(Rc::new(x.to_string()));
    for (i, name) in ["substrate", "prefix_one", "one_suffix", "exact"]
        .iter()
        .enumerate()
    {
        put(&t, vec![Variant::UInt64(i as u64), s(name)], false).unwrap();
    }
    assert_eq!(
        col_of(&t, &Query::wher("name LIKE '%str%'"), 1),
        vec!["substrate"]
    );
    assert_eq!(
        col_of(&t, &Query::wher("name LIKE 'prefix%'"), 1),
        vec!["prefix_one"]
    );
    assert_eq!(
        col_of(&t, &Query::wher("name LIKE '%suffix'"), 1),
        vec!["one_suffix"]
    );
    assert_eq!(
        col_of(&t, &Query::wher("name LIKE 'exact'"), 1),
        vec!["exact"]
    );
}

fn wal_schema() -> Meta {
    schema(
        "CREATE TABLE t (k uint, v string(12), INDEX primary (k))
         INCREMENT=65536 WAL=log WAL_SYNC=off",
    )
}

#[test]
fn wal_survives_reopen_and_discards_uncommitted() {
    let _ = env_logger::builder().is_test(true).try_init();
    let dir = tempfile::tempdir().unwrap();
    let base: PathBuf = dir.path().join("t");
    let s = |x: String| Variant::Str(Rc::new(x));

    {
        let t = table_open(&base, OpenMode::ReadWrite, Some(wal_schema())).unwrap();
        for i in 0..1000_u64 {
            put(&t, vec![Variant::UInt64(i), s(format!("row{}", i))], false).unwrap();
        }
        // Simulate a crash: the table is never closed or saved.
        std::mem::forget(t);
    }
    {
        // Reopen: schema comes from the sidecar, the journal is replayed.
        let t = table_open(&base, OpenMode::ReadWrite, None).unwrap();
        assert_eq!(t.rows(), 1000);
        let row = t.one("primary", &["500"]).unwrap();
        assert_eq!(&**row.values[1].str().unwrap(), "row500");

        // Ten rows inside a transaction that never commits.
        let mut tx = t.begin().unwrap();
        for i in 2000..2010_u64 {
            let mut r = Row::new(t.meta.clone());
            r.values = vec![Variant::UInt64(i), s(format!("tx{}", i))];
            tx.apply(&mut r, false).unwrap();
        }
        assert_eq!(t.rows(), 1010); // Visible inside the transaction.
        tx.close();
        drop(tx);
    }
    {
        let t = table_open(&base, OpenMode::ReadWrite, None).unwrap();
        assert_eq!(t.rows(), 1000);
        assert!(matches!(t.one("primary", &["2005"]), Err(Error::NotFound)));
    }
}

#[test]
fn transaction_rollback_restores_everything() {
    let dir = tempfile::tempdir().unwrap();
    let base: PathBuf = dir.path().join("t");
    let t = table_open(&base, OpenMode::ReadWrite, Some(wal_schema())).unwrap();
    let s = |x: &str| Variant::Str(Rc::new(x.to_string()));

    for i in 0..5_u64 {
        put(&t, vec![Variant::UInt64(i), s("base")], false).unwrap();
    }
    let before: Vec<i64> = t
        .find(&Query::default())
        .unwrap()
        .map(|r| r.unwrap())
        .collect();
    assert_eq!(before.len(), 5);

    let mut tx = t.begin().unwrap();
    let mut fresh = Vec::new();
    for i in 10..13_u64 {
        let mut r = Row::new(t.meta.clone());
        r.values = vec![Variant::UInt64(i), s("fresh")];
        tx.apply(&mut r, false).unwrap();
        fresh.push(r.id);
    }
    // Update an existing row inside the transaction.
    let mut r = Row::new(t.meta.clone());
    r.values = vec![Variant::UInt64(0), s("changed")];
    tx.apply(&mut r, true).unwrap();
    assert_eq!(t.rows(), 8);
    tx.rollback().unwrap();
    drop(tx);

    // Row count and content are back to the pre-transaction state.
    assert_eq!(t.rows(), 5);
    let after: Vec<i64> = t
        .find(&Query::default())
        .unwrap()
        .map(|r| r.unwrap())
        .collect();
    assert_eq!(after, before);
    assert_eq!(&**t.one("primary", &["0"]).unwrap().values[1].str().unwrap(), "base");
    // No rolled back rowid is reachable.
    for id in fresh {
        assert!(matches!(t.read(id), Err(Error::NotFound)));
    }

    // The lock is free again.
    let tx = t.begin().unwrap();
    drop(tx);
}

#[test]
fn transaction_state_errors() {
    let dir = tempfile::tempdir().unwrap();
    let base: PathBuf = dir.path().join("t");
    let t = table_open(&base, OpenMode::ReadWrite, Some(wal_schema())).unwrap();

    let mut tx = t.begin().unwrap();
    // The table lock is exclusive.
    assert!(matches!(t.begin(), Err(Error::TransactionState(_))));
    tx.commit().unwrap();
    // A finished transaction rejects further work.
    assert!(matches!(tx.commit(), Err(Error::TransactionState(_))));
    assert!(matches!(tx.delete_at(0), Err(Error::TransactionState(_))));
    drop(tx);

    // A failed statement rolls the whole transaction back.
    put(&t, vec![Variant::UInt64(1), Variant::Str(Rc::new("a".into()))], false).unwrap();
    let mut tx = t.begin().unwrap();
    let mut r = Row::new(t.meta.clone());
    r.values = vec![Variant::UInt64(1), Variant::Str(Rc::new("dup".into()))];
    assert!(matches!(tx.apply(&mut r, false), Err(Error::DuplicateKey)));
    assert!(matches!(tx.commit(), Err(Error::TransactionState(_))));
}

#[test]
fn schema_sidecar_validation() {
    let dir = tempfile::tempdir().unwrap();
    let base: PathBuf = dir.path().join("t");
    {
        let t = table_open(&base, OpenMode::ReadWrite, Some(wal_schema())).unwrap();
        drop(t);
    }
    // Same schema: fine.
    {
        let t = table_open(&base, OpenMode::ReadWrite, Some(wal_schema())).unwrap();
        drop(t);
    }
    // Different schema: rejected.
    let other = schema("CREATE TABLE t (k uint, other uint, INDEX primary (k))");
    assert!(matches!(
        table_open(&base, OpenMode::ReadWrite, Some(other)),
        Err(Error::Unsupported(_))
    ));
}

#[test]
fn drop_table_removes_files() {
    let dir = tempfile::tempdir().unwrap();
    let base: PathBuf = dir.path().join("t");
    {
        let t = table_open(&base, OpenMode::ReadWrite, Some(wal_schema())).unwrap();
        put(
            &t,
            vec![Variant::UInt64(1), Variant::Str(Rc::new("x".into()))],
            false,
        )
        .unwrap();
    }
    assert!(dir.path().join("t.flint").exists());
    table_drop(&base).unwrap();
    assert_eq!(std::fs::read_dir(dir.path()).unwrap().count(), 0);
    // Dropping again is a no-op.
    table_drop(&base).unwrap();
}

#[test]
fn big_rows_through_small_cache() {
    // Row slots around 64 KiB squeeze the cache floor down to a few rows,
    // exercising eviction on the read path.
    let t = Table::open_mem(schema(
        "CREATE TABLE t (id uint, pad bytes(65000), INDEX primary (id)) CACHE=1",
    ))
    .unwrap();
    for i in 0..9_u64 {
        let pad = vec![i as u8; 60_000];
        put(
            &t,
            vec![Variant::UInt64(i), Variant::Bytes(Rc::new(pad))],
            false,
        )
        .unwrap();
    }
    for i in (0..9_u64).rev() {
        let row = t.one("primary", &[&i.to_string()]).unwrap();
        let pad = row.values[1].bytes().unwrap();
        assert_eq!(pad.len(), 60_000);
        assert!(pad.iter().all(|b| *b == i as u8));
    }
}

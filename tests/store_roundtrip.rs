use shelfdb::{ColumnDef, ColumnKind, Database, StoreError, TableDef, Value};

fn tribble_def() -> TableDef {
    TableDef::new(
        "tribble",
        vec![
            ColumnDef::new("name", ColumnKind::Str { len: 8 }),
            ColumnDef::new("age", ColumnKind::Int),
            ColumnDef::new("notes", ColumnKind::StrBlob),
            ColumnDef::new("traits", ColumnKind::Pickle { len: 32 }),
        ],
    )
}

#[test]
fn every_kind_round_trips_through_a_reconnect() {
    let dir = tempfile::tempdir().unwrap();
    let id = {
        let mut db = Database::connect(dir.path(), vec![tribble_def()]).unwrap();
        let tribbles = db.table_mut("tribble").unwrap();
        let id = tribbles.create();
        tribbles.set(id, "name", Value::str("Fuzzy")).unwrap();
        tribbles.set(id, "age", Value::Int(-3)).unwrap();
        tribbles
            .set(id, "notes", Value::str("purrs at warp speed"))
            .unwrap();
        tribbles
            .set(id, "traits", Value::bytes(vec![1, 2, 3]))
            .unwrap();
        db.save().unwrap();
        id
    };

    let db = Database::connect(dir.path(), vec![tribble_def()]).unwrap();
    let tribbles = db.table("tribble").unwrap();
    assert_eq!(tribbles.get(id, "name").unwrap(), Value::str("Fuzzy"));
    assert_eq!(tribbles.get(id, "age").unwrap(), Value::Int(-3));
    assert_eq!(
        tribbles.get(id, "notes").unwrap(),
        Value::str("purrs at warp speed")
    );
    assert_eq!(
        tribbles.get(id, "traits").unwrap(),
        Value::bytes(vec![1, 2, 3])
    );
    assert_eq!(tribbles.get(id, "id").unwrap(), Value::Id(id));
}

#[test]
fn fresh_rows_read_back_their_blanks() {
    let dir = tempfile::tempdir().unwrap();
    let mut db = Database::connect(dir.path(), vec![tribble_def()]).unwrap();
    let tribbles = db.table_mut("tribble").unwrap();
    let id = tribbles.create();
    assert_eq!(tribbles.get(id, "name").unwrap(), Value::str(""));
    assert_eq!(tribbles.get(id, "age").unwrap(), Value::Int(0));
    assert_eq!(tribbles.get(id, "notes").unwrap(), Value::str(""));
    assert_eq!(tribbles.get(id, "traits").unwrap(), Value::Null);
}

#[test]
fn oversized_value_is_rejected_and_nothing_changes() {
    let dir = tempfile::tempdir().unwrap();
    let mut db = Database::connect(dir.path(), vec![tribble_def()]).unwrap();
    let tribbles = db.table_mut("tribble").unwrap();
    let id = tribbles.create();
    tribbles.set(id, "name", Value::str("Spot")).unwrap();

    let err = tribbles
        .set(id, "name", Value::str("overlylongname"))
        .unwrap_err();
    assert_eq!(
        err.downcast_ref::<StoreError>(),
        Some(&StoreError::LengthExceeded {
            column: "name".to_string(),
            attempted: 14,
            max: 8,
        })
    );
    assert_eq!(tribbles.get(id, "name").unwrap(), Value::str("Spot"));
}

#[test]
fn wrong_kind_is_rejected() {
    let dir = tempfile::tempdir().unwrap();
    let mut db = Database::connect(dir.path(), vec![tribble_def()]).unwrap();
    let tribbles = db.table_mut("tribble").unwrap();
    let id = tribbles.create();
    let err = tribbles.set(id, "age", Value::str("three")).unwrap_err();
    assert!(matches!(
        err.downcast_ref::<StoreError>(),
        Some(StoreError::KindMismatch { .. })
    ));
}

#[test]
fn ids_grow_monotonically_and_are_never_reused() {
    let dir = tempfile::tempdir().unwrap();
    let mut db = Database::connect(dir.path(), vec![tribble_def()]).unwrap();
    let tribbles = db.table_mut("tribble").unwrap();
    let a = tribbles.create();
    let b = tribbles.create();
    assert_eq!((a, b), (1, 2));
    db.save().unwrap();

    let tribbles = db.table_mut("tribble").unwrap();
    tribbles.destroy(b).unwrap();
    assert_eq!(tribbles.create(), 3);
    db.save().unwrap();
    drop(db);

    // the counter survives a reconnect as well
    let mut db = Database::connect(dir.path(), vec![tribble_def()]).unwrap();
    assert_eq!(db.table_mut("tribble").unwrap().create(), 4);
}

#[test]
fn empty_pickle_payload_survives_a_reconnect() {
    let dir = tempfile::tempdir().unwrap();
    {
        let mut db = Database::connect(dir.path(), vec![tribble_def()]).unwrap();
        let tribbles = db.table_mut("tribble").unwrap();
        let id = tribbles.create();
        tribbles.set(id, "traits", Value::bytes(vec![])).unwrap();
        assert_eq!(tribbles.get(id, "traits").unwrap(), Value::bytes(vec![]));
        db.save().unwrap();
    }

    // an empty payload is data, not the blank
    let db = Database::connect(dir.path(), vec![tribble_def()]).unwrap();
    assert_eq!(
        db.table("tribble").unwrap().get(1, "traits").unwrap(),
        Value::bytes(vec![])
    );
}

#[test]
fn typed_payloads_flow_through_pickle_columns() {
    let dir = tempfile::tempdir().unwrap();
    let mut db = Database::connect(dir.path(), vec![tribble_def()]).unwrap();
    let tribbles = db.table_mut("tribble").unwrap();
    let id = tribbles.create();

    assert_eq!(tribbles.get_as::<i64>(id, "traits").unwrap(), None);
    tribbles.set_as(id, "traits", &99i64).unwrap();
    assert_eq!(tribbles.get_as::<i64>(id, "traits").unwrap(), Some(99));
    db.save().unwrap();
    drop(db);

    let db = Database::connect(dir.path(), vec![tribble_def()]).unwrap();
    assert_eq!(
        db.table("tribble").unwrap().get_as::<i64>(1, "traits").unwrap(),
        Some(99)
    );
}

#[test]
fn unknown_column_reads_fail_with_a_typed_error() {
    let dir = tempfile::tempdir().unwrap();
    let mut db = Database::connect(dir.path(), vec![tribble_def()]).unwrap();
    let tribbles = db.table_mut("tribble").unwrap();
    let id = tribbles.create();
    let err = tribbles.get(id, "color").unwrap_err();
    assert!(matches!(
        err.downcast_ref::<StoreError>(),
        Some(StoreError::UnknownColumn { .. })
    ));
}

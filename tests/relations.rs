use shelfdb::{
    ColumnDef, ColumnKind, Database, IndexDef, Resolved, StoreError, TableDef, Value, VirtualDef,
};

fn defs() -> Vec<TableDef> {
    vec![
        TableDef::new(
            "human",
            vec![ColumnDef::new("name", ColumnKind::Str { len: 16 })],
        )
        .with_virtual("tribbles", VirtualDef::belongs("tribble", "owner"))
        .with_virtual("tribble_names", VirtualDef::through("tribbles", "name")),
        TableDef::new(
            "tribble",
            vec![
                ColumnDef::new("name", ColumnKind::Str { len: 8 }),
                ColumnDef::new(
                    "owner",
                    ColumnKind::Foreign {
                        table: "human".to_string(),
                    },
                ),
            ],
        )
        .with_index(IndexDef::new(vec!["owner"])),
    ]
}

fn seeded(dir: &std::path::Path) -> (Database, u64) {
    let mut db = Database::connect(dir, defs()).unwrap();
    let kirk = {
        let humans = db.table_mut("human").unwrap();
        let id = humans.create();
        humans.set(id, "name", Value::str("Kirk")).unwrap();
        id
    };
    let tribbles = db.table_mut("tribble").unwrap();
    for name in ["Fuzzy", "Spot", "Blinky"] {
        let id = tribbles.create();
        tribbles.set(id, "name", Value::str(name)).unwrap();
        tribbles.set(id, "owner", Value::Id(kirk)).unwrap();
    }
    (db, kirk)
}

#[test]
fn belongs_lists_the_rows_pointing_back() {
    let dir = tempfile::tempdir().unwrap();
    let (db, kirk) = seeded(dir.path());
    let resolved = db.related("human", kirk, "tribbles").unwrap();
    assert_eq!(
        resolved,
        Resolved::Rows {
            table: "tribble".to_string(),
            ids: vec![1, 2, 3],
        }
    );
}

#[test]
fn through_projects_a_column_across_the_relation() {
    let dir = tempfile::tempdir().unwrap();
    let (db, kirk) = seeded(dir.path());
    let resolved = db.related("human", kirk, "tribble_names").unwrap();
    assert_eq!(
        resolved.values().unwrap(),
        &[Value::str("Fuzzy"), Value::str("Spot"), Value::str("Blinky")]
    );
}

#[test]
fn nulling_the_reference_detaches_the_row() {
    let dir = tempfile::tempdir().unwrap();
    let (mut db, kirk) = seeded(dir.path());
    db.table_mut("tribble")
        .unwrap()
        .set(2, "owner", Value::Null)
        .unwrap();
    let resolved = db.related("human", kirk, "tribbles").unwrap();
    assert_eq!(resolved.rows().unwrap().1, &[1, 3]);
}

#[test]
fn relations_survive_a_save_and_reconnect() {
    let dir = tempfile::tempdir().unwrap();
    let kirk = {
        let (mut db, kirk) = seeded(dir.path());
        db.save().unwrap();
        kirk
    };
    let db = Database::connect(dir.path(), defs()).unwrap();
    let resolved = db.related("human", kirk, "tribble_names").unwrap();
    assert_eq!(resolved.values().unwrap().len(), 3);
}

#[test]
fn oversized_write_leaves_the_relation_view_unchanged() {
    let dir = tempfile::tempdir().unwrap();
    let (mut db, kirk) = seeded(dir.path());
    let err = db
        .table_mut("tribble")
        .unwrap()
        .set(1, "name", Value::str("overlylongname"))
        .unwrap_err();
    assert!(matches!(
        err.downcast_ref::<StoreError>(),
        Some(StoreError::LengthExceeded { .. })
    ));
    let resolved = db.related("human", kirk, "tribble_names").unwrap();
    assert_eq!(resolved.values().unwrap()[0], Value::str("Fuzzy"));
}

#[test]
fn two_owners_see_disjoint_relations() {
    let dir = tempfile::tempdir().unwrap();
    let (mut db, kirk) = seeded(dir.path());
    let spock = {
        let humans = db.table_mut("human").unwrap();
        let id = humans.create();
        humans.set(id, "name", Value::str("Spock")).unwrap();
        id
    };
    db.table_mut("tribble")
        .unwrap()
        .set(3, "owner", Value::Id(spock))
        .unwrap();

    assert_eq!(
        db.related("human", kirk, "tribbles").unwrap().rows().unwrap().1,
        &[1, 2]
    );
    assert_eq!(
        db.related("human", spock, "tribbles").unwrap().rows().unwrap().1,
        &[3]
    );
}

#[test]
fn resolving_for_a_missing_row_is_an_error() {
    let dir = tempfile::tempdir().unwrap();
    let (db, _) = seeded(dir.path());
    let err = db.related("human", 99, "tribbles").unwrap_err();
    assert!(matches!(
        err.downcast_ref::<StoreError>(),
        Some(StoreError::RowNotFound { .. })
    ));
}

use std::fs;

use epet_storage::{StagedRow, StagingWriter};
use epet_sync::{
    DatasetKind, LookupEntry, LookupTable, MemoryStore, Reconciler, RelationalStore, StoreError,
};
use serde_json::{json, Map, Value as JsonValue};
use tempfile::TempDir;

fn row(cells: &[(&str, &str)]) -> StagedRow {
    StagedRow::from_cells(cells.iter().copied())
}

fn petition(id: &str, state: &str, file_id: &str) -> StagedRow {
    let files = format!(r#"[{{"id":"{file_id}","name":"{file_id}.pdf","mimeType":"application/pdf"}}]"#);
    row(&[
        ("id", id),
        ("title", "Green yards"),
        ("state", state),
        ("source", r#"{"code":"PORTAL"}"#),
        ("organization", r#"{"id":"org-1","name":"City hall"}"#),
        ("coverFile", r#"{"id":"cover-1","mimeType":"image/png"}"#),
        ("files", files.as_str()),
        ("signersCount", "3"),
    ])
}

fn comment(id: &str, parent: &str, created: &str) -> StagedRow {
    row(&[
        ("id", id),
        ("petitionId", "p1"),
        ("parentId", parent),
        ("fio", "Reader"),
        ("comment", "+1"),
        ("repliesCount", ""),
        ("createdDate", created),
    ])
}

fn signer(created: &str) -> StagedRow {
    row(&[("petitionId", "p1"), ("fio", "Signer"), ("createdDate", created)])
}

async fn seeded() -> Reconciler<MemoryStore> {
    let reconciler = Reconciler::new(MemoryStore::new());
    reconciler
        .load_petitions(&[petition("p1", "ACTIVE", "f1")])
        .await
        .unwrap();
    reconciler
}

#[tokio::test]
async fn loading_the_same_batch_twice_is_idempotent() {
    let reconciler = seeded().await;
    let petitions = vec![petition("p1", "ACTIVE", "f1"), petition("p2", "ACTIVE", "f1")];
    let comments = vec![
        comment("c2", "c1", "2024-02-01T10:05:00Z"),
        comment("c1", "", "2024-02-01T10:00:00Z"),
    ];
    let signers = vec![signer("2024-02-01T11:00:00Z"), signer("2024-02-01T11:01:00Z")];

    reconciler.load_petitions(&petitions).await.unwrap();
    reconciler.load_comments(&comments).await.unwrap();
    reconciler.load_signers(&signers).await.unwrap();
    let once = reconciler.store().tables();

    let petitions_again = reconciler.load_petitions(&petitions).await.unwrap();
    let comments_again = reconciler.load_comments(&comments).await.unwrap();
    let signers_again = reconciler.load_signers(&signers).await.unwrap();

    assert_eq!(reconciler.store().tables(), once);
    assert_eq!(petitions_again.inserted, 0);
    assert_eq!(comments_again.already_present, 2);
    assert!(signers_again.batch_skipped);
    assert_eq!(once.petitions.len(), 2);
    assert_eq!(once.comments.len(), 2);
    assert_eq!(once.signers.len(), 2);
}

#[tokio::test]
async fn shared_lookups_resolve_to_one_surrogate_id() {
    let reconciler = Reconciler::new(MemoryStore::new());
    reconciler
        .load_petitions(&[petition("p1", "ACTIVE", "f1"), petition("p2", "ACTIVE", "f1")])
        .await
        .unwrap();

    let tables = reconciler.store().tables();
    let states: Vec<_> = tables
        .named
        .keys()
        .filter(|(table, _)| *table == LookupTable::States)
        .collect();
    assert_eq!(states.len(), 1);
    assert_eq!(tables.organizations.len(), 1);
    assert_eq!(tables.files.len(), 2);
    assert_eq!(tables.petition_files.len(), 2);

    let (_, p1) = &tables.petitions["p1"];
    let (_, p2) = &tables.petitions["p2"];
    assert_eq!(p1.state_id, p2.state_id);
    assert_eq!(p1.organization_id, p2.organization_id);
    assert_eq!(p1.cover_file_id, Some(tables.files["cover-1"].id));
    assert_eq!(p1.signers_count, Some(3));
}

#[tokio::test]
async fn resolve_or_create_returns_the_existing_id() {
    let reconciler = Reconciler::new(MemoryStore::new());
    let entry = LookupEntry::Named {
        table: LookupTable::Languages,
        name: "kk".to_string(),
    };
    let first = reconciler.resolve_or_create(&entry).await.unwrap();
    let second = reconciler.resolve_or_create(&entry).await.unwrap();
    assert_eq!(first, second);
    assert_eq!(reconciler.store().lookup_id(&entry).await.unwrap(), Some(first));
}

#[tokio::test]
async fn empty_parent_reference_is_stored_as_absent() {
    let reconciler = seeded().await;
    let report = reconciler
        .load_comments(&[comment("c1", "", "2024-02-01T10:00:00Z")])
        .await
        .unwrap();
    assert_eq!(report.inserted, 1);
    let tables = reconciler.store().tables();
    assert_eq!(tables.comments["c1"].row.parent_external_id, None);
}

#[tokio::test]
async fn comments_are_inserted_oldest_first() {
    let reconciler = seeded().await;
    reconciler
        .load_comments(&[
            comment("reply", "root", "2024-02-01T10:05:00Z"),
            comment("root", "", "2024-02-01T10:00:00Z"),
        ])
        .await
        .unwrap();
    let tables = reconciler.store().tables();
    assert!(tables.comments["root"].id < tables.comments["reply"].id);
    assert_eq!(
        tables.comments["reply"].row.parent_external_id.as_deref(),
        Some("root")
    );
}

#[tokio::test]
async fn signer_batch_overlapping_loaded_rows_is_skipped_whole() {
    let reconciler = seeded().await;
    reconciler
        .load_signers(&[signer("2024-02-01T11:00:00Z")])
        .await
        .unwrap();

    let report = reconciler
        .load_signers(&[signer("2024-02-01T12:00:00Z"), signer("2024-02-01T11:00:00Z")])
        .await
        .unwrap();
    assert!(report.batch_skipped);
    assert_eq!(report.inserted, 0);
    assert_eq!(reconciler.store().tables().signers.len(), 1);

    let later = reconciler
        .load_signers(&[signer("2024-02-01T12:00:00Z")])
        .await
        .unwrap();
    assert_eq!(later.inserted, 1);
}

#[tokio::test]
async fn children_of_unknown_petitions_are_a_storage_fault() {
    let reconciler = Reconciler::new(MemoryStore::new());
    let err = reconciler
        .load_signers(&[signer("2024-02-01T11:00:00Z")])
        .await
        .unwrap_err();
    assert!(matches!(
        err.downcast_ref::<StoreError>(),
        Some(StoreError::MissingParent(id)) if id == "p1"
    ));
    assert!(reconciler.store().tables().signers.is_empty());
}

fn stage(dir: &TempDir, name: &str, rows: &[Map<String, JsonValue>]) {
    let mut writer = StagingWriter::create(dir.path().join(name)).unwrap();
    writer.append_rows(rows).unwrap();
    writer.finish().unwrap();
}

fn comment_json(id: &str, created: &str) -> Map<String, JsonValue> {
    let value = json!({
        "id": id,
        "petitionId": "p1",
        "parentId": "",
        "fio": "Reader",
        "comment": "text",
        "repliesCount": 0,
        "createdDate": created,
    });
    value.as_object().cloned().unwrap()
}

#[tokio::test]
async fn pending_artifacts_load_oldest_first_and_are_removed() {
    let dir = TempDir::new().unwrap();
    stage(&dir, "comments_20240202_000000.csv", &[comment_json("c2", "2024-02-01T12:00:00Z")]);
    stage(&dir, "comments_20240201_000000.csv", &[comment_json("c1", "2024-01-31T12:00:00Z")]);
    stage(&dir, "signers_20240201_000000.csv", &[]);

    let reconciler = seeded().await;
    let reports = reconciler
        .load_pending(dir.path(), DatasetKind::Comments)
        .await
        .unwrap();

    assert_eq!(reports.len(), 2);
    assert!(reports[0]
        .source
        .as_ref()
        .unwrap()
        .ends_with("comments_20240201_000000.csv"));
    let tables = reconciler.store().tables();
    assert!(tables.comments["c1"].id < tables.comments["c2"].id);
    assert_eq!(tables.comments["c1"].row.replies_count, Some(0));

    let left: Vec<_> = fs::read_dir(dir.path())
        .unwrap()
        .map(|e| e.unwrap().file_name().to_string_lossy().into_owned())
        .collect();
    assert_eq!(left, vec!["signers_20240201_000000.csv"]);
}

#[tokio::test]
async fn storage_fault_keeps_the_artifact_and_committed_rows() {
    let dir = TempDir::new().unwrap();
    stage(
        &dir,
        "comments_20240201_000000.csv",
        &[
            comment_json("c1", "2024-02-01T10:00:00Z"),
            comment_json("c2", "2024-02-01T10:01:00Z"),
            comment_json("c3", "2024-02-01T10:02:00Z"),
        ],
    );
    let reconciler = seeded().await;
    reconciler.store().fail_comment("c2");

    assert!(reconciler
        .load_pending(dir.path(), DatasetKind::Comments)
        .await
        .is_err());
    let tables = reconciler.store().tables();
    assert!(tables.comments.contains_key("c1"));
    assert!(!tables.comments.contains_key("c3"));
    assert!(dir.path().join("comments_20240201_000000.csv").exists());

    reconciler.store().clear_failures();
    let reports = reconciler
        .load_pending(dir.path(), DatasetKind::Comments)
        .await
        .unwrap();
    assert_eq!(reports[0].already_present, 1);
    assert_eq!(reports[0].inserted, 2);
    assert!(!dir.path().join("comments_20240201_000000.csv").exists());
}

#[tokio::test]
async fn kept_artifacts_survive_a_rehearsal() {
    let dir = TempDir::new().unwrap();
    stage(&dir, "comments_20240201_000000.csv", &[comment_json("c1", "2024-02-01T10:00:00Z")]);

    let reconciler = Reconciler::new(MemoryStore::registering_missing_parents()).keep_artifacts(true);
    let reports = reconciler
        .load_pending(dir.path(), DatasetKind::Comments)
        .await
        .unwrap();
    assert_eq!(reports[0].inserted, 1);
    assert!(dir.path().join("comments_20240201_000000.csv").exists());
}

fn signer_json(created: &str) -> Map<String, JsonValue> {
    let value = json!({"petitionId": "p1", "fio": "Signer", "createdDate": created});
    value.as_object().cloned().unwrap()
}

#[tokio::test]
async fn hand_picked_older_signer_batch_is_kept_when_skipped() {
    let dir = TempDir::new().unwrap();
    stage(&dir, "signers_20240201_000000.csv", &[signer_json("2024-01-31T12:00:00Z")]);
    stage(&dir, "signers_20240202_000000.csv", &[signer_json("2024-02-01T12:00:00Z")]);
    let older = dir.path().join("signers_20240201_000000.csv");
    let newer = dir.path().join("signers_20240202_000000.csv");

    let reconciler = seeded().await;
    let first = reconciler
        .load_selected(DatasetKind::Signers, &newer)
        .await
        .unwrap();
    assert_eq!(first.inserted, 1);
    assert!(!newer.exists());

    let second = reconciler
        .load_selected(DatasetKind::Signers, &older)
        .await
        .unwrap();
    assert!(second.batch_skipped);
    assert!(older.exists());
    assert_eq!(reconciler.store().tables().signers.len(), 1);
}

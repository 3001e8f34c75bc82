// Integration tests for the library store
// Each test uses a fresh in-memory database with migrations applied.

use nrg_datasense::db::{
    connect_in_memory, FileMetadataUpdate, FileRegistration, FileRepository, FileSource,
    FileStatus, LibraryFilter, SensorRecordRepository, SortField, SortOrder,
};
use nrg_datasense::logger::SensorRecord;
use std::collections::HashSet;

/// Test fixture module for library store tests
mod fixtures {
    use super::*;

    pub fn registration(filename: &str, tags: &[&str], category: &str) -> FileRegistration {
        FileRegistration {
            filename: filename.to_string(),
            file_size: 1000,
            tags: tags.iter().map(|t| t.to_string()).collect(),
            category: category.to_string(),
            description: None,
            source: FileSource::TxtUpload,
            checksum: None,
        }
    }

    pub fn records(filename: &str, count: usize) -> Vec<SensorRecord> {
        (0..count)
            .map(|i| {
                let mut record =
                    SensorRecord::new(format!("2024-01-01 00:{:02}:00", i % 60), filename);
                record.wind_speed = i as f64;
                record
            })
            .collect()
    }

    pub async fn setup() -> (FileRepository, SensorRecordRepository) {
        let pool = connect_in_memory().await.expect("in-memory database");
        (
            FileRepository::new(pool.clone()),
            SensorRecordRepository::new(pool),
        )
    }
}

use fixtures::{records, registration, setup};

#[tokio::test]
async fn test_register_inserts_metadata_and_records() {
    let (files, sensor) = setup().await;

    let registered = files
        .register_with_records(&registration("a.txt", &["TXT"], "general"), &records("a.txt", 5))
        .await
        .unwrap();

    assert_eq!(registered.status, FileStatus::Processed);
    assert_eq!(registered.version, 1);
    assert_eq!(registered.records_inserted, 5);
    assert_eq!(registered.records_replaced, 0);

    let file = files.find_by_id(registered.id).await.unwrap().unwrap();
    assert_eq!(file.filename, "a.txt");
    assert_eq!(file.record_count, 5);
    assert_eq!(file.tags, vec!["TXT"]);
    assert_eq!(sensor.count_by_filename("a.txt").await.unwrap(), 5);
}

#[tokio::test]
async fn test_bulk_insert_spans_multiple_chunks() {
    let (files, sensor) = setup().await;

    files
        .register_with_records(&registration("big.txt", &[], "general"), &records("big.txt", 250))
        .await
        .unwrap();

    assert_eq!(sensor.count_by_filename("big.txt").await.unwrap(), 250);
}

#[tokio::test]
async fn test_reregister_replaces_records_and_bumps_version() {
    let (files, sensor) = setup().await;

    let first = files
        .register_with_records(&registration("a.txt", &[], "general"), &records("a.txt", 5))
        .await
        .unwrap();
    let second = files
        .register_with_records(&registration("a.txt", &["new"], "field"), &records("a.txt", 2))
        .await
        .unwrap();

    assert_eq!(second.id, first.id);
    assert_eq!(second.status, FileStatus::Updated);
    assert_eq!(second.version, 2);
    assert_eq!(second.records_replaced, 5);

    let file = files.find_by_id(first.id).await.unwrap().unwrap();
    assert_eq!(file.record_count, 2);
    assert_eq!(file.category, "field");
    assert_eq!(sensor.count_by_filename("a.txt").await.unwrap(), 2);
}

#[tokio::test]
async fn test_delete_only_removes_owned_records() {
    let (files, sensor) = setup().await;

    let a = files
        .register_with_records(&registration("a.txt", &[], "general"), &records("a.txt", 4))
        .await
        .unwrap();
    files
        .register_with_records(&registration("b.txt", &[], "general"), &records("b.txt", 3))
        .await
        .unwrap();

    let deleted = files.delete_many(&[a.id, 9999]).await.unwrap();
    assert_eq!(deleted.len(), 1);
    assert_eq!(deleted[0].filename, "a.txt");

    assert_eq!(sensor.count_by_filename("a.txt").await.unwrap(), 0);
    assert_eq!(sensor.count_by_filename("b.txt").await.unwrap(), 3);
    assert_eq!(sensor.count().await.unwrap(), 3);
    assert!(files.find_by_id(a.id).await.unwrap().is_none());
}

#[tokio::test]
async fn test_pages_reproduce_full_filtered_set() {
    let (files, _) = setup().await;

    for i in 0..23 {
        let tags: &[&str] = if i % 2 == 0 { &["even", "site"] } else { &["site"] };
        files
            .register_with_records(
                &registration(&format!("file_{i:02}.txt"), tags, "general"),
                &records("unused", 1),
            )
            .await
            .unwrap();
    }

    let filter = LibraryFilter {
        tags: vec!["site".into(), "even".into()],
        ..Default::default()
    };
    let total = files.count(&filter).await.unwrap();
    assert_eq!(total, 12);

    // Every file has the same size, so ordering relies on the id tiebreak
    let mut seen = Vec::new();
    let page_size = 5;
    let mut offset = 0;
    loop {
        let page = files
            .find_filtered(&filter, SortField::Size, SortOrder::Desc, offset, page_size)
            .await
            .unwrap();
        if page.is_empty() {
            break;
        }
        seen.extend(page.into_iter().map(|f| f.filename));
        offset += page_size;
    }

    let unique: HashSet<_> = seen.iter().cloned().collect();
    assert_eq!(seen.len(), total as usize);
    assert_eq!(unique.len(), seen.len());
}

#[tokio::test]
async fn test_search_category_and_sort() {
    let (files, _) = setup().await;

    for (name, category) in [
        ("Alpha_mast.txt", "field"),
        ("beta_mast.txt", "field"),
        ("gamma.txt", "lab"),
    ] {
        files
            .register_with_records(&registration(name, &[], category), &records(name, 1))
            .await
            .unwrap();
    }

    let filter = LibraryFilter {
        search: Some("MAST".into()),
        ..Default::default()
    };
    let found = files
        .find_filtered(&filter, SortField::Filename, SortOrder::Asc, 0, 10)
        .await
        .unwrap();
    let names: Vec<_> = found.iter().map(|f| f.filename.as_str()).collect();
    assert_eq!(names, vec!["Alpha_mast.txt", "beta_mast.txt"]);

    let filter = LibraryFilter {
        category: Some("lab".into()),
        ..Default::default()
    };
    assert_eq!(files.count(&filter).await.unwrap(), 1);
}

#[tokio::test]
async fn test_update_metadata_is_partial() {
    let (files, _) = setup().await;
    let registered = files
        .register_with_records(&registration("a.txt", &["TXT"], "general"), &records("a.txt", 1))
        .await
        .unwrap();

    let update = FileMetadataUpdate {
        description: Some("calibrated".into()),
        status: Some(FileStatus::Active),
        ..Default::default()
    };
    let updated = files
        .update_metadata(registered.id, &update)
        .await
        .unwrap()
        .unwrap();

    assert_eq!(updated.description.as_deref(), Some("calibrated"));
    assert_eq!(updated.status, FileStatus::Active);
    assert_eq!(updated.tags, vec!["TXT"]);
    assert_eq!(updated.category, "general");

    assert!(files
        .update_metadata(9999, &update)
        .await
        .unwrap()
        .is_none());
}

#[tokio::test]
async fn test_stats_are_derived_from_rows() {
    let (files, _) = setup().await;

    files
        .register_with_records(&registration("a.txt", &["TXT", "north"], "field"), &records("a.txt", 3))
        .await
        .unwrap();
    let mut rld = registration("b.rld", &["RLD", "north"], "field");
    rld.source = FileSource::Backend;
    files
        .register_with_records(&rld, &records("b.rld", 2))
        .await
        .unwrap();

    let stats = files.stats(10).await.unwrap();
    assert_eq!(stats.total_files, 2);
    assert_eq!(stats.total_records, 5);
    assert_eq!(stats.total_bytes, 2000);
    assert_eq!(stats.files_last_7_days, 2);
    assert_eq!(stats.files_last_30_days, 2);
    assert_eq!(stats.by_source.len(), 2);
    assert_eq!(stats.by_category[0].category, "field");
    assert_eq!(stats.by_category[0].count, 2);
    assert_eq!(stats.top_tags[0].tag, "north");
    assert_eq!(stats.top_tags[0].count, 2);
}

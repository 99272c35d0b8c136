//! End-to-end runs against in-memory providers.

mod common;

use ingest_core::config::Targets;
use ingest_core::error::RowFailure;
use ingest_core::location::ObjectUri;
use ingest_exec::{Engine, ExecError};

use common::*;

#[test]
fn local_files_land_under_their_crc32c() {
    let dir = tempfile::tempdir().unwrap();
    let manifest = write_batch(dir.path(), &[("a.txt", b"alpha"), ("b.txt", b"bravo")]);
    let providers = Providers::new();
    let engine = Engine::new(config(gcs_only()), providers.backends());

    let report = run(&engine, &manifest).unwrap();
    assert_eq!((report.rows, report.incomplete), (2, 0));
    assert_eq!(report.metrics.uploaded, 2);

    for row in rows_of(&report.manifest_path) {
        let crc = ingest_core::digest::crc32c_from_base64(row.gcs_crc32c.as_deref().unwrap()).unwrap();
        let identifier = row.identifier.as_ref().unwrap();
        let dest = row.gcs.as_ref().unwrap();
        let uri = ObjectUri::parse(&dest.path).unwrap();
        assert_eq!(uri.bucket, BUCKET);
        let segment = identifier.guid.rsplit('/').next().unwrap();
        assert_eq!(uri.key, format!("{crc}/{segment}/{}", row.file_name));
        assert!(identifier.uri.starts_with("drs://dg.4503:dg.4503%2F"));
        assert_eq!(dest.size, 5);
        assert!(row.content_md5.is_some());
        assert!(providers.gcs.contains(BUCKET, &uri.key));
    }
}

#[test]
fn ten_megabytes_upload_with_a_two_part_tag() {
    let dir = tempfile::tempdir().unwrap();
    let data: Vec<u8> = (0..10 * 1024 * 1024).map(|i| ((i * 31 + 7) % 251) as u8).collect();
    let manifest = write_batch(dir.path(), &[("big.bin", &data)]);
    let providers = Providers::new();
    let cfg = ingest_core::config::IngestConfig {
        chunk_size: 5 * 1024 * 1024,
        ..config(aws_only())
    };
    let engine = Engine::new(cfg, providers.backends());

    let report = run(&engine, &manifest).unwrap();
    let row = &rows_of(&report.manifest_path)[0];
    assert_eq!(row.aws_tag.as_deref(), Some("a8c6388e6556658eb669d05e70592b75-2"));
    let dest = row.aws.as_ref().unwrap();
    assert!(dest.path.starts_with(&format!("s3://{BUCKET}/a8c6388e6556658eb669d05e70592b75-2/")));
    assert_eq!(dest.size, data.len() as u64);
}

#[test]
fn identical_content_is_stored_once() {
    let dir = tempfile::tempdir().unwrap();
    let manifest = write_batch(
        dir.path(),
        &[("one.txt", b"same bytes"), ("two.txt", b"same bytes"), ("three.txt", b"other")],
    );
    let providers = Providers::new();
    let targets = Targets {
        aws: true,
        gcs: true,
    };
    let engine = Engine::new(config(targets), providers.backends());

    let report = run(&engine, &manifest).unwrap();
    assert_eq!(report.incomplete, 0);
    assert_eq!(providers.gcs.upload_count(), 2);
    assert_eq!(providers.aws.upload_count(), 2);
    assert_eq!(report.metrics.deduplicated, 2);

    let rows = rows_of(&report.manifest_path);
    assert_eq!(rows[0].gcs, rows[1].gcs);
    assert_eq!(rows[0].aws, rows[1].aws);
    assert_eq!(rows[0].identifier, rows[1].identifier);
    assert_ne!(rows[0].gcs, rows[2].gcs);
}

#[test]
fn unwritable_bucket_aborts_before_any_work() {
    let dir = tempfile::tempdir().unwrap();
    let manifest = write_batch(dir.path(), &[("a.txt", b"alpha")]);
    let providers = Providers::new();
    providers.gcs.deny_writes(BUCKET);
    let engine = Engine::new(config(gcs_only()), providers.backends());

    let err = run(&engine, &manifest).unwrap_err();
    let ExecError::Validation(report) = err else {
        panic!("expected a validation failure, got {err}");
    };
    assert!(report.problems.iter().any(|p| p.contains(BUCKET)));
    assert!(receipts(dir.path()).is_empty());
    assert_eq!(engine.metrics().checksummed, 0);
    assert_eq!(providers.gcs.upload_count(), 0);
}

#[test]
fn validation_reports_every_problem_at_once() {
    let dir = tempfile::tempdir().unwrap();
    let mut missing = row(&dir.path().join("gone.txt").display().to_string());
    missing.consent_group = "c1".into();
    let mut unnamed = row(&dir.path().join("gone2.txt").display().to_string());
    unnamed.consent_group.clear();
    let manifest = write_manifest(dir.path(), &[missing, unnamed]);
    let providers = Providers::new();
    let engine = Engine::new(config(gcs_only()), providers.backends());

    let ExecError::Validation(report) = run(&engine, &manifest).unwrap_err() else {
        panic!("expected a validation failure");
    };
    assert!(report.len() >= 3, "{report}");
}

#[test]
fn test_mode_stops_after_validation() {
    let dir = tempfile::tempdir().unwrap();
    let manifest = write_batch(dir.path(), &[("a.txt", b"alpha")]);
    let providers = Providers::new();
    let cfg = ingest_core::config::IngestConfig {
        verify_only: true,
        ..config(gcs_only())
    };
    let engine = Engine::new(cfg, providers.backends());

    let outcome = engine.run(input(&manifest)).unwrap();
    assert!(matches!(outcome, ingest_exec::RunOutcome::Verified { rows: 1 }));
    assert!(receipts(dir.path()).is_empty());
    assert_eq!(providers.gcs.upload_count(), 0);
}

#[test]
fn strict_integrity_fails_the_row_and_removes_the_object() {
    let dir = tempfile::tempdir().unwrap();
    let manifest = write_batch(dir.path(), &[("a.txt", b"alpha")]);
    let providers = Providers::new();
    providers.gcs.corrupt_reported_checksums(true);
    let engine = Engine::new(config(gcs_only()), providers.backends());

    let report = run(&engine, &manifest).unwrap();
    assert_eq!(report.incomplete, 1);
    assert_eq!(report.failures.len(), 1);
    assert!(matches!(report.failures[0].failure, RowFailure::IntegrityMismatch { .. }));
    assert!(providers.gcs.keys(BUCKET).is_empty());
    assert!(rows_of(&report.manifest_path)[0].gcs.is_none());
}

#[test]
fn lenient_integrity_keeps_the_destination() {
    let dir = tempfile::tempdir().unwrap();
    let manifest = write_batch(dir.path(), &[("a.txt", b"alpha")]);
    let providers = Providers::new();
    providers.gcs.corrupt_reported_checksums(true);
    let cfg = ingest_core::config::IngestConfig {
        strict_integrity: false,
        ..config(gcs_only())
    };
    let engine = Engine::new(cfg, providers.backends());

    let report = run(&engine, &manifest).unwrap();
    assert_eq!(report.incomplete, 0);
    assert!(report.failures.is_empty());
}

#[test]
fn failed_uploads_leave_rows_for_the_next_run() {
    let dir = tempfile::tempdir().unwrap();
    let manifest = write_batch(dir.path(), &[("a.txt", b"alpha"), ("b.txt", b"bravo")]);
    let providers = Providers::new();
    providers.gcs.fail_uploads_after(1);
    let cfg = ingest_core::config::IngestConfig {
        upload_threads: 1,
        ..config(gcs_only())
    };
    let engine = Engine::new(cfg, providers.backends());

    let report = run(&engine, &manifest).unwrap();
    assert_eq!(report.incomplete, 1);
    assert_eq!(report.failures[0].failure.kind(), "transfer_io");
    let rows = rows_of(&report.manifest_path);
    assert_eq!(rows.iter().filter(|r| r.gcs.is_none()).count(), 1);
    // Checksums survive even when the transfer fails.
    assert!(rows.iter().all(|r| r.gcs_crc32c.is_some()));
}

#[test]
fn cross_provider_objects_are_staged_locally() {
    let dir = tempfile::tempdir().unwrap();
    let providers = Providers::new();
    providers.aws.insert("source", "runs/sample.bam", b"remote payload".to_vec());
    let manifest = write_manifest(dir.path(), &[row("s3://source/runs/sample.bam")]);
    let engine = Engine::new(config(gcs_only()), providers.backends());

    let report = run(&engine, &manifest).unwrap();
    assert_eq!(report.metrics.staged, 1);
    let row = &rows_of(&report.manifest_path)[0];
    assert_eq!(row.source_size, Some(14));
    let uri = ObjectUri::parse(&row.gcs.as_ref().unwrap().path).unwrap();
    assert!(uri.key.ends_with("/sample.bam"));
    assert_eq!(providers.gcs.object(BUCKET, &uri.key).unwrap(), b"remote payload");
}

#[test]
fn large_cross_provider_objects_stream_through_a_staging_key() {
    let dir = tempfile::tempdir().unwrap();
    let providers = Providers::new();
    providers.aws.insert("source", "runs/sample.bam", b"remote payload".to_vec());
    let manifest = write_manifest(dir.path(), &[row("s3://source/runs/sample.bam")]);
    let cfg = ingest_core::config::IngestConfig {
        max_download_size: 4,
        ..config(gcs_only())
    };
    let engine = Engine::new(cfg, providers.backends());

    let report = run(&engine, &manifest).unwrap();
    assert_eq!(report.metrics.streamed, 1);
    let row = &rows_of(&report.manifest_path)[0];
    assert!(row.gcs_crc32c.is_some() && row.content_md5.is_some());
    let keys = providers.gcs.keys(BUCKET);
    assert_eq!(keys.len(), 1, "{keys:?}");
    assert!(!keys[0].starts_with("tmp/"));
}

#[test]
fn same_provider_objects_are_copied_server_side() {
    let dir = tempfile::tempdir().unwrap();
    let providers = Providers::new();
    providers.aws.insert("source", "runs/sample.bam", b"remote payload".to_vec());
    let manifest = write_manifest(dir.path(), &[row("s3://source/runs/sample.bam")]);
    let engine = Engine::new(config(aws_only()), providers.backends());

    let report = run(&engine, &manifest).unwrap();
    assert_eq!(report.metrics.copied, 1);
    assert_eq!(providers.aws.copy_count(), 1);
    assert_eq!(providers.aws.upload_count(), 0);
    let row = &rows_of(&report.manifest_path)[0];
    let tag = row.aws_tag.clone().unwrap();
    assert_eq!(row.content_md5.as_deref(), Some(tag.as_str()));
    assert!(row.aws.as_ref().unwrap().path.contains(&format!("/{tag}/")));
}

//! Resume runs: idempotence, and recovery after an interrupted run.

mod common;

use std::fs;

use ingest_core::config::{IngestConfig, Targets};
use ingest_core::location::ObjectUri;
use ingest_core::manifest::{ManifestRow, ManifestSchema, Variant};
use ingest_exec::{Engine, ExecError, RunInput};
use ingest_io::lister::list_directory;

use common::*;

const FILES: &[(&str, &[u8])] = &[
    ("a.txt", b"alpha"),
    ("b.txt", b"bravo"),
    ("c.txt", b"charlie"),
    ("d.txt", b"delta"),
    ("e.txt", b"alpha"),
];

fn both() -> Targets {
    Targets {
        aws: true,
        gcs: true,
    }
}

fn resume(cfg: IngestConfig) -> IngestConfig {
    IngestConfig {
        resume: true,
        ..cfg
    }
}

/// File name, md5, crc32c, S3 tag and per-provider `scheme://bucket/digest size`.
type ContentView = (String, Option<String>, Option<String>, Option<String>, Vec<String>);

/// The parts of a row that do not depend on minted identifiers, timestamps or
/// the scratch directory.
fn content_view(row: &ManifestRow) -> ContentView {
    let prefixes = [&row.gcs, &row.aws]
        .into_iter()
        .map(|dest| {
            let dest = dest.as_ref().expect("row was not transferred");
            let uri = ObjectUri::parse(&dest.path).unwrap();
            let digest = uri.key.split('/').next().unwrap_or_default().to_string();
            format!("{}://{}/{digest} {}", uri.provider.scheme(), uri.bucket, dest.size)
        })
        .collect();
    (
        row.file_name.clone(),
        row.content_md5.clone(),
        row.gcs_crc32c.clone(),
        row.aws_tag.clone(),
        prefixes,
    )
}

#[test]
fn resuming_a_finished_manifest_changes_nothing() {
    let dir = tempfile::tempdir().unwrap();
    let manifest = write_batch(dir.path(), FILES);
    let providers = Providers::new();

    let first = run(&Engine::new(config(both()), providers.backends()), &manifest).unwrap();
    assert_eq!(first.incomplete, 0);
    let uploads = (providers.gcs.upload_count(), providers.aws.upload_count());

    let engine = Engine::new(resume(config(both())), providers.backends());
    let second = run(&engine, &first.manifest_path).unwrap();
    assert_ne!(second.manifest_path, first.manifest_path);
    assert_eq!(second.metrics.skipped, 2 * FILES.len() as u64);
    assert_eq!(second.metrics.checksummed, 0);
    assert_eq!(
        (providers.gcs.upload_count(), providers.aws.upload_count()),
        uploads
    );
    assert_eq!(
        fs::read(&first.manifest_path).unwrap(),
        fs::read(&second.manifest_path).unwrap()
    );
}

#[test]
fn interrupted_run_resumes_to_the_same_state() {
    // Reference: one uninterrupted run.
    let reference_dir = tempfile::tempdir().unwrap();
    let reference_manifest = write_batch(reference_dir.path(), FILES);
    let reference = run(
        &Engine::new(config(both()), Providers::new().backends()),
        &reference_manifest,
    )
    .unwrap();
    let expected: Vec<ContentView> = rows_of(&reference.manifest_path)
        .iter()
        .map(content_view)
        .collect();

    let dir = tempfile::tempdir().unwrap();
    let manifest = write_batch(dir.path(), FILES);
    let providers = Providers::new();
    let cfg = IngestConfig {
        upload_threads: 1,
        ..config(both())
    };
    let engine = Engine::new(cfg.clone(), providers.backends());
    let token = engine.cancel_token();
    providers.gcs.set_upload_hook(move |uploads| {
        if uploads >= 2 {
            token.cancel();
        }
    });

    let err = run(&engine, &manifest).unwrap_err();
    let ExecError::Interrupted(saved) = err else {
        panic!("expected an interrupted run, got {err}");
    };
    let partial = rows_of(&saved);
    assert!(partial.iter().all(|r| r.gcs_crc32c.is_some()));
    let done = partial.iter().filter(|r| r.gcs.is_some()).count();
    assert!(done >= 2 && done < FILES.len(), "{done} rows transferred");
    assert!(partial.iter().all(|r| r.aws.is_none()));

    providers.gcs.set_upload_hook(|_| {});
    let resumed = run(&Engine::new(resume(cfg), providers.backends()), &saved).unwrap();
    assert_eq!(resumed.incomplete, 0);
    let actual: Vec<ContentView> = rows_of(&resumed.manifest_path)
        .iter()
        .map(content_view)
        .collect();
    assert_eq!(actual, expected);
    // Every distinct content was uploaded exactly once per provider.
    assert_eq!(providers.gcs.upload_count(), 4);
    assert_eq!(providers.aws.upload_count(), 4);
}

#[test]
fn directory_run_resumes_from_its_receipt_against_the_source_root() {
    let dir = tempfile::tempdir().unwrap();
    let data = dir.path().join("data");
    fs::create_dir_all(&data).unwrap();
    for (name, bytes) in FILES {
        fs::write(data.join(name), bytes).unwrap();
    }
    let rows = list_directory(&data, "phs001", "c1").unwrap();

    let providers = Providers::new();
    let cfg = IngestConfig {
        upload_threads: 1,
        source_root: Some(data.display().to_string()),
        ..config(gcs_only())
    };
    let engine = Engine::new(cfg.clone(), providers.backends());
    let token = engine.cancel_token();
    providers.gcs.set_upload_hook(move |uploads| {
        if uploads >= 2 {
            token.cancel();
        }
    });
    let err = engine
        .run(RunInput {
            schema: ManifestSchema::new(Variant::Standard),
            rows,
            origin: data.clone(),
        })
        .unwrap_err();
    let ExecError::Interrupted(saved) = err else {
        panic!("expected an interrupted run, got {err}");
    };
    assert_eq!(saved.parent(), Some(dir.path()));
    assert!(rows_of(&saved).iter().all(|r| !r.input_file_path.starts_with('/')));

    // `--resume --tsv <receipt> --source-root <dir>` resolves rows the same way.
    providers.gcs.set_upload_hook(|_| {});
    let resumed = run(&Engine::new(resume(cfg), providers.backends()), &saved).unwrap();
    assert_eq!(resumed.incomplete, 0);
    assert_eq!(providers.gcs.upload_count(), 4);
}

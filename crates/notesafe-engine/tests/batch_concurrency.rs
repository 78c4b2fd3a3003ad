//! Batch isolation, parallel processing and note locks

use crossbeam::channel::{self, Receiver, Sender};
use notesafe_engine::{ErrorKind, LockPolicy, MutationOutcome, NoteMutator, SessionGuard};
use notesafe_test_utils::{
    image_bytes, AppendingMutator, FailingMutator, RecordingMutator, VaultFixture, CORRUPTED,
};
use pretty_assertions::assert_eq;
use std::collections::HashSet;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

#[test]
fn batch_reports_each_note_in_order() {
    let vault = VaultFixture::new();
    vault.note_with_images("one.md", &["a.png", "b.png"]);
    vault.write_note("two.md", "no embeds\n");
    vault.note_with_images("three.md", &["c.png"]);
    let processor = vault.processor();

    let results = processor.process_notes_batch(
        &["one.md", "two.md", "three.md"],
        &Arc::new(AppendingMutator::new("#batch")),
    );

    let counts: Vec<usize> = results
        .iter()
        .map(|r| {
            let r = r.as_ref().unwrap();
            assert!(r.success);
            r.image_count()
        })
        .collect();
    assert_eq!(counts, vec![2, 0, 1]);
}

#[test]
fn batch_failures_are_isolated() {
    let vault = VaultFixture::new();
    vault.note_with_images("good.md", &["g.png"]);
    vault.note_with_images("bad.md", &["x.png"]);
    vault.note_with_images("also-good.md", &["h.png"]);
    let processor = vault.processor();

    // Fails and corrupts only the image belonging to bad.md
    let bad_image = vault.path("x.png");
    let picky = Arc::new(move |note: &Path| -> anyhow::Result<MutationOutcome> {
        if note.ends_with("bad.md") {
            fs::write(&bad_image, CORRUPTED)?;
            anyhow::bail!("cannot tag this one");
        }
        let mut text = fs::read_to_string(note)?;
        text.push_str("#ok\n");
        fs::write(note, text)?;
        Ok(MutationOutcome::Success)
    });

    let notes = ["good.md", "missing.md", "bad.md", "also-good.md"];
    let results = processor.process_notes_batch(&notes, &picky);

    assert_eq!(results.len(), notes.len());
    let results: Vec<_> = results.into_iter().map(Result::unwrap).collect();
    assert!(results[0].success);
    assert_eq!(results[1].error_type, Some(ErrorKind::NotFound));
    assert!(!results[2].success);
    assert!(results[3].success);

    assert_eq!(vault.read("x.png"), image_bytes("x.png"));
    assert!(vault.read_note("good.md").ends_with("#ok\n"));
    assert!(!vault.read_note("bad.md").contains("#ok"));

    let metrics = processor.get_performance_metrics();
    assert_eq!(metrics.operations, 4);
    assert_eq!(metrics.successes, 2);
    assert_eq!(metrics.failures, 2);
}

/// Image for `<stem>.md` is `attachments/<stem>.png`
fn own_image(note: &Path) -> PathBuf {
    let stem = note.file_stem().unwrap().to_string_lossy().into_owned();
    note.parent().unwrap().join("attachments").join(format!("{stem}.png"))
}

#[test]
fn parallel_sessions_do_not_interfere() {
    let vault = VaultFixture::new();
    let names: Vec<String> = (0..16).map(|i| format!("note-{i:02}.md")).collect();
    for name in &names {
        let stem = name.trim_end_matches(".md");
        vault.note_with_images(name, &[&format!("attachments/{stem}.png")]);
    }
    let processor = vault.processor_with(|c| c.with_parallelism(4));

    // Odd-numbered notes corrupt their own image and fail
    let mutator = Arc::new(|note: &Path| -> anyhow::Result<MutationOutcome> {
        let image = own_image(note);
        let index: u32 = note
            .file_stem()
            .and_then(|s| s.to_str())
            .and_then(|s| s.trim_start_matches("note-").parse().ok())
            .unwrap_or(0);
        thread::sleep(Duration::from_millis(5));
        if index % 2 == 1 {
            fs::write(&image, CORRUPTED)?;
            anyhow::bail!("odd note {index}");
        }
        fs::write(&image, format!("updated {index}"))?;
        Ok(MutationOutcome::Success)
    });

    let results = processor.process_notes_parallel(&names, &mutator);
    assert_eq!(results.len(), names.len());

    let mut session_ids = HashSet::new();
    for (i, (name, result)) in names.iter().zip(&results).enumerate() {
        let result = result.as_ref().unwrap();
        assert!(result.note_path.ends_with(name), "results out of order");
        assert!(session_ids.insert(result.backup_session_id.clone().unwrap()));

        let stem = name.trim_end_matches(".md");
        let image = format!("attachments/{stem}.png");
        if i % 2 == 1 {
            assert!(!result.success);
            assert_eq!(vault.read(&image), image_bytes(&image));
        } else {
            assert!(result.success);
            assert_eq!(vault.read(&image), format!("updated {i}").into_bytes());
        }
    }
    assert_eq!(processor.registry().active_count(), 0);
}

#[test]
fn parallel_batch_calls_each_note_once() {
    let vault = VaultFixture::new();
    let names: Vec<String> = (0..6).map(|i| format!("n{i}.md")).collect();
    for name in &names {
        vault.note_with_images(name, &[&format!("{name}.png")]);
    }
    let processor = vault.processor_with(|c| c.with_parallelism(3));
    let recorder = Arc::new(RecordingMutator::default());

    let results = processor.process_notes_parallel(&names, &recorder);
    assert!(results.iter().all(|r| r.as_ref().unwrap().success));

    let mut calls = recorder.calls();
    calls.sort();
    let expected: Vec<PathBuf> = names.iter().map(|n| vault.path(n)).collect();
    assert_eq!(calls, expected);
}

#[test]
fn locked_note_fails_fast() {
    let vault = VaultFixture::new();
    let (note, paths) = vault.note_with_images("n.md", &["a.png"]);
    let processor = vault.processor();

    let holder = processor
        .registry()
        .create_backup_session("other", &note)
        .unwrap();
    let result = processor
        .process_note_with_images("n.md", &Arc::new(FailingMutator::corrupting(paths)))
        .unwrap();

    assert!(!result.success);
    assert_eq!(result.error_type, Some(ErrorKind::Concurrency));
    assert!(result.backup_session_id.is_none());
    assert_eq!(vault.read("a.png"), image_bytes("a.png"));
    drop(holder);
}

#[test]
fn wait_policy_queues_behind_holder() {
    let vault = VaultFixture::new();
    let (note, _) = vault.note_with_images("n.md", &["a.png"]);
    let processor =
        vault.processor_with(|c| c.with_lock_policy(LockPolicy::Wait { timeout_ms: 5_000 }));

    let holder: SessionGuard<'_> = processor
        .registry()
        .create_backup_session("other", &note)
        .unwrap();

    thread::scope(|s| {
        s.spawn(move || {
            thread::sleep(Duration::from_millis(50));
            drop(holder);
        });
        let result = processor
            .process_note_with_images("n.md", &Arc::new(AppendingMutator::new("after")))
            .unwrap();
        assert!(result.success);
    });
    assert!(vault.read_note("n.md").ends_with("after\n"));
}

#[test]
fn same_note_in_parallel_is_serialized() {
    let vault = VaultFixture::new();
    vault.note_with_images("shared.md", &["a.png"]);
    let processor = vault.processor_with(|c| {
        c.with_parallelism(4)
            .with_lock_policy(LockPolicy::Wait { timeout_ms: 30_000 })
    });

    let notes = vec!["shared.md"; 8];
    let slow_append = Arc::new(|note: &Path| -> anyhow::Result<MutationOutcome> {
        let text = fs::read_to_string(note)?;
        thread::sleep(Duration::from_millis(10));
        fs::write(note, format!("{text}line\n"))?;
        Ok(MutationOutcome::Success)
    });
    let results = processor.process_notes_parallel(&notes, &slow_append);

    assert!(results.iter().all(|r| r.as_ref().unwrap().success));
    assert_eq!(vault.read_note("shared.md").matches("line\n").count(), 8);
}

#[test]
fn fail_fast_contention_never_loses_images() {
    let vault = VaultFixture::new();
    let (_, paths) = vault.note_with_images("shared.md", &["a.png"]);
    let processor = vault.processor_with(|c| c.with_parallelism(4));

    let notes = vec!["shared.md"; 8];
    let mutator: Arc<dyn NoteMutator> = Arc::new(FailingMutator::corrupting(paths));
    let results = processor.process_notes_parallel(&notes, &mutator);

    for result in &results {
        let result = result.as_ref().unwrap();
        assert!(!result.success);
        assert!(matches!(
            result.error_type,
            Some(ErrorKind::Concurrency | ErrorKind::Unknown)
        ));
    }
    assert_eq!(vault.read("a.png"), image_bytes("a.png"));
}

/// Overwrites `image`, signals `started`, then fails once `finish` fires
fn blocking_failure(
    image: PathBuf,
    started: Sender<()>,
    finish: Receiver<()>,
) -> Arc<impl NoteMutator> {
    Arc::new(move |_: &Path| -> anyhow::Result<MutationOutcome> {
        fs::write(&image, CORRUPTED)?;
        started.send(())?;
        finish.recv()?;
        anyhow::bail!("gave up after touching the shared image")
    })
}

fn writes(image: PathBuf, bytes: &'static str) -> Arc<impl NoteMutator> {
    Arc::new(move |_: &Path| -> anyhow::Result<MutationOutcome> {
        fs::write(&image, bytes)?;
        Ok(MutationOutcome::Success)
    })
}

#[test]
fn shared_image_blocks_a_second_note() {
    let vault = VaultFixture::new();
    vault.note_with_images("a.md", &["attachments/shared.png"]);
    vault.note_with_images("b.md", &["attachments/shared.png"]);
    let shared = vault.path("attachments/shared.png");
    let processor = vault.processor();

    let (started_tx, started_rx) = channel::bounded(1);
    let (finish_tx, finish_rx) = channel::bounded(1);
    let b_mutator = blocking_failure(shared.clone(), started_tx, finish_rx);
    let a_mutator = writes(shared, "committed by A");

    thread::scope(|s| {
        let b = s.spawn(|| processor.process_note_with_images("b.md", &b_mutator));
        started_rx.recv().unwrap();

        let a = processor.process_note_with_images("a.md", &a_mutator).unwrap();
        assert!(!a.success);
        assert_eq!(a.error_type, Some(ErrorKind::Concurrency));

        finish_tx.send(()).unwrap();
        assert!(!b.join().unwrap().unwrap().success);
    });

    assert_eq!(
        vault.read("attachments/shared.png"),
        image_bytes("attachments/shared.png")
    );
    assert_eq!(processor.registry().active_count(), 0);
}

#[test]
fn rollback_never_undoes_another_notes_commit() {
    let vault = VaultFixture::new();
    vault.note_with_images("a.md", &["attachments/shared.png"]);
    vault.note_with_images("b.md", &["attachments/shared.png"]);
    let shared = vault.path("attachments/shared.png");
    let processor =
        vault.processor_with(|c| c.with_lock_policy(LockPolicy::Wait { timeout_ms: 10_000 }));

    let (started_tx, started_rx) = channel::bounded(1);
    let (finish_tx, finish_rx) = channel::bounded(1);
    let b_mutator = blocking_failure(shared.clone(), started_tx, finish_rx);
    let a_mutator = writes(shared, "committed by A");

    thread::scope(|s| {
        let b = s.spawn(|| processor.process_note_with_images("b.md", &b_mutator));
        started_rx.recv().unwrap();

        // A queues on the image lock until B has rolled back
        let a = s.spawn(|| processor.process_note_with_images("a.md", &a_mutator));
        thread::sleep(Duration::from_millis(50));
        finish_tx.send(()).unwrap();

        assert!(!b.join().unwrap().unwrap().success);
        assert!(a.join().unwrap().unwrap().success);
    });

    assert_eq!(vault.read("attachments/shared.png"), b"committed by A");
}

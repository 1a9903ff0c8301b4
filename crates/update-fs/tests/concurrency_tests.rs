//! Concurrent access tests for write_atomic locking

use std::sync::{Arc, Barrier};
use std::thread;
use std::time::Duration;

use fs2::FileExt;
use tempfile::tempdir;
use update_fs::{NormalizedPath, RobustnessConfig, io};

#[test]
fn concurrent_writes_leave_one_complete_document() {
    let dir = tempdir().unwrap();
    let file_path = dir.path().join("history.toml");
    let path = Arc::new(NormalizedPath::new(&file_path));

    let num_threads = 8;
    let barrier = Arc::new(Barrier::new(num_threads));

    let handles: Vec<_> = (0..num_threads)
        .map(|thread_id| {
            let path = Arc::clone(&path);
            let barrier = Arc::clone(&barrier);
            thread::spawn(move || {
                barrier.wait();
                for i in 0..10 {
                    let content = format!("writer{thread_id}:entry{i}\n");
                    io::write_text(&path, &content).unwrap();
                }
            })
        })
        .collect();

    for handle in handles {
        handle.join().expect("writer thread should not panic");
    }

    let content = std::fs::read_to_string(&file_path).unwrap();
    assert!(content.starts_with("writer"));
    assert_eq!(content.matches("writer").count(), 1, "writes interleaved: {content}");
}

#[test]
fn held_lock_times_out() {
    let dir = tempdir().unwrap();
    let file_path = dir.path().join("locked.toml");
    let lock_path = dir.path().join("locked.toml.lock");

    let lock_file = std::fs::OpenOptions::new()
        .write(true)
        .create(true)
        .truncate(false)
        .open(&lock_path)
        .unwrap();
    FileExt::lock_exclusive(&lock_file).unwrap();

    let config = RobustnessConfig {
        lock_timeout: Duration::from_millis(200),
        enable_fsync: false,
    };
    let result = io::write_atomic(&NormalizedPath::new(&file_path), b"content", config);

    drop(lock_file);
    assert!(matches!(result, Err(update_fs::Error::LockFailed { .. })));
}

//! Multi-threaded behaviour: atomic creation, deadlock freedom of two-path
//! operations and shared inode access through hard links.

use std::sync::Barrier;
use std::thread;

use memfs_core::{CopyOptions, FsConfig, FsError, MemoryFileSystem, OpenOptions};

const THREADS: usize = 8;

fn fs() -> MemoryFileSystem {
    MemoryFileSystem::new(FsConfig::default()).unwrap()
}

#[test]
fn racing_creates_have_one_winner() {
    let fs = fs();
    fs.create_directory("/d").unwrap();
    let barrier = Barrier::new(THREADS);

    let results: Vec<_> = thread::scope(|s| {
        let workers: Vec<_> = (0..THREADS)
            .map(|_| {
                s.spawn(|| {
                    barrier.wait();
                    fs.create_file("/d/same")
                })
            })
            .collect();
        workers.into_iter().map(|w| w.join().unwrap()).collect()
    });

    assert_eq!(results.iter().filter(|r| r.is_ok()).count(), 1);
    assert!(results
        .iter()
        .filter_map(|r| r.as_ref().err())
        .all(|e| matches!(e, FsError::AlreadyExists)));
    assert_eq!(fs.read_dir("/d").unwrap().len(), 1);
}

#[test]
fn opposing_copies_and_moves_finish() {
    let fs = fs();
    fs.create_directory("/x").unwrap();
    fs.create_directory("/y").unwrap();
    fs.write_all("/x/a", b"from x").unwrap();
    fs.write_all("/y/b", b"from y").unwrap();
    fs.create_file("/x/m").unwrap();
    let barrier = Barrier::new(4);

    thread::scope(|s| {
        s.spawn(|| {
            barrier.wait();
            for _ in 0..500 {
                fs.copy("/x/a", "/y/b", CopyOptions::replace()).unwrap();
            }
        });
        s.spawn(|| {
            barrier.wait();
            for _ in 0..500 {
                fs.copy("/y/b", "/x/a", CopyOptions::replace()).unwrap();
            }
        });
        for (from, to) in [("/x/m", "/y/m"), ("/y/m", "/x/m")] {
            let fs = &fs;
            let barrier = &barrier;
            s.spawn(move || {
                barrier.wait();
                for _ in 0..500 {
                    match fs.move_entry(from, to, CopyOptions::default()) {
                        Ok(()) | Err(FsError::NotFound) | Err(FsError::AlreadyExists) => {}
                        Err(e) => panic!("unexpected move failure: {e}"),
                    }
                }
            });
        }
    });

    // exactly one of the two names holds the moved file
    assert!(fs.exists("/x/m") ^ fs.exists("/y/m"));
    let a = fs.read_all("/x/a").unwrap();
    let b = fs.read_all("/y/b").unwrap();
    assert!(a == b"from x" || a == b"from y");
    assert!(b == b"from x" || b == b"from y");
}

#[test]
fn nested_moves_against_each_other() {
    let fs = fs();
    fs.create_directory("/p").unwrap();
    fs.create_directory("/p/q").unwrap();
    fs.create_directory("/r").unwrap();
    let barrier = Barrier::new(2);

    thread::scope(|s| {
        s.spawn(|| {
            barrier.wait();
            for i in 0..300 {
                let name = format!("/p/q/f{i}");
                fs.create_file(&name).unwrap();
                fs.move_entry(&name, &format!("/r/f{i}"), CopyOptions::default())
                    .unwrap();
            }
        });
        s.spawn(|| {
            barrier.wait();
            for i in 0..300 {
                let name = format!("/r/g{i}");
                fs.create_file(&name).unwrap();
                fs.move_entry(&name, &format!("/p/q/g{i}"), CopyOptions::default())
                    .unwrap();
            }
        });
    });

    assert_eq!(fs.read_dir("/r").unwrap().len(), 300);
    assert_eq!(fs.read_dir("/p/q").unwrap().len(), 300);
}

#[test]
fn writers_through_hard_links_share_one_inode() {
    const CHUNK: usize = 1000;
    let fs = fs();
    fs.create_file("/data").unwrap();
    for i in 1..THREADS {
        fs.create_hard_link(&format!("/alias{i}"), "/data").unwrap();
    }
    let barrier = Barrier::new(THREADS);

    thread::scope(|s| {
        for i in 0..THREADS {
            let fs = &fs;
            let barrier = &barrier;
            s.spawn(move || {
                let name = if i == 0 {
                    "/data".to_string()
                } else {
                    format!("/alias{i}")
                };
                let handle = fs.open(&name, &OpenOptions::write()).unwrap();
                let chunk = vec![i as u8 + 1; CHUNK];
                barrier.wait();
                handle.write_at(&chunk, (i * CHUNK) as u64).unwrap();

                let mut back = vec![0u8; CHUNK];
                assert_eq!(handle.read_at(&mut back, (i * CHUNK) as u64).unwrap(), CHUNK);
                assert_eq!(back, chunk);
            });
        }
    });

    let contents = fs.read_all("/alias3").unwrap();
    assert_eq!(contents.len(), THREADS * CHUNK);
    for (i, chunk) in contents.chunks(CHUNK).enumerate() {
        assert!(chunk.iter().all(|&b| b == i as u8 + 1));
    }
    assert_eq!(fs.metadata("/data").unwrap().nlink, THREADS as u32);
}

#[test]
fn delete_racing_open_is_consistent() {
    let fs = fs();
    for round in 0..200 {
        let path = format!("/f{round}");
        fs.create_file(&path).unwrap();
        let barrier = Barrier::new(2);

        let (opened, deleted) = thread::scope(|s| {
            let opener = s.spawn(|| {
                barrier.wait();
                fs.open(&path, &OpenOptions::read())
            });
            let deleter = s.spawn(|| {
                barrier.wait();
                fs.delete(&path)
            });
            (opener.join().unwrap(), deleter.join().unwrap())
        });

        match (opened, deleted) {
            // open first: the delete saw the handle
            (Ok(handle), Err(FsError::StillOpen)) => {
                drop(handle);
                fs.delete(&path).unwrap();
            }
            // delete first: the open found nothing
            (Err(FsError::NotFound), Ok(())) => {}
            (opened, deleted) => panic!("inconsistent outcome: {opened:?} / {deleted:?}"),
        }
        assert!(!fs.exists(&path));
    }
    assert_eq!(fs.open_handle_count(), 0);
}

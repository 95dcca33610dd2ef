use hbtree::{Setting, Store};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::path::{Path, PathBuf};
use std::process::Command;
use std::sync::{Arc, Mutex};
use std::thread::sleep;
use std::time::Duration;

const ROUNDS: usize = 20;
const WINDOW: u64 = 50;

fn main() {
    let is_worker = std::env::var("HBTREE_TEST_WORKER").unwrap_or_default();
    if is_worker == "1" {
        return worker();
    }
    env_logger::init();

    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("store");
    println!("test started on {:?}", path);

    let myself = std::env::args().next().expect("missing first arg");

    let t = std::time::SystemTime::now()
        .duration_since(std::time::SystemTime::UNIX_EPOCH)
        .unwrap()
        .as_millis() as u64;
    println!("seed {t}");
    let rng = Arc::new(Mutex::new(StdRng::seed_from_u64(t)));

    let mut last_tag = 0;
    for round in 0..ROUNDS {
        println!("round {round}, restarting worker");

        let child = Arc::new(Mutex::new(
            Command::new(&myself)
                .arg(&path)
                .env("HBTREE_TEST_WORKER", "1")
                .spawn()
                .expect("command failed to start"),
        ));

        std::thread::scope(|s| {
            let (send, recv) = std::sync::mpsc::channel::<()>();

            let handle = {
                let child = child.clone();
                let rng = rng.clone();
                s.spawn(move || {
                    let ms = rng.lock().unwrap().gen_range(5..2000);
                    let res = recv.recv_timeout(Duration::from_millis(ms));
                    if matches!(res, Err(std::sync::mpsc::RecvTimeoutError::Timeout)) {
                        child.lock().unwrap().kill().expect("cannot kill child");
                    }
                })
            };

            let status = loop {
                let Some(status) = child.lock().unwrap().try_wait().unwrap() else {
                    sleep(Duration::from_millis(10));
                    continue;
                };
                break status;
            };
            drop(send);
            // killed workers have no exit code
            assert_eq!(0, status.code().unwrap_or_default());

            handle.join().unwrap();
        });

        let tag = verify(&path);
        assert!(tag >= last_tag, "tag went back from {last_tag} to {tag}");
        last_tag = tag;
    }
    println!("done, {last_tag} commits survived");
}

fn key(i: u64) -> Vec<u8> {
    format!("key{i:08}").into_bytes()
}

fn value(i: u64) -> Vec<u8> {
    // every seventh value goes to an overflow chain
    let len = if i % 7 == 0 { 3000 } else { 10 + (i % 13) as usize * 50 };
    let mut value = i.to_be_bytes().to_vec();
    value.resize(len, (i % 251) as u8);
    value
}

/// Every synced commit `i` adds key `i` and drops key `i - WINDOW`, so the
/// tag alone tells which keys must be there.
fn verify(path: &Path) -> u64 {
    let store = Store::open(path, Setting::default()).unwrap();
    store.check_integrity().unwrap();
    let tag = store.tag();

    let tx = store.begin_read().unwrap();
    let first = tag.saturating_sub(WINDOW);
    for i in 0..tag {
        let got = tx.get(&key(i)).unwrap();
        if i >= first {
            assert_eq!(Some(value(i)), got, "key {i} is missing at tag {tag}");
        } else {
            assert_eq!(None, got, "key {i} is still there at tag {tag}");
        }
    }
    assert_eq!(None, tx.get(&key(tag)).unwrap());
    assert_eq!(None, tx.get(b"noise").unwrap());
    tag
}

fn worker() {
    env_logger::init();

    let path = std::env::args().nth(1).map(PathBuf::from).unwrap();
    let setting = Setting {
        auto_sync_rate: 3,
        ..Setting::default()
    };
    let store = Store::open(&path, setting).unwrap();

    let mut rng = rand::thread_rng();
    let start = store.tag();
    for i in start..start + 100_000 {
        if rng.gen_bool(0.2) {
            // aborted noise that must never become visible
            let tx = store.begin_write().unwrap();
            tx.put(b"noise", &[0u8; 2000]).unwrap();
            tx.del(&key(i.saturating_sub(1))).unwrap();
            tx.abort();
        }

        let tx = store.begin_write().expect("cannot create write tx");
        tx.put(&key(i), &value(i)).unwrap();
        if i >= WINDOW {
            tx.del(&key(i - WINDOW)).unwrap();
        }
        tx.commit(i + 1).unwrap();
    }
    store.close().unwrap();
}

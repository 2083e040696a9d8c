//! Behavioural tests for the directory-backed storage pool.

use std::collections::BTreeMap;
use std::sync::Arc;

use camino::{Utf8Path, Utf8PathBuf};
use rstest::rstest;
use tempfile::TempDir;

use super::*;

struct Fixture {
    pool: DirectoryPool,
    _tmp: TempDir,
}

fn pool() -> Fixture {
    let tmp = TempDir::new().expect("temp dir");
    let root = Utf8PathBuf::from_path_buf(tmp.path().join("pool")).expect("utf8 path");
    let pool = DirectoryPool::create(PoolName::generate(), &root).expect("pool should be created");
    Fixture { pool, _tmp: tmp }
}

fn volume(name: &str) -> VolumeName {
    VolumeName::new(name).expect("valid volume name")
}

fn write(fs: &Filesystem, path: &str, contents: &[u8]) {
    let target = fs.mount_path.join(path);
    if let Some(parent) = target.parent() {
        std::fs::create_dir_all(parent).expect("create parent directories");
    }
    std::fs::write(&target, contents).expect("write test file");
}

fn remove(fs: &Filesystem, path: &str) {
    std::fs::remove_file(fs.mount_path.join(path)).expect("remove test file");
}

fn read_tree(root: &Utf8Path) -> BTreeMap<String, Vec<u8>> {
    let mut files = BTreeMap::new();
    collect(root, root, &mut files);
    files
}

fn collect(base: &Utf8Path, dir: &Utf8Path, out: &mut BTreeMap<String, Vec<u8>>) {
    for entry in dir.read_dir_utf8().expect("read dir") {
        let entry = entry.expect("dir entry");
        let path = entry.path();
        if path.is_dir() {
            collect(base, path, out);
        } else {
            let relative = path.strip_prefix(base).expect("nested path").to_string();
            out.insert(relative, std::fs::read(path).expect("read file"));
        }
    }
}

async fn serialize(
    pool: &DirectoryPool,
    volume: &VolumeName,
    from: Option<&SnapshotId>,
    to: &SnapshotId,
) -> Vec<u8> {
    let mut stream = Vec::new();
    pool.serialize_incremental(volume, from, to, &mut stream)
        .await
        .expect("stream should serialise");
    stream
}

async fn receive(
    pool: &DirectoryPool,
    volume: &VolumeName,
    stream: &[u8],
) -> Result<Filesystem, PoolError> {
    let mut source = stream;
    pool.receive_incremental(volume, &mut source).await
}

#[tokio::test]
async fn create_then_get_returns_mounted_filesystem() {
    let fixture = pool();
    let data = volume("data");

    let created = fixture.pool.create(&data).await.expect("create");
    let fetched = fixture.pool.get(&data).await.expect("get");

    assert_eq!(created, fetched);
    assert_eq!(created.mount_path, fixture.pool.mount_root().join("data"));
    assert!(created.mount_path.is_dir());
    assert!(fixture.pool.snapshots(&data).await.expect("history").is_empty());
}

#[tokio::test]
async fn create_rejects_duplicates() {
    let fixture = pool();
    let data = volume("data");
    fixture.pool.create(&data).await.expect("first create");

    let err = fixture.pool.create(&data).await.expect_err("duplicate");

    assert!(matches!(err, PoolError::AlreadyExists { .. }), "got {err}");
}

#[tokio::test]
async fn get_reports_missing_filesystem() {
    let fixture = pool();
    let err = fixture.pool.get(&volume("ghost")).await.expect_err("missing");
    assert!(matches!(err, PoolError::NotFound { .. }), "got {err}");
}

#[tokio::test]
async fn enumerate_is_a_point_in_time_listing() {
    let fixture = pool();
    fixture.pool.create(&volume("beta")).await.expect("create beta");
    fixture.pool.create(&volume("alpha")).await.expect("create alpha");

    let listed = fixture.pool.enumerate().await.expect("enumerate");
    fixture.pool.create(&volume("gamma")).await.expect("create gamma");

    let names: Vec<&str> = listed.iter().map(|fs| fs.volume.as_str()).collect();
    assert_eq!(names, ["alpha", "beta"]);
}

#[tokio::test]
async fn snapshots_are_sequential_and_allow_empty_deltas() {
    let fixture = pool();
    let data = volume("data");
    let fs = fixture.pool.create(&data).await.expect("create");
    write(&fs, "file.txt", b"one");

    let first = fixture.pool.snapshot(&data).await.expect("first snapshot");
    let second = fixture.pool.snapshot(&data).await.expect("empty-delta snapshot");

    assert_eq!(first.sequence, 1);
    assert_eq!(second.sequence, 2);
    assert_ne!(first.digest, second.digest);
    assert_eq!(
        fixture.pool.latest_snapshot(&data).await.expect("latest"),
        Some(second)
    );
}

#[tokio::test]
async fn full_stream_reconstructs_filesystem_in_fresh_pool() {
    let source = pool();
    let target = pool();
    let data = volume("data");
    let fs = source.pool.create(&data).await.expect("create");
    write(&fs, "top.txt", b"top level");
    write(&fs, "nested/deeper/leaf.bin", &[0_u8, 1, 2, 255]);
    let s1 = source.pool.snapshot(&data).await.expect("s1");
    write(&fs, "top.txt", b"rewritten");
    let s2 = source.pool.snapshot(&data).await.expect("s2");
    write(&fs, "unsnapshotted.txt", b"not captured");

    let stream = serialize(&source.pool, &data, None, &s2).await;
    let received = receive(&target.pool, &data, &stream).await.expect("receive");

    let expected: BTreeMap<String, Vec<u8>> = [
        ("nested/deeper/leaf.bin".to_owned(), vec![0_u8, 1, 2, 255]),
        ("top.txt".to_owned(), b"rewritten".to_vec()),
    ]
    .into_iter()
    .collect();
    assert_eq!(read_tree(&received.mount_path), expected);
    assert_eq!(
        target.pool.snapshots(&data).await.expect("history"),
        vec![s1, s2]
    );
}

#[tokio::test]
async fn incremental_stream_carries_only_changes() {
    let source = pool();
    let target = pool();
    let data = volume("data");
    let fs = source.pool.create(&data).await.expect("create");
    write(&fs, "large.bin", &vec![7_u8; 256 * 1024]);
    write(&fs, "small.txt", b"v1");
    write(&fs, "doomed.txt", b"bye");
    let s1 = source.pool.snapshot(&data).await.expect("s1");
    write(&fs, "small.txt", b"v2");
    remove(&fs, "doomed.txt");
    let s2 = source.pool.snapshot(&data).await.expect("s2");

    let full = serialize(&source.pool, &data, None, &s1).await;
    receive(&target.pool, &data, &full).await.expect("full receive");
    let delta = serialize(&source.pool, &data, Some(&s1), &s2).await;
    let received = receive(&target.pool, &data, &delta).await.expect("delta receive");

    assert!(
        delta.len() * 10 < full.len(),
        "delta of {} bytes should be far smaller than full stream of {} bytes",
        delta.len(),
        full.len()
    );
    assert_eq!(read_tree(&received.mount_path), read_tree(&fs.mount_path));
    assert_eq!(
        target.pool.latest_snapshot(&data).await.expect("latest"),
        Some(s2)
    );
}

#[tokio::test]
async fn stream_between_equal_snapshots_is_an_accepted_no_op() {
    let source = pool();
    let target = pool();
    let data = volume("data");
    let fs = source.pool.create(&data).await.expect("create");
    write(&fs, "a.txt", b"a");
    let s1 = source.pool.snapshot(&data).await.expect("s1");
    let full = serialize(&source.pool, &data, None, &s1).await;
    receive(&target.pool, &data, &full).await.expect("full receive");

    let empty = serialize(&source.pool, &data, Some(&s1), &s1).await;
    receive(&target.pool, &data, &empty).await.expect("empty receive");

    assert_eq!(
        target.pool.snapshots(&data).await.expect("history"),
        vec![s1]
    );
}

#[rstest]
#[case::unknown_base(true)]
#[case::base_after_target(false)]
#[tokio::test]
async fn serialize_rejects_invalid_ranges(#[case] forge_base: bool) {
    let fixture = pool();
    let data = volume("data");
    let fs = fixture.pool.create(&data).await.expect("create");
    write(&fs, "a.txt", b"a");
    let s1 = fixture.pool.snapshot(&data).await.expect("s1");
    let s2 = fixture.pool.snapshot(&data).await.expect("s2");
    let (from, to) = if forge_base {
        let forged = SnapshotId {
            sequence: 1,
            digest: "not-in-history".to_owned(),
        };
        (forged, s2)
    } else {
        (s2, s1)
    };

    let mut sink = Vec::new();
    let err = fixture
        .pool
        .serialize_incremental(&data, Some(&from), &to, &mut sink)
        .await
        .expect_err("range should be rejected");

    assert!(matches!(err, PoolError::InvalidRange { .. }), "got {err}");
    assert!(sink.is_empty(), "nothing may be written for an invalid range");
}

#[tokio::test]
async fn receive_rejects_mismatched_base_without_changes() {
    let source = pool();
    let target = pool();
    let data = volume("data");
    let fs = source.pool.create(&data).await.expect("create");
    write(&fs, "a.txt", b"a");
    let s1 = source.pool.snapshot(&data).await.expect("s1");
    write(&fs, "a.txt", b"b");
    let s2 = source.pool.snapshot(&data).await.expect("s2");
    write(&fs, "a.txt", b"c");
    let s3 = source.pool.snapshot(&data).await.expect("s3");

    let full = serialize(&source.pool, &data, None, &s1).await;
    receive(&target.pool, &data, &full).await.expect("full receive");
    let skipping = serialize(&source.pool, &data, Some(&s2), &s3).await;
    let err = receive(&target.pool, &data, &skipping)
        .await
        .expect_err("base mismatch");

    assert!(matches!(err, PoolError::StreamCorrupt { .. }), "got {err}");
    assert_eq!(
        target.pool.snapshots(&data).await.expect("history"),
        vec![s1]
    );
}

#[tokio::test]
async fn receive_rejects_full_stream_over_existing_history() {
    let source = pool();
    let data = volume("data");
    let fs = source.pool.create(&data).await.expect("create");
    write(&fs, "a.txt", b"a");
    let s1 = source.pool.snapshot(&data).await.expect("s1");
    let full = serialize(&source.pool, &data, None, &s1).await;

    let err = receive(&source.pool, &data, &full)
        .await
        .expect_err("conflicting history");

    assert!(matches!(err, PoolError::StreamCorrupt { .. }), "got {err}");
}

#[tokio::test]
async fn receive_rejects_stream_for_another_volume() {
    let source = pool();
    let target = pool();
    let data = volume("data");
    let fs = source.pool.create(&data).await.expect("create");
    write(&fs, "a.txt", b"a");
    let s1 = source.pool.snapshot(&data).await.expect("s1");
    let full = serialize(&source.pool, &data, None, &s1).await;

    let err = receive(&target.pool, &volume("other"), &full)
        .await
        .expect_err("volume mismatch");

    assert!(matches!(err, PoolError::StreamCorrupt { .. }), "got {err}");
    assert!(target.pool.enumerate().await.expect("enumerate").is_empty());
}

#[rstest]
#[case::truncated(Damage::Truncate)]
#[case::flipped_content(Damage::FlipLastContentByte)]
#[tokio::test]
async fn damaged_streams_leave_the_receiver_untouched(#[case] damage: Damage) {
    let source = pool();
    let target = pool();
    let data = volume("data");
    let fs = source.pool.create(&data).await.expect("create");
    write(&fs, "a.txt", b"first");
    let s1 = source.pool.snapshot(&data).await.expect("s1");
    let full = serialize(&source.pool, &data, None, &s1).await;
    let received = receive(&target.pool, &data, &full).await.expect("full receive");
    let before = read_tree(&received.mount_path);

    write(&fs, "a.txt", b"second version");
    let s2 = source.pool.snapshot(&data).await.expect("s2");
    let mut delta = serialize(&source.pool, &data, Some(&s1), &s2).await;
    damage.apply(&mut delta);

    let err = receive(&target.pool, &data, &delta)
        .await
        .expect_err("damaged stream");

    assert!(matches!(err, PoolError::StreamCorrupt { .. }), "got {err}");
    assert_eq!(read_tree(&received.mount_path), before);
    assert_eq!(
        target.pool.snapshots(&data).await.expect("history"),
        vec![s1]
    );
}

#[derive(Clone, Copy, Debug)]
enum Damage {
    Truncate,
    FlipLastContentByte,
}

impl Damage {
    fn apply(self, stream: &mut Vec<u8>) {
        match self {
            Self::Truncate => stream.truncate(stream.len() - 3),
            Self::FlipLastContentByte => {
                let index = stream.len() - 2;
                if let Some(byte) = stream.get_mut(index) {
                    *byte ^= 0xff;
                }
            }
        }
    }
}

#[tokio::test]
async fn truncated_first_push_does_not_create_filesystem() {
    let source = pool();
    let target = pool();
    let data = volume("data");
    let fs = source.pool.create(&data).await.expect("create");
    write(&fs, "a.txt", b"payload");
    let s1 = source.pool.snapshot(&data).await.expect("s1");
    let mut full = serialize(&source.pool, &data, None, &s1).await;
    full.truncate(full.len() / 2);

    receive(&target.pool, &data, &full)
        .await
        .expect_err("truncated stream");

    let err = target.pool.get(&data).await.expect_err("nothing applied");
    assert!(matches!(err, PoolError::NotFound { .. }), "got {err}");
}

#[tokio::test]
async fn empty_filesystem_replicates_without_snapshots() {
    let source = pool();
    let target = pool();
    let data = volume("data");
    source.pool.create(&data).await.expect("create");
    let mut stream = Vec::new();
    source
        .pool
        .serialize_full_history(&data, &mut stream)
        .await
        .expect("serialise");

    receive(&target.pool, &data, &stream).await.expect("receive");

    assert!(target.pool.get(&data).await.is_ok());
    assert!(target.pool.snapshots(&data).await.expect("history").is_empty());
}

#[tokio::test]
async fn concurrent_snapshots_of_one_filesystem_are_serialised() {
    const CALLS: u64 = 8;
    let fixture = pool();
    let data = volume("data");
    let fs = fixture.pool.create(&data).await.expect("create");
    write(&fs, "a.txt", b"shared");
    let shared = Arc::new(fixture.pool);

    let mut handles = Vec::new();
    for _ in 0..CALLS {
        let pool = Arc::clone(&shared);
        let name = data.clone();
        handles.push(tokio::spawn(async move { pool.snapshot(&name).await }));
    }
    for handle in handles {
        handle.await.expect("task").expect("snapshot");
    }

    let history = shared.snapshots(&data).await.expect("history");
    let sequences: Vec<u64> = history.iter().map(|id| id.sequence).collect();
    assert_eq!(sequences, (1..=CALLS).collect::<Vec<_>>());
}

#[tokio::test]
async fn destroyed_pool_reports_io_failures() {
    let fixture = pool();
    let data = volume("data");
    fixture.pool.create(&data).await.expect("create");

    fixture.pool.destroy().expect("destroy");

    let err = fixture.pool.snapshot(&data).await.expect_err("pool gone");
    assert!(matches!(err, PoolError::Io { .. }), "got {err}");
    assert!(!fixture.pool.mount_root().exists());
}

#[tokio::test]
async fn reopening_checks_the_pool_name() {
    let fixture = pool();
    let root = fixture.pool.mount_root().to_path_buf();

    let reopened =
        DirectoryPool::open(Some(fixture.pool.name()), &root).expect("matching name reopens");
    assert_eq!(reopened.name(), fixture.pool.name());

    let other = PoolName::generate();
    assert!(DirectoryPool::open(Some(&other), &root).is_err());
    assert!(DirectoryPool::create(other, &root).is_err());
}

#[tokio::test]
async fn closed_sink_is_reported_as_a_sink_failure() {
    let fixture = pool();
    let data = volume("data");
    let fs = fixture.pool.create(&data).await.expect("create");
    write(&fs, "a.txt", &[3_u8; 4096]);
    let s1 = fixture.pool.snapshot(&data).await.expect("s1");
    let (mut sink, reader) = tokio::io::duplex(64);
    drop(reader);

    let err = fixture
        .pool
        .serialize_incremental(&data, None, &s1, &mut sink)
        .await
        .expect_err("closed sink");

    assert!(matches!(err, PoolError::Sink { .. }), "got {err}");
    assert!(err.is_sink_failure());
    assert_eq!(err.kind(), PoolError::IO_FAILURE);
}

#[tokio::test]
async fn storage_failures_are_not_sink_failures() {
    let fixture = pool();
    let data = volume("data");
    fixture.pool.create(&data).await.expect("create");
    fixture.pool.destroy().expect("destroy");

    let err = fixture.pool.snapshot(&data).await.expect_err("pool gone");
    assert!(!err.is_sink_failure(), "got {err}");
}

#[tokio::test]
async fn separate_handles_serialise_conflicting_receives() {
    let first_source = pool();
    let second_source = pool();
    let target = pool();
    let data = volume("data");

    let fs = first_source.pool.create(&data).await.expect("create");
    write(&fs, "a.txt", b"a");
    let s1 = first_source.pool.snapshot(&data).await.expect("s1");
    let full = serialize(&first_source.pool, &data, None, &s1).await;
    receive(&target.pool, &data, &full).await.expect("seed target");
    let other_fs = receive(&second_source.pool, &data, &full)
        .await
        .expect("seed second source");

    write(&fs, "b.txt", b"from the first source");
    let left = first_source.pool.snapshot(&data).await.expect("left s2");
    write(&other_fs, "c.txt", b"from the second source");
    let right = second_source.pool.snapshot(&data).await.expect("right s2");
    assert_ne!(left, right, "the two deltas must conflict");
    let left_stream = serialize(&first_source.pool, &data, Some(&s1), &left).await;
    let right_stream = serialize(&second_source.pool, &data, Some(&s1), &right).await;

    let root = target.pool.mount_root().to_path_buf();
    let left_handle = DirectoryPool::open(None, &root).expect("first handle");
    let right_handle = DirectoryPool::open(None, &root).expect("second handle");
    let (left_outcome, right_outcome) = tokio::join!(
        receive(&left_handle, &data, &left_stream),
        receive(&right_handle, &data, &right_stream),
    );

    let winner = match (&left_outcome, &right_outcome) {
        (Ok(_), Err(err)) => {
            assert!(matches!(err, PoolError::StreamCorrupt { .. }), "got {err}");
            left
        }
        (Err(err), Ok(_)) => {
            assert!(matches!(err, PoolError::StreamCorrupt { .. }), "got {err}");
            right
        }
        outcomes => panic!("exactly one receive must win, got {outcomes:?}"),
    };
    assert_eq!(
        target.pool.snapshots(&data).await.expect("history"),
        vec![s1, winner]
    );
}

//! Exercises the chunk store against scratch repositories. The tests
//! shell out to a real `git` binary and skip themselves when none is
//! installed.

use std::path::Path;
use std::process::Command;

use gfc_datastore::{ChunkStorage, ChunkStore, GitRepo, MissingChunk, RefContention, SIDE_BRANCH};

fn git_available() -> bool {
    Command::new("git")
        .arg("version")
        .output()
        .map(|output| output.status.success())
        .unwrap_or(false)
}

fn git(dir: &Path, args: &[&str]) -> String {
    let output = Command::new("git")
        .current_dir(dir)
        .args(args)
        .output()
        .expect("failed to execute git");
    assert!(
        output.status.success(),
        "git {args:?} failed: {}",
        String::from_utf8_lossy(&output.stderr)
    );
    String::from_utf8(output.stdout).unwrap().trim_end().to_string()
}

fn scratch_repo() -> tempfile::TempDir {
    let dir = tempfile::tempdir().unwrap();
    git(dir.path(), &["init", "--quiet"]);
    dir
}

fn open_store(dir: &Path) -> ChunkStore {
    ChunkStore::open(GitRepo::open(dir).unwrap()).unwrap()
}

#[test]
fn test_insert_commit_read() {
    if !git_available() {
        eprintln!("git not available, skipping");
        return;
    }
    let dir = scratch_repo();

    let mut store = open_store(dir.path());
    let digest = store.insert_chunk(b"some chunk bytes").unwrap();

    // staged chunks are readable before the branch moves
    assert_eq!(store.read_chunk(&digest).unwrap(), b"some chunk bytes");

    let commit = store.commit_session().unwrap().expect("expected a commit");
    assert_eq!(git(dir.path(), &["rev-parse", SIDE_BRANCH]), commit);

    // tree layout: <pp>/<digest>, blob content is the chunk
    let path = format!("{}:{}/{}", SIDE_BRANCH, &digest[..2], digest);
    assert_eq!(git(dir.path(), &["cat-file", "-p", &path]), "some chunk bytes");

    // a fresh store resolves through the branch
    let mut store = open_store(dir.path());
    assert_eq!(store.read_chunk(&digest).unwrap(), b"some chunk bytes");
}

#[test]
fn test_no_chunks_no_commit() {
    if !git_available() {
        eprintln!("git not available, skipping");
        return;
    }
    let dir = scratch_repo();

    let mut store = open_store(dir.path());
    assert!(store.commit_session().unwrap().is_none());

    let missing = Command::new("git")
        .current_dir(dir.path())
        .args(["rev-parse", "--verify", "--quiet", SIDE_BRANCH])
        .output()
        .unwrap();
    assert!(!missing.status.success());
}

#[test]
fn test_reinserting_known_chunks_is_idempotent() {
    if !git_available() {
        eprintln!("git not available, skipping");
        return;
    }
    let dir = scratch_repo();

    let mut store = open_store(dir.path());
    let first = store.insert_chunk(b"stable content").unwrap();
    store.commit_session().unwrap().expect("expected a commit");
    let tip = git(dir.path(), &["rev-parse", SIDE_BRANCH]);

    // same content in a new session: same digest, no second commit
    let mut store = open_store(dir.path());
    let second = store.insert_chunk(b"stable content").unwrap();
    assert_eq!(first, second);
    assert!(store.commit_session().unwrap().is_none());
    assert_eq!(git(dir.path(), &["rev-parse", SIDE_BRANCH]), tip);
}

#[test]
fn test_prefixes_and_existing_entries_survive() {
    if !git_available() {
        eprintln!("git not available, skipping");
        return;
    }
    let dir = scratch_repo();

    let mut store = open_store(dir.path());
    let mut digests: Vec<String> = (0u32..16)
        .map(|i| {
            store
                .insert_chunk(format!("chunk number {i}").as_bytes())
                .unwrap()
        })
        .collect();
    store.commit_session().unwrap().expect("expected a commit");

    // second batch merges into the same trees
    let mut store = open_store(dir.path());
    for i in 16u32..32 {
        digests.push(
            store
                .insert_chunk(format!("chunk number {i}").as_bytes())
                .unwrap(),
        );
    }
    store.commit_session().unwrap().expect("expected a commit");

    let mut store = open_store(dir.path());
    for (i, digest) in digests.iter().enumerate() {
        assert_eq!(
            store.read_chunk(digest).unwrap(),
            format!("chunk number {i}").into_bytes()
        );
    }

    // root holds only two-hex prefix directories
    let root = git(dir.path(), &["ls-tree", SIDE_BRANCH]);
    for line in root.lines() {
        let name = line.rsplit('\t').next().unwrap();
        assert_eq!(name.len(), 2, "unexpected root entry {line:?}");
        assert!(line.contains(" tree "));
    }
}

#[test]
fn test_missing_chunk_error() {
    if !git_available() {
        eprintln!("git not available, skipping");
        return;
    }
    let dir = scratch_repo();

    let mut store = open_store(dir.path());
    store.insert_chunk(b"unrelated").unwrap();
    store.commit_session().unwrap();

    let err = store
        .read_chunk("00000000000000000000000000000000000000ff")
        .unwrap_err();
    assert!(err.downcast_ref::<MissingChunk>().is_some());
    assert!(err.downcast_ref::<RefContention>().is_none());
}

#[test]
fn test_chunked_file_roundtrip() {
    if !git_available() {
        eprintln!("git not available, skipping");
        return;
    }
    let dir = scratch_repo();

    // a blob big enough for several chunks
    let mut content = Vec::with_capacity(2 * 1024 * 1024);
    let mut state: u64 = 0x9e3779b97f4a7c15;
    while content.len() < 2 * 1024 * 1024 {
        state ^= state << 13;
        state ^= state >> 7;
        state ^= state << 17;
        content.extend_from_slice(&state.to_le_bytes());
    }

    let chunker = gfc_datastore::Chunker::new(4 * 1024, 64 * 1024, 256 * 1024).unwrap();
    let mut store = open_store(dir.path());

    let digests: Vec<String> = gfc_datastore::ChunkStream::new(&content[..], chunker)
        .map(|chunk| store.insert_chunk(&chunk.unwrap()).unwrap())
        .collect();
    assert!(digests.len() > 1);
    store.commit_session().unwrap().expect("expected a commit");

    let mut store = open_store(dir.path());
    let mut reassembled = Vec::new();
    for digest in &digests {
        reassembled.extend_from_slice(&store.read_chunk(digest).unwrap());
    }
    assert_eq!(reassembled, content);
}

#[test]
fn test_concurrent_append_linearizes() {
    if !git_available() {
        eprintln!("git not available, skipping");
        return;
    }
    let dir = scratch_repo();

    // two filter processes over the same repository
    let mut store_a = open_store(dir.path());
    let mut store_b = open_store(dir.path());

    let digest_a = store_a.insert_chunk(b"written by instance a").unwrap();
    let digest_b = store_b.insert_chunk(b"written by instance b").unwrap();

    let commit_a = store_a.commit_session().unwrap().expect("expected a commit");
    // b's compare-and-swap loses against a's commit and must retry on
    // top of it
    let commit_b = store_b.commit_session().unwrap().expect("expected a commit");

    assert_eq!(git(dir.path(), &["rev-parse", SIDE_BRANCH]), commit_b);
    let parent = git(dir.path(), &["rev-parse", &format!("{SIDE_BRANCH}^")]);
    assert_eq!(parent, commit_a);

    // neither instance lost chunks
    let mut store = open_store(dir.path());
    assert_eq!(store.read_chunk(&digest_a).unwrap(), b"written by instance a");
    assert_eq!(store.read_chunk(&digest_b).unwrap(), b"written by instance b");
}

#[test]
fn test_commit_identity_and_message() {
    if !git_available() {
        eprintln!("git not available, skipping");
        return;
    }
    let dir = scratch_repo();

    let mut store = open_store(dir.path());
    store.insert_chunk(b"one").unwrap();
    store.insert_chunk(b"two").unwrap();
    store.commit_session().unwrap().expect("expected a commit");

    let author = git(dir.path(), &["log", "-1", "--format=%an <%ae>", SIDE_BRANCH]);
    assert_eq!(author, "git-fastcdc <git-fastcdc@localhost>");

    let subject = git(dir.path(), &["log", "-1", "--format=%s", SIDE_BRANCH]);
    assert_eq!(subject, "fastcdc: add 2 chunks");
}

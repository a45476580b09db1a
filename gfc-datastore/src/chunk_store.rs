use std::collections::{BTreeMap, BTreeSet};

use anyhow::{bail, Error};

use crate::git::{CatFileBatch, GitRepo, TreeEntry};
use crate::manifest::is_valid_digest;

/// Ref holding the chunk objects. It has to be pushed and fetched
/// alongside the main history; the filter never touches remotes.
pub const SIDE_BRANCH: &str = "refs/heads/git-fastcdc";

#[derive(Debug, thiserror::Error)]
#[error("chunk {digest} is not reachable from the chunk branch")]
pub struct MissingChunk {
    pub digest: String,
}

#[derive(Debug, thiserror::Error)]
#[error("concurrent modification of {refname}, gave up after one retry")]
pub struct RefContention {
    pub refname: String,
}

/// Chunk persistence as seen by the filter driver.
pub trait ChunkStorage {
    /// Store one chunk, returning its content digest. Idempotent.
    fn insert_chunk(&mut self, data: &[u8]) -> Result<String, Error>;

    /// Fetch a chunk by digest.
    fn read_chunk(&mut self, digest: &str) -> Result<Vec<u8>, Error>;

    /// Record everything inserted since the last call as a single commit
    /// on the side branch. Returns the new commit, if one was needed.
    fn commit_session(&mut self) -> Result<Option<String>, Error>;
}

enum SyncOutcome {
    Committed(String),
    UpToDate,
    Contended,
}

/// Chunk store on the `git-fastcdc` side branch.
///
/// Chunks become loose objects the moment they are inserted (safe
/// against concurrent writers), grouped in memory below their two-hex
/// prefix. The branch itself only moves in `commit_session`: one merged
/// tree, one commit, one compare-and-swap ref update. Until that point a
/// crash leaves the ref untouched.
pub struct ChunkStore {
    repo: GitRepo,
    tip: Option<String>,
    pending: BTreeMap<String, BTreeSet<String>>,
    batch: Option<CatFileBatch>,
}

impl ChunkStore {
    pub fn open(repo: GitRepo) -> Result<Self, Error> {
        let tip = Self::resolve_tip(&repo)?;
        Ok(Self {
            repo,
            tip,
            pending: BTreeMap::new(),
            batch: None,
        })
    }

    pub fn repo(&self) -> &GitRepo {
        &self.repo
    }

    fn resolve_tip(repo: &GitRepo) -> Result<Option<String>, Error> {
        repo.rev_parse(&format!("{SIDE_BRANCH}^{{commit}}"))
    }

    /// Merge the pending chunks onto the current tip and try to advance
    /// the branch once.
    fn sync_branch(&mut self) -> Result<SyncOutcome, Error> {
        let root_entries = match &self.tip {
            Some(tip) => self.repo.ls_tree(tip)?,
            None => Vec::new(),
        };
        let mut root: BTreeMap<String, TreeEntry> = root_entries
            .into_iter()
            .map(|entry| (entry.name.clone(), entry))
            .collect();

        let mut added = 0;
        for (prefix, digests) in &self.pending {
            let mut entries: BTreeMap<String, TreeEntry> = match root.get(prefix) {
                Some(entry) if entry.otype == "tree" => self
                    .repo
                    .ls_tree(&entry.oid)?
                    .into_iter()
                    .map(|entry| (entry.name.clone(), entry))
                    .collect(),
                _ => BTreeMap::new(),
            };

            let known = entries.len();
            for digest in digests {
                entries
                    .entry(digest.clone())
                    .or_insert_with(|| TreeEntry::blob(digest, digest));
            }
            if entries.len() == known {
                // every chunk of this prefix already on the branch
                continue;
            }
            added += entries.len() - known;

            let subtree: Vec<TreeEntry> = entries.into_values().collect();
            let oid = self.repo.mktree(&subtree)?;
            root.insert(prefix.clone(), TreeEntry::subtree(&oid, prefix));
        }

        if added == 0 {
            return Ok(SyncOutcome::UpToDate);
        }

        let root: Vec<TreeEntry> = root.into_values().collect();
        let tree = self.repo.mktree(&root)?;
        let message = format!("fastcdc: add {added} chunks");
        let commit = self.repo.commit_tree(&tree, self.tip.as_deref(), &message)?;

        match self
            .repo
            .update_ref_cas(SIDE_BRANCH, &commit, self.tip.as_deref())
        {
            Ok(()) => Ok(SyncOutcome::Committed(commit)),
            Err(err) => {
                log::debug!("ref update on {SIDE_BRANCH} refused: {err:#}");
                Ok(SyncOutcome::Contended)
            }
        }
    }

    fn is_pending(&self, digest: &str) -> bool {
        self.pending
            .get(&digest[..2])
            .map_or(false, |digests| digests.contains(digest))
    }
}

impl ChunkStorage for ChunkStore {
    fn insert_chunk(&mut self, data: &[u8]) -> Result<String, Error> {
        let digest = self.repo.hash_object(data)?;
        if !is_valid_digest(&digest) {
            bail!("hash-object returned unexpected digest {digest:?}");
        }

        let prefix = digest[..2].to_string();
        if self.pending.entry(prefix).or_default().insert(digest.clone()) {
            log::debug!("staged chunk {digest}");
        }
        Ok(digest)
    }

    fn read_chunk(&mut self, digest: &str) -> Result<Vec<u8>, Error> {
        if !is_valid_digest(digest) {
            bail!("refusing to look up malformed digest {digest:?}");
        }
        // chunks staged in this session are loose objects not yet
        // reachable from the branch; address those by object id
        let name = if self.is_pending(digest) {
            digest.to_string()
        } else {
            format!("{}:{}/{}", SIDE_BRANCH, &digest[..2], digest)
        };

        if self.batch.is_none() {
            self.batch = Some(self.repo.cat_file_batch()?);
        }
        let Some(batch) = self.batch.as_mut() else {
            bail!("cat-file batch unavailable");
        };

        match batch.read_object(&name) {
            Ok(Some(data)) => Ok(data),
            Ok(None) => Err(MissingChunk {
                digest: digest.to_string(),
            }
            .into()),
            Err(err) => {
                // child may be gone, spawn a fresh one next time
                self.batch = None;
                Err(err)
            }
        }
    }

    fn commit_session(&mut self) -> Result<Option<String>, Error> {
        if self.pending.is_empty() {
            return Ok(None);
        }

        for attempt in 0..2 {
            if attempt > 0 {
                log::warn!("{SIDE_BRANCH} moved underneath us, retrying");
                self.tip = Self::resolve_tip(&self.repo)?;
            }
            match self.sync_branch()? {
                SyncOutcome::Committed(commit) => {
                    log::info!("advanced {SIDE_BRANCH} to {commit}");
                    self.pending.clear();
                    self.tip = Some(commit.clone());
                    return Ok(Some(commit));
                }
                SyncOutcome::UpToDate => {
                    self.pending.clear();
                    return Ok(None);
                }
                SyncOutcome::Contended => continue,
            }
        }

        Err(RefContention {
            refname: SIDE_BRANCH.to_string(),
        }
        .into())
    }
}

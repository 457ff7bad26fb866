//! A vault: one versioned tree of secrets with its objects and refs.

use crate::cache::PackCache;
use crate::fs::VaultFs;
use crate::refs::RefStore;
use crate::store::ObjectStore;
use crate::{Ident, ObjectId, Result, StorageError, VaultObject};
use std::path::PathBuf;
use std::sync::Arc;

/// A vault directory: object store plus reference store.
pub struct Vault {
    /// Vault name.
    pub name: String,
    /// Object store.
    pub objects: ObjectStore,
    /// Reference store.
    pub refs: RefStore,
}

impl Vault {
    /// Opens a vault rooted at `root` within the filesystem.
    pub fn open(
        fs: Arc<dyn VaultFs>,
        root: impl Into<PathBuf>,
        name: impl Into<String>,
        cache: Arc<PackCache>,
    ) -> Self {
        let root = root.into();
        Self {
            name: name.into(),
            objects: ObjectStore::new(fs.clone(), root.clone(), cache),
            refs: RefStore::new(fs, root),
        }
    }

    /// Initializes an empty vault with HEAD pointing at the main branch.
    pub fn init(
        fs: Arc<dyn VaultFs>,
        root: impl Into<PathBuf>,
        name: impl Into<String>,
        cache: Arc<PackCache>,
    ) -> Result<Self> {
        let vault = Self::open(fs, root, name, cache);
        vault.refs.set_symbolic("HEAD", "refs/heads/main")?;
        Ok(vault)
    }

    /// Resolves HEAD to the current commit.
    pub fn head(&self) -> Result<ObjectId> {
        self.refs.resolve_oid("HEAD")
    }

    /// Records a new snapshot commit on the current branch.
    pub fn commit(&self, tree: &ObjectId, message: &str, author: &Ident) -> Result<ObjectId> {
        // Only an unborn branch means no parent; any other head failure
        // must not silently mint a root commit.
        let parents: Vec<ObjectId> = match self.head() {
            Ok(oid) => vec![oid],
            Err(StorageError::RefNotFound(_)) => Vec::new(),
            Err(e) => return Err(e),
        };
        let commit = VaultObject::commit(tree, &parents, author, author, message);
        let id = self.objects.put(&commit)?;

        let target = self.refs.resolve("HEAD", Some(2))?;
        if ObjectId::is_hex(&target) {
            // Detached HEAD.
            self.refs.set("HEAD", id)?;
        } else {
            self.refs.set(&target, id)?;
        }
        Ok(id)
    }
}

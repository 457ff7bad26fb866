//! The object store: oid to typed content, from loose files or packs.

use crate::cache::PackCache;
use crate::fs::VaultFs;
use crate::packfile::{ExternalBaseResolver, LoadedPack, PackIndex};
use crate::{ObjectId, ObjectType, Result, StorageError, VaultObject};
use bytes::Bytes;
use flate2::read::ZlibDecoder;
use flate2::write::ZlibEncoder;
use flate2::Compression;
use std::collections::HashSet;
use std::io::{Read, Write};
use std::path::PathBuf;
use std::sync::Arc;

/// How much decoding the caller wants.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReadFormat {
    /// Raw deflated bytes, for re-streaming without interpretation.
    Deflated,
    /// Inflated, with the `"<type> <len>\0"` header still attached.
    Wrapped,
    /// Fully unwrapped content with a validated header.
    Content,
}

/// Where an object was found.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ObjectSource {
    /// An individually stored loose file.
    Loose,
    /// A pack file, by filename.
    Pack(String),
}

/// Result of an object read.
#[derive(Debug, Clone)]
pub struct StoredObject {
    /// Object type; `None` only when the achieved format is `Deflated`,
    /// where the header was never inflated.
    pub kind: Option<ObjectType>,
    /// The format actually achieved (at least the requested one; pack hits
    /// always decode to `Content`).
    pub format: ReadFormat,
    /// The bytes in the achieved format.
    pub data: Bytes,
    /// Which source produced the object.
    pub source: ObjectSource,
}

/// Content-addressed object store over a vault filesystem.
///
/// Reads consult, in order: the loose object path, every pack under
/// `objects/pack/` (through the shared [`PackCache`]), and finally the
/// `shallow` marker file, which turns absence into a distinct
/// [`StorageError::Shallow`] instead of not-found.
pub struct ObjectStore {
    fs: Arc<dyn VaultFs>,
    root: PathBuf,
    cache: Arc<PackCache>,
}

impl ObjectStore {
    /// Creates a store for the vault at `root`.
    pub fn new(fs: Arc<dyn VaultFs>, root: impl Into<PathBuf>, cache: Arc<PackCache>) -> Self {
        Self {
            fs,
            root: root.into(),
            cache,
        }
    }

    fn loose_path(&self, oid: &ObjectId) -> PathBuf {
        let (dir, file) = oid.loose_parts();
        self.root.join("objects").join(dir).join(file)
    }

    fn pack_dir(&self) -> PathBuf {
        self.root.join("objects").join("pack")
    }

    /// Reads an object at the requested (minimum) format.
    pub fn read(&self, oid: &ObjectId, format: ReadFormat) -> Result<StoredObject> {
        // 1. Loose file.
        let loose = self.loose_path(oid);
        if self.fs.exists(&loose) {
            let deflated = self.fs.read_file(&loose)?;
            return match format {
                ReadFormat::Deflated => Ok(StoredObject {
                    kind: None,
                    format: ReadFormat::Deflated,
                    data: deflated.into(),
                    source: ObjectSource::Loose,
                }),
                ReadFormat::Wrapped => {
                    let wrapped = inflate(&deflated)?;
                    let object = VaultObject::from_wrapped(&wrapped)?;
                    Ok(StoredObject {
                        kind: Some(object.kind),
                        format: ReadFormat::Wrapped,
                        data: wrapped.into(),
                        source: ObjectSource::Loose,
                    })
                }
                ReadFormat::Content => {
                    let wrapped = inflate(&deflated)?;
                    let object = VaultObject::from_wrapped(&wrapped)?;
                    Ok(StoredObject {
                        kind: Some(object.kind),
                        format: ReadFormat::Content,
                        data: object.data,
                        source: ObjectSource::Loose,
                    })
                }
            };
        }

        // 2. Pack files. Delta chains force a full decode, so the achieved
        // format is Content regardless of the request.
        for pack_name in self.list_pack_names()? {
            if self.cache.loading(&self.pack_key(&pack_name)) {
                // This thread is mid-scan of that pack; it cannot serve as
                // a base source for its own thin deltas.
                continue;
            }
            let pack = self.load_pack(&pack_name)?;
            if pack.contains(oid) {
                let object = pack.read_object(oid, self)?;
                return Ok(StoredObject {
                    kind: Some(object.kind),
                    format: ReadFormat::Content,
                    data: object.data,
                    source: ObjectSource::Pack(pack_name),
                });
            }
        }

        // 3. Shallow marker: known upstream, intentionally absent here.
        if self.read_shallow_set()?.contains(oid) {
            return Err(StorageError::Shallow(*oid));
        }

        Err(StorageError::ObjectNotFound(oid.to_hex()))
    }

    /// Reads a fully decoded, typed object.
    pub fn read_object(&self, oid: &ObjectId) -> Result<VaultObject> {
        let stored = self.read(oid, ReadFormat::Content)?;
        let kind = stored.kind.expect("content reads always carry a type");
        Ok(VaultObject::new(kind, stored.data))
    }

    /// Reads and validates that the object has the expected type.
    pub fn read_typed(&self, oid: &ObjectId, expected: ObjectType) -> Result<VaultObject> {
        let object = self.read_object(oid)?;
        if object.kind != expected {
            return Err(StorageError::InvalidObject(format!(
                "{} is a {}, expected {}",
                oid,
                object.kind.as_str(),
                expected.as_str()
            )));
        }
        Ok(object)
    }

    /// Whether the object is present in any source (shallow markers do not
    /// count).
    pub fn contains(&self, oid: &ObjectId) -> bool {
        match self.read(oid, ReadFormat::Deflated) {
            Ok(_) => true,
            Err(_) => false,
        }
    }

    /// Writes an object as a deflated loose file. Content addressing makes
    /// this idempotent.
    pub fn put(&self, object: &VaultObject) -> Result<ObjectId> {
        let path = self.loose_path(&object.id);
        if !self.fs.exists(&path) {
            let mut encoder = ZlibEncoder::new(Vec::new(), Compression::default());
            encoder.write_all(&object.wrapped())?;
            let deflated = encoder.finish()?;
            self.fs.write_file(&path, &deflated)?;
        }
        Ok(object.id)
    }

    /// Stores a verified pack stream under `objects/pack/<name>.pack`,
    /// making its objects readable through this store. The index is built
    /// lazily on first read.
    pub fn write_pack(&self, name: &str, pack: &[u8]) -> Result<()> {
        crate::packfile::verify_pack_trailer(pack)?;
        let path = self.pack_dir().join(format!("{}.pack", name));
        self.fs.write_file(&path, pack)
    }

    /// Parses the `shallow` marker file into a set of boundary commit oids.
    pub fn read_shallow_set(&self) -> Result<HashSet<ObjectId>> {
        let path = self.root.join("shallow");
        if !self.fs.exists(&path) {
            return Ok(HashSet::new());
        }
        let content = self.fs.read_file(&path)?;
        let text = String::from_utf8_lossy(&content);
        let mut set = HashSet::new();
        for line in text.lines() {
            let line = line.trim();
            if !line.is_empty() {
                set.insert(ObjectId::from_hex(line)?);
            }
        }
        Ok(set)
    }

    fn list_pack_names(&self) -> Result<Vec<String>> {
        let dir = self.pack_dir();
        if !self.fs.exists(&dir) {
            return Ok(Vec::new());
        }
        let mut names: Vec<String> = self
            .fs
            .read_dir(&dir)?
            .into_iter()
            .filter(|e| !e.is_dir && e.name.ends_with(".pack"))
            .map(|e| e.name)
            .collect();
        names.sort();
        Ok(names)
    }

    fn pack_key(&self, pack_name: &str) -> String {
        self.pack_dir().join(pack_name).to_string_lossy().into_owned()
    }

    /// Loads a pack through the shared cache, preferring a co-located
    /// `.idx` file and otherwise scanning the pack body. A scan-built index
    /// is written back as `.idx` as a best-effort caching side effect.
    fn load_pack(&self, pack_name: &str) -> Result<Arc<LoadedPack>> {
        let pack_path = self.pack_dir().join(pack_name);
        let key = self.pack_key(pack_name);
        self.cache.get_or_load(&key, || {
            let data = self.fs.read_file(&pack_path)?;
            crate::packfile::verify_pack_trailer(&data)?;

            let idx_path = pack_path.with_extension("idx");
            if self.fs.exists(&idx_path) {
                let idx_bytes = self.fs.read_file(&idx_path)?;
                let index = PackIndex::from_idx_bytes(&idx_bytes)?;
                return Ok(LoadedPack::new(data, index));
            }

            let index = PackIndex::scan(&data, self)?;
            if let Err(e) = self.fs.write_file(&idx_path, &index.to_idx_bytes()) {
                tracing::warn!(pack = pack_name, error = %e, "failed to write pack index");
            }
            Ok(LoadedPack::new(data, index))
        })
    }
}

impl ExternalBaseResolver for ObjectStore {
    fn resolve_base(&self, oid: &ObjectId) -> Result<VaultObject> {
        self.read_object(oid)
    }
}

fn inflate(deflated: &[u8]) -> Result<Vec<u8>> {
    let mut decoder = ZlibDecoder::new(deflated);
    let mut out = Vec::new();
    decoder
        .read_to_end(&mut out)
        .map_err(|e| StorageError::Corruption(format!("loose object inflate failed: {}", e)))?;
    Ok(out)
}

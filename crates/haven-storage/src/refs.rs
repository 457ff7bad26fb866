//! Reference resolution: loose ref files, packed-refs, symbolic chains.

use crate::fs::VaultFs;
use crate::{ObjectId, Result, StorageError};
use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::Arc;

/// Repository-layout filenames that can never be refs.
const RESERVED: &[&str] = &["config", "description", "index", "shallow", "commondir"];

/// Reference store for one vault.
///
/// Loose ref files always take precedence over packed-refs entries of the
/// same name; packed-refs is a fallback snapshot only.
pub struct RefStore {
    fs: Arc<dyn VaultFs>,
    root: PathBuf,
}

impl RefStore {
    /// Creates a ref store for the vault at `root`.
    pub fn new(fs: Arc<dyn VaultFs>, root: impl Into<PathBuf>) -> Self {
        Self {
            fs,
            root: root.into(),
        }
    }

    /// Resolves a ref to a 40-hex oid string, following symbolic
    /// indirection. With a `depth` bound the chain stops early and returns
    /// whatever ref text it reached (e.g. `depth = 2` on `HEAD` yields the
    /// branch path, not the commit).
    pub fn resolve(&self, refname: &str, depth: Option<u32>) -> Result<String> {
        let mut visited = HashSet::new();
        self.resolve_inner(refname, depth, &mut visited)
    }

    /// Resolves a ref all the way down to an oid.
    pub fn resolve_oid(&self, refname: &str) -> Result<ObjectId> {
        let resolved = self.resolve(refname, None)?;
        ObjectId::from_hex(&resolved)
    }

    fn resolve_inner(
        &self,
        refname: &str,
        depth: Option<u32>,
        visited: &mut HashSet<String>,
    ) -> Result<String> {
        let next_depth = match depth {
            Some(0) => return Ok(refname.to_string()),
            Some(d) => Some(d - 1),
            None => None,
        };

        if let Some(target) = refname.strip_prefix("ref: ") {
            return self.resolve_inner(target, next_depth, visited);
        }
        if ObjectId::is_hex(refname) {
            return Ok(refname.to_string());
        }

        let candidates = [
            refname.to_string(),
            format!("refs/{}", refname),
            format!("refs/tags/{}", refname),
            format!("refs/heads/{}", refname),
            format!("refs/remotes/{}", refname),
            format!("refs/remotes/{}/HEAD", refname),
        ];
        let packed = self.packed_refs()?;
        for candidate in candidates {
            if RESERVED.contains(&candidate.as_str()) {
                continue;
            }
            let content = match self.read_loose(&candidate)? {
                Some(content) => Some(content),
                None => packed.get(&candidate).cloned(),
            };
            if let Some(content) = content {
                if !visited.insert(candidate.clone()) {
                    return Err(StorageError::RefCycle(candidate));
                }
                return self.resolve_inner(content.trim(), next_depth, visited);
            }
        }

        Err(StorageError::RefNotFound(refname.to_string()))
    }

    fn read_loose(&self, refname: &str) -> Result<Option<String>> {
        let path = self.root.join(refname);
        if !self.fs.exists(&path) {
            return Ok(None);
        }
        match self.fs.metadata(&path) {
            Ok(stat) if stat.is_dir => return Ok(None),
            _ => {}
        }
        let content = self.fs.read_file(&path)?;
        Ok(Some(String::from_utf8_lossy(&content).trim().to_string()))
    }

    /// Parses `packed-refs` into a name to oid map. Peeled-tag lines
    /// (`^<oid>`) are keyed as `<name>^{}`.
    fn packed_refs(&self) -> Result<HashMap<String, String>> {
        let path = self.root.join("packed-refs");
        if !self.fs.exists(&path) {
            return Ok(HashMap::new());
        }
        let content = self.fs.read_file(&path)?;
        let text = String::from_utf8_lossy(&content);
        let mut map = HashMap::new();
        let mut last_name: Option<String> = None;
        for line in text.lines() {
            let line = line.trim_end();
            if line.is_empty() || line.starts_with('#') {
                continue;
            }
            if let Some(peeled) = line.strip_prefix('^') {
                if let Some(name) = &last_name {
                    map.insert(format!("{}^{{}}", name), peeled.trim().to_string());
                }
                continue;
            }
            if let Some((oid, name)) = line.split_once(' ') {
                map.insert(name.to_string(), oid.to_string());
                last_name = Some(name.to_string());
            }
        }
        Ok(map)
    }

    /// Lists ref names under a prefix, merging loose files (which win) with
    /// packed-refs entries, prefix stripped. Sorted so a peeled `name^{}`
    /// entry orders immediately after its un-peeled counterpart.
    pub fn list(&self, prefix: &str) -> Result<Vec<String>> {
        let prefix = prefix.trim_end_matches('/');
        let mut names = self.walk_loose(prefix)?;
        let loose: HashSet<String> = names.iter().cloned().collect();

        let packed_prefix = format!("{}/", prefix);
        for key in self.packed_refs()?.keys() {
            if let Some(rest) = key.strip_prefix(&packed_prefix) {
                if !loose.contains(rest) {
                    names.push(rest.to_string());
                }
            }
        }

        names.sort_by(|a, b| {
            let base_a = a.strip_suffix("^{}").unwrap_or(a);
            let base_b = b.strip_suffix("^{}").unwrap_or(b);
            base_a
                .cmp(base_b)
                .then_with(|| a.len().cmp(&b.len()))
        });
        names.dedup();
        Ok(names)
    }

    fn walk_loose(&self, prefix: &str) -> Result<Vec<String>> {
        let base = self.root.join(prefix);
        if !self.fs.exists(&base) {
            return Ok(Vec::new());
        }
        let mut out = Vec::new();
        let mut stack: Vec<PathBuf> = vec![PathBuf::new()];
        while let Some(rel) = stack.pop() {
            let dir = base.join(&rel);
            for entry in self.fs.read_dir(&dir)? {
                let child = rel.join(&entry.name);
                if entry.is_dir {
                    stack.push(child);
                } else {
                    out.push(path_to_ref(&child));
                }
            }
        }
        Ok(out)
    }

    /// Writes a loose ref pointing at an oid.
    pub fn set(&self, refname: &str, oid: ObjectId) -> Result<()> {
        self.fs
            .write_file(&self.root.join(refname), format!("{}\n", oid).as_bytes())
    }

    /// Writes a loose symbolic ref.
    pub fn set_symbolic(&self, refname: &str, target: &str) -> Result<()> {
        self.fs.write_file(
            &self.root.join(refname),
            format!("ref: {}\n", target).as_bytes(),
        )
    }
}

fn path_to_ref(path: &Path) -> String {
    path.components()
        .map(|c| c.as_os_str().to_string_lossy())
        .collect::<Vec<_>>()
        .join("/")
}

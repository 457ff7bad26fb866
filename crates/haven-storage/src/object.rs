//! Vault object types and parsing.
//!
//! Vault history uses the git object model: content-addressed commits,
//! trees, blobs and tags, identified by the SHA-1 of
//! `"<type> <len>\0<content>"`.

use crate::{Result, StorageError};
use bytes::Bytes;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use sha1::{Digest, Sha1};
use std::fmt;

/// A 20-byte SHA-1 object identifier.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ObjectId([u8; 20]);

impl Serialize for ObjectId {
    fn serialize<S>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_str(&self.to_hex())
    }
}

impl<'de> Deserialize<'de> for ObjectId {
    fn deserialize<D>(deserializer: D) -> std::result::Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        ObjectId::from_hex(&s).map_err(serde::de::Error::custom)
    }
}

impl ObjectId {
    /// Creates an ObjectId from raw bytes.
    pub fn from_bytes(bytes: [u8; 20]) -> Self {
        Self(bytes)
    }

    /// Creates an ObjectId from a 40-character hex string.
    pub fn from_hex(hex: &str) -> Result<Self> {
        if hex.len() != 40 {
            return Err(StorageError::InvalidObject(format!(
                "invalid object id length: {}",
                hex.len()
            )));
        }
        let mut bytes = [0u8; 20];
        hex::decode_to_slice(hex, &mut bytes)
            .map_err(|e| StorageError::InvalidObject(e.to_string()))?;
        Ok(Self(bytes))
    }

    /// Returns whether a string is a well-formed 40-hex id.
    pub fn is_hex(s: &str) -> bool {
        s.len() == 40 && s.bytes().all(|b| b.is_ascii_hexdigit())
    }

    /// Returns the raw bytes.
    pub fn as_bytes(&self) -> &[u8; 20] {
        &self.0
    }

    /// Returns the hex representation.
    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }

    /// Computes the SHA-1 hash of data with the object header prepended.
    pub fn hash_object(kind: ObjectType, data: &[u8]) -> Self {
        let header = format!("{} {}\0", kind.as_str(), data.len());
        let mut hasher = Sha1::new();
        hasher.update(header.as_bytes());
        hasher.update(data);
        let result = hasher.finalize();
        let mut bytes = [0u8; 20];
        bytes.copy_from_slice(&result);
        Self(bytes)
    }

    /// Splits the hex form into the loose-object path pair: the first two
    /// characters (directory) and the remaining 38 (filename).
    pub fn loose_parts(&self) -> (String, String) {
        let hex = self.to_hex();
        (hex[..2].to_string(), hex[2..].to_string())
    }
}

impl fmt::Debug for ObjectId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ObjectId({})", self.to_hex())
    }
}

impl fmt::Display for ObjectId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.to_hex())
    }
}

/// Vault history object types.
///
/// A closed enum so every encode/decode site matches exhaustively; an
/// unrecognized type is a parse failure, never a silent string miss.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ObjectType {
    /// Secret content.
    Blob,
    /// Directory level of the secrets tree.
    Tree,
    /// Point-in-time vault snapshot descriptor.
    Commit,
    /// Annotated tag.
    Tag,
}

impl ObjectType {
    /// Returns the wire string representation.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Blob => "blob",
            Self::Tree => "tree",
            Self::Commit => "commit",
            Self::Tag => "tag",
        }
    }

    /// Parses an object type from its wire string.
    pub fn parse(s: &str) -> Result<Self> {
        match s {
            "blob" => Ok(Self::Blob),
            "tree" => Ok(Self::Tree),
            "commit" => Ok(Self::Commit),
            "tag" => Ok(Self::Tag),
            _ => Err(StorageError::InvalidObject(format!(
                "unknown object type: {}",
                s
            ))),
        }
    }

    /// Returns the 3-bit type code used in pack entry headers.
    pub fn pack_type(&self) -> u8 {
        match self {
            Self::Commit => 1,
            Self::Tree => 2,
            Self::Blob => 3,
            Self::Tag => 4,
        }
    }

    /// Parses an object type from a pack entry type code.
    pub fn from_pack_type(code: u8) -> Result<Self> {
        match code {
            1 => Ok(Self::Commit),
            2 => Ok(Self::Tree),
            3 => Ok(Self::Blob),
            4 => Ok(Self::Tag),
            _ => Err(StorageError::Corruption(format!(
                "unknown pack type code: {}",
                code
            ))),
        }
    }
}

/// A vault object (blob, tree, commit, or tag).
#[derive(Debug, Clone)]
pub struct VaultObject {
    /// Content-derived identifier.
    pub id: ObjectId,
    /// The kind of object.
    pub kind: ObjectType,
    /// The raw object data (uncompressed, header stripped).
    pub data: Bytes,
}

impl VaultObject {
    /// Creates a new object, computing its id from the data.
    pub fn new(kind: ObjectType, data: impl Into<Bytes>) -> Self {
        let data = data.into();
        let id = ObjectId::hash_object(kind, &data);
        Self { id, kind, data }
    }

    /// Creates a blob object from secret content.
    pub fn blob(content: impl Into<Bytes>) -> Self {
        Self::new(ObjectType::Blob, content)
    }

    /// Creates a commit object.
    pub fn commit(
        tree: &ObjectId,
        parents: &[ObjectId],
        author: &Ident,
        committer: &Ident,
        message: &str,
    ) -> Self {
        let mut content = format!("tree {}\n", tree);
        for parent in parents {
            content.push_str(&format!("parent {}\n", parent));
        }
        content.push_str(&format!("author {}\n", author));
        content.push_str(&format!("committer {}\n", committer));
        content.push_str(&format!("\n{}", message));
        Self::new(ObjectType::Commit, content.into_bytes())
    }

    /// Returns the `"<type> <len>\0"`-prefixed wrapped form.
    pub fn wrapped(&self) -> Vec<u8> {
        let mut out = format!("{} {}\0", self.kind.as_str(), self.data.len()).into_bytes();
        out.extend_from_slice(&self.data);
        out
    }

    /// Parses an object out of its wrapped form, validating the header.
    pub fn from_wrapped(wrapped: &[u8]) -> Result<Self> {
        let null = wrapped
            .iter()
            .position(|&b| b == 0)
            .ok_or_else(|| StorageError::InvalidObject("missing header terminator".into()))?;
        let header = std::str::from_utf8(&wrapped[..null])
            .map_err(|_| StorageError::InvalidObject("non-utf8 object header".into()))?;
        let (kind, len) = header
            .split_once(' ')
            .ok_or_else(|| StorageError::InvalidObject(format!("invalid header: {}", header)))?;
        let kind = ObjectType::parse(kind)?;
        let len: usize = len
            .parse()
            .map_err(|_| StorageError::InvalidObject(format!("invalid length: {}", len)))?;
        let data = &wrapped[null + 1..];
        if data.len() != len {
            return Err(StorageError::InvalidObject(format!(
                "header declares {} bytes, found {}",
                len,
                data.len()
            )));
        }
        Ok(Self::new(kind, data.to_vec()))
    }

    /// Returns the size of the object data.
    pub fn size(&self) -> usize {
        self.data.len()
    }
}

/// Author or committer identity with timestamp.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Ident {
    /// Display name.
    pub name: String,
    /// Email address.
    pub email: String,
    /// Seconds since the unix epoch.
    pub timestamp: i64,
    /// Timezone offset as written (e.g. `+0000`).
    pub tz: String,
}

impl Ident {
    /// Creates an identity.
    pub fn new(name: &str, email: &str, timestamp: i64, tz: &str) -> Self {
        Self {
            name: name.to_string(),
            email: email.to_string(),
            timestamp,
            tz: tz.to_string(),
        }
    }

    /// Parses `"Name <email> ts tz"`.
    fn parse(s: &str) -> Result<Self> {
        let open = s
            .find(" <")
            .ok_or_else(|| StorageError::InvalidObject(format!("invalid ident: {}", s)))?;
        let close = s
            .find('>')
            .ok_or_else(|| StorageError::InvalidObject(format!("invalid ident: {}", s)))?;
        let name = s[..open].to_string();
        let email = s[open + 2..close].to_string();
        let rest = s[close + 1..].trim();
        let (ts, tz) = rest
            .split_once(' ')
            .ok_or_else(|| StorageError::InvalidObject(format!("invalid ident: {}", s)))?;
        let timestamp = ts
            .parse()
            .map_err(|_| StorageError::InvalidObject(format!("invalid timestamp: {}", ts)))?;
        Ok(Self {
            name,
            email,
            timestamp,
            tz: tz.to_string(),
        })
    }
}

impl fmt::Display for Ident {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} <{}> {} {}",
            self.name, self.email, self.timestamp, self.tz
        )
    }
}

/// Parsed view of a commit object.
#[derive(Debug, Clone)]
pub struct CommitInfo {
    /// Commit id.
    pub id: ObjectId,
    /// Root tree of the snapshot.
    pub tree: ObjectId,
    /// Parent commit ids.
    pub parents: Vec<ObjectId>,
    /// Author identity.
    pub author: Ident,
    /// Committer identity; its timestamp orders the log walk.
    pub committer: Ident,
    /// Commit message.
    pub message: String,
}

impl CommitInfo {
    /// Parses a commit object's content.
    pub fn parse(id: ObjectId, data: &[u8]) -> Result<Self> {
        let text = std::str::from_utf8(data)
            .map_err(|_| StorageError::InvalidObject(format!("non-utf8 commit {}", id)))?;
        let (headers, message) = text.split_once("\n\n").unwrap_or((text, ""));

        let mut tree = None;
        let mut parents = Vec::new();
        let mut author = None;
        let mut committer = None;
        for line in headers.lines() {
            if let Some(hex) = line.strip_prefix("tree ") {
                tree = Some(ObjectId::from_hex(hex)?);
            } else if let Some(hex) = line.strip_prefix("parent ") {
                parents.push(ObjectId::from_hex(hex)?);
            } else if let Some(rest) = line.strip_prefix("author ") {
                author = Some(Ident::parse(rest)?);
            } else if let Some(rest) = line.strip_prefix("committer ") {
                committer = Some(Ident::parse(rest)?);
            }
        }

        let tree =
            tree.ok_or_else(|| StorageError::InvalidObject(format!("commit {} has no tree", id)))?;
        let author = author
            .ok_or_else(|| StorageError::InvalidObject(format!("commit {} has no author", id)))?;
        let committer = committer.ok_or_else(|| {
            StorageError::InvalidObject(format!("commit {} has no committer", id))
        })?;

        Ok(Self {
            id,
            tree,
            parents,
            author,
            committer,
            message: message.to_string(),
        })
    }
}

/// One entry of a tree object.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TreeEntry {
    /// Octal mode string (e.g. `100644`, `40000`).
    pub mode: String,
    /// Entry name within the directory level.
    pub name: String,
    /// Target object id.
    pub oid: ObjectId,
}

impl TreeEntry {
    /// Whether the entry points at a subtree.
    pub fn is_tree(&self) -> bool {
        self.mode == "40000" || self.mode == "040000"
    }

    /// Parses the binary tree format: repeated `"<mode> <name>\0"` followed
    /// by 20 raw oid bytes.
    pub fn parse_tree(data: &[u8]) -> Result<Vec<TreeEntry>> {
        let mut entries = Vec::new();
        let mut pos = 0;
        while pos < data.len() {
            let null = data[pos..]
                .iter()
                .position(|&b| b == 0)
                .ok_or_else(|| StorageError::InvalidObject("truncated tree entry".into()))?
                + pos;
            let head = std::str::from_utf8(&data[pos..null])
                .map_err(|_| StorageError::InvalidObject("non-utf8 tree entry".into()))?;
            let (mode, name) = head
                .split_once(' ')
                .ok_or_else(|| StorageError::InvalidObject(format!("bad tree entry: {}", head)))?;
            if data.len() < null + 21 {
                return Err(StorageError::InvalidObject("truncated tree oid".into()));
            }
            let mut oid = [0u8; 20];
            oid.copy_from_slice(&data[null + 1..null + 21]);
            entries.push(TreeEntry {
                mode: mode.to_string(),
                name: name.to_string(),
                oid: ObjectId::from_bytes(oid),
            });
            pos = null + 21;
        }
        Ok(entries)
    }

    /// Encodes entries into a tree object. Entries are sorted by name as
    /// the format requires.
    pub fn encode_tree(entries: &[TreeEntry]) -> VaultObject {
        let mut sorted: Vec<&TreeEntry> = entries.iter().collect();
        sorted.sort_by(|a, b| a.name.cmp(&b.name));
        let mut data = Vec::new();
        for entry in sorted {
            data.extend_from_slice(entry.mode.as_bytes());
            data.push(b' ');
            data.extend_from_slice(entry.name.as_bytes());
            data.push(0);
            data.extend_from_slice(entry.oid.as_bytes());
        }
        VaultObject::new(ObjectType::Tree, data)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_object_id_hex_roundtrip() {
        let hex = "a94a8fe5ccb19ba61c4c0873d391e987982fbbd3";
        let id = ObjectId::from_hex(hex).unwrap();
        assert_eq!(id.to_hex(), hex);
    }

    #[test]
    fn test_blob_hash() {
        // Content-addressing sanity check against a well-known digest.
        let obj = VaultObject::blob(b"hello\n".to_vec());
        assert_eq!(obj.id.to_hex(), "ce013625030ba8dba906f756967f9e9ca394464a");
    }

    #[test]
    fn test_empty_blob_hash() {
        let obj = VaultObject::blob(b"".to_vec());
        assert_eq!(obj.id.to_hex(), "e69de29bb2d1d6434b8b29ae775ad8c2e48c5391");
    }

    #[test]
    fn test_hash_is_deterministic() {
        let a = ObjectId::hash_object(ObjectType::Blob, b"secret");
        let b = ObjectId::hash_object(ObjectType::Blob, b"secret");
        assert_eq!(a, b);
        // The type participates in the digest.
        let c = ObjectId::hash_object(ObjectType::Tree, b"secret");
        assert_ne!(a, c);
    }

    #[test]
    fn test_object_id_invalid_hex() {
        assert!(ObjectId::from_hex("abc").is_err());
        assert!(ObjectId::from_hex(&"z".repeat(40)).is_err());
        assert!(!ObjectId::is_hex("abc"));
        assert!(ObjectId::is_hex(&"a".repeat(40)));
    }

    #[test]
    fn test_loose_parts() {
        let id = ObjectId::from_hex("ce013625030ba8dba906f756967f9e9ca394464a").unwrap();
        let (dir, file) = id.loose_parts();
        assert_eq!(dir, "ce");
        assert_eq!(file, "013625030ba8dba906f756967f9e9ca394464a");
    }

    #[test]
    fn test_object_type_roundtrip() {
        for kind in [
            ObjectType::Blob,
            ObjectType::Tree,
            ObjectType::Commit,
            ObjectType::Tag,
        ] {
            assert_eq!(ObjectType::parse(kind.as_str()).unwrap(), kind);
            assert_eq!(ObjectType::from_pack_type(kind.pack_type()).unwrap(), kind);
        }
        assert!(ObjectType::parse("invalid").is_err());
        assert!(ObjectType::from_pack_type(0).is_err());
        assert!(ObjectType::from_pack_type(5).is_err());
    }

    #[test]
    fn test_wrapped_roundtrip() {
        let obj = VaultObject::blob(b"api-key=hunter2".to_vec());
        let wrapped = obj.wrapped();
        assert!(wrapped.starts_with(b"blob 15\0"));

        let parsed = VaultObject::from_wrapped(&wrapped).unwrap();
        assert_eq!(parsed.id, obj.id);
        assert_eq!(parsed.kind, ObjectType::Blob);
        assert_eq!(parsed.data, obj.data);
    }

    #[test]
    fn test_wrapped_bad_length() {
        let result = VaultObject::from_wrapped(b"blob 99\0short");
        assert!(result.is_err());
    }

    #[test]
    fn test_wrapped_bad_type() {
        let result = VaultObject::from_wrapped(b"bolb 4\0data");
        assert!(matches!(result, Err(StorageError::InvalidObject(_))));
    }

    #[test]
    fn test_ident_roundtrip() {
        let ident = Ident::new("Alice", "alice@example.com", 1234567890, "+0100");
        let parsed = Ident::parse(&ident.to_string()).unwrap();
        assert_eq!(parsed, ident);
    }

    #[test]
    fn test_commit_parse() {
        let tree = ObjectId::from_bytes([1u8; 20]);
        let parent = ObjectId::from_bytes([2u8; 20]);
        let author = Ident::new("Alice", "alice@example.com", 100, "+0000");
        let committer = Ident::new("Bob", "bob@example.com", 200, "+0000");
        let obj = VaultObject::commit(&tree, &[parent], &author, &committer, "rotate db password");

        let info = CommitInfo::parse(obj.id, &obj.data).unwrap();
        assert_eq!(info.tree, tree);
        assert_eq!(info.parents, vec![parent]);
        assert_eq!(info.committer.timestamp, 200);
        assert_eq!(info.message, "rotate db password");
    }

    #[test]
    fn test_commit_parse_no_parents() {
        let tree = ObjectId::from_bytes([1u8; 20]);
        let ident = Ident::new("Alice", "a@b.c", 1, "+0000");
        let obj = VaultObject::commit(&tree, &[], &ident, &ident, "init");
        let info = CommitInfo::parse(obj.id, &obj.data).unwrap();
        assert!(info.parents.is_empty());
    }

    #[test]
    fn test_commit_parse_missing_tree() {
        let id = ObjectId::from_bytes([0u8; 20]);
        let result = CommitInfo::parse(id, b"author A <a@b> 1 +0000\n\nmsg");
        assert!(result.is_err());
    }

    #[test]
    fn test_tree_roundtrip() {
        let entries = vec![
            TreeEntry {
                mode: "100644".into(),
                name: "password".into(),
                oid: ObjectId::from_bytes([3u8; 20]),
            },
            TreeEntry {
                mode: "40000".into(),
                name: "db".into(),
                oid: ObjectId::from_bytes([4u8; 20]),
            },
        ];
        let obj = TreeEntry::encode_tree(&entries);
        assert_eq!(obj.kind, ObjectType::Tree);

        let parsed = TreeEntry::parse_tree(&obj.data).unwrap();
        assert_eq!(parsed.len(), 2);
        // Sorted by name on encode.
        assert_eq!(parsed[0].name, "db");
        assert!(parsed[0].is_tree());
        assert_eq!(parsed[1].name, "password");
        assert!(!parsed[1].is_tree());
    }

    #[test]
    fn test_tree_truncated() {
        assert!(TreeEntry::parse_tree(b"100644 f\0shortoid").is_err());
        assert!(TreeEntry::parse_tree(b"no-terminator").is_err());
    }

    #[test]
    fn test_object_id_serde() {
        let id = ObjectId::from_bytes([0xab; 20]);
        let json = serde_json::to_string(&id).unwrap();
        let parsed: ObjectId = serde_json::from_str(&json).unwrap();
        assert_eq!(id, parsed);
    }
}

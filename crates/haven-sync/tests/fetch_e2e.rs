//! End-to-end fetch over an on-disk vault: negotiate, build, stream, and
//! rebuild on the receiving side.

use haven_storage::{
    Ident, LoadedPack, LocalFs, ObjectId, PackCache, TreeEntry, Vault, VaultFs, VaultObject,
};
use haven_sync::{
    advertise_refs, upload_pack, verify_pack, PktLine, PktLineReader, SideBandReader,
};
use std::collections::HashSet;
use std::io::Cursor;
use std::sync::Arc;

fn disk_vault(dir: &tempfile::TempDir) -> Vault {
    let fs: Arc<dyn VaultFs> = Arc::new(LocalFs::new(dir.path()));
    Vault::init(fs, "team-secrets", "team-secrets", Arc::new(PackCache::new())).unwrap()
}

fn commit_secret(vault: &Vault, name: &str, content: &str, timestamp: i64) -> ObjectId {
    let blob = VaultObject::blob(content.as_bytes().to_vec());
    vault.objects.put(&blob).unwrap();
    let tree = TreeEntry::encode_tree(&[TreeEntry {
        mode: "100644".into(),
        name: name.into(),
        oid: blob.id,
    }]);
    vault.objects.put(&tree).unwrap();
    let author = Ident::new("Alice", "alice@example.com", timestamp, "+0000");
    vault.commit(&tree.id, content, &author).unwrap()
}

/// Runs one full fetch against a vault: read the advertisement, request
/// HEAD, and demultiplex the response into pack bytes.
fn fetch(vault: &Vault) -> (ObjectId, Vec<u8>) {
    let mut advertisement = Vec::new();
    advertise_refs(&mut advertisement, vault).unwrap();

    let mut reader = PktLineReader::new(Cursor::new(advertisement));
    assert_eq!(
        reader.read().unwrap().unwrap().as_text(),
        Some("# service=git-upload-pack\n")
    );
    assert!(matches!(reader.read().unwrap(), Some(PktLine::Flush)));

    let head_line = reader.read().unwrap().unwrap();
    let head_line = head_line.as_text().unwrap();
    let head = ObjectId::from_hex(&head_line[..40]).unwrap();
    assert!(head_line.contains("side-band-64k"));

    let mut body = Vec::new();
    {
        let mut pkt = haven_sync::PktLineWriter::new(&mut body);
        pkt.write_line(&format!("want {} side-band-64k", head)).unwrap();
        pkt.flush_pkt().unwrap();
        pkt.write_line("done").unwrap();
    }

    let mut response = Vec::new();
    upload_pack(&mut Cursor::new(body), &mut response, vault).unwrap();

    let mut reader = PktLineReader::new(Cursor::new(response));
    let ack = reader.read().unwrap().unwrap();
    assert_eq!(ack.as_text().map(str::trim_end), Some("NAK"));
    let (pack, progress) = SideBandReader::new(reader.into_inner()).collect().unwrap();
    assert!(!progress.is_empty());
    (head, pack)
}

#[test]
fn test_full_fetch_transfers_reachable_closure() {
    let dir = tempfile::tempdir().unwrap();
    let vault = disk_vault(&dir);
    let c1 = commit_secret(&vault, "db-password", "one", 100);
    let c2 = commit_secret(&vault, "db-password", "two", 200);
    let c3 = commit_secret(&vault, "api-key", "three", 300);

    let (head, pack) = fetch(&vault);
    assert_eq!(head, c3);
    // 3 commits, 3 trees, 3 blobs.
    assert_eq!(verify_pack(&pack).unwrap(), 9);

    // The receiving side can materialize every commit from the pack alone.
    let loaded = LoadedPack::load(pack, &vault.objects).unwrap();
    for oid in [c1, c2, c3] {
        let from_pack = loaded.read_object(&oid, &vault.objects).unwrap();
        let from_store = vault.objects.read_object(&oid).unwrap();
        assert_eq!(from_pack.data, from_store.data);
    }
}

#[test]
fn test_depth_bounded_build_reports_shallow_tip() {
    let dir = tempfile::tempdir().unwrap();
    let vault = disk_vault(&dir);
    commit_secret(&vault, "db-password", "one", 100);
    commit_secret(&vault, "db-password", "two", 200);
    let c3 = commit_secret(&vault, "db-password", "three", 300);

    let result = haven_sync::PackBuilder::new(&vault)
        .pack_objects(&["refs/heads/main".to_string()], Some(1), &HashSet::new())
        .unwrap();

    assert_eq!(verify_pack(&result.pack).unwrap(), 3);
    assert_eq!(result.shallows, HashSet::from([c3]));
    assert!(result.unshallows.is_empty());

    let loaded = LoadedPack::load(result.pack, &vault.objects).unwrap();
    assert!(loaded.contains(&c3));
}

#[test]
fn test_pack_written_into_second_vault_is_readable() {
    let dir = tempfile::tempdir().unwrap();
    let vault = disk_vault(&dir);
    let c1 = commit_secret(&vault, "db-password", "hunter2", 100);

    let (_, pack) = fetch(&vault);

    // Drop the pack into a fresh vault's pack directory and read through it.
    let peer_dir = tempfile::tempdir().unwrap();
    let peer = disk_vault(&peer_dir);
    peer.objects.write_pack("fetched", &pack).unwrap();

    let commit = peer.objects.read_object(&c1).unwrap();
    let original = vault.objects.read_object(&c1).unwrap();
    assert_eq!(commit.kind, original.kind);
    assert_eq!(commit.data, original.data);
}

//! Smart-HTTP fetch protocol: ref advertisement and upload-pack.
//!
//! See: https://git-scm.com/docs/http-protocol

use crate::pack::PackBuilder;
use crate::pktline::{PktLine, PktLineReader, PktLineWriter};
use crate::sideband::{SideBandChannel, SideBandWriter};
use crate::{Result, SyncError};
use haven_storage::{ObjectId, Vault};
use std::collections::HashSet;
use std::io::{Read, Write};
use tracing::debug;

/// The service this node serves. Fetch only; pushes go through the vault's
/// own commit path.
pub const UPLOAD_PACK_SERVICE: &str = "git-upload-pack";

const ZERO_OID: &str = "0000000000000000000000000000000000000000";

fn capabilities(head_target: &str) -> String {
    format!(
        "side-band-64k symref=HEAD:{} agent=haven/0.1.0",
        head_target
    )
}

/// Writes the pkt-line ref advertisement for a fetch.
///
/// HEAD comes first carrying the capability list, then every ref under
/// `refs/` resolved to its oid, then a flush.
pub fn advertise_refs<W: Write>(writer: &mut W, vault: &Vault) -> Result<()> {
    let mut pkt = PktLineWriter::new(writer);
    pkt.write(&PktLine::text(&format!(
        "# service={}\n",
        UPLOAD_PACK_SERVICE
    )))?;
    pkt.flush_pkt()?;

    let head_target = vault
        .refs
        .resolve("HEAD", Some(2))
        .unwrap_or_else(|_| "refs/heads/main".to_string());
    let caps = capabilities(&head_target);

    match vault.head() {
        Ok(head) => {
            pkt.write(&PktLine::text(&format!("{} HEAD\0{}\n", head, caps)))?;
            for name in vault.refs.list("refs")? {
                let refname = format!("refs/{}", name);
                match vault.refs.resolve_oid(&refname) {
                    Ok(oid) => pkt.write_line(&format!("{} {}", oid, refname))?,
                    // A dangling symbolic ref is not advertisable; skip it.
                    Err(e) => debug!(refname, error = %e, "skipping unresolvable ref"),
                }
            }
        }
        Err(_) => {
            // Empty vault: advertise capabilities against the zero id.
            pkt.write(&PktLine::text(&format!(
                "{} capabilities^{{}}\0{}\n",
                ZERO_OID, caps
            )))?;
        }
    }

    pkt.flush_pkt()?;
    pkt.flush()?;
    Ok(())
}

/// Parsed upload-pack negotiation request.
#[derive(Debug, Clone, Default)]
pub struct Negotiation {
    /// Tip oids the peer is requesting.
    pub wants: Vec<ObjectId>,
    /// Oids the peer already possesses.
    pub haves: HashSet<ObjectId>,
}

impl Negotiation {
    /// Parses `want`/`have`/`done` pkt-lines from a request body.
    ///
    /// Malformed lines fail before any response bytes are written.
    pub fn parse<R: Read>(reader: &mut R) -> Result<Self> {
        let mut pkt = PktLineReader::new(reader);
        let mut negotiation = Self::default();
        loop {
            match pkt.read()? {
                Some(PktLine::Data(data)) => {
                    let line = std::str::from_utf8(&data)
                        .map_err(|_| SyncError::Protocol("non-utf8 request line".into()))?
                        .trim_end();
                    if let Some(rest) = line.strip_prefix("want ") {
                        // Capabilities may trail the first want line.
                        let hex = rest.split(' ').next().unwrap_or(rest);
                        negotiation.wants.push(parse_oid(hex)?);
                    } else if let Some(hex) = line.strip_prefix("have ") {
                        negotiation.haves.insert(parse_oid(hex)?);
                    } else if line == "done" {
                        break;
                    } else {
                        return Err(SyncError::Protocol(format!(
                            "unexpected request line: {:?}",
                            line
                        )));
                    }
                }
                // Flush separates the want block from the have block.
                Some(PktLine::Flush) => continue,
                Some(PktLine::Delimiter) => {
                    return Err(SyncError::Protocol(
                        "unexpected delimiter in negotiation".into(),
                    ))
                }
                None => break,
            }
        }
        Ok(negotiation)
    }
}

fn parse_oid(hex: &str) -> Result<ObjectId> {
    ObjectId::from_hex(hex).map_err(|e| SyncError::Protocol(format!("bad oid in request: {}", e)))
}

/// Serves one upload-pack exchange: parses the negotiation, builds the
/// pack, then streams it side-band multiplexed with progress messages.
pub fn upload_pack<R: Read, W: Write>(reader: &mut R, writer: &mut W, vault: &Vault) -> Result<()> {
    let negotiation = Negotiation::parse(reader)?;
    let mut pkt = PktLineWriter::new(writer);

    if negotiation.wants.is_empty() {
        pkt.write_line("NAK")?;
        pkt.flush()?;
        return Ok(());
    }

    let refs: Vec<String> = negotiation
        .wants
        .iter()
        .map(|oid| oid.to_hex())
        .collect();
    let result = PackBuilder::new(vault).pack_objects(&refs, None, &negotiation.haves)?;

    match result.acks.first() {
        Some(ack) => pkt.write_line(&format!("ACK {}", ack.oid))?,
        None => pkt.write_line("NAK")?,
    }

    let mut sideband = SideBandWriter::new(pkt.inner_mut());
    sideband.progress(&format!(
        "packing {} vault objects\n",
        pack_object_count(&result.pack)
    ))?;
    sideband.write(SideBandChannel::Pack, &result.pack)?;
    sideband.finish()?;
    Ok(())
}

fn pack_object_count(pack: &[u8]) -> u32 {
    // Header layout is fixed; the builder always emits at least 12 bytes.
    pack.get(8..12)
        .map(|b| u32::from_be_bytes(b.try_into().unwrap()))
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pack::verify_pack;
    use crate::sideband::SideBandReader;
    use haven_storage::{Ident, MemFs, PackCache, TreeEntry, VaultFs, VaultObject};
    use std::io::Cursor;
    use std::sync::Arc;

    fn vault() -> Vault {
        let fs: Arc<dyn VaultFs> = Arc::new(MemFs::new());
        Vault::init(fs, "vault", "vault", Arc::new(PackCache::new())).unwrap()
    }

    fn commit_secret(vault: &Vault, content: &str, timestamp: i64) -> ObjectId {
        let blob = VaultObject::blob(content.as_bytes().to_vec());
        vault.objects.put(&blob).unwrap();
        let tree = TreeEntry::encode_tree(&[TreeEntry {
            mode: "100644".into(),
            name: "secret".into(),
            oid: blob.id,
        }]);
        vault.objects.put(&tree).unwrap();
        let author = Ident::new("Alice", "alice@example.com", timestamp, "+0000");
        vault.commit(&tree.id, content, &author).unwrap()
    }

    fn advertisement_lines(vault: &Vault) -> Vec<String> {
        let mut out = Vec::new();
        advertise_refs(&mut out, vault).unwrap();
        let mut reader = PktLineReader::new(Cursor::new(out));
        let mut lines = Vec::new();
        while let Some(pkt) = reader.read().unwrap() {
            match pkt {
                PktLine::Data(d) => lines.push(String::from_utf8(d).unwrap()),
                PktLine::Flush => lines.push("FLUSH".into()),
                PktLine::Delimiter => lines.push("DELIM".into()),
            }
        }
        lines
    }

    #[test]
    fn test_advertisement_lists_head_first() {
        let vault = vault();
        let c1 = commit_secret(&vault, "one", 100);
        vault.refs.set("refs/tags/v1", c1).unwrap();

        let lines = advertisement_lines(&vault);
        assert_eq!(lines[0], "# service=git-upload-pack\n");
        assert_eq!(lines[1], "FLUSH");
        assert_eq!(
            lines[2],
            format!(
                "{} HEAD\0side-band-64k symref=HEAD:refs/heads/main agent=haven/0.1.0\n",
                c1
            )
        );
        assert_eq!(lines[3], format!("{} refs/heads/main\n", c1));
        assert_eq!(lines[4], format!("{} refs/tags/v1\n", c1));
        assert_eq!(lines[5], "FLUSH");
    }

    #[test]
    fn test_advertisement_for_empty_vault() {
        let vault = vault();
        let lines = advertisement_lines(&vault);
        assert!(lines[2].starts_with(ZERO_OID));
        assert!(lines[2].contains("capabilities^{}"));
    }

    #[test]
    fn test_negotiation_parse() {
        let mut body = Vec::new();
        {
            let mut pkt = PktLineWriter::new(&mut body);
            pkt.write_line(&format!("want {} side-band-64k", "a".repeat(40)))
                .unwrap();
            pkt.write_line(&format!("want {}", "b".repeat(40))).unwrap();
            pkt.flush_pkt().unwrap();
            pkt.write_line(&format!("have {}", "c".repeat(40))).unwrap();
            pkt.write_line("done").unwrap();
        }
        let negotiation = Negotiation::parse(&mut Cursor::new(body)).unwrap();
        assert_eq!(negotiation.wants.len(), 2);
        assert_eq!(negotiation.haves.len(), 1);
        assert_eq!(negotiation.wants[0].to_hex(), "a".repeat(40));
    }

    #[test]
    fn test_negotiation_rejects_garbage() {
        let mut body = Vec::new();
        {
            let mut pkt = PktLineWriter::new(&mut body);
            pkt.write_line("steal everything").unwrap();
        }
        assert!(matches!(
            Negotiation::parse(&mut Cursor::new(body)),
            Err(SyncError::Protocol(_))
        ));
    }

    #[test]
    fn test_negotiation_rejects_short_oid() {
        let mut body = Vec::new();
        {
            let mut pkt = PktLineWriter::new(&mut body);
            pkt.write_line("want abc123").unwrap();
        }
        assert!(Negotiation::parse(&mut Cursor::new(body)).is_err());
    }

    #[test]
    fn test_upload_pack_streams_valid_pack() {
        let vault = vault();
        commit_secret(&vault, "one", 100);
        commit_secret(&vault, "two", 200);
        let head = vault.head().unwrap();

        let mut body = Vec::new();
        {
            let mut pkt = PktLineWriter::new(&mut body);
            pkt.write_line(&format!("want {}", head)).unwrap();
            pkt.flush_pkt().unwrap();
            pkt.write_line("done").unwrap();
        }

        let mut response = Vec::new();
        upload_pack(&mut Cursor::new(body), &mut response, &vault).unwrap();

        let mut reader = PktLineReader::new(Cursor::new(response));
        let first = reader.read().unwrap().unwrap();
        assert_eq!(first.as_text().map(str::trim_end), Some("NAK"));

        let (pack, progress) = SideBandReader::new(reader.into_inner()).collect().unwrap();
        assert_eq!(verify_pack(&pack).unwrap(), 6);
        assert!(progress.contains("6 vault objects"));
    }

    #[test]
    fn test_upload_pack_acks_known_tip() {
        let vault = vault();
        let c1 = commit_secret(&vault, "one", 100);
        let c2 = commit_secret(&vault, "two", 200);

        let mut body = Vec::new();
        {
            let mut pkt = PktLineWriter::new(&mut body);
            pkt.write_line(&format!("want {}", c2)).unwrap();
            pkt.flush_pkt().unwrap();
            pkt.write_line(&format!("have {}", c1)).unwrap();
            pkt.write_line("done").unwrap();
        }

        let mut response = Vec::new();
        upload_pack(&mut Cursor::new(body), &mut response, &vault).unwrap();

        let mut reader = PktLineReader::new(Cursor::new(response));
        let first = reader.read().unwrap().unwrap();
        assert_eq!(
            first.as_text().map(str::trim_end),
            Some(format!("ACK {}", c1).as_str())
        );

        let (pack, _) = SideBandReader::new(reader.into_inner()).collect().unwrap();
        // Only c2's commit, tree, and blob.
        assert_eq!(verify_pack(&pack).unwrap(), 3);
    }

    #[test]
    fn test_upload_pack_without_wants_naks() {
        let vault = vault();
        commit_secret(&vault, "one", 100);

        let mut body = Vec::new();
        {
            let mut pkt = PktLineWriter::new(&mut body);
            pkt.write_line("done").unwrap();
        }
        let mut response = Vec::new();
        upload_pack(&mut Cursor::new(body), &mut response, &vault).unwrap();

        let mut reader = PktLineReader::new(Cursor::new(response));
        let first = reader.read().unwrap().unwrap();
        assert_eq!(first.as_text().map(str::trim_end), Some("NAK"));
        assert!(reader.read().unwrap().is_none());
    }
}

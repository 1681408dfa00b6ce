//! Wire-format traversal of opaque request frames.
//!
//! The proxy never holds schemas for the requests it forwards. To route a
//! call it must still read, and sometimes rewrite, the repository reference
//! embedded in the first request frame. Both operations walk the protobuf
//! wire format along a path of field numbers; rewriting splices the new
//! value in place and re-encodes only the enclosing length prefixes, so all
//! other frame content survives byte-for-byte.

use crate::ProtocolError;
use prost::Message;
use proto::vault::Repository;

/// A located field occurrence: the wire type, the byte range of the key and
/// length prefix, and the byte range of the value itself.
struct Located {
    wire_type: u64,
    key_start: usize,
    value_start: usize,
    value_end: usize,
}

fn read_varint(buf: &[u8], pos: &mut usize) -> Result<u64, ProtocolError> {
    let mut value = 0u64;
    for shift in 0..10 {
        let byte = *buf.get(*pos).ok_or(ProtocolError::Malformed(*pos))?;
        *pos += 1;
        value |= u64::from(byte & 0x7f) << (shift * 7);
        if byte & 0x80 == 0 {
            return Ok(value);
        }
    }
    Err(ProtocolError::Malformed(*pos))
}

/// Scans one message level for `field`, returning its last occurrence.
/// proto3 semantics: when a singular field appears repeatedly, the final
/// occurrence wins.
fn locate(buf: &[u8], field: u32) -> Result<Option<Located>, ProtocolError> {
    let mut pos = 0;
    let mut found = None;

    while pos < buf.len() {
        let key_start = pos;
        let key = read_varint(buf, &mut pos)?;
        let field_number = (key >> 3) as u32;
        let wire_type = key & 0x7;

        let value_start = pos;
        let value_end = match wire_type {
            0 => {
                let _ = read_varint(buf, &mut pos)?;
                pos
            }
            1 => {
                pos += 8;
                pos
            }
            2 => {
                let len = read_varint(buf, &mut pos)? as usize;
                pos + len
            }
            5 => {
                pos += 4;
                pos
            }
            // Groups (3/4) and reserved wire types are not produced by any
            // supported protocol revision.
            _ => return Err(ProtocolError::Malformed(key_start)),
        };
        if value_end > buf.len() {
            return Err(ProtocolError::Malformed(value_start));
        }
        pos = value_end;

        if field_number == field {
            found = Some(Located {
                wire_type,
                key_start,
                value_start,
                value_end,
            });
        }
    }
    Ok(found)
}

fn descend<'b>(buf: &'b [u8], field: u32) -> Result<&'b [u8], ProtocolError> {
    match locate(buf, field)? {
        None => Err(ProtocolError::MissingField { field }),
        Some(at) if at.wire_type != 2 => Err(ProtocolError::UnexpectedWireType {
            field,
            wire_type: at.wire_type as u8,
        }),
        Some(at) => Ok(&buf[at.value_start..at.value_end]),
    }
}

/// Reads the repository reference at `path` within `frame`.
pub fn peek_repository(frame: &[u8], path: &[u32]) -> Result<Repository, ProtocolError> {
    let mut buf = frame;
    for field in path {
        buf = descend(buf, *field)?;
    }
    Ok(Repository::decode(buf)?)
}

/// Reads the string field at `path` within `frame`.
pub fn peek_string(frame: &[u8], path: &[u32]) -> Result<String, ProtocolError> {
    let (last, parents) = path.split_last().expect("peek path is never empty");
    let mut buf = frame;
    for field in parents {
        buf = descend(buf, *field)?;
    }
    let value = descend(buf, *last)?;
    String::from_utf8(value.to_vec()).map_err(|_| ProtocolError::MissingField { field: *last })
}

fn encode_field(field: u32, value: &[u8], out: &mut Vec<u8>) {
    prost::encoding::encode_key(field, prost::encoding::WireType::LengthDelimited, out);
    prost::encoding::encode_varint(value.len() as u64, out);
    out.extend_from_slice(value);
}

/// Replaces the length-delimited field at `path` with `value`, splicing the
/// surrounding bytes unchanged. Interior path segments must exist; the leaf
/// field is appended to its parent when absent.
pub fn rewrite_string(frame: &[u8], path: &[u32], value: &str) -> Result<Vec<u8>, ProtocolError> {
    rewrite(frame, path, value.as_bytes(), true)
}

fn rewrite(
    frame: &[u8],
    path: &[u32],
    value: &[u8],
    is_leaf_parentless_ok: bool,
) -> Result<Vec<u8>, ProtocolError> {
    let (field, rest) = match path {
        [] => return Ok(value.to_vec()),
        [field, rest @ ..] => (*field, rest),
    };

    match locate(frame, field)? {
        Some(at) if at.wire_type != 2 => Err(ProtocolError::UnexpectedWireType {
            field,
            wire_type: at.wire_type as u8,
        }),
        Some(at) => {
            let inner = rewrite(
                &frame[at.value_start..at.value_end],
                rest,
                value,
                is_leaf_parentless_ok,
            )?;
            let mut out = Vec::with_capacity(frame.len() + inner.len());
            out.extend_from_slice(&frame[..at.key_start]);
            encode_field(field, &inner, &mut out);
            out.extend_from_slice(&frame[at.value_end..]);
            Ok(out)
        }
        None if rest.is_empty() && is_leaf_parentless_ok => {
            // The leaf string was absent (e.g. an empty storage_name was
            // omitted from the wire); append it to this message level.
            let mut out = Vec::with_capacity(frame.len() + value.len() + 8);
            out.extend_from_slice(frame);
            encode_field(field, value, &mut out);
            Ok(out)
        }
        None => Err(ProtocolError::MissingField { field }),
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use prost::Message;
    use proto::vault::{RemoveRepositoryRequest, ReplicateRepositoryRequest, Repository};

    fn repo(storage: &str, path: &str) -> Repository {
        Repository {
            storage_name: storage.to_string(),
            relative_path: path.to_string(),
        }
    }

    #[test]
    fn peeks_repository_at_top_level() {
        let frame = RemoveRepositoryRequest {
            repository: Some(repo("default", "@repos/a.git")),
        }
        .encode_to_vec();

        let peeked = peek_repository(&frame, &[1]).unwrap();
        assert_eq!(peeked, repo("default", "@repos/a.git"));
    }

    #[test]
    fn peeks_second_repository_field() {
        let frame = ReplicateRepositoryRequest {
            repository: Some(repo("target", "@repos/a.git")),
            source: Some(repo("source", "@repos/a.git")),
        }
        .encode_to_vec();

        assert_eq!(
            peek_repository(&frame, &[2]).unwrap().storage_name,
            "source"
        );
    }

    #[test]
    fn missing_field_is_an_error() {
        let frame = RemoveRepositoryRequest { repository: None }.encode_to_vec();
        assert!(matches!(
            peek_repository(&frame, &[1]),
            Err(ProtocolError::MissingField { field: 1 })
        ));
    }

    #[test]
    fn rewrites_storage_name_and_preserves_unknown_fields() {
        // Encode a frame carrying fields this build has no schema for, both
        // beside and inside the repository message.
        let mut frame = Vec::new();
        encode_field(7, b"unknown sibling", &mut frame);
        let mut inner = repo("default-virtual", "@repos/a.git").encode_to_vec();
        encode_field(9, b"unknown nested", &mut inner);
        encode_field(1, &inner, &mut frame);

        let rewritten = rewrite_string(&frame, &[1, 1], "node-a").unwrap();

        // The routed frame decodes to the rewritten repository...
        let decoded = peek_repository(&rewritten, &[1]).unwrap();
        assert_eq!(decoded, repo("node-a", "@repos/a.git"));

        // ...and every unknown byte survived the splice.
        let sibling = peek_string(&rewritten, &[7]).unwrap();
        assert_eq!(sibling, "unknown sibling");
        let nested = descend(descend(&rewritten, 1).unwrap(), 9).unwrap();
        assert_eq!(nested, b"unknown nested");
    }

    #[test]
    fn rewrite_appends_absent_leaf() {
        // proto3 omits empty strings: a repository with no storage_name.
        let frame = RemoveRepositoryRequest {
            repository: Some(repo("", "@repos/a.git")),
        }
        .encode_to_vec();

        let rewritten = rewrite_string(&frame, &[1, 1], "node-b").unwrap();
        assert_eq!(
            peek_repository(&rewritten, &[1]).unwrap(),
            repo("node-b", "@repos/a.git")
        );
    }

    #[test]
    fn rewrite_without_repository_fails() {
        let frame = RemoveRepositoryRequest { repository: None }.encode_to_vec();
        assert!(rewrite_string(&frame, &[1, 1], "node-a").is_err());
    }

    #[test]
    fn last_occurrence_wins() {
        let mut frame = Vec::new();
        encode_field(1, &repo("first", "a").encode_to_vec(), &mut frame);
        encode_field(1, &repo("second", "b").encode_to_vec(), &mut frame);

        assert_eq!(peek_repository(&frame, &[1]).unwrap().storage_name, "second");
    }

    #[test]
    fn truncated_frame_is_an_error() {
        let frame = RemoveRepositoryRequest {
            repository: Some(repo("default", "@repos/a.git")),
        }
        .encode_to_vec();

        assert!(peek_repository(&frame[..frame.len() - 3], &[1]).is_err());
    }
}

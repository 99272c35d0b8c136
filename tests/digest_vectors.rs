//! Fixed digest vectors for the provider-native tags.

use std::io::Cursor;

use ingest_core::digest::{
    crc32c_from_base64, digest_reader, DigestSelection, DigestingReader, MultiDigest,
};
use std::io::Read;

const MIB: usize = 1024 * 1024;

fn pattern(len: usize) -> Vec<u8> {
    (0..len).map(|i| ((i * 31 + 7) % 251) as u8).collect()
}

#[test]
fn ten_megabytes_at_five_megabyte_chunks_has_two_parts() {
    let data = pattern(10 * MIB);
    let digests = digest_reader(Cursor::new(&data), 5 * MIB, DigestSelection::ALL).unwrap();
    assert_eq!(
        digests.multipart_tag.as_deref(),
        Some("a8c6388e6556658eb669d05e70592b75-2")
    );
    assert_eq!(digests.md5.as_deref(), Some("9b344b7f2bf041493fe5d3dbd6a051b9"));
    assert_eq!(digests.bytes, (10 * MIB) as u64);
}

#[test]
fn three_megabytes_is_a_plain_digest() {
    let data = pattern(3 * MIB);
    let digests = digest_reader(Cursor::new(&data), 5 * MIB, DigestSelection::ALL).unwrap();
    assert_eq!(
        digests.multipart_tag.as_deref(),
        Some("758d000988ff2631c440d48aefe73c87")
    );
    assert_eq!(digests.multipart_tag, digests.md5);
    assert_eq!(digests.crc32c, Some(3323787205));
    assert_eq!(digests.crc32c_base64().as_deref(), Some("xhz3xQ=="));
    assert_eq!(crc32c_from_base64("xhz3xQ==").unwrap(), 3323787205);
}

#[test]
fn empty_input_matches_empty_buffer() {
    let digests = digest_reader(Cursor::new(Vec::new()), 5 * MIB, DigestSelection::ALL).unwrap();
    assert_eq!(
        digests.multipart_tag.as_deref(),
        Some("d41d8cd98f00b204e9800998ecf8427e")
    );
    assert_eq!(digests.md5, digests.multipart_tag);
    assert_eq!(digests.crc32c, Some(0));
    assert_eq!(digests.bytes, 0);
}

#[test]
fn digest_is_independent_of_read_boundaries() {
    let data = pattern(3 * MIB + 17);
    let whole = digest_reader(Cursor::new(&data), MIB, DigestSelection::ALL).unwrap();

    let mut pieces = MultiDigest::new(MIB, DigestSelection::ALL);
    for piece in data.chunks(12_345) {
        pieces.update(piece);
    }
    assert_eq!(pieces.finish(), whole);
    assert!(whole.multipart_tag.as_deref().unwrap().ends_with("-4"));
}

#[test]
fn digesting_reader_passes_bytes_through() {
    let data = pattern(2 * MIB + 1);
    let mut reader = DigestingReader::new(Cursor::new(&data), MIB, DigestSelection::ALL);
    let mut copied = Vec::new();
    reader.read_to_end(&mut copied).unwrap();
    assert_eq!(copied, data);

    let streamed = reader.finish();
    let direct = digest_reader(Cursor::new(&data), MIB, DigestSelection::ALL).unwrap();
    assert_eq!(streamed, direct);
}

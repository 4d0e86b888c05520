use etherip_lib::cip::path::{
    encode_class_path, encode_port_path, encode_tag_path, tag_path_words,
};
use etherip_lib::tag::TagPath;

fn build(tag: &str) -> Vec<u8> {
    encode_tag_path(&tag.parse::<TagPath>().unwrap()).unwrap()
}

#[test]
fn test_word_count_matches_byte_length() {
    for tag in [
        "fred",
        "a.b.c",
        "arr[258]",
        "Local:2:I.Ch0Data",
        "MyUDT.Field[3].Sub[70000]",
        "x[255]",
        "x[256]",
        "x[65535]",
        "x[65536]",
    ] {
        let parsed: TagPath = tag.parse().unwrap();
        let words = tag_path_words(&parsed).unwrap();
        let bytes = encode_tag_path(&parsed).unwrap();
        assert_eq!(bytes.len(), words * 2, "tag {tag}");
        assert_eq!(bytes.len() % 2, 0, "tag {tag}");
    }
}

#[test]
fn test_symbolic_segments_with_pad() {
    // module-style names keep their colons in one symbolic segment
    assert_eq!(
        build("Local:2:I.Ch0Data"),
        [
            0x91, 0x09, b'L', b'o', b'c', b'a', b'l', b':', b'2', b':', b'I', 0x00, //
            0x91, 0x07, b'C', b'h', b'0', b'D', b'a', b't', b'a', 0x00,
        ]
    );
    // even-length name needs no pad
    assert_eq!(build("ab"), [0x91, 0x02, b'a', b'b']);
}

#[test]
fn test_indexed_tag_two_word_element() {
    assert_eq!(
        build("arr[258]"),
        [0x91, 0x03, b'a', b'r', b'r', 0x00, 0x29, 0x00, 0x02, 0x01]
    );
}

#[test]
fn test_element_segment_widths() {
    assert_eq!(&build("x[255]")[4..], [0x28, 0xFF]);
    assert_eq!(&build("x[256]")[4..], [0x29, 0x00, 0x00, 0x01]);
    assert_eq!(&build("x[65535]")[4..], [0x29, 0x00, 0xFF, 0xFF]);
    assert_eq!(
        &build("x[65536]")[4..],
        [0x2A, 0x00, 0x00, 0x00, 0x01, 0x00]
    );
}

#[test]
fn test_class_path() {
    assert_eq!(encode_class_path(0x06, 1, 0), [0x20, 0x06, 0x24, 0x01]);
    assert_eq!(
        encode_class_path(0x01, 1, 7),
        [0x20, 0x01, 0x24, 0x01, 0x30, 0x07]
    );
}

#[test]
fn test_port_path() {
    assert_eq!(encode_port_path(1, 3).unwrap(), [0x01, 0x03]);
    assert!(encode_port_path(0, 0).is_err());
    assert!(encode_port_path(15, 0).is_err());
}

#[test]
fn test_oversized_name_rejected() {
    let long = "a".repeat(300);
    let parsed: TagPath = long.parse().unwrap();
    assert!(encode_tag_path(&parsed).is_err());
}

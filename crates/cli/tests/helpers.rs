use cleanpass::{log_level, parse_address, sha256_file};
use log::LevelFilter;
use sha2::{Digest, Sha256};
use tempfile::tempdir;

#[test]
fn addresses_parse_as_hex_or_decimal() {
    assert_eq!(parse_address("0x401000"), Ok(0x401000));
    assert_eq!(parse_address("0X40_1000"), Ok(0x401000));
    assert_eq!(parse_address("4096"), Ok(4096));
    assert!(parse_address("0xZZ").is_err());
    assert!(parse_address("").is_err());
}

#[test]
fn sha256_file_matches_in_memory_digest() {
    let dir = tempdir().expect("tempdir");
    let path = dir.path().join("blob.bin");
    let bytes = vec![0xCCu8; 20_000];
    std::fs::write(&path, &bytes).expect("write");

    let expected = format!("{:x}", Sha256::digest(&bytes));
    assert_eq!(sha256_file(&path).expect("hash"), expected);
    assert!(sha256_file(&dir.path().join("missing")).is_err());
}

#[test]
fn verbosity_maps_to_levels() {
    assert_eq!(log_level(0, false), LevelFilter::Info);
    assert_eq!(log_level(1, false), LevelFilter::Debug);
    assert_eq!(log_level(3, false), LevelFilter::Trace);
    assert_eq!(log_level(2, true), LevelFilter::Warn);
}

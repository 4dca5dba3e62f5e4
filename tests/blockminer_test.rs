// tests/blockminer_test.rs
use xepool::blockminer::BlockMiner;
use xepool::difficulty::{check_diff, target, target_bytes};

const TEST_TIMESTAMP: u64 = 0x6553_6001_2345_6789;

#[test]
fn test_blob_roundtrip_preserves_every_byte() {
    let mut bm = BlockMiner::new([0x11; 32], [0x44; 32], [0x77; 32]);
    bm.set_timestamp(TEST_TIMESTAMP);
    bm.set_nonce(0x0102_0304_0506_0708);

    let blob = bm.blob();
    let mut back = BlockMiner::from_blob(&blob).unwrap();
    back.set_timestamp(TEST_TIMESTAMP);
    back.set_nonce(0x0102_0304_0506_0708);

    assert_eq!(back, bm, "blob roundtrip must reproduce the header");
    assert_eq!(back.blob(), blob);
}

#[test]
fn test_arbitrary_blob_roundtrip() {
    // any 96-byte blob survives from_blob().blob()
    let mut blob = [0u8; 96];
    for (i, byte) in blob.iter_mut().enumerate() {
        *byte = (i as u8).wrapping_mul(37).wrapping_add(11);
    }
    let bm = BlockMiner::from_blob(&blob).unwrap();
    assert_eq!(bm.blob(), blob);
}

#[test]
fn test_field_layout() {
    let mut bm = BlockMiner::new([0xaa; 32], [0x00; 32], [0xbb; 32]);
    bm.set_timestamp(1);
    bm.set_nonce(2);
    bm.set_job_id([0xcc; 16]);
    bm.set_pool_nonce([0xdd; 8]);

    let raw = bm.as_bytes();
    assert_eq!(&raw[0..32], &[0xaa; 32], "work hash at 0..32");
    assert_eq!(raw[39], 1, "timestamp big-endian at 32..40");
    assert_eq!(raw[47], 2, "nonce big-endian at 40..48");
    assert_eq!(&raw[48..64], &[0xcc; 16], "job id at 48..64");
    assert_eq!(&raw[64..72], &[0xdd; 8], "pool nonce at 64..72");
    assert_eq!(&raw[80..112], &[0xbb; 32], "public key at 80..112");
}

#[test]
fn test_hash_changes_with_nonce() {
    let mut bm = BlockMiner::new([1; 32], [2; 32], [3; 32]);
    let h1 = bm.hash();
    bm.set_nonce(1);
    assert_ne!(bm.hash(), h1);
}

#[test]
fn test_target_strictly_decreases_with_difficulty() {
    let mut previous = target(1);
    for diff in [2u64, 10, 1_000, 1_000_000, 1 << 40] {
        let current = target(diff);
        assert!(current < previous, "target({}) must shrink", diff);
        previous = current;
    }
}

#[test]
fn test_check_diff_accepts_any_nonmax_hash_at_one() {
    assert!(check_diff(&[0x00; 32], 1));
    assert!(check_diff(&[0x7f; 32], 1));

    let mut almost_max = [0xff; 32];
    almost_max[31] = 0xfe;
    assert!(check_diff(&almost_max, 1));
}

#[test]
fn test_target_bytes_matches_bigint_division() {
    // difficulty 2^16 leaves the top 16 bits clear
    let bytes = target_bytes(1 << 16);
    assert_eq!(bytes[0], 0);
    assert_eq!(bytes[1], 0);
    assert_eq!(bytes[2], 0xff);
}

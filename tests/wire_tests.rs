//! Integration tests for the blockset wire encoding


use std::sync::Arc;

use layerfs::block_format::calculate_checksum;
use layerfs::{Blockset, OpContext, WireError};
use test_helpers::*;

/// Blockset over `spec` holding a few blocks from two writers
async fn populated(spec: &str) -> (Blockset, FlakyBlockStore) {
    let (blockset, store) = build(spec);
    let ctx = OpContext::background();
    for index in 0..4u64 {
        let data = format!("payload {} of {}", index, spec);
        blockset
            .put_block(&ctx, writer(), index, data.as_bytes())
            .await
            .unwrap();
    }
    blockset
        .put_block(&ctx, writer().next_generation().unwrap(), 9, b"late block")
        .await
        .unwrap();
    (blockset, store)
}

/// Replace the trailing checksum so that only the body is under test
fn reseal(bytes: &mut Vec<u8>) {
    let body_len = bytes.len() - 4;
    let checksum = calculate_checksum(&bytes[..body_len]);
    bytes.truncate(body_len);
    bytes.extend_from_slice(&checksum.to_le_bytes());
}

#[tokio::test]
async fn test_roundtrip_every_composition() {
    init_tracing();
    let ctx = OpContext::background();

    for spec in COMPOSITIONS {
        let (original, store) = populated(spec).await;
        let encoded = original.marshal_to_wire().await.unwrap();

        let decoded = Blockset::unmarshal_from_wire(&encoded, store.as_store()).unwrap();
        assert_eq!(decoded.spec(), original.spec(), "{}", spec);
        assert_eq!(decoded.indices(), original.indices());
        assert_eq!(decoded.live_inodes(), original.live_inodes());
        assert_eq!(decoded.block_ids(), original.block_ids());

        for index in original.indices() {
            assert_eq!(
                decoded.get_block(&ctx, index).await.unwrap(),
                original.get_block(&ctx, index).await.unwrap(),
                "{} block {}",
                spec,
                index
            );
        }

        // Encoding is deterministic
        assert_eq!(decoded.marshal_to_wire().await.unwrap(), encoded);
    }
}

#[tokio::test]
async fn test_empty_blockset_roundtrip() {
    let (blockset, store) = build("replication:3,crc,base");
    let encoded = blockset.marshal_to_wire().await.unwrap();

    let decoded = Blockset::unmarshal_from_wire(&encoded, store.as_store()).unwrap();
    assert!(decoded.is_empty());
    assert_eq!(decoded.spec().to_string(), "replication:3,crc,base");
}

#[tokio::test]
async fn test_decoded_blockset_accepts_writes() {
    let ctx = OpContext::background();
    let (blockset, store) = populated("replication:2,crc,base").await;
    let encoded = blockset.marshal_to_wire().await.unwrap();

    let decoded = Blockset::unmarshal_from_wire(&encoded, store.as_store()).unwrap();
    decoded.put_block(&ctx, writer(), 1, b"rewritten").await.unwrap();
    decoded.put_block(&ctx, writer(), 20, b"new").await.unwrap();

    assert_eq!(decoded.get_block(&ctx, 1).await.unwrap(), b"rewritten");
    assert_eq!(decoded.get_block(&ctx, 20).await.unwrap(), b"new");
    assert_eq!(decoded.get_block(&ctx, 0).await.unwrap(), b"payload 0 of replication:2,crc,base");
}

#[tokio::test]
async fn test_every_truncated_prefix_fails() {
    let (blockset, store) = populated("crc,replication:2,crc,base").await;
    let encoded = blockset.marshal_to_wire().await.unwrap();

    for len in 0..encoded.len() {
        assert!(
            Blockset::unmarshal_from_wire(&encoded[..len], store.as_store()).is_err(),
            "prefix of {} bytes decoded",
            len
        );
    }
}

#[tokio::test]
async fn test_every_flipped_byte_fails() {
    let (blockset, store) = populated("replication:2,crc,base").await;
    let encoded = blockset.marshal_to_wire().await.unwrap();

    for position in 0..encoded.len() {
        let mut damaged = encoded.clone();
        damaged[position] ^= 0x01;
        assert!(
            Blockset::unmarshal_from_wire(&damaged, store.as_store()).is_err(),
            "flip at byte {} decoded",
            position
        );
    }
}

#[tokio::test]
async fn test_structural_errors() {
    let (blockset, store) = populated("crc,base").await;
    let encoded = blockset.marshal_to_wire().await.unwrap();

    let mut bad_magic = encoded.clone();
    bad_magic[0] = b'X';
    reseal(&mut bad_magic);
    assert!(matches!(
        Blockset::unmarshal_from_wire(&bad_magic, store.as_store()),
        Err(WireError::InvalidMagic)
    ));

    let mut bad_version = encoded.clone();
    bad_version[4] = 9;
    reseal(&mut bad_version);
    assert!(matches!(
        Blockset::unmarshal_from_wire(&bad_version, store.as_store()),
        Err(WireError::UnsupportedVersion { found: 9 })
    ));

    // The first frame tag follows the 6-byte header
    let mut unknown_tag = encoded.clone();
    unknown_tag[6] = 0x7f;
    reseal(&mut unknown_tag);
    assert!(matches!(
        Blockset::unmarshal_from_wire(&unknown_tag, store.as_store()),
        Err(WireError::UnknownTag { position: 0, tag: 0x7f })
    ));

    let mut terminal_first = encoded.clone();
    terminal_first[6] = 1;
    reseal(&mut terminal_first);
    assert!(matches!(
        Blockset::unmarshal_from_wire(&terminal_first, store.as_store()),
        Err(WireError::TerminalNotLast { position: 0 })
    ));

    let mut trailing = encoded.clone();
    trailing.truncate(trailing.len() - 4);
    trailing.push(0);
    trailing.extend_from_slice(&[0, 0, 0, 0]);
    reseal(&mut trailing);
    assert!(matches!(
        Blockset::unmarshal_from_wire(&trailing, store.as_store()),
        Err(WireError::TrailingBytes { count: 1, .. })
    ));

    let mut empty_stack = encoded[..6].to_vec();
    empty_stack[5] = 0;
    empty_stack.extend_from_slice(&[0, 0, 0, 0]);
    reseal(&mut empty_stack);
    assert!(matches!(
        Blockset::unmarshal_from_wire(&empty_stack, store.as_store()),
        Err(WireError::EmptyStack)
    ));
}

#[tokio::test]
async fn test_marshal_during_concurrent_puts() {
    let ctx = OpContext::background();
    let (blockset, store) = build("replication:2,crc,base");
    let blockset = Arc::new(blockset);

    let writer_task = {
        let blockset = Arc::clone(&blockset);
        let ctx = ctx.clone();
        tokio::spawn(async move {
            for index in 0..200u64 {
                blockset
                    .put_block(&ctx, writer(), index % 16, format!("value {}", index).as_bytes())
                    .await
                    .unwrap();
            }
        })
    };

    let mut snapshots = Vec::new();
    for _ in 0..20 {
        snapshots.push(blockset.marshal_to_wire().await.unwrap());
        tokio::task::yield_now().await;
    }
    writer_task.await.unwrap();

    // Every snapshot is a consistent stack whose checksums match its blocks
    for encoded in snapshots {
        let decoded = Blockset::unmarshal_from_wire(&encoded, store.as_store()).unwrap();
        for index in decoded.indices() {
            let data = decoded.get_block(&ctx, index).await.unwrap();
            assert!(data.starts_with(b"value "));
        }
    }
}

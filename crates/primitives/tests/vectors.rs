use schilling_consensus::{chain_params, hash256_from_hex, hash256_to_hex, Network};
use schilling_primitives::{Block, BlockHeader, Transaction};

const GENESIS_COINBASE_HEX: &str = concat!(
    "01000000010000000000000000000000000000000000000000000000000000000000000000ffffffff",
    "4d04ffff001d0104455468652054696d65732030332f4a616e2f32303039204368616e63656c6c6f72",
    "206f6e206272696e6b206f66207365636f6e64206261696c6f757420666f722062616e6b73ffffffff",
    "0100f2052a01000000434104678afdb0fe5548271967f1a67130b7105cd6a828e03909a67962e0ea1f",
    "61deb649f6bc3f4cef38c4f35504e51ec112de5c384df7ba0b8d578a4c702b6bf11d5fac00000000",
);

fn hex_to_bytes(hex: &str) -> Vec<u8> {
    hex.as_bytes()
        .chunks_exact(2)
        .map(|pair| {
            let high = (pair[0] as char).to_digit(16).expect("hex digit") as u8;
            let low = (pair[1] as char).to_digit(16).expect("hex digit") as u8;
            high << 4 | low
        })
        .collect()
}

fn genesis_coinbase() -> Transaction {
    Transaction::consensus_decode(&hex_to_bytes(GENESIS_COINBASE_HEX)).expect("decode coinbase")
}

#[test]
fn bitcoin_genesis_header_hash() {
    let header = BlockHeader {
        version: 1,
        prev_block: [0u8; 32],
        merkle_root: hash256_from_hex(
            "4a5e1e4baab89f3a32518a88c31bc87f618f76673e2cc77ab2127b7afdeda33b",
        )
        .expect("merkle"),
        time: 1_231_006_505,
        bits: 0x1d00_ffff,
        nonce: 2_083_236_893,
    };
    assert_eq!(
        hash256_to_hex(&header.hash()),
        "000000000019d6689c085ae165831e934ff763ae46a2a6c172b3f1b60a8ce26f"
    );
}

#[test]
fn genesis_coinbase_merkle_root() {
    let block = Block {
        header: BlockHeader {
            version: 1,
            prev_block: [0u8; 32],
            merkle_root: [0u8; 32],
            time: 0,
            bits: 0,
            nonce: 0,
        },
        transactions: vec![genesis_coinbase()],
    };
    assert!(block.transactions[0].is_coinbase());
    assert_eq!(
        hash256_to_hex(&block.compute_merkle_root()),
        "4a5e1e4baab89f3a32518a88c31bc87f618f76673e2cc77ab2127b7afdeda33b"
    );
}

#[test]
fn regtest_genesis_matches_declared_hash() {
    let params = chain_params(Network::Regtest);
    let genesis = &params.consensus.genesis;
    let header = BlockHeader {
        version: genesis.version,
        prev_block: [0u8; 32],
        merkle_root: genesis.merkle_root,
        time: genesis.time,
        bits: genesis.bits,
        nonce: genesis.nonce,
    };
    assert_eq!(header.hash(), params.consensus.hash_genesis_block);
}

#[test]
fn full_block_survives_wire_encoding() {
    let coinbase = genesis_coinbase();
    let mut block = Block {
        header: BlockHeader {
            version: 1,
            prev_block: [9u8; 32],
            merkle_root: [0u8; 32],
            time: 1_528_727_751,
            bits: 0x207f_ffff,
            nonce: 1,
        },
        transactions: vec![coinbase],
    };
    block.header.merkle_root = block.compute_merkle_root();
    let decoded = Block::consensus_decode(&block.consensus_encode()).expect("decode block");
    assert_eq!(decoded.hash(), block.hash());
    assert_eq!(decoded.transactions.len(), 1);
}

#![allow(dead_code)]

use std::sync::Arc;

use schilling_chainstate::{BlockChain, BlockStore, MemoryBlockStore, ValidHashStore};
use schilling_consensus::{chain_params, ChainParams, Checkpoint, Hash256, Network};
use schilling_pow::check_proof_of_work;
use schilling_primitives::{Block, BlockHeader, OutPoint, Transaction, TxIn, TxOut};

pub const REGTEST_BITS: u32 = 0x207f_ffff;

pub fn regtest() -> Arc<ChainParams> {
    Arc::new(chain_params(Network::Regtest))
}

/// The block a test chain builds on.
#[derive(Clone, Copy, Debug)]
pub struct Tip {
    pub hash: Hash256,
    pub time: u32,
    pub height: i32,
}

impl Tip {
    pub fn genesis(params: &ChainParams) -> Self {
        Self {
            hash: params.consensus.hash_genesis_block,
            time: params.consensus.genesis.time,
            height: 0,
        }
    }

    pub fn of(block: &Block, height: i32) -> Self {
        Self {
            hash: block.hash(),
            time: block.header.time,
            height,
        }
    }
}

pub fn child_header(prev: &Tip, tag: u8, bits: u32) -> BlockHeader {
    let mut merkle_root = [0u8; 32];
    merkle_root[0] = tag;
    BlockHeader {
        version: 1,
        prev_block: prev.hash,
        merkle_root,
        time: prev.time + 600,
        bits,
        nonce: 0,
    }
}

/// Bumps the nonce until the header meets (or, with `valid == false`, misses) its target.
pub fn grind(params: &ChainParams, mut header: BlockHeader, valid: bool) -> BlockHeader {
    loop {
        let meets = check_proof_of_work(&header.hash(), header.bits, &params.consensus).is_ok();
        if meets == valid {
            return header;
        }
        header.nonce += 1;
    }
}

pub fn mine_header_only(params: &ChainParams, prev: &Tip, tag: u8) -> Block {
    Block::header_only(grind(params, child_header(prev, tag, REGTEST_BITS), true))
}

pub fn coinbase(height: i32, tag: u8) -> Transaction {
    let mut script_sig = height.to_le_bytes().to_vec();
    script_sig.push(tag);
    Transaction {
        version: 1,
        vin: vec![TxIn {
            prevout: OutPoint::null(),
            script_sig,
            sequence: u32::MAX,
        }],
        vout: vec![TxOut {
            value: 50 * 100_000_000,
            script_pubkey: vec![0x51, tag],
        }],
        lock_time: 0,
    }
}

pub fn mine_full(params: &ChainParams, prev: &Tip, tag: u8) -> Block {
    let mut block = Block {
        header: child_header(prev, tag, REGTEST_BITS),
        transactions: vec![coinbase(prev.height + 1, tag)],
    };
    block.header.merkle_root = block.compute_merkle_root();
    block.header = grind(params, block.header, true);
    block
}

/// Mines `count` blocks on top of `from`, full blocks when `full` is set.
pub fn mine_chain(
    params: &ChainParams,
    from: &Tip,
    count: usize,
    tag: u8,
    full: bool,
) -> Vec<Block> {
    let mut tip = *from;
    let mut blocks = Vec::with_capacity(count);
    for _ in 0..count {
        let block = if full {
            mine_full(params, &tip, tag)
        } else {
            mine_header_only(params, &tip, tag)
        };
        tip = Tip::of(&block, tip.height + 1);
        blocks.push(block);
    }
    blocks
}

pub fn last_tip(from: &Tip, blocks: &[Block]) -> Tip {
    match blocks.last() {
        Some(block) => Tip::of(block, from.height + blocks.len() as i32),
        None => *from,
    }
}

pub fn open_chain(params: &Arc<ChainParams>) -> BlockChain {
    open_chain_with(params, &params.consensus.checkpoints, Arc::new(MemoryBlockStore::new()))
}

pub fn open_chain_with(
    params: &Arc<ChainParams>,
    checkpoints: &[Checkpoint],
    store: Arc<dyn BlockStore>,
) -> BlockChain {
    let valid_hashes = Arc::new(ValidHashStore::from_checkpoints(checkpoints));
    BlockChain::new(Arc::clone(params), store, valid_hashes).expect("open chain")
}

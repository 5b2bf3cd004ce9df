#![allow(dead_code)]

use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use schilling_chainstate::{BlockChain, MemoryBlockStore, ValidHashStore};
use schilling_consensus::constants::PROTOCOL_VERSION;
use schilling_consensus::{chain_params, ChainParams, Hash256, Network};
use schilling_net::{
    read_frame, write_frame, write_message, Inventory, InvType, NetworkMessage, PeerSettings,
    VersionMessage,
};
use schilling_pow::check_proof_of_work;
use schilling_primitives::{Block, BlockHeader, OutPoint, Transaction, TxIn, TxOut};
use tokio::io::{AsyncWriteExt, BufReader};
use tokio::net::{TcpListener, TcpStream};
use tokio::task::JoinHandle;

pub const REGTEST_BITS: u32 = 0x207f_ffff;
pub const FAKE_USER_AGENT: &str = "/fake-node:0.1/";

pub fn regtest() -> Arc<ChainParams> {
    Arc::new(chain_params(Network::Regtest))
}

pub fn open_chain(params: &Arc<ChainParams>) -> Arc<BlockChain> {
    let valid_hashes = Arc::new(ValidHashStore::from_checkpoints(&params.consensus.checkpoints));
    let chain = BlockChain::new(Arc::clone(params), Arc::new(MemoryBlockStore::new()), valid_hashes)
        .expect("open chain");
    Arc::new(chain)
}

pub fn settings(params: &ChainParams) -> PeerSettings {
    PeerSettings {
        magic: params.message_start,
        user_agent: "/schilling-test:0.0/".to_string(),
        start_height: 0,
        handshake_timeout: Duration::from_secs(2),
    }
}

fn coinbase(height: usize, tag: u8) -> Transaction {
    let mut script_sig = (height as u32).to_le_bytes().to_vec();
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
            script_pubkey: vec![0x51],
        }],
        lock_time: 0,
    }
}

/// Full regtest blocks on top of genesis.
pub fn mine_blocks(params: &ChainParams, count: usize) -> Vec<Block> {
    mine_branch(params, 0, count)
}

/// Like [`mine_blocks`], but `tag` keeps branches with different tags apart.
pub fn mine_branch(params: &ChainParams, tag: u8, count: usize) -> Vec<Block> {
    let mut prev = params.consensus.hash_genesis_block;
    let mut time = params.consensus.genesis.time;
    let mut blocks = Vec::with_capacity(count);
    for height in 1..=count {
        time += 600;
        let mut block = Block {
            header: BlockHeader {
                version: 1,
                prev_block: prev,
                merkle_root: [0u8; 32],
                time,
                bits: REGTEST_BITS,
                nonce: 0,
            },
            transactions: vec![coinbase(height, tag)],
        };
        block.header.merkle_root = block.compute_merkle_root();
        grind(params, &mut block.header, true);
        prev = block.hash();
        blocks.push(block);
    }
    blocks
}

/// Bumps the nonce until the header meets (or, with `valid == false`, misses) its target.
pub fn grind(params: &ChainParams, header: &mut BlockHeader, valid: bool) {
    while check_proof_of_work(&header.hash(), REGTEST_BITS, &params.consensus).is_ok() != valid {
        header.nonce += 1;
    }
}

/// How the fake remote node behaves towards whoever dials it.
#[derive(Clone)]
pub struct Behavior {
    pub version: i32,
    pub start_height: i32,
    pub complete_handshake: bool,
    pub answer_requests: bool,
    /// When false, `getdata` goes unanswered while headers are still served.
    pub serve_blocks: bool,
    /// Holds back the answer to the first `getheaders` of each connection.
    pub first_headers_delay: Option<Duration>,
    /// Sent once the handshake is done, framed with a foreign magic.
    pub garbage_after_handshake: bool,
    pub chain: Vec<Block>,
}

impl Behavior {
    pub fn serving(chain: Vec<Block>) -> Self {
        Self {
            version: PROTOCOL_VERSION,
            start_height: chain.len() as i32,
            complete_handshake: true,
            answer_requests: true,
            serve_blocks: true,
            first_headers_delay: None,
            garbage_after_handshake: false,
            chain,
        }
    }
}

/// A scripted remote node that serves one connection at a time.
pub struct FakeNode {
    pub addr: SocketAddr,
    commands: Arc<Mutex<Vec<String>>>,
    task: JoinHandle<()>,
}

impl FakeNode {
    pub async fn spawn(params: &ChainParams, behavior: Behavior) -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
        let addr = listener.local_addr().expect("local addr");
        let commands = Arc::new(Mutex::new(Vec::new()));
        let magic = params.message_start;
        let genesis = params.consensus.hash_genesis_block;
        let log = Arc::clone(&commands);
        let task = tokio::spawn(async move {
            while let Ok((stream, remote)) = listener.accept().await {
                serve(stream, remote, magic, genesis, &behavior, &log).await;
            }
        });
        Self {
            addr,
            commands,
            task,
        }
    }

    /// Commands received so far, in order.
    pub fn commands(&self) -> Vec<String> {
        self.commands.lock().expect("commands").clone()
    }

    /// Drops the listener and any open connection.
    pub fn shutdown(&self) {
        self.task.abort();
    }
}

impl Drop for FakeNode {
    fn drop(&mut self) {
        self.task.abort();
    }
}

async fn serve(
    stream: TcpStream,
    remote: SocketAddr,
    magic: [u8; 4],
    genesis: Hash256,
    behavior: &Behavior,
    log: &Mutex<Vec<String>>,
) {
    let (read_half, mut writer) = stream.into_split();
    let mut reader = BufReader::new(read_half);
    let mut headers_answered = false;
    while let Ok(raw) = read_frame(&mut reader, magic).await {
        log.lock().expect("commands").push(raw.command.clone());
        let Ok(message) = NetworkMessage::from_raw(&raw) else {
            return;
        };
        let replies = match message {
            NetworkMessage::Version(_) if behavior.complete_handshake => {
                let mut ours =
                    VersionMessage::outbound(remote, FAKE_USER_AGENT, behavior.start_height);
                ours.version = behavior.version;
                ours.services = 1;
                vec![NetworkMessage::Version(ours), NetworkMessage::Verack]
            }
            NetworkMessage::Verack if behavior.garbage_after_handshake => {
                let _ = write_frame(&mut writer, [0xde, 0xad, 0xbe, 0xef], "ping", &[0u8; 8]).await;
                Vec::new()
            }
            NetworkMessage::Ping(nonce) => vec![NetworkMessage::Pong(nonce)],
            NetworkMessage::GetHeaders(request) if behavior.answer_requests => {
                if let (false, Some(delay)) = (headers_answered, behavior.first_headers_delay) {
                    tokio::time::sleep(delay).await;
                }
                headers_answered = true;
                let start = request
                    .locator
                    .iter()
                    .find_map(|hash| {
                        if *hash == genesis {
                            return Some(0);
                        }
                        behavior
                            .chain
                            .iter()
                            .position(|block| block.hash() == *hash)
                            .map(|index| index + 1)
                    })
                    .unwrap_or(0);
                let headers = behavior.chain[start..]
                    .iter()
                    .take(2000)
                    .map(|block| block.header.clone())
                    .collect();
                vec![NetworkMessage::Headers(headers)]
            }
            NetworkMessage::GetData(items) if behavior.answer_requests && behavior.serve_blocks => {
                let mut replies = Vec::new();
                let mut missing = Vec::new();
                for item in items.into_iter().filter(|item| item.kind == InvType::Block) {
                    match behavior.chain.iter().find(|block| block.hash() == item.hash) {
                        Some(block) => replies.push(NetworkMessage::Block(block.clone())),
                        None => missing.push(Inventory::block(item.hash)),
                    }
                }
                if !missing.is_empty() {
                    replies.push(NetworkMessage::NotFound(missing));
                }
                replies
            }
            _ => Vec::new(),
        };
        for reply in replies {
            if write_message(&mut writer, magic, &reply).await.is_err() {
                return;
            }
        }
        let _ = writer.flush().await;
    }
}

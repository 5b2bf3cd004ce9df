//! Peer-to-peer plumbing: the wire codec, single peer connections, and the peer group that
//! keeps a pool of connections and drives chain download.

pub mod addr_book;
pub mod download;
pub mod message;
pub mod peer;
pub mod peer_book;
pub mod peer_group;

pub use addr_book::{AddrBook, PeersFileError};
pub use message::{
    read_frame, write_frame, write_message, AddrEntry, GetBlocksMessage, InvType, Inventory,
    NetAddress, NetworkMessage, ProtocolError, RawMessage, RejectMessage, VersionMessage,
    MAX_PAYLOAD_SIZE,
};
pub use peer::{
    NetTotals, NetTotalsSnapshot, PendingBlock, Peer, PeerError, PeerEvent, PeerInfo,
    PeerSettings, MAX_REQUEST_TIMEOUTS,
};
pub use peer_book::{BannedPeerInfo, PeerBook};
pub use peer_group::{PeerGroup, PeerGroupConfig, PeerGroupError, SyncState};

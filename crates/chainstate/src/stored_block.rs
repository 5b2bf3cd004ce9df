use primitive_types::U256;
use schilling_consensus::{ConsensusParams, Hash256};
use schilling_pow::difficulty::{block_proof, CompactError};
use schilling_primitives::encoding::{DecodeError, Decoder, Encoder};
use schilling_primitives::BlockHeader;

/// A header placed in the block tree: its height and the total work of the chain it ends.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct StoredBlock {
    pub hash: Hash256,
    pub header: BlockHeader,
    pub height: i32,
    /// Cumulative chain work, big-endian.
    pub chainwork: [u8; 32],
}

impl StoredBlock {
    /// The genesis entry, anchored to the network's declared genesis hash.
    pub fn genesis(params: &ConsensusParams) -> Result<Self, CompactError> {
        let genesis = &params.genesis;
        let header = BlockHeader {
            version: genesis.version,
            prev_block: [0u8; 32],
            merkle_root: genesis.merkle_root,
            time: genesis.time,
            bits: genesis.bits,
            nonce: genesis.nonce,
        };
        Ok(Self {
            hash: params.hash_genesis_block,
            header,
            height: 0,
            chainwork: block_proof(genesis.bits)?.to_big_endian(),
        })
    }

    pub fn chainwork_value(&self) -> U256 {
        U256::from_big_endian(&self.chainwork)
    }

    pub fn more_work_than(&self, other: &StoredBlock) -> bool {
        self.chainwork_value() > other.chainwork_value()
    }

    /// Builds the entry for `header` as a child of `self`.
    pub fn build_next(&self, header: BlockHeader) -> Result<Self, CompactError> {
        let work = self.chainwork_value() + block_proof(header.bits)?;
        Ok(Self {
            hash: header.hash(),
            header,
            height: self.height + 1,
            chainwork: work.to_big_endian(),
        })
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut encoder = Encoder::with_capacity(116);
        self.header.consensus_encode_to(&mut encoder);
        encoder.write_i32_le(self.height);
        encoder.write_bytes(&self.chainwork);
        encoder.into_inner()
    }

    /// Decodes an entry stored under `hash`; the hash is not recomputed.
    pub fn decode(hash: Hash256, bytes: &[u8]) -> Result<Self, DecodeError> {
        let mut decoder = Decoder::new(bytes);
        let header = BlockHeader::consensus_decode_from(&mut decoder)?;
        let height = decoder.read_i32_le()?;
        let chainwork = decoder.read_fixed::<32>()?;
        decoder.finish()?;
        Ok(Self {
            hash,
            header,
            height,
            chainwork,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use schilling_consensus::{chain_params, Network};

    #[test]
    fn child_adds_its_own_proof() {
        let params = chain_params(Network::Regtest).consensus;
        let genesis = StoredBlock::genesis(&params).expect("genesis");
        let header = BlockHeader {
            version: 1,
            prev_block: genesis.hash,
            merkle_root: [0u8; 32],
            time: genesis.header.time + 600,
            bits: 0x207f_ffff,
            nonce: 0,
        };
        let child = genesis.build_next(header).expect("child");
        let proof = block_proof(0x207f_ffff).expect("proof");
        assert_eq!(child.height, 1);
        assert_eq!(child.chainwork_value(), proof + proof);
        assert!(child.more_work_than(&genesis));

        let decoded = StoredBlock::decode(child.hash, &child.encode()).expect("decode");
        assert_eq!(decoded, child);
    }

    #[test]
    fn mainnet_genesis_keeps_its_anchored_hash() {
        let params = chain_params(Network::Mainnet).consensus;
        let genesis = StoredBlock::genesis(&params).expect("genesis");
        assert_eq!(genesis.hash, params.hash_genesis_block);
        assert_eq!(genesis.height, 0);

        let decoded = StoredBlock::decode(genesis.hash, &genesis.encode()).expect("decode");
        assert_eq!(decoded.hash, params.hash_genesis_block);
    }
}

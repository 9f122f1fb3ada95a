//! Block Format Module
//!
//! On-disk format of a block file written by the file-backed block store.
//!
//! Layout (little-endian):
//! - magic: [u8;4] = b"LFB1"
//! - version: u8
//! - header_length: u16
//! - data_checksum: u32 (CRC32 of the payload)
//! - block_id: [u8;16]
//! - payload_len: u32
//! - reserved: [u8;4]
//! - payload: [u8; payload_len]

use std::io::{Cursor, Read, Write};

use crc32fast::Hasher;
use thiserror::Error;

use crate::block_store::BlockId;

/// Fixed magic at the start of every block file
pub const BLOCK_MAGIC: &[u8; 4] = b"LFB1";

/// Current block format version
pub const BLOCK_FORMAT_VERSION: u8 = 1;

/// Size of the serialized header in bytes
pub const BLOCK_HEADER_LEN: u16 = 4 + 1 + 2 + 4 + 16 + 4 + 4;

/// Errors that can occur while encoding or decoding block files
#[derive(Error, Debug)]
pub enum BlockFormatError {
    #[error("Invalid block magic")]
    InvalidMagic,

    #[error("Invalid block format version: expected {expected}, found {found}")]
    InvalidVersion { expected: u8, found: u8 },

    #[error("Invalid header length: {length}")]
    InvalidHeaderLength { length: u16 },

    #[error("Data checksum mismatch: expected {expected:08x}, calculated {calculated:08x}")]
    DataChecksumMismatch { expected: u32, calculated: u32 },

    #[error("Payload length mismatch: header says {expected}, found {actual}")]
    PayloadLengthMismatch { expected: u32, actual: usize },

    #[error("Payload too large: {size} bytes")]
    PayloadTooLarge { size: usize },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Header stored in front of every block payload
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BlockHeader {
    pub version: u8,
    pub data_checksum: u32,
    pub block_id: BlockId,
    pub payload_len: u32,
}

impl BlockHeader {
    /// Build the header describing `data` stored under `block_id`
    pub fn for_payload(block_id: BlockId, data: &[u8]) -> Result<Self, BlockFormatError> {
        let payload_len = u32::try_from(data.len())
            .map_err(|_| BlockFormatError::PayloadTooLarge { size: data.len() })?;

        Ok(Self {
            version: BLOCK_FORMAT_VERSION,
            data_checksum: calculate_checksum(data),
            block_id,
            payload_len,
        })
    }

    /// Serialize the header to bytes
    pub fn serialize(&self) -> Vec<u8> {
        let mut buffer = Vec::with_capacity(BLOCK_HEADER_LEN as usize);

        buffer.extend_from_slice(BLOCK_MAGIC);
        buffer.push(self.version);
        buffer.extend_from_slice(&BLOCK_HEADER_LEN.to_le_bytes());
        buffer.extend_from_slice(&self.data_checksum.to_le_bytes());
        buffer.extend_from_slice(self.block_id.as_bytes());
        buffer.extend_from_slice(&self.payload_len.to_le_bytes());

        // Reserved bytes for future expansion
        buffer.extend_from_slice(&[0u8; 4]);

        buffer
    }

    /// Deserialize a header from bytes
    pub fn deserialize(data: &[u8]) -> Result<Self, BlockFormatError> {
        if data.len() < BLOCK_HEADER_LEN as usize {
            return Err(BlockFormatError::InvalidHeaderLength {
                length: data.len() as u16,
            });
        }

        let mut cursor = Cursor::new(data);

        let mut magic = [0u8; 4];
        cursor.read_exact(&mut magic)?;
        if &magic != BLOCK_MAGIC {
            return Err(BlockFormatError::InvalidMagic);
        }

        let mut byte_buf = [0u8; 1];
        cursor.read_exact(&mut byte_buf)?;
        let version = byte_buf[0];
        if version != BLOCK_FORMAT_VERSION {
            return Err(BlockFormatError::InvalidVersion {
                expected: BLOCK_FORMAT_VERSION,
                found: version,
            });
        }

        let mut u16_buf = [0u8; 2];
        cursor.read_exact(&mut u16_buf)?;
        let header_length = u16::from_le_bytes(u16_buf);
        if header_length != BLOCK_HEADER_LEN {
            return Err(BlockFormatError::InvalidHeaderLength {
                length: header_length,
            });
        }

        let mut u32_buf = [0u8; 4];
        cursor.read_exact(&mut u32_buf)?;
        let data_checksum = u32::from_le_bytes(u32_buf);

        let mut id_buf = [0u8; 16];
        cursor.read_exact(&mut id_buf)?;
        let block_id = BlockId::from_bytes(id_buf);

        cursor.read_exact(&mut u32_buf)?;
        let payload_len = u32::from_le_bytes(u32_buf);

        // Skip reserved bytes
        let mut reserved = [0u8; 4];
        cursor.read_exact(&mut reserved)?;

        Ok(Self {
            version,
            data_checksum,
            block_id,
            payload_len,
        })
    }
}

/// Calculate the CRC32 checksum of data
pub fn calculate_checksum(data: &[u8]) -> u32 {
    let mut hasher = Hasher::new();
    hasher.update(data);
    hasher.finalize()
}

/// Write a block (header + payload) to a writer
pub fn write_block<W: Write>(
    writer: &mut W,
    block_id: BlockId,
    data: &[u8],
) -> Result<BlockHeader, BlockFormatError> {
    let header = BlockHeader::for_payload(block_id, data)?;
    writer.write_all(&header.serialize())?;
    writer.write_all(data)?;
    Ok(header)
}

/// Read a block (header + payload) from a reader, verifying the payload checksum
pub fn read_block<R: Read>(reader: &mut R) -> Result<(BlockHeader, Vec<u8>), BlockFormatError> {
    let mut header_buf = vec![0u8; BLOCK_HEADER_LEN as usize];
    reader.read_exact(&mut header_buf)?;
    let header = BlockHeader::deserialize(&header_buf)?;

    let mut data = Vec::with_capacity(header.payload_len as usize);
    reader.read_to_end(&mut data)?;

    if data.len() != header.payload_len as usize {
        return Err(BlockFormatError::PayloadLengthMismatch {
            expected: header.payload_len,
            actual: data.len(),
        });
    }

    let calculated = calculate_checksum(&data);
    if calculated != header.data_checksum {
        return Err(BlockFormatError::DataChecksumMismatch {
            expected: header.data_checksum,
            calculated,
        });
    }

    Ok((header, data))
}

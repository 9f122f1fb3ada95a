//! Wire Module
//!
//! Canonical, self-describing encoding of a blockset's layer chain.
//!
//! Layout (little-endian):
//! - magic: [u8;4] = b"BLKS"
//! - version: u8
//! - layer_count: u8
//! - per layer, outermost first:
//!   - tag: u8 (see [`LayerKind`])
//!   - state_len: u32
//!   - state: [u8; state_len] (the layer's own `marshal_state` output)
//! - checksum: u32 (CRC32 of every preceding byte)
//!
//! The encoding contains block identifiers but no reference to a particular
//! block store instance; decoding binds the rebuilt chain to the store passed
//! in by the caller.

use std::io::{Cursor, Read};
use std::sync::Arc;

use thiserror::Error;
use tracing::debug;

use crate::block_format::calculate_checksum;
use crate::block_store::{BlockId, BlockStore};
use crate::blockset::{BaseLayer, BlockLayer, Blockset, IntegrityLayer, ReplicationLayer};
use crate::layer_spec::LayerKind;

/// Fixed magic at the start of every encoded blockset
pub const WIRE_MAGIC: &[u8; 4] = b"BLKS";

/// Current wire format version
pub const WIRE_VERSION: u8 = 1;

/// Bytes before the first layer frame
const WIRE_HEADER_LEN: usize = 4 + 1 + 1;

/// Bytes of the trailing checksum
const WIRE_TRAILER_LEN: usize = 4;

/// Errors raised while encoding or decoding a blockset
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum WireError {
    #[error("Encoding truncated: {what}")]
    Truncated { what: &'static str },

    #[error("Invalid blockset magic")]
    InvalidMagic,

    #[error("Unsupported wire version: {found}")]
    UnsupportedVersion { found: u8 },

    #[error("Wire checksum mismatch: expected {expected:08x}, calculated {calculated:08x}")]
    ChecksumMismatch { expected: u32, calculated: u32 },

    #[error("Encoding contains no layers")]
    EmptyStack,

    #[error("Unknown layer tag {tag} at position {position}")]
    UnknownTag { position: usize, tag: u8 },

    #[error("Layer stack does not end in a terminal layer (found '{last}')")]
    MissingTerminal { last: LayerKind },

    #[error("Terminal layer at position {position} is not the last layer")]
    TerminalNotLast { position: usize },

    #[error("{count} unexpected trailing bytes after the {context}")]
    TrailingBytes { context: String, count: usize },

    #[error("Truncated state for the {layer} layer")]
    TruncatedState { layer: LayerKind },

    #[error("Invalid state for the {layer} layer: {reason}")]
    InvalidState { layer: LayerKind, reason: String },

    #[error("Cannot encode {what} of {found}, the format allows at most {max}")]
    TooLarge {
        what: &'static str,
        found: usize,
        max: usize,
    },
}

/// Result type for wire encoding and decoding
pub type WireResult<T> = Result<T, WireError>;

/// Cursor over one layer's state bytes
pub(crate) struct StateReader<'a> {
    cursor: Cursor<&'a [u8]>,
    layer: LayerKind,
}

impl<'a> StateReader<'a> {
    pub(crate) fn new(layer: LayerKind, state: &'a [u8]) -> Self {
        Self {
            cursor: Cursor::new(state),
            layer,
        }
    }

    fn read_array<const N: usize>(&mut self) -> WireResult<[u8; N]> {
        let mut buf = [0u8; N];
        self.cursor
            .read_exact(&mut buf)
            .map_err(|_| WireError::TruncatedState { layer: self.layer })?;
        Ok(buf)
    }

    pub(crate) fn read_u8(&mut self) -> WireResult<u8> {
        Ok(self.read_array::<1>()?[0])
    }

    pub(crate) fn read_u32(&mut self) -> WireResult<u32> {
        Ok(u32::from_le_bytes(self.read_array()?))
    }

    pub(crate) fn read_u64(&mut self) -> WireResult<u64> {
        Ok(u64::from_le_bytes(self.read_array()?))
    }

    pub(crate) fn read_block_id(&mut self) -> WireResult<BlockId> {
        Ok(BlockId::from_bytes(self.read_array()?))
    }

    fn remaining(&self) -> usize {
        let len = self.cursor.get_ref().len();
        len.saturating_sub(self.cursor.position() as usize)
    }

    /// Read an entry count, rejecting counts the remaining bytes cannot hold
    pub(crate) fn read_count(&mut self, entry_len: usize) -> WireResult<usize> {
        let count = self.read_u64()?;
        let fits = usize::try_from(count)
            .ok()
            .filter(|c| c.checked_mul(entry_len).is_some_and(|n| n <= self.remaining()));
        fits.ok_or(WireError::TruncatedState { layer: self.layer })
    }

    pub(crate) fn invalid(&self, reason: impl Into<String>) -> WireError {
        WireError::InvalidState {
            layer: self.layer,
            reason: reason.into(),
        }
    }

    /// Require that every state byte was consumed
    pub(crate) fn finish(self) -> WireResult<()> {
        match self.remaining() {
            0 => Ok(()),
            count => Err(WireError::TrailingBytes {
                context: format!("{} layer state", self.layer),
                count,
            }),
        }
    }
}

/// Rebuild one layer from its state and its already rebuilt inner layer
type DecodeFn =
    fn(&[u8], Option<Box<dyn BlockLayer>>, &Arc<dyn BlockStore>) -> WireResult<Box<dyn BlockLayer>>;

/// Tag to decoder dispatch table
const LAYER_DECODERS: &[(LayerKind, DecodeFn)] = &[
    (LayerKind::Base, decode_base),
    (LayerKind::Crc, decode_crc),
    (LayerKind::Replication, decode_replication),
];

fn require_inner(
    kind: LayerKind,
    inner: Option<Box<dyn BlockLayer>>,
) -> WireResult<Box<dyn BlockLayer>> {
    inner.ok_or(WireError::MissingTerminal { last: kind })
}

fn decode_base(
    state: &[u8],
    inner: Option<Box<dyn BlockLayer>>,
    store: &Arc<dyn BlockStore>,
) -> WireResult<Box<dyn BlockLayer>> {
    if inner.is_some() {
        return Err(WireError::InvalidState {
            layer: LayerKind::Base,
            reason: "terminal layer cannot wrap another layer".to_string(),
        });
    }
    Ok(Box::new(BaseLayer::unmarshal_state(state, Arc::clone(store))?))
}

fn decode_crc(
    state: &[u8],
    inner: Option<Box<dyn BlockLayer>>,
    _store: &Arc<dyn BlockStore>,
) -> WireResult<Box<dyn BlockLayer>> {
    let inner = require_inner(LayerKind::Crc, inner)?;
    Ok(Box::new(IntegrityLayer::unmarshal_state(state, inner)?))
}

fn decode_replication(
    state: &[u8],
    inner: Option<Box<dyn BlockLayer>>,
    _store: &Arc<dyn BlockStore>,
) -> WireResult<Box<dyn BlockLayer>> {
    let inner = require_inner(LayerKind::Replication, inner)?;
    Ok(Box::new(ReplicationLayer::unmarshal_state(state, inner)?))
}

fn decoder_for(position: usize, kind: LayerKind) -> WireResult<DecodeFn> {
    LAYER_DECODERS
        .iter()
        .find(|(k, _)| *k == kind)
        .map(|(_, decode)| *decode)
        .ok_or(WireError::UnknownTag {
            position,
            tag: kind.tag(),
        })
}

/// Encode a layer chain, outermost first
fn encode_layers(root: &dyn BlockLayer) -> WireResult<Vec<u8>> {
    let mut frames = Vec::new();
    let mut count = 0usize;
    let mut current = Some(root);

    while let Some(layer) = current {
        let state = layer.marshal_state();
        let state_len = u32::try_from(state.len()).map_err(|_| WireError::TooLarge {
            what: "layer state length",
            found: state.len(),
            max: u32::MAX as usize,
        })?;
        frames.push(layer.kind().tag());
        frames.extend_from_slice(&state_len.to_le_bytes());
        frames.extend_from_slice(&state);
        count += 1;
        current = layer.inner();
    }

    let count = u8::try_from(count).map_err(|_| WireError::TooLarge {
        what: "layer count",
        found: count,
        max: u8::MAX as usize,
    })?;

    let mut buffer = Vec::with_capacity(WIRE_HEADER_LEN + frames.len() + WIRE_TRAILER_LEN);
    buffer.extend_from_slice(WIRE_MAGIC);
    buffer.push(WIRE_VERSION);
    buffer.push(count);
    buffer.extend_from_slice(&frames);

    let checksum = calculate_checksum(&buffer);
    buffer.extend_from_slice(&checksum.to_le_bytes());
    Ok(buffer)
}

/// Encode a blockset. Mutations are excluded for the duration of the walk.
pub async fn marshal_to_wire(blockset: &Blockset) -> WireResult<Vec<u8>> {
    let bytes = blockset.with_consistent_view(encode_layers).await?;
    debug!("Marshalled blockset '{}' into {} bytes", blockset.spec(), bytes.len());
    Ok(bytes)
}

/// One undecoded layer frame
struct Frame<'a> {
    kind: LayerKind,
    state: &'a [u8],
}

fn split_frames(bytes: &[u8]) -> WireResult<Vec<Frame<'_>>> {
    if bytes.len() < WIRE_HEADER_LEN + WIRE_TRAILER_LEN {
        return Err(WireError::Truncated { what: "header" });
    }

    let (body, trailer) = bytes.split_at(bytes.len() - WIRE_TRAILER_LEN);
    let mut checksum = [0u8; 4];
    checksum.copy_from_slice(trailer);
    let expected = u32::from_le_bytes(checksum);
    let calculated = calculate_checksum(body);
    if expected != calculated {
        return Err(WireError::ChecksumMismatch {
            expected,
            calculated,
        });
    }

    if &body[..4] != WIRE_MAGIC {
        return Err(WireError::InvalidMagic);
    }
    if body[4] != WIRE_VERSION {
        return Err(WireError::UnsupportedVersion { found: body[4] });
    }
    let count = body[5] as usize;
    if count == 0 {
        return Err(WireError::EmptyStack);
    }

    let mut cursor = Cursor::new(&body[WIRE_HEADER_LEN..]);
    let mut frames = Vec::with_capacity(count);
    for position in 0..count {
        let mut tag = [0u8; 1];
        cursor
            .read_exact(&mut tag)
            .map_err(|_| WireError::Truncated { what: "layer tag" })?;
        let kind = LayerKind::from_tag(tag[0]).ok_or(WireError::UnknownTag {
            position,
            tag: tag[0],
        })?;

        let mut len = [0u8; 4];
        cursor
            .read_exact(&mut len)
            .map_err(|_| WireError::Truncated { what: "layer state length" })?;
        let len = u32::from_le_bytes(len) as usize;

        let start = cursor.position() as usize;
        let frame_bytes = *cursor.get_ref();
        let end = start
            .checked_add(len)
            .filter(|end| *end <= frame_bytes.len())
            .ok_or(WireError::Truncated { what: "layer state" })?;
        frames.push(Frame {
            kind,
            state: &frame_bytes[start..end],
        });
        cursor.set_position(end as u64);
    }

    let consumed = cursor.position() as usize;
    let total = cursor.get_ref().len();
    if consumed != total {
        return Err(WireError::TrailingBytes {
            context: "last layer frame".to_string(),
            count: total - consumed,
        });
    }

    Ok(frames)
}

fn validate_tags(frames: &[Frame<'_>]) -> WireResult<()> {
    let last = frames.len() - 1;
    for (position, frame) in frames.iter().enumerate() {
        if frame.kind.is_terminal() && position != last {
            return Err(WireError::TerminalNotLast { position });
        }
    }
    if !frames[last].kind.is_terminal() {
        return Err(WireError::MissingTerminal {
            last: frames[last].kind,
        });
    }
    Ok(())
}

/// Decode a blockset and bind it to `store`
pub fn unmarshal_from_wire(bytes: &[u8], store: Arc<dyn BlockStore>) -> WireResult<Blockset> {
    let frames = split_frames(bytes)?;
    validate_tags(&frames)?;

    let mut inner: Option<Box<dyn BlockLayer>> = None;
    for (position, frame) in frames.iter().enumerate().rev() {
        let decode = decoder_for(position, frame.kind)?;
        inner = Some(decode(frame.state, inner.take(), &store)?);
    }

    let root = inner.ok_or(WireError::EmptyStack)?;
    let blockset = Blockset::from_root(root);
    debug!(
        "Unmarshalled blockset '{}' ({} blocks) bound to '{}' store",
        blockset.spec(),
        blockset.len(),
        store.name()
    );
    Ok(blockset)
}

impl Blockset {
    /// See [`marshal_to_wire`]
    pub async fn marshal_to_wire(&self) -> WireResult<Vec<u8>> {
        marshal_to_wire(self).await
    }

    /// See [`unmarshal_from_wire`]
    pub fn unmarshal_from_wire(bytes: &[u8], store: Arc<dyn BlockStore>) -> WireResult<Self> {
        unmarshal_from_wire(bytes, store)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::block_store::MemoryBlockStore;
    use crate::context::OpContext;
    use crate::inode::InodeRef;

    fn memory_store() -> Arc<dyn BlockStore> {
        Arc::new(MemoryBlockStore::new())
    }

    fn reseal(mut body: Vec<u8>) -> Vec<u8> {
        let checksum = calculate_checksum(&body);
        body.extend_from_slice(&checksum.to_le_bytes());
        body
    }

    fn frame(tag: u8, state: &[u8]) -> Vec<u8> {
        let mut out = vec![tag];
        out.extend_from_slice(&(state.len() as u32).to_le_bytes());
        out.extend_from_slice(state);
        out
    }

    fn encoding(frames: &[Vec<u8>]) -> Vec<u8> {
        let mut body = WIRE_MAGIC.to_vec();
        body.push(WIRE_VERSION);
        body.push(frames.len() as u8);
        for f in frames {
            body.extend_from_slice(f);
        }
        reseal(body)
    }

    // Empty base state: zero entries
    const EMPTY_BASE: [u8; 8] = [0u8; 8];

    #[tokio::test]
    async fn test_empty_stack_layout() {
        let store = memory_store();
        let blockset = Blockset::build_from_str("crc,base", store.clone()).unwrap();
        let bytes = blockset.marshal_to_wire().await.unwrap();

        assert_eq!(&bytes[..4], WIRE_MAGIC);
        assert_eq!(bytes[4], WIRE_VERSION);
        assert_eq!(bytes[5], 2);
        assert_eq!(bytes[6], LayerKind::Crc.tag());

        let decoded = unmarshal_from_wire(&bytes, store).unwrap();
        assert_eq!(decoded.spec().to_string(), "crc,base");
        assert!(decoded.is_empty());
    }

    #[tokio::test]
    async fn test_roundtrip_preserves_reads() {
        let store = memory_store();
        let ctx = OpContext::background();
        let writer = InodeRef::new(1, 1);
        let blockset = Blockset::build_from_str("crc,base", store.clone()).unwrap();
        blockset.put_block(&ctx, writer, 0, b"zero").await.unwrap();
        blockset.put_block(&ctx, writer, 5, b"five").await.unwrap();

        let bytes = blockset.marshal_to_wire().await.unwrap();
        let decoded = unmarshal_from_wire(&bytes, store).unwrap();

        assert_eq!(decoded.get_block(&ctx, 0).await.unwrap(), b"zero");
        assert_eq!(decoded.get_block(&ctx, 5).await.unwrap(), b"five");
        assert_eq!(decoded.indices(), vec![0, 5]);
        assert_eq!(decoded.marshal_to_wire().await.unwrap(), bytes);
    }

    #[test]
    fn test_rejects_bad_header() {
        let store = memory_store();
        assert!(matches!(
            unmarshal_from_wire(b"BLK", store.clone()),
            Err(WireError::Truncated { .. })
        ));

        let mut bytes = encoding(&[frame(1, &EMPTY_BASE)]);
        bytes[0] = b'X';
        assert!(matches!(
            unmarshal_from_wire(&bytes, store.clone()),
            Err(WireError::ChecksumMismatch { .. })
        ));

        let mut body = b"XXXX".to_vec();
        body.extend_from_slice(&[WIRE_VERSION, 1]);
        body.extend_from_slice(&frame(1, &EMPTY_BASE));
        assert_eq!(
            unmarshal_from_wire(&reseal(body), store.clone()).unwrap_err(),
            WireError::InvalidMagic
        );

        let mut body = WIRE_MAGIC.to_vec();
        body.extend_from_slice(&[9, 1]);
        body.extend_from_slice(&frame(1, &EMPTY_BASE));
        assert_eq!(
            unmarshal_from_wire(&reseal(body), store.clone()).unwrap_err(),
            WireError::UnsupportedVersion { found: 9 }
        );

        assert_eq!(
            unmarshal_from_wire(&encoding(&[]), store).unwrap_err(),
            WireError::EmptyStack
        );
    }

    #[test]
    fn test_rejects_bad_tag_sequences() {
        let store = memory_store();

        assert_eq!(
            unmarshal_from_wire(&encoding(&[frame(99, &[])]), store.clone()).unwrap_err(),
            WireError::UnknownTag {
                position: 0,
                tag: 99
            }
        );

        assert_eq!(
            unmarshal_from_wire(
                &encoding(&[frame(1, &EMPTY_BASE), frame(1, &EMPTY_BASE)]),
                store.clone()
            )
            .unwrap_err(),
            WireError::TerminalNotLast { position: 0 }
        );

        assert_eq!(
            unmarshal_from_wire(&encoding(&[frame(2, &EMPTY_BASE)]), store).unwrap_err(),
            WireError::MissingTerminal {
                last: LayerKind::Crc
            }
        );
    }

    #[test]
    fn test_rejects_truncated_and_trailing_state() {
        let store = memory_store();

        // Count says one entry but no entry bytes follow
        let mut state = 1u64.to_le_bytes().to_vec();
        state.extend_from_slice(&[0u8; 3]);
        assert_eq!(
            unmarshal_from_wire(&encoding(&[frame(1, &state)]), store.clone()).unwrap_err(),
            WireError::TruncatedState {
                layer: LayerKind::Base
            }
        );

        let mut state = EMPTY_BASE.to_vec();
        state.push(0);
        assert!(matches!(
            unmarshal_from_wire(&encoding(&[frame(1, &state)]), store.clone()),
            Err(WireError::TrailingBytes { count: 1, .. })
        ));

        // Frame length runs past the end of the encoding
        let mut bad = vec![1u8];
        bad.extend_from_slice(&100u32.to_le_bytes());
        bad.extend_from_slice(&EMPTY_BASE);
        assert_eq!(
            unmarshal_from_wire(&encoding(&[bad]), store).unwrap_err(),
            WireError::Truncated {
                what: "layer state"
            }
        );
    }

    #[tokio::test]
    async fn test_chain_too_deep_to_encode() {
        let store = memory_store();
        let mut root: Box<dyn BlockLayer> = Box::new(BaseLayer::new(Arc::clone(&store)));
        for _ in 0..u8::MAX {
            root = Box::new(IntegrityLayer::new(root));
        }

        // 256 layers cannot be counted in one byte
        let blockset = Blockset::from_root(root);
        assert_eq!(
            blockset.marshal_to_wire().await.unwrap_err(),
            WireError::TooLarge {
                what: "layer count",
                found: 256,
                max: 255,
            }
        );

        let shallow = Blockset::build_from_str("crc,base", store).unwrap();
        assert!(shallow.marshal_to_wire().await.is_ok());
    }
}

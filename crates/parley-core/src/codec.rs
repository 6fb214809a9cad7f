//! Chunk codec: split a payload into relay-sized envelopes and put it back
//! together.
//!
//! Both directions are pure. The only thing the codec needs from the outside
//! world is an estimate of how large a plaintext envelope becomes once the
//! relay has sealed and framed it; see [`sealed_event_len`].

use crate::crypto::PublicId;
use crate::error::{ErrorKind, ParleyError, Result};
use crate::wire::{CorrelationId, Envelope};
use serde_json::json;
use std::collections::BTreeMap;

/// Smallest accepted `max_bytes_per_chunk`.
pub const MIN_BYTES_PER_CHUNK: usize = 1_000;

/// Largest accepted `max_bytes_per_chunk`.
pub const MAX_BYTES_PER_CHUNK: usize = 64_000;

/// Per-chunk allowance for framing and encryption when deciding how many
/// chunks a payload needs. Tunable, not part of the protocol.
pub const FRAME_OVERHEAD_ESTIMATE: usize = 750;

/// Signed relay event with empty content: 64-char id, two 64-char keys (author
/// and recipient tag), 128-char signature, timestamp and kind.
pub const EVENT_FRAME_LEN: usize = 418;

/// `?iv=` followed by a base64 encoded 16-byte IV.
pub const IV_SUFFIX_LEN: usize = 28;

/// Upper bound on the indices listed in an `IncompleteChunkSet` error.
const MAX_REPORTED_MISSING: usize = 64;

/// Size of the relay event that carries `plaintext_len` bytes of envelope:
/// AES-CBC with PKCS#7 padding, base64, the IV suffix, and the event frame.
pub fn sealed_event_len(plaintext_len: usize) -> usize {
    let padded = (plaintext_len / 16 + 1) * 16;
    let ciphertext = padded.div_ceil(3) * 4;
    EVENT_FRAME_LEN + ciphertext + IV_SUFFIX_LEN
}

pub fn validate_chunk_size(max_bytes_per_chunk: usize) -> Result<()> {
    if (MIN_BYTES_PER_CHUNK..=MAX_BYTES_PER_CHUNK).contains(&max_bytes_per_chunk) {
        Ok(())
    } else {
        Err(ParleyError::new(
            ErrorKind::InvalidChunkSize,
            format!(
                "max bytes per chunk must be between {MIN_BYTES_PER_CHUNK} and {MAX_BYTES_PER_CHUNK}, got {max_bytes_per_chunk}"
            ),
        ))
    }
}

/// Everything the codec needs to frame one exchange.
#[derive(Debug, Clone)]
pub struct SplitParams<'a> {
    pub correlation_id: &'a CorrelationId,
    pub payload: &'a str,
    pub deadline: u64,
    pub sender_id: &'a PublicId,
    pub max_bytes_per_chunk: usize,
    pub max_response_size: Option<u64>,
}

/// Frame `params.payload` into envelopes whose sealed size stays near
/// `max_bytes_per_chunk`.
///
/// `framed_len` maps an envelope's JSON length to the size of the event the
/// relay will publish.
pub fn split<F>(params: &SplitParams<'_>, framed_len: F) -> Result<Vec<Envelope>>
where
    F: Fn(usize) -> usize,
{
    validate_chunk_size(params.max_bytes_per_chunk)?;

    let first = |fragment: &str, chunk_count: u64| Envelope {
        correlation_id: params.correlation_id.clone(),
        chunk_index: 0,
        deadline: params.deadline,
        payload_fragment: fragment.to_owned(),
        chunk_count: Some(chunk_count),
        sender_id: Some(params.sender_id.clone()),
        max_response_size: params.max_response_size,
    };

    let whole = first(params.payload, 1);
    let framed = framed_len(whole.encode()?.len());
    if framed <= params.max_bytes_per_chunk {
        return Ok(vec![whole]);
    }

    let count = framed.div_ceil(params.max_bytes_per_chunk - FRAME_OVERHEAD_ESTIMATE);
    let target = params.payload.len().div_ceil(count);
    let fragments = cut_fragments(params.payload, count, target);

    let chunk_count = fragments.len() as u64;
    Ok(fragments
        .into_iter()
        .enumerate()
        .map(|(i, fragment)| {
            if i == 0 {
                first(fragment, chunk_count)
            } else {
                Envelope {
                    correlation_id: params.correlation_id.clone(),
                    chunk_index: i as u64,
                    deadline: params.deadline,
                    payload_fragment: fragment.to_owned(),
                    chunk_count: None,
                    sender_id: None,
                    max_response_size: None,
                }
            }
        })
        .collect())
}

/// Exactly `count` contiguous fragments of at most `target` bytes each, cut on
/// character boundaries. The last fragment takes the remainder.
fn cut_fragments(payload: &str, count: usize, target: usize) -> Vec<&str> {
    let mut out = Vec::with_capacity(count);
    let mut rest = payload;
    for _ in 1..count {
        let mut cut = target.min(rest.len());
        while !rest.is_char_boundary(cut) {
            cut -= 1;
        }
        if cut == 0 && !rest.is_empty() {
            // A single character wider than the target still has to move.
            cut = rest.chars().next().map_or(0, char::len_utf8);
        }
        let (head, tail) = rest.split_at(cut);
        out.push(head);
        rest = tail;
    }
    out.push(rest);
    out
}

/// Rebuild a payload from its chunks, in index order regardless of the order
/// they are given in. A later duplicate of an index replaces the earlier one.
pub fn reassemble<'a, I>(chunks: I) -> Result<String>
where
    I: IntoIterator<Item = &'a Envelope>,
{
    let mut count = None;
    let mut fragments: BTreeMap<u64, &str> = BTreeMap::new();
    for chunk in chunks {
        if chunk.is_first() {
            count = chunk.chunk_count;
        }
        fragments.insert(chunk.chunk_index, &chunk.payload_fragment);
    }

    let Some(count) = count else {
        return Err(incomplete(None, vec![0]));
    };
    let missing: Vec<u64> = (0..count)
        .filter(|i| !fragments.contains_key(i))
        .take(MAX_REPORTED_MISSING)
        .collect();
    if !missing.is_empty() {
        return Err(incomplete(Some(count), missing));
    }

    Ok(fragments.range(..count).map(|(_, f)| *f).collect())
}

fn incomplete(count: Option<u64>, missing: Vec<u64>) -> ParleyError {
    ParleyError::new(
        ErrorKind::IncompleteChunkSet,
        format!("missing chunk indices {missing:?}"),
    )
    .with_data(json!({ "chunkCount": count, "missing": missing }))
}

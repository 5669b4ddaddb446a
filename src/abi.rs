//! Coordinator contract ABI: event topics, log decoding and calldata.
//!
//! Only the handful of entries the relay touches are modelled. Every value
//! is a 32-byte big-endian word; the request commitment tuple is fully
//! static so it is encoded inline.

use alloy_primitives::{Address, B256, Bytes, U256, keccak256};
use thiserror::Error;

use crate::request::RandomnessRequest;

pub const RANDOM_WORDS_REQUESTED: &str =
    "RandomWordsRequested(bytes32,uint256,uint256,uint64,uint16,uint32,uint32,address)";
pub const RANDOM_WORDS_FULFILLED: &str = "RandomWordsFulfilled(uint256,uint256,uint96,bool)";
pub const FULFILL_RANDOM_WORDS: &str =
    "fulfillRandomWords(uint256,uint256,(uint64,uint64,uint32,uint32,address))";
pub const GET_COMMITMENT: &str = "getCommitment(uint256)";

const WORD: usize = 32;

#[derive(Debug, Error, PartialEq, Eq)]
#[error("malformed {what}: {reason}")]
pub struct AbiError {
    pub what: &'static str,
    pub reason: String,
}

impl AbiError {
    fn new(what: &'static str, reason: impl Into<String>) -> Self {
        Self {
            what,
            reason: reason.into(),
        }
    }
}

/// A raw log as returned by `eth_getLogs`, already hex-decoded.
#[derive(Debug, Clone)]
pub struct LogEntry {
    pub topics: Vec<B256>,
    pub data: Bytes,
    pub block_number: u64,
    pub tx_hash: Option<B256>,
}

/// A decoded `RandomWordsFulfilled` log.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FulfilledLog {
    pub request_id: U256,
    pub block_number: u64,
    pub success: bool,
}

/// Either of the two coordinator events the relay follows.
#[derive(Debug, Clone)]
pub enum CoordinatorEvent {
    Requested(RandomnessRequest),
    Fulfilled(FulfilledLog),
}

pub fn requested_topic() -> B256 {
    keccak256(RANDOM_WORDS_REQUESTED.as_bytes())
}

pub fn fulfilled_topic() -> B256 {
    keccak256(RANDOM_WORDS_FULFILLED.as_bytes())
}

/// First four bytes of `keccak256(signature)`.
pub fn selector(signature: &str) -> [u8; 4] {
    let hash = keccak256(signature.as_bytes());
    let mut out = [0u8; 4];
    out.copy_from_slice(&hash[..4]);
    out
}

/// Decode a coordinator log, returning `None` for unrelated topics.
pub fn decode_log(log: &LogEntry) -> Result<Option<CoordinatorEvent>, AbiError> {
    let Some(topic0) = log.topics.first() else {
        return Ok(None);
    };
    if *topic0 == requested_topic() {
        decode_requested(log).map(|r| Some(CoordinatorEvent::Requested(r)))
    } else if *topic0 == fulfilled_topic() {
        decode_fulfilled(log).map(|f| Some(CoordinatorEvent::Fulfilled(f)))
    } else {
        Ok(None)
    }
}

/// Indexed: keyHash, subId, sender. Data: requestId, preSeed,
/// minimumRequestConfirmations, callbackGasLimit, numWords.
fn decode_requested(log: &LogEntry) -> Result<RandomnessRequest, AbiError> {
    const WHAT: &str = "RandomWordsRequested log";
    if log.topics.len() != 4 {
        return Err(AbiError::new(
            WHAT,
            format!("expected 4 topics, got {}", log.topics.len()),
        ));
    }
    let words = words(&log.data, 5, WHAT)?;
    let sub_id = word_to_u64(U256::from_be_bytes(log.topics[2].0), WHAT, "subId")?;
    let requester = word_to_address(&log.topics[3]);

    Ok(RandomnessRequest {
        request_id: words[0],
        requester,
        block_number: log.block_number,
        sub_id,
        callback_gas_limit: word_to_u32(words[3], WHAT, "callbackGasLimit")?,
        num_words: word_to_u32(words[4], WHAT, "numWords")?,
        tx_hash: log.tx_hash,
    })
}

/// Indexed: requestId. Data: outputSeed, payment, success.
fn decode_fulfilled(log: &LogEntry) -> Result<FulfilledLog, AbiError> {
    const WHAT: &str = "RandomWordsFulfilled log";
    if log.topics.len() != 2 {
        return Err(AbiError::new(
            WHAT,
            format!("expected 2 topics, got {}", log.topics.len()),
        ));
    }
    let words = words(&log.data, 3, WHAT)?;
    Ok(FulfilledLog {
        request_id: U256::from_be_bytes(log.topics[1].0),
        block_number: log.block_number,
        success: !words[2].is_zero(),
    })
}

/// Calldata for `fulfillRandomWords(requestId, randomness, rc)`.
///
/// The commitment is rebuilt from the request log exactly as the
/// coordinator hashed it at request time.
pub fn encode_fulfill(request: &RandomnessRequest, randomness: U256) -> Bytes {
    let mut data = Vec::with_capacity(4 + 7 * WORD);
    data.extend_from_slice(&selector(FULFILL_RANDOM_WORDS));
    push_word(&mut data, request.request_id);
    push_word(&mut data, randomness);
    push_word(&mut data, U256::from(request.block_number));
    push_word(&mut data, U256::from(request.sub_id));
    push_word(&mut data, U256::from(request.callback_gas_limit));
    push_word(&mut data, U256::from(request.num_words));
    data.extend_from_slice(request.requester.into_word().as_slice());
    data.into()
}

/// Calldata for `getCommitment(requestId)`.
pub fn encode_get_commitment(request_id: U256) -> Bytes {
    let mut data = Vec::with_capacity(4 + WORD);
    data.extend_from_slice(&selector(GET_COMMITMENT));
    push_word(&mut data, request_id);
    data.into()
}

/// Decode the `bytes32` returned by `getCommitment`.
pub fn decode_commitment(output: &[u8]) -> Result<B256, AbiError> {
    if output.len() != WORD {
        return Err(AbiError::new(
            "getCommitment output",
            format!("expected {WORD} bytes, got {}", output.len()),
        ));
    }
    Ok(B256::from_slice(output))
}

/// Request ID and randomness from `fulfillRandomWords` calldata.
#[cfg(test)]
pub fn decode_fulfill(calldata: &[u8]) -> Option<(U256, U256)> {
    if calldata.len() != 4 + 7 * WORD || calldata[..4] != selector(FULFILL_RANDOM_WORDS) {
        return None;
    }
    let body = &calldata[4..];
    Some((
        U256::from_be_slice(&body[..WORD]),
        U256::from_be_slice(&body[WORD..2 * WORD]),
    ))
}

fn push_word(out: &mut Vec<u8>, value: U256) {
    out.extend_from_slice(&value.to_be_bytes::<WORD>());
}

fn words(data: &[u8], expected: usize, what: &'static str) -> Result<Vec<U256>, AbiError> {
    if data.len() < expected * WORD {
        return Err(AbiError::new(
            what,
            format!("expected {} data bytes, got {}", expected * WORD, data.len()),
        ));
    }
    Ok(data
        .chunks_exact(WORD)
        .take(expected)
        .map(U256::from_be_slice)
        .collect())
}

fn word_to_u64(word: U256, what: &'static str, field: &str) -> Result<u64, AbiError> {
    if word > U256::from(u64::MAX) {
        return Err(AbiError::new(what, format!("{field} does not fit in u64")));
    }
    Ok(word.as_limbs()[0])
}

fn word_to_u32(word: U256, what: &'static str, field: &str) -> Result<u32, AbiError> {
    let value = word_to_u64(word, what, field)?;
    u32::try_from(value).map_err(|_| AbiError::new(what, format!("{field} does not fit in u32")))
}

fn word_to_address(word: &B256) -> Address {
    Address::from_slice(&word[12..])
}

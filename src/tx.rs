//! Fulfillment transaction encoding and signing.
//!
//! EIP-1559 (type 2) transactions by default; legacy EIP-155 for chains
//! whose nodes do not accept typed transactions.

use alloy_primitives::{Address, B256, Bytes, U256, keccak256};
use alloy_rlp::{Encodable, Header};
use k256::ecdsa::SigningKey;

/// How the transaction pays for gas.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GasPricing {
    Eip1559 {
        max_fee_per_gas: u128,
        max_priority_fee_per_gas: u128,
    },
    Legacy {
        gas_price: u128,
    },
}

/// An unsigned call. Fulfillments carry no value.
#[derive(Debug, Clone)]
pub struct UnsignedTx {
    pub chain_id: u64,
    pub nonce: u64,
    pub gas_limit: u64,
    pub pricing: GasPricing,
    pub to: Address,
    pub value: U256,
    pub input: Bytes,
}

/// Raw signed bytes ready for `eth_sendRawTransaction`.
#[derive(Debug, Clone)]
pub struct SignedTx {
    pub raw: Vec<u8>,
    pub hash: B256,
}

const EIP1559_TX_TYPE: u8 = 0x02;

impl UnsignedTx {
    /// Hash that gets signed.
    pub fn signing_hash(&self) -> B256 {
        keccak256(self.signing_payload())
    }

    fn signing_payload(&self) -> Vec<u8> {
        match self.pricing {
            GasPricing::Eip1559 { .. } => {
                let mut out = vec![EIP1559_TX_TYPE];
                out.extend(rlp_list(|buf| self.encode_eip1559_fields(buf)));
                out
            }
            GasPricing::Legacy { .. } => rlp_list(|buf| {
                self.encode_legacy_fields(buf);
                // EIP-155: chain_id, 0, 0
                self.chain_id.encode(buf);
                0u8.encode(buf);
                0u8.encode(buf);
            }),
        }
    }

    pub fn sign(&self, key: &SigningKey) -> Result<SignedTx, k256::ecdsa::Error> {
        let (signature, recovery_id) = key.sign_prehash_recoverable(self.signing_hash().as_slice())?;
        let bytes = signature.to_bytes();
        let r = U256::from_be_slice(&bytes[..32]);
        let s = U256::from_be_slice(&bytes[32..]);
        let y_parity = u64::from(recovery_id.is_y_odd());

        let raw = match self.pricing {
            GasPricing::Eip1559 { .. } => {
                let mut out = vec![EIP1559_TX_TYPE];
                out.extend(rlp_list(|buf| {
                    self.encode_eip1559_fields(buf);
                    y_parity.encode(buf);
                    r.encode(buf);
                    s.encode(buf);
                }));
                out
            }
            GasPricing::Legacy { .. } => rlp_list(|buf| {
                self.encode_legacy_fields(buf);
                let v = y_parity + 35 + 2 * self.chain_id;
                v.encode(buf);
                r.encode(buf);
                s.encode(buf);
            }),
        };

        let hash = keccak256(&raw);
        Ok(SignedTx { raw, hash })
    }

    fn encode_eip1559_fields(&self, buf: &mut Vec<u8>) {
        let (max_fee_per_gas, max_priority_fee_per_gas) = match self.pricing {
            GasPricing::Eip1559 {
                max_fee_per_gas,
                max_priority_fee_per_gas,
            } => (max_fee_per_gas, max_priority_fee_per_gas),
            GasPricing::Legacy { gas_price } => (gas_price, gas_price),
        };
        self.chain_id.encode(buf);
        self.nonce.encode(buf);
        max_priority_fee_per_gas.encode(buf);
        max_fee_per_gas.encode(buf);
        self.gas_limit.encode(buf);
        self.to.encode(buf);
        self.value.encode(buf);
        self.input.encode(buf);
        // empty access list
        Header {
            list: true,
            payload_length: 0,
        }
        .encode(buf);
    }

    fn encode_legacy_fields(&self, buf: &mut Vec<u8>) {
        let gas_price = match self.pricing {
            GasPricing::Legacy { gas_price } => gas_price,
            GasPricing::Eip1559 {
                max_fee_per_gas, ..
            } => max_fee_per_gas,
        };
        self.nonce.encode(buf);
        gas_price.encode(buf);
        self.gas_limit.encode(buf);
        self.to.encode(buf);
        self.value.encode(buf);
        self.input.encode(buf);
    }
}

fn rlp_list(fields: impl FnOnce(&mut Vec<u8>)) -> Vec<u8> {
    let mut payload = Vec::new();
    fields(&mut payload);
    let mut out = Vec::with_capacity(payload.len() + 9);
    Header {
        list: true,
        payload_length: payload.len(),
    }
    .encode(&mut out);
    out.extend_from_slice(&payload);
    out
}

/// Nonce and input of a raw transaction produced by [`UnsignedTx::sign`].
#[cfg(test)]
pub fn decode_nonce_and_input(raw: &[u8]) -> Result<(u64, Bytes), alloy_rlp::Error> {
    use alloy_rlp::Decodable;

    let typed = raw.first() == Some(&EIP1559_TX_TYPE);
    let mut buf = if typed { &raw[1..] } else { raw };
    let header = Header::decode(&mut buf)?;
    if !header.list {
        return Err(alloy_rlp::Error::UnexpectedString);
    }
    if typed {
        let _chain_id = u64::decode(&mut buf)?;
        let nonce = u64::decode(&mut buf)?;
        let _priority = u128::decode(&mut buf)?;
        let _max_fee = u128::decode(&mut buf)?;
        let _gas = u64::decode(&mut buf)?;
        let _to = Address::decode(&mut buf)?;
        let _value = U256::decode(&mut buf)?;
        let input = Bytes::decode(&mut buf)?;
        Ok((nonce, input))
    } else {
        let nonce = u64::decode(&mut buf)?;
        let _gas_price = u128::decode(&mut buf)?;
        let _gas = u64::decode(&mut buf)?;
        let _to = Address::decode(&mut buf)?;
        let _value = U256::decode(&mut buf)?;
        let input = Bytes::decode(&mut buf)?;
        Ok((nonce, input))
    }
}

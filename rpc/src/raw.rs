//! Raw full node JSON and its validation into domain types
//!
//! Field names follow `getblock <hash> 2` and `getrawtransaction <txid> 1`.

use serde::Deserialize;
use serde_json::value::RawValue;
use utxodex_core::{
    Amount, Block, BlockHash, BlockHeight, IndexerError, IndexerResult, OutputKind, Transaction,
    TxInput, TxOutput, Txid,
};

#[derive(Debug, Deserialize)]
pub struct RawBlock {
    pub hash: String,
    pub height: BlockHeight,
    #[serde(rename = "previousblockhash", default)]
    pub previous_hash: Option<String>,
    #[serde(default)]
    pub tx: Vec<RawTransaction>,
}

#[derive(Debug, Deserialize)]
pub struct RawTransaction {
    pub txid: String,
    #[serde(default)]
    pub vin: Vec<RawInput>,
    #[serde(default)]
    pub vout: Vec<RawOutput>,
}

#[derive(Debug, Deserialize)]
pub struct RawInput {
    #[serde(default)]
    pub coinbase: Option<String>,
    #[serde(default)]
    pub txid: Option<String>,
    #[serde(default)]
    pub vout: Option<u32>,
}

#[derive(Debug, Deserialize)]
pub struct RawOutput {
    /// Decimal coin value, kept as the original JSON text
    #[serde(default)]
    pub value: Option<Box<RawValue>>,
    #[serde(rename = "valueSat", default)]
    pub value_sat: Option<u64>,
    pub n: u32,
    #[serde(rename = "scriptPubKey")]
    pub script_pub_key: RawScriptPubKey,
}

#[derive(Debug, Deserialize)]
pub struct RawScriptPubKey {
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(default)]
    pub address: Option<String>,
    #[serde(default)]
    pub addresses: Vec<String>,
}

impl RawBlock {
    /// Validate into a domain block expected at `height`
    pub fn into_block(self, height: BlockHeight) -> IndexerResult<Block> {
        if self.height != height {
            return Err(IndexerError::MalformedBlock {
                height,
                reason: format!("node returned block at height {}", self.height),
            });
        }

        let hash = parse_block_hash(height, &self.hash)?;
        let previous_hash = self
            .previous_hash
            .as_deref()
            .map(|prev| parse_block_hash(height, prev))
            .transpose()?;
        let transactions = self
            .tx
            .into_iter()
            .map(RawTransaction::into_transaction)
            .collect::<IndexerResult<Vec<_>>>()?;

        Ok(Block {
            height,
            hash: Some(hash),
            previous_hash,
            transactions,
        })
    }
}

impl RawTransaction {
    pub fn into_transaction(self) -> IndexerResult<Transaction> {
        let txid = parse_txid(&self.txid)?;
        let inputs = self
            .vin
            .into_iter()
            .map(|input| input.into_input(&txid))
            .collect::<IndexerResult<Vec<_>>>()?;
        let outputs = self
            .vout
            .into_iter()
            .map(|output| output.into_output(&txid))
            .collect::<IndexerResult<Vec<_>>>()?;

        Ok(Transaction::new(txid, inputs, outputs))
    }
}

impl RawInput {
    fn into_input(self, spender: &Txid) -> IndexerResult<TxInput> {
        if self.coinbase.is_some() {
            return Ok(TxInput::Coinbase);
        }
        match (self.txid, self.vout) {
            (Some(txid), Some(vout)) => Ok(TxInput::spend(parse_txid(&txid)?, vout)),
            _ => Err(IndexerError::MalformedTransaction {
                txid: spender.to_hex(),
                reason: "input is neither coinbase nor an outpoint".into(),
            }),
        }
    }
}

impl RawOutput {
    fn into_output(self, txid: &Txid) -> IndexerResult<TxOutput> {
        let kind = OutputKind::from_script_type(&self.script_pub_key.kind);
        let amount = match (self.value_sat, &self.value) {
            (Some(sats), _) => Amount(sats),
            (None, Some(value)) => parse_coin_amount(value.get())?,
            (None, None) => {
                return Err(IndexerError::MalformedTransaction {
                    txid: txid.to_hex(),
                    reason: format!("output {} has no value", self.n),
                })
            }
        };

        let RawScriptPubKey {
            address,
            mut addresses,
            ..
        } = self.script_pub_key;
        // Bare multisig reports every key; only a single one is an address.
        let address = match address {
            Some(address) => Some(address),
            None if addresses.len() == 1 || (kind.is_addressable() && !addresses.is_empty()) => {
                Some(addresses.swap_remove(0))
            }
            None => None,
        };

        Ok(TxOutput {
            index: self.n,
            address,
            amount,
            kind,
        })
    }
}

/// Parse a decimal coin amount into minor units without floating point
///
/// Accepts a JSON number or string such as `5`, `5.00000000` or `"0.1"`.
pub fn parse_coin_amount(text: &str) -> IndexerResult<Amount> {
    let invalid = || IndexerError::DeserializationError(format!("invalid amount {}", text));

    let digits = text.trim().trim_matches('"');
    let (whole, fraction) = digits.split_once('.').unwrap_or((digits, ""));
    if whole.is_empty()
        || !whole.bytes().all(|b| b.is_ascii_digit())
        || !fraction.bytes().all(|b| b.is_ascii_digit())
    {
        return Err(invalid());
    }

    let fraction = fraction.trim_end_matches('0');
    if fraction.len() > Amount::DECIMALS as usize {
        return Err(invalid());
    }

    let whole: u64 = whole.parse().map_err(|_| IndexerError::AmountOverflow)?;
    let minor: u64 = if fraction.is_empty() {
        0
    } else {
        format!("{:0<width$}", fraction, width = Amount::DECIMALS as usize)
            .parse()
            .map_err(|_| invalid())?
    };

    whole
        .checked_mul(Amount::ONE_COIN)
        .and_then(|whole| whole.checked_add(minor))
        .map(Amount)
        .ok_or(IndexerError::AmountOverflow)
}

pub fn parse_txid(hex: &str) -> IndexerResult<Txid> {
    Txid::from_hex(hex).map_err(|e| IndexerError::InvalidTxid(format!("{}: {}", hex, e)))
}

fn parse_block_hash(height: BlockHeight, hex: &str) -> IndexerResult<BlockHash> {
    BlockHash::from_hex(hex).map_err(|e| IndexerError::MalformedBlock {
        height,
        reason: format!("bad block hash {}: {}", hex, e),
    })
}

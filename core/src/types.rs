//! Core types for utxodex
//!
//! Defines the UTXO data model used across the system: identifiers,
//! amounts, blocks and their transactions, and the indexed output itself.

use serde::de::Error as _;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::fmt;

/// Block height
pub type BlockHeight = u64;

macro_rules! hash_type {
    ($(#[$doc:meta])* $name:ident) => {
        $(#[$doc])*
        #[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
        pub struct $name(pub [u8; 32]);

        impl $name {
            pub const ZERO: $name = $name([0u8; 32]);

            pub fn from_bytes(bytes: [u8; 32]) -> Self {
                $name(bytes)
            }

            pub fn as_bytes(&self) -> &[u8; 32] {
                &self.0
            }

            pub fn to_hex(&self) -> String {
                hex::encode(self.0)
            }

            pub fn from_hex(s: &str) -> Result<Self, hex::FromHexError> {
                let bytes = hex::decode(s)?;
                if bytes.len() != 32 {
                    return Err(hex::FromHexError::InvalidStringLength);
                }
                let mut arr = [0u8; 32];
                arr.copy_from_slice(&bytes);
                Ok($name(arr))
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}", self.to_hex())
            }
        }

        impl fmt::Debug for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}({})", stringify!($name), self.to_hex())
            }
        }

        // Hex on human-readable formats (JSON), raw bytes on binary ones.
        impl Serialize for $name {
            fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
                if serializer.is_human_readable() {
                    serializer.serialize_str(&self.to_hex())
                } else {
                    self.0.serialize(serializer)
                }
            }
        }

        impl<'de> Deserialize<'de> for $name {
            fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
                if deserializer.is_human_readable() {
                    let s = String::deserialize(deserializer)?;
                    $name::from_hex(&s).map_err(D::Error::custom)
                } else {
                    <[u8; 32]>::deserialize(deserializer).map($name)
                }
            }
        }
    };
}

hash_type!(
    /// 32-byte transaction identifier
    Txid
);

hash_type!(
    /// 32-byte block hash
    BlockHash
);

/// Reference to a transaction output: the identity key of a UTXO
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct OutPoint {
    pub txid: Txid,
    pub vout: u32,
}

impl OutPoint {
    /// Length of the storage key
    pub const KEY_LEN: usize = 36;

    pub fn new(txid: Txid, vout: u32) -> Self {
        Self { txid, vout }
    }

    /// Storage key: txid bytes followed by the big-endian output index
    pub fn to_key(&self) -> [u8; Self::KEY_LEN] {
        let mut key = [0u8; Self::KEY_LEN];
        key[..32].copy_from_slice(&self.txid.0);
        key[32..].copy_from_slice(&self.vout.to_be_bytes());
        key
    }

    pub fn from_key(key: &[u8]) -> Option<Self> {
        if key.len() != Self::KEY_LEN {
            return None;
        }
        let mut txid = [0u8; 32];
        txid.copy_from_slice(&key[..32]);
        let mut vout = [0u8; 4];
        vout.copy_from_slice(&key[32..]);
        Some(Self::new(Txid(txid), u32::from_be_bytes(vout)))
    }
}

impl fmt::Display for OutPoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.txid, self.vout)
    }
}

impl fmt::Debug for OutPoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "OutPoint({}:{})", self.txid.to_hex(), self.vout)
    }
}

/// Amount in the smallest currency unit
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, Default)]
#[serde(transparent)]
pub struct Amount(pub u64);

impl Amount {
    pub const ZERO: Amount = Amount(0);
    pub const MAX: Amount = Amount(u64::MAX);

    /// One coin = 10^8 smallest units
    pub const DECIMALS: u32 = 8;
    pub const ONE_COIN: u64 = 100_000_000;

    pub fn new(value: u64) -> Self {
        Amount(value)
    }

    pub fn checked_add(self, other: Amount) -> Option<Amount> {
        self.0.checked_add(other.0).map(Amount)
    }

    pub fn checked_sub(self, other: Amount) -> Option<Amount> {
        self.0.checked_sub(other.0).map(Amount)
    }
}

impl fmt::Display for Amount {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl fmt::Debug for Amount {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Amount({})", self.0)
    }
}

/// Signed balance change in the smallest currency unit
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, Default)]
#[serde(transparent)]
pub struct AmountDelta(pub i64);

impl AmountDelta {
    pub const ZERO: AmountDelta = AmountDelta(0);

    pub fn checked_credit(self, amount: Amount) -> Option<AmountDelta> {
        let amount = i64::try_from(amount.0).ok()?;
        self.0.checked_add(amount).map(AmountDelta)
    }

    pub fn checked_debit(self, amount: Amount) -> Option<AmountDelta> {
        let amount = i64::try_from(amount.0).ok()?;
        self.0.checked_sub(amount).map(AmountDelta)
    }
}

impl fmt::Display for AmountDelta {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl fmt::Debug for AmountDelta {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "AmountDelta({})", self.0)
    }
}

/// Timestamp in milliseconds since Unix epoch
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Timestamp(pub u64);

impl Timestamp {
    pub fn now() -> Self {
        Timestamp(chrono::Utc::now().timestamp_millis() as u64)
    }

    pub fn from_millis(millis: u64) -> Self {
        Timestamp(millis)
    }

    pub fn as_millis(&self) -> u64 {
        self.0
    }
}

impl fmt::Display for Timestamp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl fmt::Debug for Timestamp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Timestamp({})", self.0)
    }
}

/// An unspent transaction output
///
/// Immutable once created. The store only ever inserts or removes whole
/// entries keyed by `(txid, vout)`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Utxo {
    pub txid: Txid,
    pub vout: u32,
    pub height: BlockHeight,
    pub address: String,
    pub amount: Amount,
}

impl Utxo {
    pub fn outpoint(&self) -> OutPoint {
        OutPoint::new(self.txid, self.vout)
    }
}

/// Output script classification
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OutputKind {
    PubKeyHash,
    PubKey,
    ScriptHash,
    WitnessKeyHash,
    WitnessScriptHash,
    Taproot,
    Multisig,
    NullData,
    NonStandard,
}

impl OutputKind {
    /// Parse the `scriptPubKey.type` string reported by the full node
    pub fn from_script_type(script_type: &str) -> Self {
        match script_type {
            "pubkeyhash" => OutputKind::PubKeyHash,
            "pubkey" => OutputKind::PubKey,
            "scripthash" => OutputKind::ScriptHash,
            "witness_v0_keyhash" => OutputKind::WitnessKeyHash,
            "witness_v0_scripthash" => OutputKind::WitnessScriptHash,
            "witness_v1_taproot" => OutputKind::Taproot,
            "multisig" => OutputKind::Multisig,
            "nulldata" => OutputKind::NullData,
            _ => OutputKind::NonStandard,
        }
    }

    /// Kinds that always resolve to exactly one address
    pub fn is_addressable(&self) -> bool {
        matches!(
            self,
            OutputKind::PubKeyHash
                | OutputKind::PubKey
                | OutputKind::ScriptHash
                | OutputKind::WitnessKeyHash
                | OutputKind::WitnessScriptHash
                | OutputKind::Taproot
        )
    }

    pub fn is_null_data(&self) -> bool {
        matches!(self, OutputKind::NullData)
    }
}

/// Transaction input
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TxInput {
    /// Block reward input, spends nothing
    Coinbase,
    /// Spends a previously created output
    Spend(OutPoint),
}

impl TxInput {
    pub fn spend(txid: Txid, vout: u32) -> Self {
        TxInput::Spend(OutPoint::new(txid, vout))
    }

    pub fn outpoint(&self) -> Option<OutPoint> {
        match self {
            TxInput::Coinbase => None,
            TxInput::Spend(outpoint) => Some(*outpoint),
        }
    }
}

/// Transaction output
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TxOutput {
    pub index: u32,
    pub address: Option<String>,
    pub amount: Amount,
    pub kind: OutputKind,
}

impl TxOutput {
    pub fn new(index: u32, address: impl Into<String>, amount: Amount) -> Self {
        Self {
            index,
            address: Some(address.into()),
            amount,
            kind: OutputKind::PubKeyHash,
        }
    }

    pub fn null_data(index: u32) -> Self {
        Self {
            index,
            address: None,
            amount: Amount::ZERO,
            kind: OutputKind::NullData,
        }
    }
}

/// A transaction as delivered by the block source
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Transaction {
    pub txid: Txid,
    pub inputs: Vec<TxInput>,
    pub outputs: Vec<TxOutput>,
}

impl Transaction {
    pub fn new(txid: Txid, inputs: Vec<TxInput>, outputs: Vec<TxOutput>) -> Self {
        Self { txid, inputs, outputs }
    }

    pub fn is_coinbase(&self) -> bool {
        self.inputs.iter().any(|input| matches!(input, TxInput::Coinbase))
    }
}

/// A block as delivered by the block source
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Block {
    pub height: BlockHeight,
    pub hash: Option<BlockHash>,
    pub previous_hash: Option<BlockHash>,
    pub transactions: Vec<Transaction>,
}

impl Block {
    pub fn new(height: BlockHeight, transactions: Vec<Transaction>) -> Self {
        Self {
            height,
            hash: None,
            previous_hash: None,
            transactions,
        }
    }
}

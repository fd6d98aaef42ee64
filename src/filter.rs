//! Transaction Filtering
//!
//! Normalizes raw block transactions into compact records and keeps only the
//! ones moving a significant amount. The filter is a pure function over its
//! input: no I/O and no state carried between calls.

use std::collections::BTreeSet;

use indexmap::IndexMap;
use serde::{Serialize, Serializer};

use crate::decoder::{btc_to_satoshis, satoshis_to_btc, RawTransaction};

/// Default significance threshold in whole bitcoin
pub const DEFAULT_THRESHOLD_BTC: f64 = 1.0;

/// One output of a retained transaction
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct OutputRecord {
    /// Output value in satoshis, serialized as whole bitcoin
    #[serde(rename = "value", serialize_with = "serialize_btc")]
    pub value_sats: u64,
    /// Entity attributed to the receiving address
    #[serde(skip_serializing_if = "Option::is_none")]
    pub entity: Option<String>,
}

impl OutputRecord {
    pub fn new(value_sats: u64) -> Self {
        Self { value_sats, entity: None }
    }

    /// Value in whole bitcoin
    pub fn value_btc(&self) -> f64 {
        satoshis_to_btc(self.value_sats)
    }
}

/// A transaction that passed the filter, ready for attribution
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TransactionRecord {
    pub hash: String,
    /// Spending addresses in input order, without duplicates
    #[serde(skip)]
    pub input_addresses: Vec<String>,
    /// Receiving addresses in output order
    pub outputs: IndexMap<String, OutputRecord>,
    /// Largest value paid to outputs without an address
    #[serde(skip)]
    pub unaddressed_sats: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub input_entity: Option<String>,
}

impl TransactionRecord {
    /// Build a record from a raw transaction
    ///
    /// Outputs are keyed by address with the last output to an address
    /// winning. Outputs without an address stay out of the map but still
    /// count toward significance.
    pub fn from_raw(tx: &RawTransaction) -> Self {
        let mut input_addresses: Vec<String> = Vec::with_capacity(tx.inputs.len());
        for addr in tx.inputs.iter().filter_map(|input| input.address()) {
            if !input_addresses.iter().any(|known| known == addr) {
                input_addresses.push(addr.to_string());
            }
        }

        let mut values: IndexMap<Option<&str>, u64> = IndexMap::with_capacity(tx.out.len());
        for output in &tx.out {
            values.insert(output.addr.as_deref(), output.value);
        }

        let mut outputs = IndexMap::with_capacity(values.len());
        let mut unaddressed_sats = 0;
        for (addr, value) in values {
            match addr.filter(|a| !a.is_empty()) {
                Some(addr) => {
                    outputs.insert(addr.to_string(), OutputRecord::new(value));
                }
                None => unaddressed_sats = unaddressed_sats.max(value),
            }
        }

        Self {
            hash: tx.hash.clone(),
            input_addresses,
            outputs,
            unaddressed_sats,
            input_entity: None,
        }
    }

    /// Largest output value in satoshis, addressed or not; zero when there are no outputs
    pub fn max_output_sats(&self) -> u64 {
        self.outputs
            .values()
            .map(|o| o.value_sats)
            .max()
            .unwrap_or(0)
            .max(self.unaddressed_sats)
    }

    /// Whether `address` is one of this transaction's spending addresses
    pub fn spends_from(&self, address: &str) -> bool {
        self.input_addresses.iter().any(|a| a == address)
    }

    /// All input and output addresses of this transaction
    pub fn addresses(&self) -> impl Iterator<Item = &str> {
        self.input_addresses
            .iter()
            .map(String::as_str)
            .chain(self.outputs.keys().map(String::as_str))
    }
}

/// Result of filtering one block
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FilteredBlock {
    /// Retained transactions, in block order
    pub records: Vec<TransactionRecord>,
    /// Deduplicated, non-empty addresses of every retained transaction
    pub addresses: BTreeSet<String>,
}

impl FilteredBlock {
    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }
}

/// Keeps transactions with at least one output strictly above a threshold
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TransactionFilter {
    threshold_sats: u64,
}

impl Default for TransactionFilter {
    fn default() -> Self {
        Self::with_threshold_btc(DEFAULT_THRESHOLD_BTC)
    }
}

impl TransactionFilter {
    /// Create a filter with a threshold expressed in satoshis
    pub fn new(threshold_sats: u64) -> Self {
        Self { threshold_sats }
    }

    /// Create a filter with a threshold expressed in whole bitcoin
    pub fn with_threshold_btc(threshold_btc: f64) -> Self {
        Self::new(btc_to_satoshis(threshold_btc))
    }

    pub fn threshold_sats(&self) -> u64 {
        self.threshold_sats
    }

    /// Whether a single output value clears the threshold
    pub fn exceeds_threshold(&self, value_sats: u64) -> bool {
        value_sats > self.threshold_sats
    }

    /// Whether a record has any output above the threshold
    pub fn is_significant(&self, record: &TransactionRecord) -> bool {
        self.exceeds_threshold(record.max_output_sats())
    }

    /// Filter a block's transactions
    ///
    /// # Arguments
    /// * `transactions` - The raw transactions of one block
    ///
    /// # Returns
    /// The retained records plus the address set to send for attribution
    pub fn filter(&self, transactions: &[RawTransaction]) -> FilteredBlock {
        let mut block = FilteredBlock::default();

        for tx in transactions {
            let record = TransactionRecord::from_raw(tx);
            if !self.is_significant(&record) {
                continue;
            }
            block
                .addresses
                .extend(record.addresses().filter(|a| !a.is_empty()).map(str::to_string));
            block.records.push(record);
        }

        block
    }
}

fn serialize_btc<S: Serializer>(value_sats: &u64, serializer: S) -> Result<S::Ok, S::Error> {
    serializer.serialize_f64(satoshis_to_btc(*value_sats))
}

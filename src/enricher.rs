//! Attribution Enrichment
//!
//! Resolves the addresses of a filtered block in one lookup and merges the
//! entity names back into the transaction records.

use std::collections::{BTreeSet, HashMap};

use thiserror::Error;
use tracing::{debug, error};

use crate::attribution::{AddressAttributionsResponse, AttributionLookup, LookupError};
use crate::filter::TransactionRecord;

/// Address to entity name, built fresh for every lookup
pub type AttributionMap = HashMap<String, String>;

/// Errors that abort enrichment of a block
#[derive(Error, Debug)]
pub enum EnrichmentError {
    #[error("Attribution lookup failed: {0}")]
    Lookup(#[from] LookupError),
}

/// Build the attribution map from a lookup response
///
/// Entries without an entity name are left out.
pub fn build_attribution_map(response: AddressAttributionsResponse) -> AttributionMap {
    response
        .data
        .into_iter()
        .filter_map(|(address, data)| {
            data.entity
                .filter(|entity| !entity.is_empty())
                .map(|entity| (address, entity))
        })
        .collect()
}

/// Merge attributions into a single record
///
/// `input_entity` becomes the entity of the first input address found in the
/// map. An output gets an entity only when its value exceeds the threshold,
/// it does not pay back one of the inputs, and its entity differs from
/// `input_entity`.
pub fn apply_attributions(record: &mut TransactionRecord, attributions: &AttributionMap, threshold_sats: u64) {
    record.input_entity = record
        .input_addresses
        .iter()
        .find_map(|addr| attributions.get(addr))
        .cloned();

    for (address, output) in record.outputs.iter_mut() {
        if output.value_sats <= threshold_sats {
            continue;
        }
        if record.input_addresses.iter().any(|a| a == address) {
            continue;
        }
        let Some(entity) = attributions.get(address) else {
            continue;
        };
        if record.input_entity.as_ref() == Some(entity) {
            continue;
        }
        output.entity = Some(entity.clone());
    }
}

/// Enriches filtered transactions with entity names
#[derive(Debug, Clone)]
pub struct AttributionEnricher<L> {
    lookup: L,
    threshold_sats: u64,
}

impl<L: AttributionLookup> AttributionEnricher<L> {
    pub fn new(lookup: L, threshold_sats: u64) -> Self {
        Self { lookup, threshold_sats }
    }

    pub fn lookup(&self) -> &L {
        &self.lookup
    }

    /// Enrich records in a single batch lookup
    ///
    /// # Arguments
    /// * `records` - Transactions retained by the filter
    /// * `addresses` - Union of their input and output addresses
    ///
    /// # Returns
    /// The records with `input_entity` and output entities filled in. An
    /// empty address set returns the records unchanged without a lookup.
    pub async fn enrich(
        &self,
        mut records: Vec<TransactionRecord>,
        addresses: &BTreeSet<String>,
    ) -> Result<Vec<TransactionRecord>, EnrichmentError> {
        if addresses.is_empty() {
            return Ok(records);
        }

        let batch: Vec<String> = addresses.iter().cloned().collect();
        let response = self.lookup.address_attributions(&batch).await.map_err(|e| {
            error!(addresses = batch.len(), error = %e, "Failed to get address attributions");
            EnrichmentError::from(e)
        })?;

        let attributions = build_attribution_map(response);
        debug!(
            addresses = batch.len(),
            attributed = attributions.len(),
            "Resolved address attributions"
        );

        for record in records.iter_mut() {
            apply_attributions(record, &attributions, self.threshold_sats);
        }

        Ok(records)
    }
}

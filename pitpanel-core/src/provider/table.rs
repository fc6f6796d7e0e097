use polars::prelude::DataFrame;
use std::collections::BTreeMap;

use super::{FeatureProvider, FeatureRequest, ProviderError};
use crate::columns::{date_values, row_mask, str_values};
use crate::panel::{DATE, SECURITY_KEY, SECURITY_KEY_NAME};

/// Serves pre-loaded feature tables from memory.
///
/// Each table is stored under its feature name and must carry `date` and a
/// column named after the feature. Tables that also carry the unit key are
/// filtered to the requested securities.
#[derive(Debug, Clone)]
pub struct TableProvider {
    name: String,
    tables: BTreeMap<String, DataFrame>,
}

impl TableProvider {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            tables: BTreeMap::new(),
        }
    }

    pub fn with_table(mut self, feature: impl Into<String>, table: DataFrame) -> Result<Self, ProviderError> {
        let feature = feature.into();
        date_values(&table, DATE)?;
        table.column(&feature)?;
        let keyed = table.get_column_index(SECURITY_KEY).is_some();
        if keyed != table.get_column_index(SECURITY_KEY_NAME).is_some() {
            return Err(ProviderError::Other(format!(
                "table '{feature}' must carry both {SECURITY_KEY_NAME} and {SECURITY_KEY} or neither"
            )));
        }
        self.tables.insert(feature, table);
        Ok(self)
    }
}

impl FeatureProvider for TableProvider {
    fn name(&self) -> &str {
        &self.name
    }

    fn features(&self) -> Vec<String> {
        self.tables.keys().cloned().collect()
    }

    fn fetch(&self, request: &FeatureRequest) -> Result<DataFrame, ProviderError> {
        let table = self.tables.get(&request.feature).ok_or_else(|| ProviderError::UnknownFeature {
            source_name: self.name.clone(),
            feature: request.feature.clone(),
        })?;
        let dates = date_values(table, DATE)?;
        let mut mask: Vec<bool> = dates
            .iter()
            .map(|d| d.is_some_and(|d| request.covers(d)))
            .collect();

        if table.get_column_index(SECURITY_KEY).is_some() {
            let names = str_values(table, SECURITY_KEY_NAME)?;
            let keys = str_values(table, SECURITY_KEY)?;
            for (keep, (name, key)) in mask.iter_mut().zip(names.iter().zip(keys)) {
                *keep = *keep
                    && match (name, key) {
                        (Some(name), Some(key)) => request.wants(name, &key),
                        _ => false,
                    };
            }
        }
        Ok(table.filter(&row_mask(&mask))?)
    }
}

//! The remote ledger of genuine serial numbers.
//!
//! Fetched, decoded and schema-resolved fresh for every verification request;
//! nothing here is cached across requests.

pub mod fetch;
pub mod parse;
pub mod schema;

use serde::Serialize;

pub use fetch::LedgerFetcher;
pub use parse::{decode_sheet, RawSheet, SourceType};
pub use schema::{resolve_columns, ColumnMap, ResolvedColumn};

use crate::error::VerifyError;

/// One ledger record, projected onto the resolved columns.
#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct LedgerRow {
    /// Serial exactly as authored in the sheet.
    pub serial: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    /// Every original cell, unused by matching.
    #[serde(skip)]
    pub cells: Vec<String>,
}

/// A decoded sheet together with the column identities resolved for it.
#[derive(Debug, Clone)]
pub struct Ledger {
    pub sheet_name: String,
    pub columns: ColumnMap,
    pub rows: Vec<LedgerRow>,
}

impl Ledger {
    /// Resolve the schema of a decoded sheet and project its rows.
    ///
    /// Rows with a blank serial cell are dropped: they can never match.
    pub fn from_sheet(sheet: RawSheet) -> Result<Self, VerifyError> {
        let columns = resolve_columns(&sheet.headers)?;

        let cell = |cells: &[String], col: &Option<ResolvedColumn>| -> Option<String> {
            col.as_ref()
                .and_then(|c| cells.get(c.index))
                .map(|v| v.trim().to_string())
                .filter(|v| !v.is_empty())
        };

        let rows = sheet
            .rows
            .into_iter()
            .filter_map(|cells| {
                let serial = cells.get(columns.serial.index)?.clone();
                if serial.trim().is_empty() {
                    return None;
                }
                Some(LedgerRow {
                    name: cell(&cells, &columns.name),
                    description: cell(&cells, &columns.description),
                    serial,
                    cells,
                })
            })
            .collect();

        Ok(Self {
            sheet_name: sheet.name,
            columns,
            rows,
        })
    }

    pub fn len(&self) -> usize {
        self.rows.len()
    }
}

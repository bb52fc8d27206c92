//! Heuristic discovery of the serial / name / description columns.
//!
//! Ledger maintainers rename columns freely, in English or Arabic, so each
//! semantic field has a ranked alias list checked in three passes:
//! exact name, case-insensitive name, then substring keywords.

use serde::Serialize;
use tracing::{debug, info};

use crate::error::VerifyError;

pub const SERIAL_ALIASES: &[&str] = &[
    "SerialNumber",
    "Serial Number",
    "Serial_Number",
    "Serial No",
    "Serial",
    "SN",
    "S/N",
    "الرقم التسلسلي",
    "رقم تسلسلي",
    "الرقم",
    "رقم",
];
const SERIAL_KEYWORDS: &[&str] = &["serial", "رقم"];

pub const NAME_ALIASES: &[&str] = &[
    "ProductName",
    "Product Name",
    "Product_Name",
    "Product",
    "Name",
    "اسم المنتج",
    "المنتج",
    "الاسم",
    "اسم",
];
const NAME_KEYWORDS: &[&str] = &["name", "product", "اسم", "منتج"];

pub const DESCRIPTION_ALIASES: &[&str] = &[
    "Description",
    "ProductDescription",
    "Product Description",
    "Code",
    "Product Code",
    "الوصف",
    "وصف",
    "الكود",
    "الرمز",
];
const DESCRIPTION_KEYWORDS: &[&str] = &["desc", "code", "وصف", "كود", "رمز"];

/// A header resolved to a semantic field.
#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct ResolvedColumn {
    /// Header text after trimming.
    pub name: String,
    pub index: usize,
    /// Which pass found it: `exact`, `case_insensitive` or `substring`.
    pub pass: &'static str,
}

/// Column identities for one fetched ledger.
#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct ColumnMap {
    pub serial: ResolvedColumn,
    pub name: Option<ResolvedColumn>,
    pub description: Option<ResolvedColumn>,
}

/// Trim surrounding whitespace (and a stray BOM); case and script are kept.
pub fn normalize_header(header: &str) -> String {
    header.trim_matches(|c: char| c.is_whitespace() || c == '\u{feff}').to_string()
}

/// Resolve all three fields. Only the serial column is mandatory.
///
/// A column claimed by an earlier field is not offered to later ones, so a
/// "Product Serial" header cannot become both serial and name.
pub fn resolve_columns(headers: &[String]) -> Result<ColumnMap, VerifyError> {
    let normalized: Vec<String> = headers.iter().map(|h| normalize_header(h)).collect();

    let serial = resolve(&normalized, SERIAL_ALIASES, SERIAL_KEYWORDS, &[])
        .ok_or_else(|| VerifyError::SchemaUnresolved(normalized.clone()))?;

    let name = resolve(&normalized, NAME_ALIASES, NAME_KEYWORDS, &[serial.index]);

    let mut claimed = vec![serial.index];
    claimed.extend(name.as_ref().map(|c| c.index));
    let description = resolve(&normalized, DESCRIPTION_ALIASES, DESCRIPTION_KEYWORDS, &claimed);

    info!(
        "Resolved ledger columns: serial={:?} name={:?} description={:?}",
        serial.name,
        name.as_ref().map(|c| &c.name),
        description.as_ref().map(|c| &c.name)
    );

    Ok(ColumnMap {
        serial,
        name,
        description,
    })
}

/// Three-pass lookup. First successful pass wins; within a pass the first
/// alias (or keyword) in rank order wins.
pub fn resolve(
    headers: &[String],
    aliases: &[&str],
    keywords: &[&str],
    excluded: &[usize],
) -> Option<ResolvedColumn> {
    let available = move || {
        headers
            .iter()
            .enumerate()
            .filter(move |(i, h)| !excluded.contains(i) && !h.is_empty())
    };
    let found = |index: usize, pass: &'static str| {
        debug!("Column '{}' matched by {} pass", headers[index], pass);
        Some(ResolvedColumn {
            name: headers[index].clone(),
            index,
            pass,
        })
    };

    for alias in aliases {
        if let Some((i, _)) = available().find(|(_, h)| h.as_str() == *alias) {
            return found(i, "exact");
        }
    }

    for alias in aliases {
        let alias = alias.to_lowercase();
        if let Some((i, _)) = available().find(|(_, h)| h.to_lowercase() == alias) {
            return found(i, "case_insensitive");
        }
    }

    for keyword in keywords {
        if let Some((i, _)) = available().find(|(_, h)| h.to_lowercase().contains(*keyword)) {
            return found(i, "substring");
        }
    }

    None
}

#[cfg(test)]
mod tests {
    use super::*;

    fn headers(hs: &[&str]) -> Vec<String> {
        hs.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn test_exact_pass() {
        let map = resolve_columns(&headers(&["Name", "SerialNumber", "Description"])).unwrap();
        assert_eq!(map.serial.index, 1);
        assert_eq!(map.serial.pass, "exact");
        assert_eq!(map.name.unwrap().index, 0);
        assert_eq!(map.description.unwrap().index, 2);
    }

    #[test]
    fn test_whitespace_is_trimmed_case_kept() {
        let map = resolve_columns(&headers(&["  Serial Number \t", "x"])).unwrap();
        assert_eq!(map.serial.name, "Serial Number");
        assert_eq!(map.serial.pass, "exact");
    }

    #[test]
    fn test_case_insensitive_pass() {
        let map = resolve_columns(&headers(&["SERIALNUMBER", "product name"])).unwrap();
        assert_eq!(map.serial.pass, "case_insensitive");
        assert_eq!(map.name.unwrap().pass, "case_insensitive");
    }

    #[test]
    fn test_substring_pass() {
        let map = resolve_columns(&headers(&["Model", "Unit serial #", "Item code"])).unwrap();
        assert_eq!(map.serial.index, 1);
        assert_eq!(map.serial.pass, "substring");
        assert_eq!(map.description.unwrap().name, "Item code");
        assert!(map.name.is_none());
    }

    #[test]
    fn test_arabic_headers() {
        let map = resolve_columns(&headers(&["اسم المنتج", "الرقم التسلسلي", "الوصف"])).unwrap();
        assert_eq!(map.serial.name, "الرقم التسلسلي");
        assert_eq!(map.serial.pass, "exact");
        assert_eq!(map.name.unwrap().index, 0);
        assert_eq!(map.description.unwrap().index, 2);
    }

    #[test]
    fn test_arabic_substring_fallback() {
        let map = resolve_columns(&headers(&["رقم الجهاز"])).unwrap();
        assert_eq!(map.serial.pass, "substring");
    }

    #[test]
    fn test_alias_rank_beats_column_order() {
        // "Serial" appears first, but "SerialNumber" ranks higher.
        let map = resolve_columns(&headers(&["Serial", "SerialNumber"])).unwrap();
        assert_eq!(map.serial.index, 1);
    }

    #[test]
    fn test_claimed_column_not_reused() {
        let map = resolve_columns(&headers(&["Product Serial"])).unwrap();
        assert_eq!(map.serial.index, 0);
        assert!(map.name.is_none());
    }

    #[test]
    fn test_unresolved_serial() {
        let err = resolve_columns(&headers(&["Model", "Price"])).unwrap_err();
        match err {
            VerifyError::SchemaUnresolved(hs) => assert_eq!(hs, vec!["Model", "Price"]),
            other => panic!("unexpected {:?}", other),
        }
    }
}

//! Ledger decoding for legacy Excel (.xls), modern Excel (.xlsx) and CSV exports.
//!
//! The byte format of the remote sheet is not under our control, so every
//! decoder is tried in turn and the first one that yields a sheet with data
//! wins. When all fail, every attempted error is reported together.

use std::io::{Cursor, Read, Seek};

use anyhow::{Context, Result};
use calamine::{open_workbook_from_rs, Data, Reader, Xls, Xlsx};
use serde::Serialize;
use tracing::{debug, info, warn};

use crate::error::VerifyError;

/// Decoder that produced the sheet.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum SourceType {
    Xls,
    Xlsx,
    Csv,
}

/// Raw decoded sheet before schema resolution.
#[derive(Debug, Clone)]
pub struct RawSheet {
    pub name: String,
    pub headers: Vec<String>,
    pub rows: Vec<Vec<String>>,
    pub source_type: SourceType,
}

/// Decode ledger bytes, trying each decoder in order.
pub fn decode_sheet(data: &[u8]) -> Result<RawSheet, VerifyError> {
    let decoders: [(&str, fn(&[u8]) -> Result<RawSheet>); 3] = [
        ("xls", parse_xls),
        ("xlsx", parse_xlsx),
        ("csv", parse_csv),
    ];

    let mut errors = Vec::new();
    for (name, decode) in decoders {
        match decode(data) {
            Ok(sheet) => {
                info!(
                    "Decoded ledger as {} (sheet '{}', {} columns, {} rows)",
                    name,
                    sheet.name,
                    sheet.headers.len(),
                    sheet.rows.len()
                );
                return Ok(sheet);
            }
            Err(e) => {
                debug!("Decoder {} rejected ledger: {:#}", name, e);
                errors.push(format!("{}: {:#}", name, e));
            }
        }
    }

    warn!("All ledger decoders failed: {:?}", errors);
    Err(VerifyError::UnparsableLedger(errors))
}

fn parse_xls(data: &[u8]) -> Result<RawSheet> {
    let workbook: Xls<_> =
        open_workbook_from_rs(Cursor::new(data)).context("Failed to open legacy Excel workbook")?;
    first_sheet_with_data(workbook, SourceType::Xls)
}

fn parse_xlsx(data: &[u8]) -> Result<RawSheet> {
    let workbook: Xlsx<_> =
        open_workbook_from_rs(Cursor::new(data)).context("Failed to open Excel workbook")?;
    first_sheet_with_data(workbook, SourceType::Xlsx)
}

/// The ledger lives on the first worksheet that has a header row and data.
fn first_sheet_with_data<R, RS>(mut workbook: R, source_type: SourceType) -> Result<RawSheet>
where
    RS: Read + Seek,
    R: Reader<RS>,
{
    let sheet_names: Vec<String> = workbook.sheet_names().to_vec();

    for name in &sheet_names {
        let range = match workbook.worksheet_range(name) {
            Ok(r) => r,
            Err(e) => {
                warn!("Skipping sheet '{}': {:?}", name, e);
                continue;
            }
        };

        if let Some(sheet) = range_to_raw_sheet(name, &range, source_type) {
            return Ok(sheet);
        }
    }

    anyhow::bail!("No sheets with data found in workbook ({} sheets)", sheet_names.len())
}

/// Convert a calamine Range into a RawSheet. First row = headers.
fn range_to_raw_sheet(name: &str, range: &calamine::Range<Data>, source_type: SourceType) -> Option<RawSheet> {
    let mut row_iter = range.rows();

    let headers: Vec<String> = row_iter.next()?.iter().map(cell_to_string).collect();
    if headers.iter().all(|h| h.trim().is_empty()) {
        return None;
    }

    let rows: Vec<Vec<String>> = row_iter
        .map(|row| row.iter().map(cell_to_string).collect::<Vec<_>>())
        .filter(|values| !values.iter().all(|v| v.trim().is_empty()))
        .collect();

    if rows.is_empty() {
        return None;
    }

    Some(RawSheet {
        name: name.to_string(),
        headers,
        rows,
        source_type,
    })
}

/// Render a cell the way a person reading the sheet would type it.
/// Numeric serials must not pick up a trailing ".0".
fn cell_to_string(cell: &Data) -> String {
    match cell {
        Data::Empty => String::new(),
        Data::String(s) => s.clone(),
        Data::Int(i) => i.to_string(),
        Data::Float(f) => format_number(*f),
        Data::Bool(b) => b.to_string(),
        Data::DateTime(dt) => format_number(dt.as_f64()),
        Data::DateTimeIso(s) => s.clone(),
        Data::DurationIso(s) => s.clone(),
        Data::Error(e) => format!("#ERR:{:?}", e),
    }
}

fn format_number(f: f64) -> String {
    if f.fract() == 0.0 && f.abs() < i64::MAX as f64 {
        format!("{}", f as i64)
    } else {
        format!("{}", f)
    }
}

// ============================================================================
// CSV exports
// ============================================================================

/// Parse a CSV export, detecting text encoding and delimiter.
fn parse_csv(data: &[u8]) -> Result<RawSheet> {
    let text = decode_text(data)?;
    let head: String = text.trim_start().chars().take(15).collect::<String>().to_lowercase();
    if head.starts_with("<!doctype") || head.starts_with("<html") {
        anyhow::bail!("Received an HTML page instead of a spreadsheet (is the sheet shared publicly?)");
    }

    let delimiter = sniff_delimiter(&text);
    debug!("CSV delimiter: {:?}", delimiter as char);

    let mut reader = csv::ReaderBuilder::new()
        .flexible(true)
        .has_headers(true)
        .delimiter(delimiter)
        .from_reader(text.as_bytes());

    let headers: Vec<String> = reader
        .headers()
        .context("Failed to read CSV headers")?
        .iter()
        .map(|h| h.to_string())
        .collect();

    if headers.iter().all(|h| h.trim().is_empty()) {
        anyhow::bail!("CSV file has no headers");
    }

    let mut rows = Vec::new();
    for result in reader.records() {
        let record = result.context("Failed to read CSV record")?;
        let row: Vec<String> = record.iter().map(|f| f.to_string()).collect();
        if row.iter().all(|v| v.trim().is_empty()) {
            continue;
        }
        rows.push(row);
    }

    if rows.is_empty() {
        anyhow::bail!("CSV file has no data rows");
    }

    Ok(RawSheet {
        name: "csv".to_string(),
        headers,
        rows,
        source_type: SourceType::Csv,
    })
}

/// UTF-8 (with or without BOM) or BOM-marked UTF-16. Anything else is rejected.
fn decode_text(data: &[u8]) -> Result<String> {
    if let Some(rest) = data.strip_prefix(&[0xEF, 0xBB, 0xBF]) {
        return String::from_utf8(rest.to_vec()).context("Invalid UTF-8 after BOM");
    }
    if let Some(rest) = data.strip_prefix(&[0xFF, 0xFE]) {
        return decode_utf16(rest, u16::from_le_bytes);
    }
    if let Some(rest) = data.strip_prefix(&[0xFE, 0xFF]) {
        return decode_utf16(rest, u16::from_be_bytes);
    }

    let text = std::str::from_utf8(data).context("Not valid UTF-8 text")?;
    if text.contains('\0') {
        anyhow::bail!("Text contains NUL bytes, not a CSV export");
    }
    Ok(text.to_string())
}

fn decode_utf16(data: &[u8], to_unit: fn([u8; 2]) -> u16) -> Result<String> {
    if data.len() % 2 != 0 {
        anyhow::bail!("Odd byte count for UTF-16 text");
    }
    let units: Vec<u16> = data.chunks_exact(2).map(|c| to_unit([c[0], c[1]])).collect();
    String::from_utf16(&units).context("Invalid UTF-16 text")
}

/// Pick the delimiter that splits the header line into the most fields.
fn sniff_delimiter(text: &str) -> u8 {
    let first_line = text.lines().find(|l| !l.trim().is_empty()).unwrap_or("");
    [b',', b';', b'\t', b'|']
        .into_iter()
        .map(|d| (d, first_line.matches(d as char).count()))
        .fold((b',', 0), |best, cur| if cur.1 > best.1 { cur } else { best })
        .0
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_csv_basic() {
        let sheet = decode_sheet(b"SerialNumber,Name,Description\nLGQM3WQF9Z,TV,55-inch\n").unwrap();
        assert_eq!(sheet.source_type, SourceType::Csv);
        assert_eq!(sheet.headers, vec!["SerialNumber", "Name", "Description"]);
        assert_eq!(sheet.rows, vec![vec!["LGQM3WQF9Z", "TV", "55-inch"]]);
    }

    #[test]
    fn test_parse_csv_semicolon_and_bom() {
        let mut data = vec![0xEF, 0xBB, 0xBF];
        data.extend_from_slice("الرقم التسلسلي;الاسم\n505KRWZ35633;ثلاجة\n".as_bytes());
        let sheet = decode_sheet(&data).unwrap();
        assert_eq!(sheet.headers, vec!["الرقم التسلسلي", "الاسم"]);
        assert_eq!(sheet.rows[0], vec!["505KRWZ35633", "ثلاجة"]);
    }

    #[test]
    fn test_parse_csv_utf16() {
        let text = "Serial\tName\nABC12345\tTV\n";
        let mut data = vec![0xFF, 0xFE];
        for unit in text.encode_utf16() {
            data.extend_from_slice(&unit.to_le_bytes());
        }
        let sheet = decode_sheet(&data).unwrap();
        assert_eq!(sheet.headers, vec!["Serial", "Name"]);
        assert_eq!(sheet.rows[0], vec!["ABC12345", "TV"]);
    }

    #[test]
    fn test_parse_csv_flexible_and_blank_rows() {
        let sheet = decode_sheet(b"a,b,c\n1,2,3\n,,\n4,5\n").unwrap();
        assert_eq!(sheet.rows.len(), 2);
        assert_eq!(sheet.rows[1], vec!["4", "5"]);
    }

    #[test]
    fn test_garbage_reports_every_decoder() {
        let err = decode_sheet(&[0x00, 0x9F, 0x92, 0x96, 0xFF, 0x00, 0x13]).unwrap_err();
        match err {
            VerifyError::UnparsableLedger(errors) => {
                assert_eq!(errors.len(), 3);
                assert!(errors[0].starts_with("xls:"));
                assert!(errors[1].starts_with("xlsx:"));
                assert!(errors[2].starts_with("csv:"));
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_html_login_page_is_rejected() {
        let err = decode_sheet(b"<!DOCTYPE html><html><body>Sign in</body></html>\n<p>x</p>").unwrap_err();
        assert!(matches!(err, VerifyError::UnparsableLedger(_)));
    }

    #[test]
    fn test_header_only_is_rejected() {
        assert!(decode_sheet(b"SerialNumber,Name\n").is_err());
    }

    #[test]
    fn test_format_number() {
        assert_eq!(format_number(12345678.0), "12345678");
        assert_eq!(format_number(1.5), "1.5");
    }

    #[test]
    fn test_sniff_delimiter() {
        assert_eq!(sniff_delimiter("a;b;c\n1;2;3"), b';');
        assert_eq!(sniff_delimiter("a\tb\n"), b'\t');
        assert_eq!(sniff_delimiter("single\n"), b',');
    }
}

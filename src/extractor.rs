//! Row extraction from CSV/TXT and XLSX/XLSM files.
//!
//! Text files have no declared encoding, so decoding walks an ordered list of
//! candidate encodings and keeps the first one that decodes (and parses)
//! cleanly. This is a heuristic: a single-byte encoding accepts any input, so
//! the first single-byte candidate in the list ends the search.

use calamine::{open_workbook_from_rs, Data, DataType, Reader, Xlsx};
use encoding_rs::{Encoding, UTF_8, WINDOWS_1256};
use sha2::{Digest, Sha256};
use std::io::Cursor;
use std::path::Path;

use crate::errors::ImportError;

const UTF8_BOM: &[u8] = b"\xEF\xBB\xBF";

/// Rows read from one file, in file order.
#[derive(Debug, Clone, PartialEq)]
pub struct ExtractedRows {
    pub rows: Vec<Vec<String>>,
    /// Whether `rows[0]` is a header row.
    pub has_header: bool,
    /// Encoding used to decode the file (`xlsx` for workbooks).
    pub encoding: String,
    /// Hex SHA-256 of the raw file bytes.
    pub file_sha256: String,
}

impl ExtractedRows {
    pub fn header(&self) -> Option<&[String]> {
        if self.has_header {
            self.rows.first().map(Vec::as_slice)
        } else {
            None
        }
    }

    pub fn data_rows(&self) -> &[Vec<String>] {
        if self.has_header {
            self.rows.get(1..).unwrap_or(&[])
        } else {
            &self.rows
        }
    }
}

/// Supported input formats, chosen by file extension.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FileFormat {
    Delimited,
    Workbook,
}

impl FileFormat {
    pub fn from_path(path: &Path) -> Result<Self, ImportError> {
        let ext = path
            .extension()
            .and_then(|e| e.to_str())
            .map(|e| e.to_ascii_lowercase())
            .unwrap_or_default();

        match ext.as_str() {
            "csv" | "txt" => Ok(FileFormat::Delimited),
            "xlsx" | "xlsm" => Ok(FileFormat::Workbook),
            _ => Err(ImportError::UnsupportedFormat(path.display().to_string())),
        }
    }
}

/// One candidate text encoding.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TextEncoding {
    /// UTF-8 prefixed by a byte order mark; fails when the mark is absent.
    Utf8Sig,
    Named(&'static Encoding),
}

impl TextEncoding {
    pub fn from_label(label: &str) -> Option<Self> {
        let label = label.trim().to_ascii_lowercase();
        if label == "utf-8-sig" || label == "utf8-sig" {
            return Some(TextEncoding::Utf8Sig);
        }
        Encoding::for_label(label.as_bytes())
            .or_else(|| Encoding::for_label(label.replace('-', "").as_bytes()))
            .map(TextEncoding::Named)
    }

    pub fn name(&self) -> &'static str {
        match self {
            TextEncoding::Utf8Sig => "utf-8-sig",
            TextEncoding::Named(encoding) => encoding.name(),
        }
    }

    /// Strict decode: malformed input is an error, never a replacement char.
    pub fn decode(&self, bytes: &[u8]) -> Result<String, String> {
        let (encoding, body) = match self {
            TextEncoding::Utf8Sig => match bytes.strip_prefix(UTF8_BOM) {
                Some(body) => (UTF_8, body),
                None => return Err("missing UTF-8 byte order mark".to_string()),
            },
            TextEncoding::Named(encoding) => (*encoding, bytes),
        };

        encoding
            .decode_without_bom_handling_and_without_replacement(body)
            .map(|text| text.into_owned())
            .ok_or_else(|| format!("input is not valid {}", self.name()))
    }
}

/// Ordered candidate encodings for text files.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EncodingStrategy {
    candidates: Vec<TextEncoding>,
}

impl Default for EncodingStrategy {
    /// BOM-marked UTF-8, plain UTF-8, then the Arabic-script code page.
    ///
    /// A single-byte code page maps every byte, so the first one listed is
    /// the terminal candidate and nothing after it is ever tried. Western
    /// exports need `latin1` configured in place of `cp1256`.
    fn default() -> Self {
        Self {
            candidates: vec![
                TextEncoding::Utf8Sig,
                TextEncoding::Named(UTF_8),
                TextEncoding::Named(WINDOWS_1256),
            ],
        }
    }
}

impl EncodingStrategy {
    pub fn new(candidates: Vec<TextEncoding>) -> Self {
        Self { candidates }
    }

    /// Build from labels such as `utf-8-sig, utf-8, cp1256, latin1`.
    pub fn from_labels<S: AsRef<str>>(labels: &[S]) -> Result<Self, String> {
        let candidates = labels
            .iter()
            .map(|label| {
                TextEncoding::from_label(label.as_ref())
                    .ok_or_else(|| format!("unknown encoding label '{}'", label.as_ref()))
            })
            .collect::<Result<Vec<_>, _>>()?;

        if candidates.is_empty() {
            return Err("at least one encoding is required".to_string());
        }
        Ok(Self { candidates })
    }

    pub fn candidates(&self) -> &[TextEncoding] {
        &self.candidates
    }

    /// Decode and split delimited text with the first candidate that works.
    pub fn read_delimited(&self, bytes: &[u8]) -> Result<(Vec<Vec<String>>, &'static str), ImportError> {
        let mut last_err = String::from("no candidate encodings configured");

        for candidate in &self.candidates {
            let parsed = candidate.decode(bytes).and_then(|text| parse_delimited(&text));
            match parsed {
                Ok(rows) => {
                    tracing::debug!("Decoded file as {}", candidate.name());
                    return Ok((rows, candidate.name()));
                }
                Err(e) => {
                    tracing::debug!("Encoding {} rejected: {}", candidate.name(), e);
                    last_err = e;
                }
            }
        }

        Err(ImportError::Decode(last_err))
    }
}

fn parse_delimited(text: &str) -> Result<Vec<Vec<String>>, String> {
    let mut reader = csv::ReaderBuilder::new()
        .has_headers(false)
        .flexible(true)
        .trim(csv::Trim::All)
        .from_reader(text.as_bytes());

    let mut rows = Vec::new();
    for record in reader.records() {
        let record = record.map_err(|e| e.to_string())?;
        let row: Vec<String> = record.iter().map(str::to_string).collect();
        if row.iter().all(|cell| cell.is_empty()) {
            continue;
        }
        rows.push(row);
    }
    Ok(rows)
}

/// Decides whether the first row is a header by looking for known column
/// name fragments.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HeaderDetector {
    fragments: Vec<String>,
}

impl Default for HeaderDetector {
    fn default() -> Self {
        Self::new(["NATIONAL", "CARD", "FULL", "BIRTH", "MOBILE"])
    }
}

impl HeaderDetector {
    pub fn new<I, S>(fragments: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        Self {
            fragments: fragments
                .into_iter()
                .map(|f| f.as_ref().to_uppercase())
                .collect(),
        }
    }

    pub fn is_header(&self, row: &[String]) -> bool {
        row.iter().any(|cell| {
            let cell = cell.to_uppercase();
            self.fragments.iter().any(|fragment| cell.contains(fragment))
        })
    }
}

/// Opens an import file and yields its raw rows.
#[derive(Debug, Clone, Default)]
pub struct RowExtractor {
    encodings: EncodingStrategy,
    headers: HeaderDetector,
}

impl RowExtractor {
    pub fn new(encodings: EncodingStrategy, headers: HeaderDetector) -> Self {
        Self { encodings, headers }
    }

    /// Read every row of the file. Blocking; run it off the async runtime.
    pub fn extract(&self, path: &Path) -> Result<ExtractedRows, ImportError> {
        let format = FileFormat::from_path(path)?;
        let bytes = std::fs::read(path).map_err(|source| ImportError::FileRead {
            path: path.display().to_string(),
            source,
        })?;
        self.extract_bytes(format, &bytes)
    }

    pub fn extract_bytes(&self, format: FileFormat, bytes: &[u8]) -> Result<ExtractedRows, ImportError> {
        let file_sha256 = hex::encode(Sha256::digest(bytes));

        let (rows, encoding) = match format {
            FileFormat::Delimited => {
                let (rows, encoding) = self.encodings.read_delimited(bytes)?;
                (rows, encoding.to_string())
            }
            FileFormat::Workbook => (read_workbook(bytes)?, "xlsx".to_string()),
        };

        let has_header = rows
            .first()
            .map(|first| self.headers.is_header(first))
            .unwrap_or(false);

        Ok(ExtractedRows {
            rows,
            has_header,
            encoding,
            file_sha256,
        })
    }
}

fn read_workbook(bytes: &[u8]) -> Result<Vec<Vec<String>>, ImportError> {
    let mut workbook: Xlsx<_> = open_workbook_from_rs(Cursor::new(bytes))
        .map_err(|e| ImportError::Decode(format!("unable to read workbook: {}", e)))?;

    let sheet_name = workbook
        .sheet_names()
        .first()
        .cloned()
        .ok_or_else(|| ImportError::Decode("workbook has no sheets".to_string()))?;

    let range = workbook
        .worksheet_range(&sheet_name)
        .map_err(|e| ImportError::Decode(format!("unable to read sheet '{}': {}", sheet_name, e)))?;

    Ok(range
        .rows()
        .map(|cells| cells.iter().map(render_cell).collect::<Vec<String>>())
        .filter(|row| row.iter().any(|cell| !cell.is_empty()))
        .collect())
}

/// Text form of a spreadsheet cell as it would appear in a CSV export.
pub(crate) fn render_cell(cell: &Data) -> String {
    match cell {
        Data::Empty => String::new(),
        Data::String(s) => s.trim().to_string(),
        // Integral floats are card numbers and national codes; keep all digits.
        Data::Float(f) if f.fract() == 0.0 => format!("{:.0}", f),
        Data::DateTime(_) | Data::DateTimeIso(_) => cell
            .as_date()
            .map(|d| d.format("%Y-%m-%d").to_string())
            .unwrap_or_else(|| cell.to_string()),
        other => other.to_string().trim().to_string(),
    }
}

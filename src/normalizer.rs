//! Row normalization for identity import files.
//!
//! Every function here is pure: one raw row in, either a canonical
//! [`NormalizedRecord`] or a [`SkipReason`] out. The consumer aggregates the
//! skip reasons into per-chunk counts; nothing here touches the database.

use chrono::NaiveDate;
use encoding_rs::WINDOWS_1252;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::sync::LazyLock;

const NATIONAL_CODE_LEN: usize = 10;
const CARD_NUMBER_LEN: usize = 16;
const MAX_PHONE_LEN: usize = 15;

/// Characters produced when UTF-8 Arabic-script or accented Latin text is
/// decoded as a Western single-byte encoding.
const MOJIBAKE_MARKERS: &[char] = &['Ø', 'Ù', 'Ú', 'Û', 'Ð', 'Ñ', 'Ã', 'Â'];

static SCIENTIFIC_NOTATION: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^[+-]?(\d+\.?\d*|\.\d+)[eE][+-]?\d+$").expect("valid scientific notation regex")
});

/// Why a row was excluded from persistence.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum SkipReason {
    /// National code missing or not exactly 10 digits.
    BadNationalCode,
    /// Card number longer than 16 digits after normalization.
    BadCardNumber,
}

/// A validated, canonical row ready to be upserted.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NormalizedRecord {
    pub national_code: String,
    /// `None` when the row carried no usable card.
    pub card_number: Option<String>,
    pub first_name: String,
    pub last_name: Option<String>,
    pub birthdate: Option<NaiveDate>,
    pub phone_numbers: Vec<String>,
}

/// Skip tally for a chunk.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SkipCounts {
    pub bad_national_code: u32,
    pub bad_card_number: u32,
}

impl SkipCounts {
    pub fn record(&mut self, reason: SkipReason) {
        match reason {
            SkipReason::BadNationalCode => self.bad_national_code += 1,
            SkipReason::BadCardNumber => self.bad_card_number += 1,
        }
    }

    pub fn total(&self) -> u32 {
        self.bad_national_code + self.bad_card_number
    }
}

/// Result of normalizing every row of one chunk.
#[derive(Debug, Clone, Default)]
pub struct NormalizedChunk {
    pub records: Vec<NormalizedRecord>,
    pub skips: SkipCounts,
    pub rows_total: u32,
}

/// Normalize one positional row: national code, card number, full name,
/// birth date, mobile. Missing trailing fields count as empty.
pub fn normalize_row(fields: &[String]) -> Result<NormalizedRecord, SkipReason> {
    let field = |idx: usize| fields.get(idx).map(String::as_str).unwrap_or("");

    let national_code = normalize_national_code(field(0)).ok_or(SkipReason::BadNationalCode)?;

    let card = normalize_card_number(field(1));
    if card.len() > CARD_NUMBER_LEN {
        return Err(SkipReason::BadCardNumber);
    }
    let card_number = if card.len() == CARD_NUMBER_LEN {
        Some(card)
    } else {
        if !card.is_empty() {
            tracing::debug!(
                "Dropping short card number ({} digits) for national code {}",
                card.len(),
                national_code
            );
        }
        None
    };

    Ok(NormalizedRecord {
        national_code,
        card_number,
        first_name: repair_mojibake(field(2).trim()),
        // Full names are not split; the family name stays empty.
        last_name: None,
        birthdate: parse_birthdate(field(3)),
        phone_numbers: normalize_mobile(field(4)),
    })
}

/// Normalize a whole chunk, tallying skipped rows instead of failing.
pub fn normalize_chunk<I>(rows: I) -> NormalizedChunk
where
    I: IntoIterator<Item = Vec<String>>,
{
    let mut chunk = NormalizedChunk::default();
    for (idx, row) in rows.into_iter().enumerate() {
        chunk.rows_total += 1;
        match normalize_row(&row) {
            Ok(record) => chunk.records.push(record),
            Err(reason) => {
                tracing::debug!("Skipping row {} of chunk: {:?}", idx, reason);
                chunk.skips.record(reason);
            }
        }
    }
    chunk
}

/// Trimmed national code, or `None` unless it is exactly 10 ASCII digits.
pub fn normalize_national_code(raw: &str) -> Option<String> {
    let code = raw.trim();
    if code.len() == NATIONAL_CODE_LEN && code.bytes().all(|b| b.is_ascii_digit()) {
        Some(code.to_string())
    } else {
        None
    }
}

/// Digits of a card number.
///
/// Values in scientific notation (spreadsheets turn long numbers into
/// `6.03799E+15`) are first rendered as a zero-padded 16-digit integer.
pub fn normalize_card_number(raw: &str) -> String {
    let value = raw.trim();
    let expanded = if SCIENTIFIC_NOTATION.is_match(value) {
        match value.parse::<f64>() {
            Ok(num) if num.is_finite() && num >= 0.0 => format!("{:016.0}", num.round()),
            _ => value.to_string(),
        }
    } else {
        value.to_string()
    };
    expanded.chars().filter(|c| c.is_ascii_digit()).collect()
}

/// Best-effort repair of UTF-8 text that was decoded as Windows-1252.
///
/// Text without the telltale marker characters, or that does not survive the
/// round trip, is returned unchanged.
pub fn repair_mojibake(raw: &str) -> String {
    if !raw.contains(MOJIBAKE_MARKERS) {
        return raw.to_string();
    }

    let (bytes, _, had_unmappable) = WINDOWS_1252.encode(raw);
    if had_unmappable {
        return raw.to_string();
    }

    match String::from_utf8(bytes.into_owned()) {
        Ok(repaired) => repaired.trim().to_string(),
        Err(_) => raw.to_string(),
    }
}

/// `YYYY-MM-DD` (or `YYYY/MM/DD`) birth date; anything else yields `None`.
pub fn parse_birthdate(raw: &str) -> Option<NaiveDate> {
    let value = raw.trim().replace('/', "-");
    if value.is_empty() {
        return None;
    }
    NaiveDate::parse_from_str(&value, "%Y-%m-%d").ok()
}

/// Split a `|`-separated mobile field into normalized numbers.
pub fn normalize_mobile(raw: &str) -> Vec<String> {
    let mut numbers: Vec<String> = Vec::new();
    for candidate in raw.split('|') {
        if let Some(number) = normalize_phone(candidate) {
            if !numbers.contains(&number) {
                numbers.push(number);
            }
        }
    }
    numbers
}

/// Digits of one phone number, prefixed with `0` unless it already starts
/// with one.
pub fn normalize_phone(raw: &str) -> Option<String> {
    let digits: String = raw.chars().filter(|c| c.is_ascii_digit()).collect();
    if digits.is_empty() {
        return None;
    }

    let number = if digits.starts_with('0') {
        digits
    } else {
        format!("0{}", digits)
    };
    if number.len() > MAX_PHONE_LEN {
        tracing::debug!("Dropping phone number longer than {} digits", MAX_PHONE_LEN);
        return None;
    }
    Some(number)
}

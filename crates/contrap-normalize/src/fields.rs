//! Scalar field parsers. Each returns `None` when the input cannot be read;
//! the caller decides which warning that becomes.

use std::str::FromStr;

use chrono::{DateTime, NaiveDate, NaiveDateTime};
use contrap_core::entity::TaxId;
use rust_decimal::Decimal;

const DATE_FORMATS: &[&str] =
  &["%d/%m/%Y", "%Y-%m-%d", "%d-%m-%Y", "%Y/%m/%d", "%d.%m.%Y"];

const DATETIME_FORMATS: &[&str] = &[
  "%Y-%m-%dT%H:%M:%S",
  "%Y-%m-%dT%H:%M:%S%.f",
  "%Y-%m-%d %H:%M:%S",
  "%d/%m/%Y %H:%M:%S",
];

pub fn parse_date(s: &str) -> Option<NaiveDate> {
  let s = s.trim();
  DATE_FORMATS
    .iter()
    .find_map(|f| NaiveDate::parse_from_str(s, f).ok())
    .or_else(|| {
      DATETIME_FORMATS
        .iter()
        .find_map(|f| NaiveDateTime::parse_from_str(s, f).ok())
        .map(|dt| dt.date())
    })
    .or_else(|| DateTime::parse_from_rfc3339(s).ok().map(|dt| dt.date_naive()))
}

/// Monetary amounts. Currency symbols and whitespace are stripped; both
/// `1.234.567,89` and `1,234,567.89` are understood, as is a lone decimal
/// comma (`1234,5`).
pub fn parse_amount(s: &str) -> Option<Decimal> {
  let cleaned: String = s
    .chars()
    .filter(|c| !c.is_whitespace() && !matches!(c, '€' | '$' | '£'))
    .collect();
  if cleaned.is_empty() {
    return None;
  }

  let normalized = match (cleaned.rfind(','), cleaned.rfind('.')) {
    (Some(comma), Some(dot)) if comma > dot => {
      cleaned.replace('.', "").replace(',', ".")
    }
    (Some(_), Some(_)) => cleaned.replace(',', ""),
    (Some(comma), None) => {
      let decimals = cleaned.len() - comma - 1;
      if cleaned.matches(',').count() == 1 && decimals <= 2 {
        cleaned.replace(',', ".")
      } else {
        cleaned.replace(',', "")
      }
    }
    (None, Some(_)) if cleaned.matches('.').count() > 1 => {
      cleaned.replace('.', "")
    }
    _ => cleaned,
  };

  Decimal::from_str(&normalized).ok()
}

/// A submission window such as `"30"`, `"30 dias"` or `"1 dia"`.
pub fn parse_day_count(s: &str) -> Option<u32> {
  let lower = s.trim().to_lowercase();
  let digits = lower
    .strip_suffix("dias")
    .or_else(|| lower.strip_suffix("dia"))
    .unwrap_or(&lower)
    .trim();
  digits.parse().ok()
}

/// An execution period converted to days: `"90 dias"`, `"12 meses"`,
/// `"2 anos"`, `"3 semanas"`. A bare number is read as days.
pub fn parse_period_days(s: &str) -> Option<u32> {
  let lower = s.trim().to_lowercase();
  let start = lower.find(|c: char| c.is_ascii_digit())?;
  let digits: String = lower[start..]
    .chars()
    .take_while(char::is_ascii_digit)
    .collect();
  let n: u32 = digits.parse().ok()?;
  let unit = &lower[start + digits.len()..];
  let factor = if unit.contains("ano") {
    365
  } else if unit.contains("mes") || unit.contains("mês") {
    30
  } else if unit.contains("semana") {
    7
  } else {
    1
  };
  n.checked_mul(factor)
}

pub fn parse_flag(s: &str) -> Option<bool> {
  match s.trim().to_lowercase().as_str() {
    "true" | "sim" | "s" | "yes" | "y" | "1" => Some(true),
    "false" | "não" | "nao" | "n" | "no" | "0" => Some(false),
    _ => None,
  }
}

pub fn parse_year(s: &str) -> Option<i32> {
  s.trim().parse().ok().filter(|y| (1900..=9999).contains(y))
}

/// Format validation, plus the mod-11 checksum when `strict`.
pub fn parse_tax_id(s: &str, strict: bool) -> Option<TaxId> {
  TaxId::parse(s).filter(|id| !strict || id.has_valid_check_digit())
}

//! Parsers for the string-encoded list entries the upstream uses for
//! categories and parties.

use contrap_core::{entity::TaxId, procurement::CodedCategory};

use crate::fields::parse_tax_id;

// ─── Categories ──────────────────────────────────────────────────────────────

/// `"45210000-2 - Construção de edifícios"`, `"45210000 Construção"`,
/// `"45210000-2"`. Falls back to the first eight-digit run anywhere in the
/// string, without a description.
pub fn parse_category(s: &str) -> Option<CodedCategory> {
  let s = s.trim();
  if let Some(cat) = parse_leading_category(s) {
    return Some(cat);
  }
  let bytes = s.as_bytes();
  (0..bytes.len()).find_map(|i| {
    let run = digit_run(&bytes[i..]);
    let preceded_by_digit = i > 0 && bytes[i - 1].is_ascii_digit();
    (run == CodedCategory::CODE_LEN && !preceded_by_digit).then(|| CodedCategory {
      code:        s[i..i + CodedCategory::CODE_LEN].to_owned(),
      check_digit: None,
      description: None,
    })
  })
}

fn digit_run(bytes: &[u8]) -> usize {
  bytes.iter().take_while(|b| b.is_ascii_digit()).count()
}

fn parse_leading_category(s: &str) -> Option<CodedCategory> {
  if digit_run(s.as_bytes()) != CodedCategory::CODE_LEN {
    return None;
  }
  let (code, mut rest) = s.split_at(CodedCategory::CODE_LEN);

  let mut check_digit = None;
  let rb = rest.as_bytes();
  if rb.len() >= 2
    && rb[0] == b'-'
    && rb[1].is_ascii_digit()
    && rb.get(2).is_none_or(|b| !b.is_ascii_digit())
  {
    check_digit = Some(rb[1] - b'0');
    rest = &rest[2..];
  }

  let rest = rest.trim_start();
  let rest = rest
    .strip_prefix('-')
    .or_else(|| rest.strip_prefix('–'))
    .unwrap_or(rest)
    .trim();

  Some(CodedCategory {
    code: code.to_owned(),
    check_digit,
    description: (!rest.is_empty()).then(|| rest.to_owned()),
  })
}

// ─── Parties ─────────────────────────────────────────────────────────────────

/// An organisation named in a party list.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Party {
  pub tax_id: TaxId,
  pub name:   Option<String>,
}

/// `"512021155-Empresa"`, `"512021155 - Empresa"`, `"Empresa (512021155)"`,
/// `"Empresa - 512021155"`, or a standalone nine-digit identifier anywhere in
/// the text. Entries without a usable identifier give `None`.
pub fn parse_party(s: &str, strict: bool) -> Option<Party> {
  let s = s.trim();
  leading_id(s, strict)
    .or_else(|| parenthesised_id(s, strict))
    .or_else(|| trailing_id(s, strict))
    .or_else(|| embedded_id(s, strict))
}

fn name_of(s: &str) -> Option<String> {
  let s = s.trim().trim_matches(|c| c == '-' || c == ',').trim();
  (!s.is_empty()).then(|| s.to_owned())
}

fn leading_id(s: &str, strict: bool) -> Option<Party> {
  let head = s.get(..9)?;
  let tax_id = parse_tax_id(head, strict)?;
  let rest = s[9..].trim_start();
  if !rest.is_empty() && !rest.starts_with('-') {
    return None;
  }
  Some(Party { tax_id, name: name_of(rest.strip_prefix('-').unwrap_or(rest)) })
}

fn parenthesised_id(s: &str, strict: bool) -> Option<Party> {
  let inner = s.strip_suffix(')')?;
  let open = inner.rfind('(')?;
  let tax_id = parse_tax_id(&inner[open + 1..], strict)?;
  Some(Party { tax_id, name: name_of(&inner[..open]) })
}

fn trailing_id(s: &str, strict: bool) -> Option<Party> {
  let (name, id) = s.rsplit_once('-')?;
  let tax_id = parse_tax_id(id, strict)?;
  Some(Party { tax_id, name: name_of(name) })
}

fn embedded_id(s: &str, strict: bool) -> Option<Party> {
  let bytes = s.as_bytes();
  let mut i = 0;
  while i < bytes.len() {
    let run = digit_run(&bytes[i..]);
    if run == 9 {
      let candidate = &s[i..i + 9];
      if let Some(tax_id) = parse_tax_id(candidate, strict) {
        let name = format!("{} {}", &s[..i], &s[i + 9..]);
        let name = name.split_whitespace().collect::<Vec<_>>().join(" ");
        return Some(Party { tax_id, name: name_of(&name) });
      }
    }
    i += run.max(1);
  }
  None
}

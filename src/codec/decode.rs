use std::{collections::BTreeMap, str::FromStr, sync::OnceLock};

use quick_xml::{events::Event, Reader};
use regex::{Captures, Regex};
use rust_decimal::Decimal;
use serde::Serialize;
use tallybridge_core::LedgerMaster;

use super::CodecError;

const ENVELOPE_OPEN: &str = "<ENVELOPE>";
const ENVELOPE_CLOSE: &str = "</ENVELOPE>";

fn char_ref_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| Regex::new(r"&#([xX][0-9A-Fa-f]+|[0-9]+);").expect("valid char ref pattern"))
}

fn is_allowed_char(c: char) -> bool {
    matches!(c as u32, 0x09 | 0x0A | 0x0D | 0x20..=0x7E | 0xA0..=0xD7FF | 0xE000..=0xFFFD)
}

fn is_allowed_code_point(code: u32) -> bool {
    matches!(code, 0x09 | 0x0A | 0x0D | 0x20..=0xD7FF | 0xE000..=0xFFFD)
}

/// Cleans a raw engine response down to the bare `ENVELOPE` element.
///
/// Character references are resolved in a single pass, so an escaped
/// reference such as `&#38;#65;` comes out as `&#65;` and would only become
/// `A` on a second call. Idempotence holds for envelopes without such
/// nested references.
pub fn decode(text: &str) -> Result<String, CodecError> {
    let filtered: String = text.chars().filter(|c| is_allowed_char(*c)).collect();

    let resolved = char_ref_pattern().replace_all(&filtered, |caps: &Captures| {
        let raw = &caps[1];
        let code = match raw.strip_prefix('x').or_else(|| raw.strip_prefix('X')) {
            Some(hex) => u32::from_str_radix(hex, 16).ok(),
            None => raw.parse::<u32>().ok(),
        };
        code.filter(|c| is_allowed_code_point(*c))
            .and_then(char::from_u32)
            .map(String::from)
            .unwrap_or_default()
    });

    let start = resolved
        .find(ENVELOPE_OPEN)
        .ok_or_else(|| CodecError::Parse("response contains no ENVELOPE".to_string()))?;
    let end = resolved
        .rfind(ENVELOPE_CLOSE)
        .filter(|end| *end >= start)
        .ok_or_else(|| CodecError::Parse("response ENVELOPE is not closed".to_string()))?;
    Ok(resolved[start..end + ENVELOPE_CLOSE.len()].to_string())
}

/// True when the engine flagged at least one line of an import as bad.
/// Must be checked on the raw response, before cleaning.
pub fn is_rejected(raw: &str) -> bool {
    raw.contains("LINEERROR")
}

/// Text of the `RESULT` element of a function export.
pub fn read_function_result(envelope: &str) -> Result<String, CodecError> {
    let mut reader = Reader::from_str(envelope);
    reader.trim_text(true);
    let mut inside = false;
    let mut result = String::new();
    loop {
        match reader.read_event() {
            Ok(Event::Start(e)) if e.name().as_ref() == b"RESULT" => inside = true,
            Ok(Event::Text(t)) if inside => {
                let text = t.unescape().map_err(|e| CodecError::Parse(e.to_string()))?;
                result.push_str(&text);
            }
            Ok(Event::End(e)) if e.name().as_ref() == b"RESULT" => {
                return Ok(result.trim().to_string());
            }
            Ok(Event::Eof) => return Err(CodecError::Parse("no RESULT element in response".to_string())),
            Ok(_) => {}
            Err(e) => return Err(CodecError::Parse(e.to_string())),
        }
    }
}

/// Reads every `COLLECTION/<item_tag>` element into a ledger.
///
/// A strict pass is tried first. If it fails, a lenient pass that ignores
/// mismatched end tags runs and keeps whatever it read before the first error
/// it cannot step over.
pub fn read_collection(envelope: &str, item_tag: &str) -> Result<Vec<LedgerMaster>, CodecError> {
    match collect_items(envelope, item_tag, true) {
        (items, None) => Ok(items),
        (_, Some(strict_err)) => {
            tracing::warn!(error = %strict_err, "Strict parse of collection failed, retrying in recovery mode");
            match collect_items(envelope, item_tag, false) {
                (items, None) => Ok(items),
                (items, Some(e)) if !items.is_empty() => {
                    tracing::warn!(error = %e, kept = items.len(), "Recovery parse stopped early");
                    Ok(items)
                }
                (_, Some(e)) => Err(CodecError::Parse(e)),
            }
        }
    }
}

#[derive(Default)]
struct ItemBuilder {
    name_attr: Option<String>,
    fields: BTreeMap<String, String>,
    current: Option<(String, String)>,
}

impl ItemBuilder {
    fn finish(mut self) -> Option<LedgerMaster> {
        let name = self
            .name_attr
            .or_else(|| self.fields.remove("LEDGERNAME"))
            .map(|n| n.trim().to_string())
            .filter(|n| !n.is_empty())?;
        self.fields.remove("LEDGERNAME");
        let parent = self.fields.remove("PARENT").unwrap_or_default();
        let closing_balance = self
            .fields
            .remove("CLOSINGBALANCE")
            .and_then(|b| Decimal::from_str(b.trim()).ok());
        Some(LedgerMaster {
            name,
            parent,
            closing_balance,
            fields: self.fields,
        })
    }
}

fn collect_items(envelope: &str, item_tag: &str, strict: bool) -> (Vec<LedgerMaster>, Option<String>) {
    let mut reader = Reader::from_str(envelope);
    reader.trim_text(true);
    reader.check_end_names(strict);

    let item_tag = item_tag.to_ascii_uppercase();
    let mut items = Vec::new();
    let mut stack: Vec<String> = Vec::new();
    let mut item: Option<(usize, ItemBuilder)> = None;

    loop {
        let event = match reader.read_event() {
            Ok(ev) => ev,
            Err(e) => return (items, Some(e.to_string())),
        };
        match event {
            Event::Start(e) => {
                let tag = String::from_utf8_lossy(e.name().as_ref()).to_string();
                match item.as_mut() {
                    None if tag == item_tag && stack.last().map(String::as_str) == Some("COLLECTION") => {
                        let mut builder = ItemBuilder::default();
                        if let Ok(Some(attr)) = e.try_get_attribute("NAME") {
                            builder.name_attr = attr.unescape_value().ok().map(|v| v.to_string());
                        }
                        item = Some((stack.len(), builder));
                    }
                    Some((depth, builder)) if stack.len() == *depth + 1 => {
                        builder.current = Some((tag.clone(), String::new()));
                    }
                    _ => {}
                }
                stack.push(tag);
            }
            Event::Text(t) => {
                if let Some((_, builder)) = item.as_mut() {
                    if let Some((_, text)) = builder.current.as_mut() {
                        match t.unescape() {
                            Ok(s) => text.push_str(&s),
                            Err(e) if strict => return (items, Some(e.to_string())),
                            Err(_) => text.push_str(&String::from_utf8_lossy(&t)),
                        }
                    }
                }
            }
            Event::End(_) => {
                stack.pop();
                let closes_item = matches!(&item, Some((depth, _)) if stack.len() == *depth);
                if closes_item {
                    if let Some((_, builder)) = item.take() {
                        if let Some(ledger) = builder.finish() {
                            items.push(ledger);
                        }
                    }
                } else if let Some((depth, builder)) = item.as_mut() {
                    if stack.len() == *depth + 1 {
                        if let Some((tag, text)) = builder.current.take() {
                            builder.fields.insert(tag, text.trim().to_string());
                        }
                    }
                }
            }
            Event::Eof => {
                if strict && !stack.is_empty() {
                    return (items, Some(format!("unclosed element {}", stack.join("/"))));
                }
                return (items, None);
            }
            _ => {}
        }
    }
}

/// Counters the engine reports after an import. Best effort: missing
/// counters read as zero.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ImportSummary {
    pub created: u32,
    pub altered: u32,
    pub errors: u32,
    pub exceptions: u32,
    pub line_errors: Vec<String>,
}

impl ImportSummary {
    pub fn read(envelope: &str) -> Self {
        ImportSummary {
            created: counter(envelope, "CREATED"),
            altered: counter(envelope, "ALTERED"),
            errors: counter(envelope, "ERRORS"),
            exceptions: counter(envelope, "EXCEPTIONS"),
            line_errors: line_errors(envelope),
        }
    }
}

fn counter(envelope: &str, tag: &str) -> u32 {
    let open = format!("<{}>", tag);
    let close = format!("</{}>", tag);
    envelope
        .find(&open)
        .and_then(|start| {
            let rest = &envelope[start + open.len()..];
            rest.find(&close).map(|end| &rest[..end])
        })
        .and_then(|v| v.trim().parse().ok())
        .unwrap_or(0)
}

fn line_errors(envelope: &str) -> Vec<String> {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    let re = PATTERN.get_or_init(|| Regex::new(r"(?s)<LINEERROR>(.*?)</LINEERROR>").expect("valid LINEERROR pattern"));
    re.captures_iter(envelope)
        .map(|c| c[1].trim().to_string())
        .filter(|s| !s.is_empty())
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    const NOISY: &str = "Tally.ERP 9 Server\u{1}\u{7}\r\n<ENVELOPE><BODY><DATA><COLLECTION>\
        <LEDGER NAME=\"HDFC&#32;Current\"><PARENT>Bank Accounts</PARENT><CLOSINGBALANCE>-1520.75</CLOSINGBALANCE></LEDGER>\
        <LEDGER NAME=\"Rent\"><PARENT>Indirect Expenses</PARENT>&#4;</LEDGER>\
        </COLLECTION></DATA></BODY></ENVELOPE>\n-- trailing log line --";

    #[test]
    fn decode_keeps_only_the_envelope() {
        let cleaned = decode(NOISY).unwrap();
        assert!(cleaned.starts_with("<ENVELOPE>"));
        assert!(cleaned.ends_with("</ENVELOPE>"));
        assert!(!cleaned.contains('\u{1}'));
        assert!(cleaned.contains("HDFC Current"));
        assert!(!cleaned.contains("&#4;"));
    }

    #[test]
    fn decode_is_idempotent() {
        let once = decode(NOISY).unwrap();
        assert_eq!(decode(&once).unwrap(), once);
    }

    #[test]
    fn nested_char_refs_resolve_one_level_per_call() {
        let once = decode("<ENVELOPE>&#38;#65;</ENVELOPE>").unwrap();
        assert_eq!(once, "<ENVELOPE>&#65;</ENVELOPE>");
        assert_eq!(decode(&once).unwrap(), "<ENVELOPE>A</ENVELOPE>");
    }

    #[test]
    fn decode_without_envelope_fails() {
        assert!(matches!(decode("Tally is starting up"), Err(CodecError::Parse(_))));
        assert!(matches!(decode("</ENVELOPE> then <ENVELOPE>"), Err(CodecError::Parse(_))));
    }

    #[test]
    fn rejection_is_read_from_raw_text() {
        assert!(is_rejected("<RESPONSE><LINEERROR>Ledger 'Fuel' does not exist!</LINEERROR></RESPONSE>"));
        assert!(!is_rejected("<ENVELOPE><CREATED>1</CREATED></ENVELOPE>"));
    }

    #[test]
    fn reads_ledger_collection() {
        let ledgers = read_collection(&decode(NOISY).unwrap(), "Ledger").unwrap();
        assert_eq!(ledgers.len(), 2);
        assert_eq!(ledgers[0].name, "HDFC Current");
        assert!(ledgers[0].is_bank_account());
        assert_eq!(ledgers[0].closing_balance, Decimal::from_str("-1520.75").ok());
        assert_eq!(ledgers[1].parent, "Indirect Expenses");
        assert_eq!(ledgers[1].closing_balance, None);
    }

    #[test]
    fn recovery_pass_tolerates_mismatched_end_tags() {
        let broken = "<ENVELOPE><COLLECTION>\
            <LEDGER NAME=\"Cash\"><PARENT>Cash-in-Hand</PARNT></LEDGER>\
            <LEDGER NAME=\"Sales\"><PARENT>Sales Accounts</PARENT></LEDGER>\
            </COLLECTION></ENVELOPE>";
        let ledgers = read_collection(broken, "LEDGER").unwrap();
        let names: Vec<_> = ledgers.iter().map(|l| l.name.as_str()).collect();
        assert_eq!(names, vec!["Cash", "Sales"]);
        assert_eq!(ledgers[0].parent, "Cash-in-Hand");
    }

    #[test]
    fn reads_function_result() {
        let envelope = "<ENVELOPE><HEADER><VERSION>1</VERSION><STATUS>1</STATUS></HEADER>\
            <BODY><DATA><RESULT TYPE=\"String\">Acme Traders</RESULT></DATA></BODY></ENVELOPE>";
        assert_eq!(read_function_result(envelope).unwrap(), "Acme Traders");
        assert!(read_function_result("<ENVELOPE></ENVELOPE>").is_err());
    }

    #[test]
    fn summary_counts_are_best_effort() {
        let envelope = "<ENVELOPE><HEADER><VERSION>1</VERSION></HEADER><BODY><DATA><IMPORTRESULT>\
            <CREATED>2</CREATED><ALTERED>0</ALTERED><ERRORS>1</ERRORS>\
            <LINEERROR>Voucher totals do not match!</LINEERROR></IMPORTRESULT></DATA></BODY></ENVELOPE>";
        let summary = ImportSummary::read(envelope);
        assert_eq!(summary.created, 2);
        assert_eq!(summary.errors, 1);
        assert_eq!(summary.exceptions, 0);
        assert_eq!(summary.line_errors, vec!["Voucher totals do not match!".to_string()]);
    }
}

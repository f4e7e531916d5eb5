//! CSV recipient ingestion: turns an uploaded contact sheet into campaign
//! recipients, reporting unusable rows instead of rejecting the whole file.

use tracing::{debug, info};

use crate::error::IngestError;
use crate::types::NewRecipient;

const PHONE_HEADERS: [&str; 3] = ["phone", "number", "phonenumber"];

/// Outcome of a CSV import.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct IngestReport {
    pub recipients: Vec<NewRecipient>,
    pub warnings: Vec<String>,
}

/// Parse recipients from CSV text with a header row.
///
/// The phone column is the first header matching `phone`, `number` or
/// `phonenumber` (case-insensitive); an optional `name` column fills the
/// recipient name. Quoted fields may span lines; warnings cite the line a
/// row starts on.
pub fn parse_recipients_csv(input: &str) -> Result<IngestReport, IngestError> {
    let mut rows = split_records(input)
        .into_iter()
        .filter(|(_, fields)| !is_blank(fields));

    let (_, header_fields) = rows.next().ok_or(IngestError::Empty)?;
    let headers: Vec<String> = header_fields
        .into_iter()
        .map(|h| h.trim().trim_start_matches('\u{feff}').to_ascii_lowercase())
        .collect();

    let phone_idx = headers
        .iter()
        .position(|h| PHONE_HEADERS.contains(&h.as_str()))
        .ok_or(IngestError::MissingPhoneColumn)?;
    let name_idx = headers.iter().position(|h| h == "name");

    let mut report = IngestReport::default();
    for (line_no, fields) in rows {
        let phone = fields
            .get(phone_idx)
            .map(|p| normalize_phone(p))
            .unwrap_or_default();

        if phone.is_empty() {
            report
                .warnings
                .push(format!("Row {}: no phone number, skipped", line_no));
            continue;
        }

        let name = name_idx
            .and_then(|i| fields.get(i))
            .map(|n| n.trim())
            .filter(|n| !n.is_empty());
        report.recipients.push(NewRecipient::new(phone, name));
    }

    if report.recipients.is_empty() {
        return Err(IngestError::NoValidRows {
            warnings: report.warnings.len(),
        });
    }

    debug!(skipped = report.warnings.len(), "CSV rows skipped");
    info!(recipients = report.recipients.len(), "Recipients imported from CSV");
    Ok(report)
}

/// Strip whitespace, hyphens and parentheses from a phone value.
pub fn normalize_phone(raw: &str) -> String {
    raw.chars()
        .filter(|c| !c.is_whitespace() && !matches!(c, '-' | '(' | ')'))
        .collect()
}

/// Split CSV text into records of fields, honouring double-quoted fields,
/// `""` escapes and line breaks inside quotes. Each record carries the
/// 1-based line it starts on.
fn split_records(input: &str) -> Vec<(usize, Vec<String>)> {
    let mut records = Vec::new();
    let mut fields = Vec::new();
    let mut current = String::new();
    let mut in_quotes = false;
    let mut line = 1;
    let mut record_line = 1;
    let mut chars = input.chars().peekable();

    while let Some(c) = chars.next() {
        match c {
            '"' if in_quotes && chars.peek() == Some(&'"') => {
                current.push('"');
                chars.next();
            }
            '"' => in_quotes = !in_quotes,
            ',' if !in_quotes => fields.push(std::mem::take(&mut current)),
            '\r' if !in_quotes && chars.peek() == Some(&'\n') => {}
            '\n' if !in_quotes => {
                fields.push(std::mem::take(&mut current));
                records.push((record_line, std::mem::take(&mut fields)));
                line += 1;
                record_line = line;
            }
            '\n' => {
                current.push(c);
                line += 1;
            }
            _ => current.push(c),
        }
    }
    if !current.is_empty() || !fields.is_empty() {
        fields.push(current);
        records.push((record_line, fields));
    }
    records
}

fn is_blank(fields: &[String]) -> bool {
    fields.len() == 1 && fields[0].trim().is_empty()
}

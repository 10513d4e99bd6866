//! CSV export and import of captions
//!
//! Format: header `id,path,promptType,captionText`, RFC 4180 quoting,
//! UTF-8, CRLF row terminators on export (LF or CRLF accepted on import).
//!
//! Import is all-or-nothing at the structural level: the whole file is
//! parsed and validated before the first record is touched.

use crate::error::{CoreError, CoreResult};
use crate::models::ExportRow;
use crate::store::CaptionStore;
use annoforge_common::atomic_file::write_atomic;
use annoforge_common::events::AnnotationEvent;
use chrono::Utc;
use serde::Serialize;
use std::path::Path;
use tracing::{info, warn};

pub const CSV_HEADER: [&str; 4] = ["id", "path", "promptType", "captionText"];

const BOM: char = '\u{feff}';

/// Outcome of [`import_csv`]
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ImportReport {
    /// Records whose caption or prompt type changed
    pub updated: Vec<String>,
    /// Rows identical to the current record
    pub unchanged: Vec<String>,
    /// Ids with no record; never created
    pub not_found: Vec<String>,
    /// Caption file write failed: `(id, error)`
    pub failed: Vec<(String, String)>,
}

/// Write every record, in snapshot order; returns the row count
pub fn export_csv(store: &CaptionStore, path: &Path) -> CoreResult<usize> {
    let rows: Vec<ExportRow> = store.snapshot().iter().map(|r| r.to_export_row()).collect();
    let contents = encode(&rows);

    write_atomic(path, contents.as_bytes()).map_err(|e| CoreError::io(path, e))?;

    info!(path = %path.display(), rows = rows.len(), "Captions exported");
    store.event_bus().emit_lossy(AnnotationEvent::CsvExported {
        path: path.to_path_buf(),
        rows: rows.len(),
        timestamp: Utc::now(),
    });
    Ok(rows.len())
}

/// Apply captions and prompt types from a CSV file to existing records
///
/// Fails with [`CoreError::MalformedCsv`] and changes nothing if the file
/// does not parse, has the wrong header or names an unknown prompt type.
pub fn import_csv(store: &CaptionStore, path: &Path) -> CoreResult<ImportReport> {
    let text = std::fs::read_to_string(path).map_err(|e| CoreError::io(path, e))?;
    let rows = decode(&text, store)?;

    let mut report = ImportReport::default();
    for row in rows {
        let current = match store.get(&row.id) {
            Some(record) => record,
            None => {
                report.not_found.push(row.id);
                continue;
            }
        };

        let mut changed = false;
        if current.prompt_type != row.prompt_type {
            store.set_prompt_type(std::slice::from_ref(&row.id), &row.prompt_type)?;
            changed = true;
        }
        if current.caption_text != row.caption_text || current.dirty {
            if let Err(e) = store.edit_caption(&row.id, &row.caption_text) {
                warn!(image_id = %row.id, error = %e, "Imported caption not written");
                report.failed.push((row.id, e.to_string()));
                continue;
            }
            changed = true;
        }

        if changed {
            report.updated.push(row.id);
        } else {
            report.unchanged.push(row.id);
        }
    }

    info!(
        path = %path.display(),
        updated = report.updated.len(),
        unchanged = report.unchanged.len(),
        not_found = report.not_found.len(),
        failed = report.failed.len(),
        "Captions imported"
    );
    store.event_bus().emit_lossy(AnnotationEvent::CsvImported {
        path: path.to_path_buf(),
        updated: report.updated.len(),
        not_found: report.not_found.len(),
        timestamp: Utc::now(),
    });
    Ok(report)
}

fn encode(rows: &[ExportRow]) -> String {
    let mut out = String::new();
    push_record(&mut out, CSV_HEADER.iter().copied());
    for row in rows {
        push_record(
            &mut out,
            [
                row.id.as_str(),
                row.path.as_str(),
                row.prompt_type.as_str(),
                row.caption_text.as_str(),
            ],
        );
    }
    out
}

fn push_record<'a>(out: &mut String, fields: impl IntoIterator<Item = &'a str>) {
    for (i, field) in fields.into_iter().enumerate() {
        if i > 0 {
            out.push(',');
        }
        push_field(out, field);
    }
    out.push_str("\r\n");
}

fn push_field(out: &mut String, field: &str) {
    if field.contains(&[',', '"', '\r', '\n'][..]) {
        out.push('"');
        out.push_str(&field.replace('"', "\"\""));
        out.push('"');
    } else {
        out.push_str(field);
    }
}

/// Validated import row; `prompt_type` is the canonical id
#[derive(Debug)]
struct ImportRow {
    id: String,
    prompt_type: String,
    caption_text: String,
}

fn decode(text: &str, store: &CaptionStore) -> CoreResult<Vec<ImportRow>> {
    let text = text.strip_prefix(BOM).unwrap_or(text);
    let mut records = parse_records(text)?.into_iter();

    let (header_line, header) = records.next().ok_or_else(|| CoreError::MalformedCsv {
        line: 1,
        message: "missing header".to_string(),
    })?;
    if header != CSV_HEADER {
        return Err(CoreError::MalformedCsv {
            line: header_line,
            message: format!("expected header {}", CSV_HEADER.join(",")),
        });
    }

    let mut rows = Vec::new();
    for (line, fields) in records {
        let [id, _path, prompt_type, caption_text]: [String; 4] =
            fields.try_into().map_err(|fields: Vec<String>| CoreError::MalformedCsv {
                line,
                message: format!("expected {} fields, found {}", CSV_HEADER.len(), fields.len()),
            })?;
        if id.is_empty() {
            return Err(CoreError::MalformedCsv {
                line,
                message: "empty id".to_string(),
            });
        }
        let prompt = store
            .registry()
            .resolve(&prompt_type)
            .map_err(|_| CoreError::MalformedCsv {
                line,
                message: format!("unknown prompt type '{}'", prompt_type),
            })?;
        rows.push(ImportRow {
            id,
            prompt_type: prompt.id.clone(),
            caption_text,
        });
    }
    Ok(rows)
}

/// Split RFC 4180 text into records, each tagged with its starting line
///
/// Blank lines between records are ignored.
fn parse_records(text: &str) -> CoreResult<Vec<(usize, Vec<String>)>> {
    let mut records = Vec::new();
    let mut fields: Vec<String> = Vec::new();
    let mut field = String::new();
    let mut line = 1;
    let mut record_line = 1;
    let mut in_quotes = false;
    // Current field was quoted and its closing quote has been seen
    let mut closed_quote = false;
    let mut chars = text.chars().peekable();

    let malformed = |line: usize, message: &str| CoreError::MalformedCsv {
        line,
        message: message.to_string(),
    };

    while let Some(c) = chars.next() {
        if in_quotes {
            match c {
                '"' if chars.peek() == Some(&'"') => {
                    chars.next();
                    field.push('"');
                }
                '"' => {
                    in_quotes = false;
                    closed_quote = true;
                }
                '\n' => {
                    line += 1;
                    field.push(c);
                }
                _ => field.push(c),
            }
            continue;
        }

        match c {
            ',' => {
                fields.push(std::mem::take(&mut field));
                closed_quote = false;
            }
            '\r' if chars.peek() == Some(&'\n') => {}
            '\n' => {
                fields.push(std::mem::take(&mut field));
                closed_quote = false;
                let is_blank = fields.len() == 1 && fields[0].is_empty();
                let record = std::mem::take(&mut fields);
                if !is_blank {
                    records.push((record_line, record));
                }
                line += 1;
                record_line = line;
            }
            '"' if field.is_empty() && !closed_quote => in_quotes = true,
            '"' => return Err(malformed(line, "unexpected quote in field")),
            _ if closed_quote => return Err(malformed(line, "text after closing quote")),
            _ => field.push(c),
        }
    }

    if in_quotes {
        return Err(malformed(record_line, "unterminated quoted field"));
    }
    if !field.is_empty() || !fields.is_empty() || closed_quote {
        fields.push(field);
        records.push((record_line, fields));
    }
    Ok(records)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fields(text: &str) -> Vec<Vec<String>> {
        parse_records(text)
            .unwrap()
            .into_iter()
            .map(|(_, f)| f)
            .collect()
    }

    #[test]
    fn test_push_field_quotes_only_when_needed() {
        let mut out = String::new();
        push_field(&mut out, "plain");
        out.push('|');
        push_field(&mut out, "a, b");
        out.push('|');
        push_field(&mut out, "say \"hi\"");
        assert_eq!(out, "plain|\"a, b\"|\"say \"\"hi\"\"\"");
    }

    #[test]
    fn test_parse_quoted_newlines_and_quotes() {
        let parsed = fields("a,\"line one\r\nline \"\"two\"\"\",c\r\n");
        assert_eq!(parsed, vec![vec!["a", "line one\r\nline \"two\"", "c"]]);
    }

    #[test]
    fn test_parse_lf_and_missing_final_newline() {
        let parsed = fields("a,b\nc,d");
        assert_eq!(parsed, vec![vec!["a", "b"], vec!["c", "d"]]);
    }

    #[test]
    fn test_parse_empty_fields_and_blank_lines() {
        let parsed = fields("a,,\"\"\n\nb,c,d\n");
        assert_eq!(parsed, vec![vec!["a", "", ""], vec!["b", "c", "d"]]);
    }

    #[test]
    fn test_record_lines_count_embedded_newlines() {
        let records = parse_records("h\n\"x\ny\"\nz\n").unwrap();
        let lines: Vec<usize> = records.iter().map(|(line, _)| *line).collect();
        assert_eq!(lines, vec![1, 2, 4]);
    }

    #[test]
    fn test_unterminated_quote_is_malformed() {
        match parse_records("id\n\"open\n") {
            Err(CoreError::MalformedCsv { line, .. }) => assert_eq!(line, 2),
            other => panic!("Expected MalformedCsv, got {:?}", other),
        }
    }

    #[test]
    fn test_text_after_closing_quote_is_malformed() {
        assert!(matches!(
            parse_records("\"a\"b,c\n"),
            Err(CoreError::MalformedCsv { line: 1, .. })
        ));
    }

    #[test]
    fn test_encode_uses_crlf_and_header() {
        let rows = vec![ExportRow {
            id: "img1.jpg".into(),
            path: "/c/img1.jpg".into(),
            prompt_type: "caption".into(),
            caption_text: "a red car".into(),
        }];
        assert_eq!(
            encode(&rows),
            "id,path,promptType,captionText\r\nimg1.jpg,/c/img1.jpg,caption,a red car\r\n"
        );
    }
}

//! Staged uploads: persisted at submission time, parsed by the import task.

use std::collections::HashSet;
use std::fmt;
use std::path::Path;
use std::time::Duration;

use quick_xml::events::Event;
use quick_xml::Reader;
use rusqlite::{Connection, OptionalExtension};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use uuid::Uuid;

use crate::db;
use crate::error::ImportError;

/// Headers of a normalized XML upload, in column order.
pub const XML_HEADERS: [&str; 4] = ["assignment", "student", "score", "feedback"];
const XML_ROW_ELEMENT: &[u8] = b"result";

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct StagingHandle(String);

impl StagingHandle {
    fn generate() -> Self {
        StagingHandle(Uuid::new_v4().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<String> for StagingHandle {
    fn from(s: String) -> Self {
        StagingHandle(s)
    }
}

impl fmt::Display for StagingHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StagedFormat {
    Csv,
    Xml,
}

impl StagedFormat {
    pub fn as_str(self) -> &'static str {
        match self {
            StagedFormat::Csv => "csv",
            StagedFormat::Xml => "xml",
        }
    }

    fn parse(s: &str) -> Option<Self> {
        match s {
            "csv" => Some(StagedFormat::Csv),
            "xml" => Some(StagedFormat::Xml),
            _ => None,
        }
    }
}

/// Accepts the named separators offered by upload forms or a single character.
pub fn parse_delimiter(name: &str) -> Option<u8> {
    match name.trim().to_ascii_lowercase().as_str() {
        "" | "comma" => Some(b','),
        "semicolon" => Some(b';'),
        "tab" => Some(b'\t'),
        "colon" => Some(b':'),
        "pipe" => Some(b'|'),
        other => {
            let bytes = other.as_bytes();
            if bytes.len() == 1 && !bytes[0].is_ascii_alphanumeric() && bytes[0] != b'"' {
                Some(bytes[0])
            } else {
                None
            }
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct StagedRow {
    /// Line (CSV) or `<result>` ordinal (XML) as shown to the submitter.
    pub line: usize,
    pub cells: Vec<String>,
}

impl StagedRow {
    pub fn cell(&self, idx: usize) -> &str {
        self.cells.get(idx).map(|s| s.as_str()).unwrap_or("")
    }
}

pub type RowIter<'a> = std::slice::Iter<'a, StagedRow>;

/// A parsed upload. `rows()` can be called any number of times.
#[derive(Debug, Clone)]
pub struct StagedImport {
    format: StagedFormat,
    headers: Vec<String>,
    rows: Vec<StagedRow>,
}

impl StagedImport {
    /// Parse the content staged under `handle` for `course_id`.
    pub fn open(
        conn: &Connection,
        handle: &StagingHandle,
        course_id: &str,
    ) -> Result<Self, ImportError> {
        let found: Option<(String, Option<String>, String)> = conn
            .query_row(
                "SELECT format, delimiter, content FROM staged_imports WHERE handle = ? AND course_id = ?",
                (handle.as_str(), course_id),
                |r| Ok((r.get(0)?, r.get(1)?, r.get(2)?)),
            )
            .optional()?;
        let Some((format, delimiter, content)) = found else {
            return Err(ImportError::StagingNotFound {
                handle: handle.to_string(),
            });
        };
        match StagedFormat::parse(&format) {
            Some(StagedFormat::Csv) => {
                let delimiter = delimiter
                    .as_deref()
                    .and_then(|d| d.as_bytes().first().copied())
                    .unwrap_or(b',');
                Self::parse_csv(&content, delimiter)
            }
            Some(StagedFormat::Xml) => Self::parse_xml(&content),
            None => Err(ImportError::parse(
                "staging",
                format!("unknown staged format {:?}", format),
            )),
        }
    }

    pub fn from_xml_file(path: &Path) -> Result<Self, ImportError> {
        let text = std::fs::read_to_string(path)?;
        Self::parse_xml(&text)
    }

    pub fn parse_csv(text: &str, delimiter: u8) -> Result<Self, ImportError> {
        let text = text.trim_start_matches('\u{feff}');
        let mut rdr = csv::ReaderBuilder::new()
            .delimiter(delimiter)
            .has_headers(true)
            .flexible(true)
            .trim(csv::Trim::All)
            .from_reader(text.as_bytes());

        let headers: Vec<String> = rdr
            .headers()
            .map_err(csv_parse_error)?
            .iter()
            .map(|h| h.to_string())
            .collect();
        if headers.iter().all(|h| h.is_empty()) {
            return Err(ImportError::parse("line 1", "missing header row"));
        }
        let mut seen = HashSet::new();
        for h in &headers {
            if !h.is_empty() && !seen.insert(h.as_str()) {
                return Err(ImportError::parse(
                    "line 1",
                    format!("duplicate column name {:?}", h),
                ));
            }
        }

        let mut rows = Vec::new();
        for result in rdr.records() {
            let record = result.map_err(csv_parse_error)?;
            let line = record
                .position()
                .map(|p| p.line() as usize)
                .unwrap_or(rows.len() + 2);
            if record.iter().all(|c| c.is_empty()) {
                continue;
            }
            if record.len() > headers.len() {
                return Err(ImportError::parse(
                    format!("line {}", line),
                    format!(
                        "row has {} fields but the header has {}",
                        record.len(),
                        headers.len()
                    ),
                ));
            }
            let mut cells: Vec<String> = record.iter().map(|c| c.to_string()).collect();
            cells.resize(headers.len(), String::new());
            rows.push(StagedRow { line, cells });
        }

        Ok(StagedImport {
            format: StagedFormat::Csv,
            headers,
            rows,
        })
    }

    /// `<root><result><assignment/><student/><score/><feedback/></result>...</root>`
    pub fn parse_xml(text: &str) -> Result<Self, ImportError> {
        let mut reader = Reader::from_str(text);
        reader.config_mut().trim_text(true);

        let mut depth = 0usize;
        let mut saw_root = false;
        let mut current: Option<Vec<String>> = None;
        let mut field: Option<usize> = None;
        let mut rows = Vec::new();

        loop {
            let event = reader.read_event().map_err(|e| {
                ImportError::parse(format!("byte {}", reader.error_position()), e.to_string())
            })?;
            match event {
                Event::Start(e) => {
                    depth += 1;
                    let name = e.name();
                    match depth {
                        1 => {
                            if saw_root {
                                return Err(xml_error(&reader, "multiple root elements"));
                            }
                            saw_root = true;
                        }
                        2 => {
                            if name.as_ref() != XML_ROW_ELEMENT {
                                return Err(unexpected_element(&reader, name.as_ref()));
                            }
                            current = Some(vec![String::new(); XML_HEADERS.len()]);
                        }
                        3 => field = xml_field_index(name.as_ref()),
                        _ => {}
                    }
                }
                Event::Empty(e) => {
                    if depth == 0 {
                        if saw_root {
                            return Err(xml_error(&reader, "multiple root elements"));
                        }
                        saw_root = true;
                    } else if depth == 1 {
                        if e.name().as_ref() != XML_ROW_ELEMENT {
                            return Err(unexpected_element(&reader, e.name().as_ref()));
                        }
                        rows.push(StagedRow {
                            line: rows.len() + 1,
                            cells: vec![String::new(); XML_HEADERS.len()],
                        });
                    }
                }
                Event::Text(t) => {
                    if let (Some(cells), Some(idx)) = (current.as_mut(), field) {
                        let value = t.unescape().map_err(|e| {
                            ImportError::parse(format!("byte {}", reader.buffer_position()), e.to_string())
                        })?;
                        cells[idx].push_str(&value);
                    } else if depth == 0 {
                        return Err(xml_error(&reader, "text outside of the root element"));
                    }
                }
                Event::CData(c) => {
                    if let (Some(cells), Some(idx)) = (current.as_mut(), field) {
                        cells[idx].push_str(&String::from_utf8_lossy(&c.into_inner()));
                    }
                }
                Event::End(_) => {
                    match depth {
                        2 => {
                            if let Some(mut cells) = current.take() {
                                for c in cells.iter_mut() {
                                    *c = c.trim().to_string();
                                }
                                rows.push(StagedRow {
                                    line: rows.len() + 1,
                                    cells,
                                });
                            }
                        }
                        3 => field = None,
                        _ => {}
                    }
                    depth = depth.saturating_sub(1);
                }
                Event::Eof => break,
                _ => {}
            }
        }

        if !saw_root {
            return Err(ImportError::parse("byte 0", "missing root element"));
        }
        if depth != 0 {
            return Err(xml_error(&reader, "unexpected end of document"));
        }

        Ok(StagedImport {
            format: StagedFormat::Xml,
            headers: XML_HEADERS.iter().map(|h| h.to_string()).collect(),
            rows,
        })
    }

    pub fn format(&self) -> StagedFormat {
        self.format
    }

    pub fn headers(&self) -> &[String] {
        &self.headers
    }

    pub fn rows(&self) -> RowIter<'_> {
        self.rows.iter()
    }

    pub fn row_count(&self) -> usize {
        self.rows.len()
    }
}

fn csv_parse_error(e: csv::Error) -> ImportError {
    let position = e
        .position()
        .map(|p| format!("line {}", p.line()))
        .unwrap_or_else(|| "unknown position".to_string());
    ImportError::parse(position, e.to_string())
}

fn xml_error(reader: &Reader<&[u8]>, message: impl Into<String>) -> ImportError {
    ImportError::parse(format!("byte {}", reader.buffer_position()), message)
}

fn unexpected_element(reader: &Reader<&[u8]>, name: &[u8]) -> ImportError {
    xml_error(
        reader,
        format!(
            "unexpected element <{}>, expected <result>",
            String::from_utf8_lossy(name)
        ),
    )
}

fn xml_field_index(name: &[u8]) -> Option<usize> {
    XML_HEADERS.iter().position(|h| h.as_bytes() == name)
}

pub fn stage_csv(
    conn: &Connection,
    course_id: &str,
    text: &str,
    delimiter: u8,
) -> Result<StagingHandle, ImportError> {
    stage(conn, course_id, StagedFormat::Csv, Some(delimiter), text)
}

pub fn stage_xml(conn: &Connection, course_id: &str, text: &str) -> Result<StagingHandle, ImportError> {
    stage(conn, course_id, StagedFormat::Xml, None, text)
}

fn stage(
    conn: &Connection,
    course_id: &str,
    format: StagedFormat,
    delimiter: Option<u8>,
    text: &str,
) -> Result<StagingHandle, ImportError> {
    let handle = StagingHandle::generate();
    let digest = format!("{:x}", Sha256::digest(text.as_bytes()));
    let delimiter = delimiter.map(|d| (d as char).to_string());
    conn.execute(
        "INSERT INTO staged_imports(handle, course_id, format, delimiter, content, digest, created_at)
         VALUES(?, ?, ?, ?, ?, ?, ?)",
        (
            handle.as_str(),
            course_id,
            format.as_str(),
            delimiter,
            text,
            &digest,
            db::now_rfc3339(),
        ),
    )?;
    tracing::debug!(handle = %handle, course_id, format = format.as_str(), %digest, "staged upload");
    Ok(handle)
}

pub fn exists(conn: &Connection, handle: &StagingHandle, course_id: &str) -> rusqlite::Result<bool> {
    conn.query_row(
        "SELECT 1 FROM staged_imports WHERE handle = ? AND course_id = ?",
        (handle.as_str(), course_id),
        |r| r.get::<_, i64>(0),
    )
    .optional()
    .map(|v| v.is_some())
}

/// Drop a staged upload once its task has consumed it. Returns whether a row existed.
pub fn consume(conn: &Connection, handle: &StagingHandle) -> rusqlite::Result<bool> {
    let n = conn.execute(
        "DELETE FROM staged_imports WHERE handle = ?",
        [handle.as_str()],
    )?;
    Ok(n > 0)
}

pub fn purge_expired(conn: &Connection, ttl: Duration) -> rusqlite::Result<usize> {
    let ttl = chrono::Duration::from_std(ttl).unwrap_or(chrono::Duration::MAX);
    let cutoff = chrono::Utc::now()
        .checked_sub_signed(ttl)
        .unwrap_or(chrono::DateTime::<chrono::Utc>::MIN_UTC);
    conn.execute(
        "DELETE FROM staged_imports WHERE created_at < ?",
        [db::to_rfc3339(cutoff)],
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn csv_rows_are_replayable_and_padded() {
        let staged =
            StagedImport::parse_csv("student_id,MathQuiz,Notes\n101,85\n\n102,90,late\n", b',')
                .expect("parse");
        assert_eq!(staged.headers(), ["student_id", "MathQuiz", "Notes"]);
        let first: Vec<_> = staged.rows().map(|r| r.cells.clone()).collect();
        let second: Vec<_> = staged.rows().map(|r| r.cells.clone()).collect();
        assert_eq!(first, second);
        assert_eq!(first[0], vec!["101", "85", ""]);
        assert_eq!(staged.rows().nth(1).map(|r| r.line), Some(4));
    }

    #[test]
    fn csv_honours_delimiter_and_bom() {
        let staged = StagedImport::parse_csv("\u{feff}student_id;MathQuiz\n101;85\n", b';')
            .expect("parse");
        assert_eq!(staged.headers()[0], "student_id");
        assert_eq!(staged.row_count(), 1);
    }

    #[test]
    fn csv_rejects_duplicate_headers_and_wide_rows() {
        let dup = StagedImport::parse_csv("a,a\n1,2\n", b',').unwrap_err();
        assert!(matches!(dup, ImportError::Parse { .. }));
        let wide = StagedImport::parse_csv("a,b\n1,2,3\n", b',').unwrap_err();
        match wide {
            ImportError::Parse { position, .. } => assert_eq!(position, "line 2"),
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn xml_results_are_normalized() {
        let staged = StagedImport::parse_xml(
            "<?xml version=\"1.0\"?>
             <results>
               <result>
                 <assignment>MQ1</assignment>
                 <student>S-101</student>
                 <score>85</score>
                 <feedback><![CDATA[Nice & tidy]]></feedback>
               </result>
               <result><assignment>MQ1</assignment><student>S-102</student><score>7&amp;</score></result>
             </results>",
        )
        .expect("parse");
        assert_eq!(staged.format(), StagedFormat::Xml);
        assert_eq!(staged.headers(), XML_HEADERS);
        let rows: Vec<_> = staged.rows().collect();
        assert_eq!(rows.len(), 2);
        assert_eq!(rows[0].cells, vec!["MQ1", "S-101", "85", "Nice & tidy"]);
        assert_eq!(rows[1].cell(2), "7&");
        assert_eq!(rows[1].cell(3), "");
    }

    #[test]
    fn malformed_xml_is_a_parse_error() {
        for bad in [
            "<results><result><score>1</result></results>",
            "<results><result><score>1</score></result>",
            "<results><row/></results><results/>",
            "",
        ] {
            let err = StagedImport::parse_xml(bad).unwrap_err();
            assert!(matches!(err, ImportError::Parse { .. }), "{bad}: {err:?}");
        }
    }

    #[test]
    fn xml_rejects_foreign_row_elements_open_or_empty() {
        for bad in [
            "<results><result><score>1</score></result><row><score>2</score></row></results>",
            "<results><result><score>1</score></result><row/></results>",
            "<results><result/><note/></results>",
        ] {
            let err = StagedImport::parse_xml(bad).unwrap_err();
            let ImportError::Parse { message, .. } = &err else {
                panic!("{bad}: {err:?}");
            };
            assert!(message.contains("expected <result>"), "{bad}: {message}");
        }
        let ok = StagedImport::parse_xml("<results><result/></results>").expect("empty result row");
        assert_eq!(ok.row_count(), 1);
    }

    #[test]
    fn staged_content_round_trips_through_the_database() {
        let conn = db::open_memory().expect("db");
        let handle = stage_csv(&conn, "c1", "student_id,MathQuiz\n101,85\n", b',').expect("stage");
        let staged = StagedImport::open(&conn, &handle, "c1").expect("open");
        assert_eq!(staged.row_count(), 1);

        let other_course = StagedImport::open(&conn, &handle, "c2").unwrap_err();
        assert!(matches!(other_course, ImportError::StagingNotFound { .. }));

        assert!(consume(&conn, &handle).expect("consume"));
        assert!(!consume(&conn, &handle).expect("consume twice"));
        assert!(matches!(
            StagedImport::open(&conn, &handle, "c1").unwrap_err(),
            ImportError::StagingNotFound { .. }
        ));
    }

    #[test]
    fn purge_removes_only_stale_uploads() {
        let conn = db::open_memory().expect("db");
        let fresh = stage_xml(&conn, "c1", "<results/>").expect("stage");
        let stale = stage_xml(&conn, "c1", "<results/>").expect("stage");
        conn.execute(
            "UPDATE staged_imports SET created_at = '2000-01-01T00:00:00.000Z' WHERE handle = ?",
            [stale.as_str()],
        )
        .expect("age");
        assert_eq!(purge_expired(&conn, Duration::from_secs(3600)).expect("purge"), 1);
        assert!(StagedImport::open(&conn, &fresh, "c1").is_ok());
    }

    #[test]
    fn delimiter_names() {
        assert_eq!(parse_delimiter("tab"), Some(b'\t'));
        assert_eq!(parse_delimiter(";"), Some(b';'));
        assert_eq!(parse_delimiter("x"), None);
    }
}

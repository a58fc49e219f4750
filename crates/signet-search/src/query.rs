//! Read-side queries over the search projection.
//!
//! Matching is case-insensitive substring matching on title and creator.
//! Each query term scores 2 for a title hit and 1 for a creator hit;
//! results sort by score, then newest first.

use rusqlite::Connection;
use serde::{Deserialize, Serialize};
use signet_types::DocumentStatus;

use crate::error::SearchError;
use crate::index::{map_projection, PROJECTION_COLUMNS};
use crate::projection::ProjectionDocument;

pub const MAX_PAGE_SIZE: usize = 100;
pub const MAX_SUGGESTIONS: usize = 20;
const MAX_BUCKETS: i64 = 50;

/// Parameters of a full-text search.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct SearchQuery {
    pub q: String,
    pub status: Option<DocumentStatus>,
    pub created_by: Option<String>,
    #[serde(default)]
    pub from: usize,
    #[serde(default = "default_size")]
    pub size: usize,
}

fn default_size() -> usize {
    10
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SearchHit {
    #[serde(flatten)]
    pub document: ProjectionDocument,
    pub score: f64,
    /// Title with matched terms wrapped in `<em>`, when the title matched.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub highlight: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SearchResults {
    pub total: usize,
    pub documents: Vec<SearchHit>,
    pub took_ms: u64,
    pub from: usize,
    pub size: usize,
}

/// Fields that support term aggregations.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AggregationField {
    Status,
    ContentType,
    CreatedBy,
}

impl AggregationField {
    fn column(self) -> &'static str {
        match self {
            Self::Status => "status",
            Self::ContentType => "content_type",
            Self::CreatedBy => "created_by",
        }
    }
}

impl std::str::FromStr for AggregationField {
    type Err = SearchError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "status" => Ok(Self::Status),
            "content_type" => Ok(Self::ContentType),
            "created_by" => Ok(Self::CreatedBy),
            _ => Err(SearchError::InvalidQuery(format!(
                "field must be one of: status, content_type, created_by (got '{s}')"
            ))),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct AggregationBucket {
    pub key: String,
    pub count: i64,
}

fn terms(q: &str) -> Vec<String> {
    q.split_whitespace().map(str::to_lowercase).collect()
}

fn like_pattern(term: &str) -> String {
    let escaped = term
        .replace('\\', "\\\\")
        .replace('%', "\\%")
        .replace('_', "\\_");
    format!("%{escaped}%")
}

/// Builds `(title LIKE ?n ESCAPE '\' OR created_by LIKE ?n ESCAPE '\')`
/// clauses for every term, starting at parameter `first`.
fn match_clause(terms: &[String], first: usize) -> (String, Vec<String>) {
    let clauses: Vec<String> = (0..terms.len())
        .map(|i| {
            let n = first + i;
            format!("title LIKE ?{n} ESCAPE '\\' OR created_by LIKE ?{n} ESCAPE '\\'")
        })
        .collect();
    let patterns = terms.iter().map(|t| like_pattern(t)).collect();
    (format!("({})", clauses.join(" OR ")), patterns)
}

fn score(doc: &ProjectionDocument, terms: &[String]) -> f64 {
    let title = doc.title.to_lowercase();
    let creator = doc.created_by.to_lowercase();
    terms
        .iter()
        .map(|t| {
            let mut s = 0.0;
            if title.contains(t.as_str()) {
                s += 2.0;
            }
            if creator.contains(t.as_str()) {
                s += 1.0;
            }
            s
        })
        .sum()
}

fn highlight(title: &str, terms: &[String]) -> Option<String> {
    // Lowercase per char and keep, for every lowered byte, the index of the
    // title char it came from. Lowercasing can change a char's byte length.
    let chars: Vec<char> = title.chars().collect();
    let mut lower = String::with_capacity(title.len());
    let mut origin = Vec::with_capacity(title.len());
    for (idx, ch) in chars.iter().enumerate() {
        for low in ch.to_lowercase() {
            lower.push(low);
            origin.extend(std::iter::repeat(idx).take(low.len_utf8()));
        }
    }

    let mut marks = vec![false; chars.len()];
    for term in terms {
        for (start, matched) in lower.match_indices(term.as_str()) {
            for &idx in &origin[start..start + matched.len()] {
                marks[idx] = true;
            }
        }
    }
    if !marks.contains(&true) {
        return None;
    }

    let mut out = String::with_capacity(title.len() + 16);
    let mut open = false;
    for (ch, &marked) in chars.iter().zip(&marks) {
        if marked && !open {
            out.push_str("<em>");
            open = true;
        } else if !marked && open {
            out.push_str("</em>");
            open = false;
        }
        out.push(*ch);
    }
    if open {
        out.push_str("</em>");
    }
    Some(out)
}

/// Runs a full-text search with optional filters.
///
/// # Errors
///
/// Returns `SearchError::InvalidQuery` for an empty query or a page size
/// outside `1..=100`.
pub fn search(conn: &Connection, query: &SearchQuery) -> Result<SearchResults, SearchError> {
    let started = std::time::Instant::now();
    let terms = terms(&query.q);
    if terms.is_empty() {
        return Err(SearchError::InvalidQuery("q must not be empty".to_string()));
    }
    if query.size == 0 || query.size > MAX_PAGE_SIZE {
        return Err(SearchError::InvalidQuery(format!(
            "size must be between 1 and {MAX_PAGE_SIZE}"
        )));
    }

    let (matches, mut values) = match_clause(&terms, 1);
    let mut clauses = vec![matches];
    if let Some(status) = query.status {
        values.push(status.as_str().to_string());
        clauses.push(format!("status = ?{}", values.len()));
    }
    if let Some(created_by) = &query.created_by {
        values.push(created_by.clone());
        clauses.push(format!("created_by = ?{}", values.len()));
    }

    let sql = format!(
        "SELECT {PROJECTION_COLUMNS} FROM search_documents WHERE {}",
        clauses.join(" AND ")
    );
    let mut stmt = conn.prepare(&sql)?;
    let rows = stmt.query_map(rusqlite::params_from_iter(values.iter()), map_projection)?;

    let mut hits = Vec::new();
    for row in rows {
        let document = row?;
        hits.push(SearchHit {
            score: score(&document, &terms),
            highlight: highlight(&document.title, &terms),
            document,
        });
    }
    hits.sort_by(|a, b| {
        b.score
            .total_cmp(&a.score)
            .then_with(|| b.document.created_at.cmp(&a.document.created_at))
            .then_with(|| b.document.id.cmp(&a.document.id))
    });

    let total = hits.len();
    let documents = hits.into_iter().skip(query.from).take(query.size).collect();

    Ok(SearchResults {
        total,
        documents,
        took_ms: started.elapsed().as_millis() as u64,
        from: query.from,
        size: query.size,
    })
}

/// Returns distinct titles starting with `prefix`, case-insensitively.
///
/// # Errors
///
/// Returns `SearchError::InvalidQuery` for a prefix shorter than two
/// characters or a size outside `1..=20`.
pub fn suggest(conn: &Connection, prefix: &str, size: usize) -> Result<Vec<String>, SearchError> {
    if prefix.chars().count() < 2 {
        return Err(SearchError::InvalidQuery(
            "prefix must be at least 2 characters".to_string(),
        ));
    }
    if size == 0 || size > MAX_SUGGESTIONS {
        return Err(SearchError::InvalidQuery(format!(
            "size must be between 1 and {MAX_SUGGESTIONS}"
        )));
    }

    let pattern = like_pattern(prefix);
    // Drop the leading wildcard: this is a prefix match.
    let pattern = &pattern[1..];

    let mut stmt = conn.prepare(
        "SELECT DISTINCT title FROM search_documents
         WHERE title LIKE ?1 ESCAPE '\\'
         ORDER BY title ASC LIMIT ?2",
    )?;
    let rows = stmt.query_map(rusqlite::params![pattern, size as i64], |row| row.get(0))?;
    let mut titles = Vec::new();
    for row in rows {
        titles.push(row?);
    }
    Ok(titles)
}

/// Counts documents per distinct value of `field`, largest buckets first.
pub fn aggregate(
    conn: &Connection,
    field: AggregationField,
    q: Option<&str>,
) -> Result<Vec<AggregationBucket>, SearchError> {
    let terms = q.map(terms).unwrap_or_default();
    let column = field.column();

    let (where_clause, values) = if terms.is_empty() {
        (String::new(), Vec::new())
    } else {
        let (clause, values) = match_clause(&terms, 1);
        (format!("WHERE {clause}"), values)
    };

    let sql = format!(
        "SELECT {column}, COUNT(*) AS n FROM search_documents {where_clause}
         GROUP BY {column} ORDER BY n DESC, {column} ASC LIMIT {MAX_BUCKETS}"
    );
    let mut stmt = conn.prepare(&sql)?;
    let rows = stmt.query_map(rusqlite::params_from_iter(values.iter()), |row| {
        Ok(AggregationBucket {
            key: row.get(0)?,
            count: row.get(1)?,
        })
    })?;
    let mut buckets = Vec::new();
    for row in rows {
        buckets.push(row?);
    }
    Ok(buckets)
}

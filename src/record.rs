use serde::Serialize;

/// Placeholder written in place of a field the extractor could not locate.
pub const NOT_FOUND: &str = "not found";

/// Hierarchical cluster labels carried unchanged from the input file.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct ClusterTags {
    pub lev1: Option<i32>,
    pub lev2: Option<i32>,
    pub lev3: Option<i32>,
    pub lev4: Option<i32>,
}

impl ClusterTags {
    pub fn as_array(&self) -> [Option<i32>; 4] {
        [self.lev1, self.lev2, self.lev3, self.lev4]
    }
}

/// One unit of work: a PubMed id plus its cluster labels.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct InputKey {
    pub pmid: i64,
    pub tags: ClusterTags,
}

/// How the page behind a record was obtained. Not persisted.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PageStatus {
    Fetched,
    NotFound { status: u16 },
    Transport(String),
}

/// Article metadata for one key. `None` means the field was not found.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ArticleRecord {
    pub pmid: i64,
    pub tags: ClusterTags,
    pub title: Option<String>,
    #[serde(rename = "abstract")]
    pub abstract_text: Option<String>,
    pub authors: Option<String>,
    pub journal: Option<String>,
    pub publication_date: Option<String>,
    pub doi: Option<String>,
    pub keywords: Option<String>,
    #[serde(skip)]
    pub page: PageStatus,
}

impl ArticleRecord {
    /// A record with every field absent, used when no page could be fetched.
    pub fn empty(key: InputKey, page: PageStatus) -> Self {
        ArticleRecord {
            pmid: key.pmid,
            tags: key.tags,
            title: None,
            abstract_text: None,
            authors: None,
            journal: None,
            publication_date: None,
            doi: None,
            keywords: None,
            page,
        }
    }

    pub fn url(&self) -> String {
        format!("https://pubmed.ncbi.nlm.nih.gov/{}/", self.pmid)
    }
}

/// Column value for a possibly-missing field.
pub fn or_sentinel(field: &Option<String>) -> &str {
    field.as_deref().unwrap_or(NOT_FOUND)
}

/// Inverse of [`or_sentinel`] for values read back from the store.
pub fn from_column(value: Option<String>) -> Option<String> {
    value.filter(|v| v != NOT_FOUND)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sentinel_round_trips_through_column_form() {
        assert_eq!(or_sentinel(&None), "not found");
        assert_eq!(from_column(Some(NOT_FOUND.to_string())), None);
        assert_eq!(from_column(Some("10.1/x".into())).as_deref(), Some("10.1/x"));
        assert_eq!(from_column(None), None);
    }

    #[test]
    fn empty_record_keeps_key_and_tags() {
        let key = InputKey {
            pmid: 12345,
            tags: ClusterTags { lev1: Some(1), lev2: Some(2), lev3: None, lev4: Some(4) },
        };
        let r = ArticleRecord::empty(key, PageStatus::NotFound { status: 404 });
        assert_eq!(r.pmid, 12345);
        assert_eq!(r.tags, key.tags);
        assert!(r.title.is_none() && r.abstract_text.is_none() && r.keywords.is_none());
        assert_eq!(r.url(), "https://pubmed.ncbi.nlm.nih.gov/12345/");
    }
}

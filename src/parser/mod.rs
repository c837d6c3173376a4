pub mod locators;

use std::panic::{catch_unwind, AssertUnwindSafe};

use scraper::Html;
use tracing::{debug, warn};

use crate::fetcher::FetchOutcome;
use crate::record::{ArticleRecord, InputKey, PageStatus};
use locators::Locator;

/// Build the record for one key from its fetch outcome.
///
/// Pages that were not fetched short-circuit to a record with every field
/// absent. Otherwise each field is located independently.
pub fn extract(key: InputKey, outcome: FetchOutcome) -> ArticleRecord {
    match outcome {
        FetchOutcome::Page(page) => extract_html(key, &page.body),
        FetchOutcome::NotFound { status } => {
            ArticleRecord::empty(key, PageStatus::NotFound { status })
        }
        FetchOutcome::Transport(reason) => ArticleRecord::empty(key, PageStatus::Transport(reason)),
    }
}

pub fn extract_html(key: InputKey, html: &str) -> ArticleRecord {
    let doc = Html::parse_document(html);
    let field = |name: &str, chain: &[Locator]| isolated(key.pmid, name, &doc, chain);

    let record = ArticleRecord {
        pmid: key.pmid,
        tags: key.tags,
        title: field("title", locators::TITLE),
        abstract_text: field("abstract", locators::ABSTRACT),
        authors: field("authors", locators::AUTHORS),
        journal: field("journal", locators::JOURNAL),
        publication_date: field("publication_date", locators::PUBLICATION_DATE),
        doi: field("doi", locators::DOI),
        keywords: field("keywords", locators::KEYWORDS),
        page: PageStatus::Fetched,
    };

    let missing: Vec<&str> = [
        ("title", &record.title),
        ("abstract", &record.abstract_text),
        ("authors", &record.authors),
        ("journal", &record.journal),
        ("publication_date", &record.publication_date),
        ("doi", &record.doi),
        ("keywords", &record.keywords),
    ]
    .iter()
    .filter(|(_, v)| v.is_none())
    .map(|(name, _)| *name)
    .collect();
    if !missing.is_empty() {
        debug!(pmid = key.pmid, ?missing, "fields not found");
    }

    record
}

/// Run one field's locators; a panic inside them only loses that field.
fn isolated(pmid: i64, name: &str, doc: &Html, chain: &[Locator]) -> Option<String> {
    match catch_unwind(AssertUnwindSafe(|| locators::locate(doc, chain))) {
        Ok(value) => value,
        Err(_) => {
            warn!("Extraction of {} panicked for pmid {}", name, pmid);
            None
        }
    }
}

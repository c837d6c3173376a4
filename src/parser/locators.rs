use std::sync::OnceLock;

use regex::Regex;
use scraper::{ElementRef, Html, Selector};
use tracing::warn;

/// How a matched element is turned into a field value.
#[derive(Debug, Clone, Copy)]
pub enum Read {
    /// Concatenated text content.
    Text,
    /// Value of the named attribute (e.g. `content` on `<meta>`).
    Attr(&'static str),
    /// First non-empty text node after an element whose text equals the label.
    FollowingText(&'static str),
    /// First link text of each item matching the inner selector, joined.
    FirstLinkOfEach(&'static str),
}

#[derive(Debug, Clone, Copy)]
pub struct Locator {
    pub css: &'static str,
    pub read: Read,
}

const fn text(css: &'static str) -> Locator {
    Locator { css, read: Read::Text }
}

const fn meta(css: &'static str) -> Locator {
    Locator { css, read: Read::Attr("content") }
}

pub const TITLE: &[Locator] = &[
    text("h1.heading-title"),
    meta("meta[name=\"citation_title\"]"),
];

pub const ABSTRACT: &[Locator] = &[
    text("div.abstract-content.selected"),
    text("div#abstract"),
    meta("meta[name=\"citation_abstract\"]"),
];

pub const AUTHORS: &[Locator] = &[
    Locator {
        css: "div.authors-list",
        read: Read::FirstLinkOfEach("span.authors-list-item"),
    },
    meta("meta[name=\"citation_authors\"]"),
];

pub const JOURNAL: &[Locator] = &[
    text("span.journal-title"),
    text("button#full-view-journal-trigger"),
    meta("meta[name=\"citation_journal_title\"]"),
];

pub const PUBLICATION_DATE: &[Locator] = &[
    text("span.cit"),
    meta("meta[name=\"citation_date\"]"),
    meta("meta[name=\"citation_publication_date\"]"),
];

pub const DOI: &[Locator] = &[
    text("span.identifier.doi a.id-link"),
    meta("meta[name=\"citation_doi\"]"),
];

pub const KEYWORDS: &[Locator] = &[Locator {
    css: "strong.sub-title",
    read: Read::FollowingText("Keywords:"),
}];

/// First locator that yields a non-empty value.
pub fn locate(doc: &Html, locators: &[Locator]) -> Option<String> {
    locators.iter().find_map(|l| apply(doc, l))
}

fn apply(doc: &Html, locator: &Locator) -> Option<String> {
    let selector = match Selector::parse(locator.css) {
        Ok(s) => s,
        Err(e) => {
            warn!("Bad selector {:?}: {:?}", locator.css, e);
            return None;
        }
    };

    match locator.read {
        Read::Text => doc.select(&selector).find_map(|el| non_empty(element_text(el))),
        Read::Attr(name) => doc
            .select(&selector)
            .find_map(|el| el.value().attr(name).and_then(|v| non_empty(normalize(v)))),
        Read::FollowingText(label) => doc
            .select(&selector)
            .filter(|el| element_text(*el) == label)
            .find_map(following_text),
        Read::FirstLinkOfEach(item_css) => {
            let item = Selector::parse(item_css).ok()?;
            let link = Selector::parse("a").ok()?;
            let container = doc.select(&selector).next()?;
            let mut names: Vec<String> = Vec::new();
            for el in container.select(&item) {
                let Some(a) = el.select(&link).next() else { continue };
                let name = element_text(a);
                if !name.is_empty() && !names.contains(&name) {
                    names.push(name);
                }
            }
            non_empty(names.join(", "))
        }
    }
}

fn following_text(el: ElementRef) -> Option<String> {
    el.next_siblings()
        .filter_map(|node| node.value().as_text().map(|t| normalize(t)))
        .find(|t| !t.is_empty())
}

fn element_text(el: ElementRef) -> String {
    normalize(&el.text().collect::<String>())
}

/// Collapse runs of whitespace to a single space and trim.
pub fn normalize(s: &str) -> String {
    static RE: OnceLock<Regex> = OnceLock::new();
    let re = RE.get_or_init(|| Regex::new(r"\s+").expect("static regex"));
    re.replace_all(s.trim(), " ").into_owned()
}

fn non_empty(s: String) -> Option<String> {
    if s.is_empty() {
        None
    } else {
        Some(s)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn doc(body: &str) -> Html {
        Html::parse_document(&format!("<html><head></head><body>{}</body></html>", body))
    }

    #[test]
    fn normalize_collapses_whitespace() {
        assert_eq!(normalize("  a \n\t b  "), "a b");
        assert_eq!(normalize("   "), "");
    }

    #[test]
    fn falls_through_to_next_locator() {
        let html = Html::parse_document(
            r#"<html><head><meta name="citation_title" content="From meta"></head><body></body></html>"#,
        );
        assert_eq!(locate(&html, TITLE).as_deref(), Some("From meta"));
    }

    #[test]
    fn empty_match_does_not_count_as_hit() {
        let html = doc(r#"<h1 class="heading-title">   </h1>"#);
        assert_eq!(locate(&html, TITLE), None);
    }

    #[test]
    fn keywords_follow_label() {
        let html = doc(
            r#"<p><strong class="sub-title">Methods:</strong> not this</p>
               <p><strong class="sub-title">
                 Keywords:
               </strong>
               Alzheimer disease; tau; PET.</p>"#,
        );
        assert_eq!(locate(&html, KEYWORDS).as_deref(), Some("Alzheimer disease; tau; PET."));
    }

    #[test]
    fn authors_keep_order_and_drop_repeats() {
        let html = doc(
            r#"<div class="authors-list">
                 <span class="authors-list-item"><a class="full-name">Ada Lovelace</a><sup><a>1</a></sup></span>
                 <span class="authors-list-item"><a class="full-name">Alan Turing</a></span>
                 <span class="authors-list-item"><a class="full-name">Ada Lovelace</a></span>
                 <span class="authors-list-item">no link</span>
               </div>
               <div class="authors-list">
                 <span class="authors-list-item"><a>Someone Else</a></span>
               </div>"#,
        );
        assert_eq!(locate(&html, AUTHORS).as_deref(), Some("Ada Lovelace, Alan Turing"));
    }
}

use crate::model::{Metadata, PageData};
use crate::plugins::Extractor;
use scraper::{ElementRef, Html, Selector};
use url::Url;

/// Structural parsing of HTML pages.
#[derive(Debug, Default, Clone, Copy)]
pub struct HtmlExtractor;

impl Extractor for HtmlExtractor {
    fn extract(&self, page: &PageData) -> Metadata {
        if !page.is_html() {
            return Metadata::default();
        }
        let document = Html::parse_document(&page.html());
        let base = Url::parse(&page.final_url).ok();
        extract_metadata(&document, base.as_ref())
    }
}

pub(crate) fn selector(css: &str) -> Option<Selector> {
    Selector::parse(css).ok()
}

pub(crate) fn select_all<'a>(document: &'a Html, css: &str) -> Vec<ElementRef<'a>> {
    match selector(css) {
        Some(sel) => document.select(&sel).collect(),
        None => Vec::new(),
    }
}

pub(crate) fn text_of(element: ElementRef<'_>) -> String {
    element.text().collect::<String>().trim().to_string()
}

fn resolve(base: Option<&Url>, href: &str) -> Option<String> {
    let href = href.trim();
    if href.is_empty() {
        return None;
    }
    match base {
        Some(base) => base.join(href).ok().map(String::from),
        None => Some(href.to_string()),
    }
}

pub fn extract_metadata(document: &Html, base: Option<&Url>) -> Metadata {
    let mut metadata = Metadata {
        title: select_all(document, "title")
            .into_iter()
            .next()
            .map(text_of)
            .filter(|t| !t.is_empty()),
        ..Metadata::default()
    };

    for meta in select_all(document, "meta") {
        let element = meta.value();
        let key = element.attr("name").or_else(|| element.attr("property"));
        let content = element.attr("content").map(str::trim).filter(|c| !c.is_empty());
        if let (Some(key), Some(content)) = (key, content) {
            metadata
                .meta_tags
                .entry(key.to_ascii_lowercase())
                .or_insert_with(|| content.to_string());
        }
    }

    metadata.description = metadata.meta_tags.get("description").cloned();
    metadata.og_title = metadata.meta_tags.get("og:title").cloned();
    metadata.og_description = metadata.meta_tags.get("og:description").cloned();
    metadata.keywords = metadata
        .meta_tags
        .get("keywords")
        .map(|k| {
            k.split(',')
                .map(str::trim)
                .filter(|k| !k.is_empty())
                .map(str::to_string)
                .collect()
        })
        .unwrap_or_default();

    metadata.links = select_all(document, "a[href]")
        .into_iter()
        .filter_map(|a| a.value().attr("href").and_then(|href| resolve(base, href)))
        .collect();

    let images = select_all(document, "img");
    metadata.images_count = images.len();
    metadata.image_urls = images
        .into_iter()
        .filter_map(|img| img.value().attr("src").and_then(|src| resolve(base, src)))
        .collect();

    for level in 1..=6u8 {
        let count = select_all(document, &format!("h{level}")).len();
        for _ in 0..count {
            metadata.headings.increment(level);
        }
    }

    metadata
}

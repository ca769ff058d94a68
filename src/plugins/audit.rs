use crate::model::{AccessibilityReport, PageData, SeoReport, StructuredData};
use crate::plugins::extract::{select_all, text_of};
use crate::plugins::PageAuditor;
use scraper::Html;
use serde_json::Value;
use std::collections::BTreeSet;

/// Technology label and the lowercase markers that reveal it.
const TECHNOLOGY_MARKERS: &[(&str, &[&str])] = &[
    ("React", &["data-reactroot", "react"]),
    ("Angular", &["ng-app", "ng-controller", "angular"]),
    ("Vue", &["v-bind:", "vuejs", "vue.js", "vue"]),
    ("Svelte", &["svelte"]),
    ("jQuery", &["jquery"]),
    ("Bootstrap", &["bootstrap"]),
    ("TailwindCSS", &["tailwind"]),
    ("WordPress", &["wp-content", "wp-json"]),
    ("Drupal", &["drupal"]),
    ("Django", &["django"]),
    ("Laravel", &["laravel"]),
    ("Next.js", &["__next", "next/dist"]),
    ("Nuxt.js", &["nuxt"]),
];

/// Static audits over the raw HTML: SEO scoring, technology detection,
/// JSON-LD extraction and accessibility checks.
#[derive(Debug, Default, Clone, Copy)]
pub struct HtmlAuditor;

impl PageAuditor for HtmlAuditor {
    fn seo(&self, page: &PageData) -> SeoReport {
        let document = Html::parse_document(&page.html());
        audit_seo(&document)
    }

    fn technologies(&self, page: &PageData) -> Vec<String> {
        let html = page.html();
        let document = Html::parse_document(&html);
        detect_technologies(&html, &document)
    }

    fn structured_data(&self, page: &PageData) -> StructuredData {
        extract_structured_data(&Html::parse_document(&page.html()))
    }

    fn accessibility(&self, page: &PageData) -> AccessibilityReport {
        analyze_accessibility(&Html::parse_document(&page.html()))
    }
}

pub fn audit_seo(document: &Html) -> SeoReport {
    let title = select_all(document, "title")
        .into_iter()
        .next()
        .map(text_of)
        .unwrap_or_default();

    let description = select_all(document, "meta[name]")
        .into_iter()
        .find(|m| m.value().attr("name").map(str::to_ascii_lowercase).as_deref() == Some("description"))
        .and_then(|m| m.value().attr("content").map(|c| c.trim().to_string()))
        .unwrap_or_default();

    let has_robots = select_all(document, "meta[name]")
        .into_iter()
        .any(|m| m.value().attr("name").map(str::to_ascii_lowercase).as_deref() == Some("robots"));

    let has_canonical = select_all(document, "link[rel]").into_iter().any(|link| {
        link.value()
            .attr("rel")
            .map(|rel| rel.split_whitespace().any(|r| r.eq_ignore_ascii_case("canonical")))
            .unwrap_or(false)
    });

    let has_open_graph = select_all(document, "meta[property]")
        .into_iter()
        .any(|m| m.value().attr("property").map(|p| p.contains("og:")).unwrap_or(false));

    let h1_count = select_all(document, "h1").len();
    let title_length = title.chars().count();
    let meta_description_length = description.chars().count();

    SeoReport {
        title_length,
        meta_description_length,
        h1_count,
        has_canonical,
        has_robots,
        has_open_graph,
        score: seo_score(
            title_length,
            meta_description_length,
            h1_count,
            has_canonical,
            has_robots,
            has_open_graph,
        ),
    }
}

fn seo_score(
    title_length: usize,
    description_length: usize,
    h1_count: usize,
    has_canonical: bool,
    has_robots: bool,
    has_open_graph: bool,
) -> u8 {
    let checks: [(bool, u32); 8] = [
        (title_length > 0, 15),
        ((10..=70).contains(&title_length), 20),
        (description_length > 0, 15),
        ((50..=160).contains(&description_length), 15),
        (h1_count == 1, 10),
        (has_canonical, 10),
        (has_robots, 5),
        (has_open_graph, 10),
    ];
    let score: u32 = checks.iter().filter(|(passed, _)| *passed).map(|(_, points)| points).sum();
    score.min(100) as u8
}

/// Sorted labels whose markers appear in the page text, script sources or stylesheet links.
pub fn detect_technologies(html: &str, document: &Html) -> Vec<String> {
    let mut haystack = html.to_ascii_lowercase();
    for script in select_all(document, "script[src]") {
        if let Some(src) = script.value().attr("src") {
            haystack.push(' ');
            haystack.push_str(&src.to_ascii_lowercase());
        }
    }
    for link in select_all(document, "link[href]") {
        if let Some(href) = link.value().attr("href") {
            haystack.push(' ');
            haystack.push_str(&href.to_ascii_lowercase());
        }
    }

    TECHNOLOGY_MARKERS
        .iter()
        .filter(|(_, markers)| markers.iter().any(|m| haystack.contains(m)))
        .map(|(label, _)| label.to_string())
        .collect::<BTreeSet<_>>()
        .into_iter()
        .collect()
}

/// Objects from every parseable `application/ld+json` script. Top-level
/// arrays are flattened; malformed scripts and non-object items are skipped.
pub fn extract_structured_data(document: &Html) -> StructuredData {
    let mut items = StructuredData::new();
    for script in select_all(document, "script[type]") {
        let is_json_ld = script
            .value()
            .attr("type")
            .map(|t| t.trim().eq_ignore_ascii_case("application/ld+json"))
            .unwrap_or(false);
        if !is_json_ld {
            continue;
        }
        let text: String = script.text().collect();
        match serde_json::from_str::<Value>(text.trim()) {
            Ok(Value::Object(object)) => items.push(object),
            Ok(Value::Array(values)) => items.extend(values.into_iter().filter_map(|value| match value {
                Value::Object(object) => Some(object),
                _ => None,
            })),
            _ => continue,
        }
    }
    items
}

pub fn analyze_accessibility(document: &Html) -> AccessibilityReport {
    let images_missing_alt: Vec<String> = select_all(document, "img")
        .into_iter()
        .filter(|img| img.value().attr("alt").map(|alt| alt.trim().is_empty()).unwrap_or(true))
        .map(|img| img.value().attr("src").unwrap_or_default().to_string())
        .collect();

    let links_without_text: Vec<String> = select_all(document, "a")
        .into_iter()
        .filter(|link| text_of(*link).is_empty())
        .map(|link| link.value().attr("href").unwrap_or_default().to_string())
        .collect();

    let buttons_without_text: Vec<usize> = select_all(document, "button")
        .into_iter()
        .enumerate()
        .filter(|(_, button)| text_of(*button).is_empty())
        .map(|(index, _)| index)
        .collect();

    let contrast_warnings: Vec<String> = select_all(document, "[style]")
        .into_iter()
        .filter(|element| {
            let style = element.value().attr("style").unwrap_or_default();
            match (
                declared_hex(style, &["color"]),
                declared_hex(style, &["background", "background-color"]),
            ) {
                (Some(fg), Some(bg)) => fg == bg,
                _ => false,
            }
        })
        .map(|element| format!("possible low contrast in <{}>", element.value().name()))
        .collect();

    let issues = images_missing_alt.len() + links_without_text.len() + buttons_without_text.len() + contrast_warnings.len();
    let score = 100usize.saturating_sub(issues * 10) as u8;

    AccessibilityReport {
        images_missing_alt,
        links_without_text,
        buttons_without_text,
        contrast_warnings,
        score,
    }
}

/// Lowercase hex digits of the first inline declaration of one of
/// `properties` whose value starts with a `#` color.
fn declared_hex(style: &str, properties: &[&str]) -> Option<String> {
    style
        .split(';')
        .filter_map(|declaration| declaration.split_once(':'))
        .find_map(|(name, value)| {
            let name = name.trim().to_ascii_lowercase();
            if !properties.contains(&name.as_str()) {
                return None;
            }
            let value = value.trim().to_ascii_lowercase();
            let digits: String = value
                .strip_prefix('#')?
                .chars()
                .take_while(|c| c.is_ascii_hexdigit())
                .collect();
            (3..=6).contains(&digits.len()).then_some(digits)
        })
}

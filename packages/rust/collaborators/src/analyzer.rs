//! Static HTML analysis collaborator.
//!
//! Fetches a page (http/https) or reads a local file, then splits it into
//! semantic blocks (`section`, `article`, `header`, `footer`, `main`,
//! `aside`, `nav`) and classifies each by keyword.

use std::collections::BTreeMap;
use std::sync::LazyLock;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use regex::Regex;
use reqwest::Client;
use scraper::{ElementRef, Html, Selector};
use sha2::{Digest, Sha256};
use siteport_shared::{CollaboratorError, Result, SiteBlueprint, SiteportError, SourceElement};
use tracing::{debug, instrument};
use url::Url;

use crate::http::classify_status;
use crate::{Analyzer, CollabResult};

/// User-Agent string for source fetches.
const USER_AGENT: &str = concat!("siteport-analyzer/", env!("CARGO_PKG_VERSION"));

/// Upper bound on blocks taken from one page.
const MAX_BLOCKS: usize = 15;

/// Characters of block text kept in the `body` field.
const BODY_LIMIT: usize = 400;

static BLOCK_SEL: LazyLock<Selector> = LazyLock::new(|| {
    Selector::parse("section, article, header, footer, main, aside, nav").expect("valid selector")
});
static HEADING_SEL: LazyLock<Selector> =
    LazyLock::new(|| Selector::parse("h1, h2, h3, h4, h5, h6").expect("valid selector"));
static H1_SEL: LazyLock<Selector> =
    LazyLock::new(|| Selector::parse("h1").expect("valid selector"));
static IMG_SEL: LazyLock<Selector> =
    LazyLock::new(|| Selector::parse("img[src]").expect("valid selector"));
static LINK_SEL: LazyLock<Selector> =
    LazyLock::new(|| Selector::parse("a[href]").expect("valid selector"));
static FORM_SEL: LazyLock<Selector> =
    LazyLock::new(|| Selector::parse("form").expect("valid selector"));
static STYLED_SEL: LazyLock<Selector> =
    LazyLock::new(|| Selector::parse("[style]").expect("valid selector"));
static TITLE_SEL: LazyLock<Selector> =
    LazyLock::new(|| Selector::parse("title").expect("valid selector"));

static COLOR_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"#(?:[0-9a-fA-F]{6}|[0-9a-fA-F]{3})\b").expect("valid regex"));
static FONT_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r#"(?i)font-family\s*:\s*([^;"']+)"#).expect("valid regex"));

/// Keyword table, checked in order. First hit wins.
const CLASSIFIERS: &[(&str, &[&str])] = &[
    ("hero", &["hero", "banner", "jumbotron", "intro"]),
    ("navigation", &["nav", "menu", "navigation"]),
    ("features", &["feature", "service", "card", "grid"]),
    ("about", &["about", "mission", "vision", "story"]),
    ("blog", &["blog", "news", "article", "post"]),
    ("contact", &["contact", "form", "reach", "touch"]),
    ("footer", &["footer", "copyright"]),
    ("testimonials", &["testimonial", "review", "quote"]),
    ("team", &["team", "staff", "people", "member"]),
    ("pricing", &["pricing", "plan", "package"]),
];

/// Classify a block from its tag, classes, id and text.
pub fn classify_block(tag: &str, classes: &str, id_attr: &str, text: &str) -> &'static str {
    let combined = format!("{classes} {id_attr} {text}").to_lowercase();
    let hit = CLASSIFIERS
        .iter()
        .find(|(_, words)| words.iter().any(|w| combined.contains(w)));
    if let Some((kind, _)) = hit {
        return kind;
    }
    match tag {
        "nav" => "navigation",
        "header" => "header",
        "footer" => "footer",
        "article" => "blog",
        _ => "content",
    }
}

/// `analyze` collaborator backed by `scraper`.
pub struct HtmlAnalyzer {
    client: Client,
}

impl HtmlAnalyzer {
    pub fn new(timeout: Duration) -> Result<Self> {
        let client = Client::builder()
            .user_agent(USER_AGENT)
            .redirect(reqwest::redirect::Policy::limited(5))
            .timeout(timeout)
            .build()
            .map_err(|e| SiteportError::config(format!("failed to build HTTP client: {e}")))?;
        Ok(Self { client })
    }

    async fn fetch(&self, url: &Url) -> CollabResult<String> {
        let response = self
            .client
            .get(url.as_str())
            .send()
            .await
            .map_err(|e| CollaboratorError::transient("analyze", format!("{url}: {e}")))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(classify_status("analyze", status, &body));
        }
        response
            .text()
            .await
            .map_err(|e| CollaboratorError::transient("analyze", format!("{url}: body read failed: {e}")))
    }
}

#[async_trait]
impl Analyzer for HtmlAnalyzer {
    #[instrument(skip_all, fields(source = %source))]
    async fn analyze(&self, source: &str) -> CollabResult<SiteBlueprint> {
        let (html, page) = match Url::parse(source) {
            Ok(url) if matches!(url.scheme(), "http" | "https") => {
                let html = self.fetch(&url).await?;
                (html, url.path().to_string())
            }
            _ => {
                let html = tokio::fs::read_to_string(source).await.map_err(|e| {
                    CollaboratorError::Protocol(format!("analyze: cannot read {source}: {e}"))
                })?;
                (html, "/".to_string())
            }
        };
        let blueprint = analyze_html(source, &page, &html);
        debug!(elements = blueprint.elements.len(), "analysis complete");
        Ok(blueprint)
    }
}

fn element_id(page: &str, index: usize, tag: &str, heading: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(format!("{page}\n{index}\n{tag}\n{heading}").as_bytes());
    let digest = hasher.finalize();
    let hex: String = digest.iter().take(6).map(|b| format!("{b:02x}")).collect();
    format!("el-{hex}")
}

fn collapse_text(el: &ElementRef<'_>) -> String {
    el.text()
        .flat_map(str::split_whitespace)
        .collect::<Vec<_>>()
        .join(" ")
}

fn style_tokens(block: &ElementRef<'_>, page_fonts: &[String]) -> BTreeMap<String, String> {
    let mut tokens = BTreeMap::new();

    let inline: String = block
        .select(&STYLED_SEL)
        .chain(std::iter::once(*block).filter(|b| b.value().attr("style").is_some()))
        .filter_map(|el| el.value().attr("style"))
        .collect::<Vec<_>>()
        .join(";");

    let colors: Vec<&str> = COLOR_RE.find_iter(&inline).map(|m| m.as_str()).collect();
    if let Some(primary) = colors.first() {
        tokens.insert("primary_color".into(), primary.to_string());
    }
    if let Some(secondary) = colors.get(1) {
        tokens.insert("secondary_color".into(), secondary.to_string());
    }

    let font = FONT_RE
        .captures(&inline)
        .and_then(|c| c.get(1))
        .map(|m| m.as_str().trim().to_string())
        .or_else(|| page_fonts.first().cloned());
    if let Some(font) = font {
        tokens.insert("font_family".into(), font);
    }

    let classes: Vec<&str> = block.value().classes().collect();
    if !classes.is_empty() {
        tokens.insert("classes".into(), classes.join(" "));
    }
    tokens
}

/// Build a blueprint from one HTML document.
pub fn analyze_html(source: &str, page: &str, html: &str) -> SiteBlueprint {
    let doc = Html::parse_document(html);

    let title = doc
        .select(&TITLE_SEL)
        .next()
        .map(|t| collapse_text(&t))
        .unwrap_or_default();

    let page_fonts: Vec<String> = FONT_RE
        .captures_iter(html)
        .filter_map(|c| c.get(1))
        .map(|m| m.as_str().trim().to_string())
        .collect();

    let mut elements = Vec::new();
    for (index, block) in doc.select(&BLOCK_SEL).take(MAX_BLOCKS).enumerate() {
        let tag = block.value().name();
        let classes: Vec<&str> = block.value().classes().collect();
        let id_attr = block.value().id().unwrap_or_default();
        let text = collapse_text(&block);

        let heading = block
            .select(&HEADING_SEL)
            .next()
            .map(|h| collapse_text(&h))
            .unwrap_or_default();

        let mut content = BTreeMap::new();
        if !heading.is_empty() {
            content.insert("heading".to_string(), heading.clone());
        }
        if !text.is_empty() {
            content.insert("body".to_string(), text.chars().take(BODY_LIMIT).collect());
        }
        if let Some(src) = block.select(&IMG_SEL).next().and_then(|i| i.value().attr("src")) {
            content.insert("image".to_string(), src.to_string());
        }
        if let Some(href) = block
            .select(&LINK_SEL)
            .filter_map(|a| a.value().attr("href"))
            .find(|h| !h.trim_start().to_lowercase().starts_with("javascript:"))
        {
            content.insert("link".to_string(), href.to_string());
        }
        if block.select(&FORM_SEL).next().is_some() {
            content.insert("form".to_string(), "present".to_string());
        }

        let semantic_type = classify_block(tag, &classes.join(" "), id_attr, &text);
        let weight = if block.select(&H1_SEL).next().is_some() {
            2.0
        } else {
            1.0
        };

        elements.push(SourceElement {
            id: element_id(page, index, tag, &heading),
            page: page.to_string(),
            semantic_type: semantic_type.to_string(),
            content,
            style_tokens: style_tokens(&block, &page_fonts),
            weight,
        });
    }

    SiteBlueprint {
        source: source.to_string(),
        title,
        elements,
        analyzed_at: Utc::now(),
    }
}

#[cfg(test)]
mod tests {
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    use super::*;

    const PAGE: &str = r##"<!doctype html>
<html><head><title>Bakery</title>
<style>body { font-family: Lato, sans-serif; }</style></head>
<body>
<header class="site-header"><nav><a href="/">Home</a><a href="/menu">Menu</a></nav></header>
<section class="hero" style="background:#ff8800;color:#222"><h1>Fresh bread daily</h1>
  <img src="/img/loaf.jpg"><a href="javascript:void(0)">x</a><a href="/order">Order</a></section>
<section id="pricing"><h2>Plans</h2><p>Weekly box</p></section>
<section><h2>Get in touch</h2><form><input name="email"></form></section>
<footer><p>&copy; 2024 copyright Bakery</p></footer>
</body></html>"##;

    #[test]
    fn classifies_blocks_by_keyword_then_tag() {
        assert_eq!(classify_block("section", "hero-wrap", "", ""), "hero");
        assert_eq!(classify_block("section", "", "pricing", ""), "pricing");
        assert_eq!(classify_block("header", "", "", "Acme"), "header");
        assert_eq!(classify_block("footer", "", "", "Acme Inc"), "footer");
        assert_eq!(classify_block("div", "", "", "lorem ipsum"), "content");
    }

    #[test]
    fn extracts_fields_and_style_tokens() {
        let bp = analyze_html("file.html", "/", PAGE);
        assert_eq!(bp.title, "Bakery");

        let hero = bp
            .elements
            .iter()
            .find(|e| e.semantic_type == "hero")
            .expect("hero block");
        assert_eq!(hero.content.get("heading").map(String::as_str), Some("Fresh bread daily"));
        assert_eq!(hero.content.get("image").map(String::as_str), Some("/img/loaf.jpg"));
        assert_eq!(hero.content.get("link").map(String::as_str), Some("/order"));
        assert_eq!(hero.style_tokens.get("primary_color").map(String::as_str), Some("#ff8800"));
        assert_eq!(hero.style_tokens.get("font_family").map(String::as_str), Some("Lato, sans-serif"));
        assert_eq!(hero.weight, 2.0);

        let contact = bp
            .elements
            .iter()
            .find(|e| e.content.contains_key("form"))
            .expect("form block");
        assert_eq!(contact.semantic_type, "contact");
        assert!(bp.validate().is_ok());
    }

    #[test]
    fn element_ids_are_stable() {
        let a = analyze_html("s", "/", PAGE);
        let b = analyze_html("s", "/", PAGE);
        let ids_a: Vec<_> = a.elements.iter().map(|e| e.id.clone()).collect();
        let ids_b: Vec<_> = b.elements.iter().map(|e| e.id.clone()).collect();
        assert_eq!(ids_a, ids_b);
        assert!(ids_a.iter().all(|id| id.starts_with("el-") && id.len() == 15));
    }

    #[tokio::test]
    async fn fetches_remote_sources() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/home"))
            .respond_with(ResponseTemplate::new(200).set_body_string(PAGE))
            .mount(&server)
            .await;

        let analyzer = HtmlAnalyzer::new(Duration::from_secs(5)).unwrap();
        let bp = analyzer
            .analyze(&format!("{}/home", server.uri()))
            .await
            .unwrap();
        assert!(!bp.elements.is_empty());
        assert!(bp.elements.iter().all(|e| e.page == "/home"));
    }

    #[tokio::test]
    async fn remote_server_errors_are_transient() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(502))
            .mount(&server)
            .await;

        let analyzer = HtmlAnalyzer::new(Duration::from_secs(5)).unwrap();
        let err = analyzer.analyze(&server.uri()).await.unwrap_err();
        assert!(err.is_transient());
    }

    #[tokio::test]
    async fn reads_local_files() {
        let tmp = std::env::temp_dir().join(format!("sp_page_{}.html", std::process::id()));
        std::fs::write(&tmp, PAGE).unwrap();
        let analyzer = HtmlAnalyzer::new(Duration::from_secs(5)).unwrap();
        let bp = analyzer.analyze(tmp.to_str().unwrap()).await.unwrap();
        assert_eq!(bp.elements[0].page, "/");
        let _ = std::fs::remove_file(&tmp);
    }
}

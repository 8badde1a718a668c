//! HTML parsing: ordered image URLs plus optional gallery metadata.
//! Deterministic and side-effect-free.

use scraper::{ElementRef, Html, Selector};
use url::Url;

use crate::error::{Error, Result};

/// Structured metadata extracted from the gallery description and navigation
/// blocks. Absent fields stay empty.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct GalleryMeta {
    pub title: String,
    pub published_date: String,
    pub tags: Vec<String>,
    pub organizations: Vec<String>,
    pub models: Vec<String>,
}

#[derive(Debug, Clone)]
pub struct ParseOutcome {
    pub page_url: String,
    pub selector: String,
    pub image_urls: Vec<String>,
    pub gallery: GalleryMeta,
}

/// Extract image URLs in DOM order using a CSS selector, resolving relative
/// sources against the page URL.
pub fn parse_image_urls(html: &str, page_url: &str, selector: &str) -> Result<ParseOutcome> {
    let image_selector =
        Selector::parse(selector).map_err(|_| Error::InvalidSelector(selector.to_string()))?;
    let doc = Html::parse_document(html);
    let base = Url::parse(page_url).ok();

    let mut image_urls = Vec::new();
    for element in doc.select(&image_selector) {
        let Some(src) = element.value().attr("src") else { continue };
        if src.is_empty() {
            continue;
        }
        image_urls.push(resolve(base.as_ref(), src));
    }

    Ok(ParseOutcome {
        page_url: page_url.to_string(),
        selector: selector.to_string(),
        image_urls,
        gallery: parse_gallery_meta(&doc),
    })
}

/// Extract the advertised image count from a page text node, e.g. the
/// `<span>61</span>` inside a "61 images in the full set" banner.
pub fn parse_gallery_upper_bound(html: &str, selector: &str) -> Result<Option<u32>> {
    let count_selector =
        Selector::parse(selector).map_err(|_| Error::InvalidSelector(selector.to_string()))?;
    let doc = Html::parse_document(html);
    let Some(node) = doc.select(&count_selector).next() else {
        return Ok(None);
    };
    let text: String = node.text().collect();
    let digits: String = text
        .chars()
        .skip_while(|c| !c.is_ascii_digit())
        .take_while(|c| c.is_ascii_digit())
        .collect();
    Ok(digits.parse::<u32>().ok().filter(|value| *value > 0))
}

fn resolve(base: Option<&Url>, src: &str) -> String {
    match base {
        Some(base) => base
            .join(src)
            .map(|url| url.to_string())
            .unwrap_or_else(|_| src.to_string()),
        None => src.to_string(),
    }
}

fn parse_gallery_meta(doc: &Html) -> GalleryMeta {
    use crate::selectors::meta::*;

    let mut meta = GalleryMeta::default();
    if let Some(heading) = doc.select(&TITLE).next() {
        meta.title = element_text(heading);
    }
    for paragraph in doc.select(&INTRO_PARAGRAPHS) {
        let links: Vec<ElementRef> = paragraph.select(&ANCHOR).collect();
        if links.is_empty() {
            if meta.published_date.is_empty() {
                let text = element_text(paragraph);
                if !text.is_empty() {
                    meta.published_date = text;
                }
            }
        } else {
            meta.tags.extend(
                links
                    .iter()
                    .map(|link| element_text(*link))
                    .filter(|text| !text.is_empty()),
            );
        }
    }
    for person in doc.select(&PERSON) {
        let Some(name) = person.select(&PERSON_NAME).next().map(element_text) else {
            continue;
        };
        if name.is_empty() {
            continue;
        }
        if person.select(&ROLE_ORGANIZATION).next().is_some() {
            meta.organizations.push(name);
        } else if person.select(&ROLE_MODEL).next().is_some() {
            meta.models.push(name);
        }
    }
    meta
}

fn element_text(element: ElementRef) -> String {
    element
        .text()
        .map(str::trim)
        .filter(|text| !text.is_empty())
        .collect::<Vec<_>>()
        .join(" ")
}

#[cfg(test)]
mod tests {
    use super::*;

    const PAGE_URL: &str = "https://site.example/gallery/9.html";
    const SELECTOR: &str = "div.gallerypic img";

    #[test]
    fn keeps_dom_order_and_resolves_relative_urls() {
        let html = r#"
        <html><body>
          <div class="gallerypic">
            <img src="/img/002.jpg" />
            <img src="/img/001.jpg" />
            <img src="https://cdn.example.com/003.jpg" />
          </div>
        </body></html>
        "#;
        let outcome = parse_image_urls(html, PAGE_URL, SELECTOR).unwrap();
        assert_eq!(
            outcome.image_urls,
            vec![
                "https://site.example/img/002.jpg",
                "https://site.example/img/001.jpg",
                "https://cdn.example.com/003.jpg",
            ]
        );
        assert_eq!(outcome.gallery, GalleryMeta::default());
    }

    #[test]
    fn skips_images_without_src() {
        let html = r#"<div class="gallerypic"><img /><img src="" /><img src="a.jpg" /></div>"#;
        let outcome = parse_image_urls(html, PAGE_URL, SELECTOR).unwrap();
        assert_eq!(outcome.image_urls, vec!["https://site.example/gallery/a.jpg"]);
    }

    #[test]
    fn rejects_invalid_selector() {
        assert!(matches!(
            parse_image_urls("<html></html>", PAGE_URL, "div..["),
            Err(Error::InvalidSelector(_))
        ));
    }

    #[test]
    fn extracts_gallery_meta_fields() {
        let html = r#"
        <html><body>
          <div class="gallery_jieshao">
            <h1>[YouMi]尤蜜荟 2024.07.10 Vol.1082 心妍小公主</h1>
            <p>2024-11-02</p>
            <p>
              <a href="/tags/i-cup.html">I-CUP</a>
              <a href="/tags/meijiao.html">美脚</a>
              <a href="/tags/jiudian.html">酒店</a>
            </p>
          </div>
          <div class="gallery_nav">
            <div class="gallery_nav_box">
              <div class="gallery_nav_box_left">
                <div class="gallery_renwu">
                  <a href="/jigou/98.html"><div class="gallery_chuangzuo">机构</div></a>
                  <div class="gallery_renwu_title"><a href="/jigou/98.html">尤蜜荟</a></div>
                </div>
                <div class="gallery_renwu">
                  <a href="/mote/99.html"><div class="gallery_chujing">模特</div></a>
                  <div class="gallery_renwu_title"><a href="/mote/99.html">李妍曦</a></div>
                </div>
              </div>
            </div>
          </div>
          <div class="gallerypic"><img src="/img/001.jpg" /></div>
        </body></html>
        "#;
        let outcome = parse_image_urls(html, PAGE_URL, SELECTOR).unwrap();
        let gallery = outcome.gallery;
        assert_eq!(gallery.title, "[YouMi]尤蜜荟 2024.07.10 Vol.1082 心妍小公主");
        assert_eq!(gallery.published_date, "2024-11-02");
        assert_eq!(gallery.tags, vec!["I-CUP", "美脚", "酒店"]);
        assert_eq!(gallery.organizations, vec!["尤蜜荟"]);
        assert_eq!(gallery.models, vec!["李妍曦"]);
    }

    #[test]
    fn groups_multiple_people_by_role() {
        let html = r#"
        <html><body>
          <div class="gallery_nav">
            <div class="gallery_renwu">
              <a><div class="gallery_chuangzuo">机构</div></a>
              <div class="gallery_renwu_title"><a>机构A</a></div>
            </div>
            <div class="gallery_renwu">
              <a><div class="gallery_chuangzuo">机构</div></a>
              <div class="gallery_renwu_title"><a>机构B</a></div>
            </div>
            <div class="gallery_renwu">
              <a><div class="gallery_chujing">模特</div></a>
              <div class="gallery_renwu_title"><a>模特A</a></div>
            </div>
            <div class="gallery_renwu">
              <a><div class="gallery_chujing">模特</div></a>
              <div class="gallery_renwu_title"><a>模特B</a></div>
            </div>
          </div>
          <div class="gallerypic"><img src="/img/001.jpg" /></div>
        </body></html>
        "#;
        let outcome = parse_image_urls(html, PAGE_URL, SELECTOR).unwrap();
        assert_eq!(outcome.gallery.organizations, vec!["机构A", "机构B"]);
        assert_eq!(outcome.gallery.models, vec!["模特A", "模特B"]);
    }

    #[test]
    fn upper_bound_parses_first_digit_run() {
        let html = r#"
        <html><body>
          <div id="tishi"><p>全本<span>61</span>张图片，欣赏完整作品</p></div>
        </body></html>
        "#;
        assert_eq!(parse_gallery_upper_bound(html, "#tishi p span").unwrap(), Some(61));
    }

    #[test]
    fn upper_bound_is_none_when_missing_or_zero() {
        assert_eq!(
            parse_gallery_upper_bound("<html><body><div>no count</div></body></html>", "#tishi p span").unwrap(),
            None
        );
        let zero = r#"<div id="tishi"><p><span>0</span></p></div>"#;
        assert_eq!(parse_gallery_upper_bound(zero, "#tishi p span").unwrap(), None);
    }
}

//! Structured and heuristic extraction of product data from page HTML

use scraper::{ElementRef, Html, Selector};
use serde_json::Value;
use tracing::debug;
use url::Url;

use crate::models::ProductData;
use crate::price::parse_price;

/// Schemes an extracted image URL may never carry.
const DISALLOWED_SCHEMES: &[&str] = &["javascript", "data", "file", "vbscript", "about"];

/// Price elements holding more text than this are containers, not prices.
const MAX_PRICE_TEXT_LEN: usize = 64;

/// Pages with less visible text than this are likely rendered client-side.
const MIN_STATIC_TEXT_LEN: usize = 200;

/// Heuristic selectors tried after structured markup, most specific first.
const PRICE_SELECTORS: &[&str] = &[
    "[itemprop=\"price\"]",
    "[data-price]",
    ".a-price .a-offscreen",
    "#priceblock_ourprice",
    ".product-price",
    ".price-current",
    ".sale-price",
    "#price",
    ".price",
    "[class*=\"price\"]",
];

const CURRENCY_META: &[&str] = &[
    "meta[property=\"product:price:currency\"]",
    "meta[property=\"og:price:currency\"]",
    "meta[itemprop=\"priceCurrency\"]",
];

const PRICE_META: &[&str] = &[
    "meta[property=\"product:price:amount\"]",
    "meta[property=\"og:price:amount\"]",
];

/// What one page yielded, plus hints for the pipeline.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PageExtraction {
    pub data: ProductData,
    /// The page looks like a client-rendered shell whose price is filled in by
    /// script. Never set when a price was found.
    pub needs_render: bool,
    /// First price-looking text that could not be parsed, if any.
    pub unparsed_price: Option<String>,
}

/// A price string found on the page, with the currency declared next to it.
struct PriceCandidate {
    text: String,
    currency: Option<String>,
}

/// Product fields read from JSON-LD markup
#[derive(Default)]
struct StructuredProduct {
    name: Option<String>,
    image: Option<String>,
    price: Option<String>,
    currency: Option<String>,
}

/// Extract title, price, currency and image from `html` served at `page_url`.
pub fn extract_product(html: &str, page_url: &str) -> PageExtraction {
    let document = Html::parse_document(html);
    let structured = structured_product(&document).unwrap_or_default();

    let mut unparsed_price = None;
    let money = price_candidates(&document, &structured)
        .into_iter()
        .find_map(|candidate| {
            let text = match candidate.currency.as_deref() {
                Some(code) if is_currency_code(code) => format!("{} {code}", candidate.text),
                _ => candidate.text.clone(),
            };
            let parsed = parse_price(&text);
            if parsed.is_none() && unparsed_price.is_none() {
                unparsed_price = Some(candidate.text);
            }
            parsed
        });

    let title = structured
        .name
        .clone()
        .or_else(|| meta_content(&document, "meta[property=\"og:title\"]"))
        .or_else(|| first_text(&document, "h1"))
        .or_else(|| first_text(&document, "title"));

    let image_url = structured
        .image
        .clone()
        .or_else(|| meta_content(&document, "meta[property=\"og:image\"]"))
        .or_else(|| meta_content(&document, "meta[name=\"twitter:image\"]"))
        .or_else(|| first_attr(&document, "[itemprop=\"image\"]", &["content", "src"]))
        .and_then(|src| resolve_image_url(page_url, &src));

    let needs_render = money.is_none() && looks_client_rendered(&document);

    PageExtraction {
        data: ProductData {
            title,
            price_cents: money.as_ref().map(|m| m.cents),
            currency: money.map(|m| m.currency),
            image_url,
        },
        needs_render,
        unparsed_price,
    }
}

/// Resolve an image reference against the page URL, refusing unsafe schemes.
///
/// Any failure yields `None`: a bad image never aborts extraction.
pub fn resolve_image_url(page_url: &str, src: &str) -> Option<String> {
    // Responsive image templates carry a width placeholder
    let src = src.trim().replace("{width}", "800");
    if src.is_empty() {
        return None;
    }

    let base = Url::parse(page_url).ok()?;
    let resolved = base.join(&src).ok()?;

    if DISALLOWED_SCHEMES.contains(&resolved.scheme()) {
        debug!(scheme = resolved.scheme(), "Discarding image with disallowed scheme");
        return None;
    }

    Some(resolved.into())
}

fn price_candidates(document: &Html, structured: &StructuredProduct) -> Vec<PriceCandidate> {
    let meta_currency = CURRENCY_META
        .iter()
        .find_map(|css| meta_content(document, css));

    let mut candidates = Vec::new();

    if let Some(price) = &structured.price {
        candidates.push(PriceCandidate {
            text: price.clone(),
            currency: structured.currency.clone().or_else(|| meta_currency.clone()),
        });
    }

    for css in PRICE_META {
        if let Some(price) = meta_content(document, css) {
            candidates.push(PriceCandidate {
                text: price,
                currency: meta_currency.clone(),
            });
        }
    }

    for css in PRICE_SELECTORS {
        let Some(selector) = selector(css) else {
            continue;
        };
        for element in document.select(&selector) {
            if let Some(text) = element_price_text(element) {
                candidates.push(PriceCandidate {
                    text,
                    currency: meta_currency.clone(),
                });
            }
        }
    }

    candidates
}

fn element_price_text(element: ElementRef<'_>) -> Option<String> {
    let value = element.value();
    let text = value
        .attr("content")
        .or_else(|| value.attr("data-price"))
        .map(ToString::to_string)
        .or_else(|| clean_text(&element.text().collect::<String>()))?;

    if text.len() > MAX_PRICE_TEXT_LEN || !text.chars().any(|c| c.is_ascii_digit()) {
        return None;
    }
    Some(text)
}

fn structured_product(document: &Html) -> Option<StructuredProduct> {
    let selector = selector("script[type=\"application/ld+json\"]")?;

    document.select(&selector).find_map(|script| {
        let raw = script.text().collect::<String>();
        let json: Value = serde_json::from_str(raw.trim()).ok()?;
        let node = find_product_node(&json)?;

        let (price, currency) = node
            .get("offers")
            .and_then(offer_price)
            .map_or((None, None), |(price, currency)| (Some(price), currency));

        Some(StructuredProduct {
            name: node.get("name").and_then(Value::as_str).and_then(clean_text),
            image: node.get("image").and_then(image_value),
            price,
            currency,
        })
    })
}

fn find_product_node(value: &Value) -> Option<&Value> {
    match value {
        Value::Array(items) => items.iter().find_map(find_product_node),
        Value::Object(map) => {
            if is_product_type(map.get("@type")) {
                return Some(value);
            }
            map.get("@graph").and_then(find_product_node)
        }
        _ => None,
    }
}

fn is_product_type(kind: Option<&Value>) -> bool {
    match kind {
        Some(Value::String(kind)) => kind == "Product",
        Some(Value::Array(kinds)) => kinds.iter().any(|k| k.as_str() == Some("Product")),
        _ => false,
    }
}

fn offer_price(offers: &Value) -> Option<(String, Option<String>)> {
    match offers {
        Value::Array(items) => items.iter().find_map(offer_price),
        Value::Object(offer) => {
            let currency = offer
                .get("priceCurrency")
                .and_then(Value::as_str)
                .map(ToString::to_string);

            let price = offer
                .get("price")
                .or_else(|| offer.get("lowPrice"))
                .and_then(scalar_text);

            match price {
                Some(price) => Some((price, currency)),
                None => offer.get("priceSpecification").and_then(offer_price),
            }
        }
        _ => None,
    }
}

fn image_value(value: &Value) -> Option<String> {
    match value {
        Value::String(url) => Some(url.clone()),
        Value::Array(items) => items.iter().find_map(image_value),
        Value::Object(map) => map.get("url").and_then(image_value),
        _ => None,
    }
}

fn scalar_text(value: &Value) -> Option<String> {
    match value {
        Value::String(s) if !s.trim().is_empty() => Some(s.trim().to_string()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

/// Script shells (empty SPA roots, "enable JavaScript" notices, almost no text).
fn looks_client_rendered(document: &Html) -> bool {
    let asks_for_script = selector("noscript").is_some_and(|noscript| {
        document.select(&noscript).any(|el| {
            el.text()
                .collect::<String>()
                .to_lowercase()
                .contains("javascript")
        })
    });

    let empty_app_root = selector("#root, #__next, #app, [data-reactroot]").is_some_and(|root| {
        document
            .select(&root)
            .any(|el| el.text().collect::<String>().trim().is_empty())
    });

    let body_text_len = selector("body").map_or(0, |body| {
        document
            .select(&body)
            .map(|el| {
                el.text()
                    .filter(|t| !t.trim().is_empty())
                    .map(str::len)
                    .sum::<usize>()
            })
            .sum()
    });

    asks_for_script || empty_app_root || body_text_len < MIN_STATIC_TEXT_LEN
}

fn meta_content(document: &Html, css: &str) -> Option<String> {
    first_attr(document, css, &["content"])
}

fn first_attr(document: &Html, css: &str, attrs: &[&str]) -> Option<String> {
    let selector = selector(css)?;
    document.select(&selector).find_map(|el| {
        attrs
            .iter()
            .find_map(|attr| el.value().attr(attr))
            .and_then(clean_text)
    })
}

fn first_text(document: &Html, css: &str) -> Option<String> {
    let selector = selector(css)?;
    document
        .select(&selector)
        .find_map(|el| clean_text(&el.text().collect::<String>()))
}

fn selector(css: &str) -> Option<Selector> {
    Selector::parse(css).ok()
}

fn clean_text(text: &str) -> Option<String> {
    let cleaned = text.split_whitespace().collect::<Vec<_>>().join(" ");
    (!cleaned.is_empty()).then_some(cleaned)
}

fn is_currency_code(code: &str) -> bool {
    code.len() == 3 && code.chars().all(|c| c.is_ascii_alphabetic())
}

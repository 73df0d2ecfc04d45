use std::collections::HashMap;
use std::sync::LazyLock;

use reqwest::Url;
use scraper::{ElementRef, Html, Selector};
use serde_json::json;
use tracing::{debug, info, warn};

use super::{FetchBatch, Fetcher};
use crate::error::{RecordSkipped, SourceError};
use crate::http::{HttpRequest, RetryPolicy, Transport};
use crate::record::{CanonicalRecord, Cursor, Payload, RawRecord};

pub const BASE_URL: &str = "https://www.amazon.co.jp";
const USER_AGENT: &str = "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 \
                          (KHTML, like Gecko) Chrome/120 Safari/537.36";
const ACCEPT_LANGUAGE: &str = "ja-JP,ja;q=0.9,en-US;q=0.8,en;q=0.7";

const CARD_TITLE_SELECTORS: [&str; 3] = ["h2 a span", "h2 a", "h2"];
const CARD_PRICE_SELECTORS: [&str; 3] = [
    r#"[data-a-color="base"] .a-offscreen"#,
    ".a-price-range .a-offscreen",
    ".a-text-price .a-offscreen",
];
const DETAIL_PRICE_SELECTORS: [&str; 6] = [
    "#corePrice_feature_div .a-offscreen",
    "#sns-base-price .a-offscreen",
    "#priceblock_dealprice",
    "#priceblock_ourprice",
    "#priceblock_saleprice",
    "#apex_desktop .a-price .a-offscreen",
];
const DETAIL_AVAILABILITY_SELECTORS: [&str; 2] = [
    "#availability .a-color-success",
    "#availability .a-color-state",
];
/// Title-only lookups after dedupe, per keyword.
const TITLE_LOOKUP_LIMIT: usize = 3;

static MAIN_SLOT: LazyLock<Selector> = LazyLock::new(|| selector("div.s-main-slot"));
static CARD: LazyLock<Selector> = LazyLock::new(|| selector("div[data-asin]"));
static CARD_IMAGE: LazyLock<Selector> = LazyLock::new(|| selector("img.s-image"));
static CARD_LINK: LazyLock<Selector> = LazyLock::new(|| selector("h2 a"));
static PRICE_OFFSCREEN: LazyLock<Selector> = LazyLock::new(|| selector(".a-price .a-offscreen"));
static PRICE_WHOLE: LazyLock<Selector> = LazyLock::new(|| selector(".a-price-whole"));
static PRICE_FRACTION: LazyLock<Selector> = LazyLock::new(|| selector(".a-price-fraction"));
static PRODUCT_TITLE: LazyLock<Selector> = LazyLock::new(|| selector("#productTitle"));
static DETAIL_IMAGE: LazyLock<Selector> = LazyLock::new(|| selector("#imgTagWrapperId img[src]"));
static CARD_TITLES: LazyLock<Vec<Selector>> = LazyLock::new(|| selectors(&CARD_TITLE_SELECTORS));
static CARD_PRICES: LazyLock<Vec<Selector>> = LazyLock::new(|| selectors(&CARD_PRICE_SELECTORS));
static DETAIL_PRICES: LazyLock<Vec<Selector>> = LazyLock::new(|| selectors(&DETAIL_PRICE_SELECTORS));
static DETAIL_AVAILABILITY: LazyLock<Vec<Selector>> =
    LazyLock::new(|| selectors(&DETAIL_AVAILABILITY_SELECTORS));

pub fn dp_url(asin: &str) -> String {
    format!("{}/dp/{}", BASE_URL, asin)
}

// ── Parsing ──

/// One `div[data-asin]` card from a search page, before any detail fallback.
#[derive(Debug, Clone, PartialEq)]
pub struct SearchCard {
    pub asin: String,
    pub title: Option<String>,
    pub price_text: Option<String>,
    pub url: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct DetailInfo {
    pub title: Option<String>,
    pub price_text: Option<String>,
    pub availability_text: Option<String>,
    pub image_url: Option<String>,
}

fn selector(css: &str) -> Selector {
    Selector::parse(css).unwrap()
}

fn selectors(css: &[&str]) -> Vec<Selector> {
    css.iter().map(|c| selector(c)).collect()
}

/// Text nodes joined by `sep`, each trimmed, empties dropped.
fn text_of(el: ElementRef, sep: &str) -> String {
    el.text()
        .map(str::trim)
        .filter(|t| !t.is_empty())
        .collect::<Vec<_>>()
        .join(sep)
}

fn first_text(scope: ElementRef, sel: &Selector, sep: &str) -> Option<String> {
    scope
        .select(sel)
        .next()
        .map(|el| text_of(el, sep))
        .filter(|t| !t.is_empty())
}

fn doc_text(doc: &Html, sel: &Selector, sep: &str) -> Option<String> {
    first_text(doc.root_element(), sel, sep)
}

/// Cards in page order, or `None` when the page has no result slot at all
/// (captcha, layout change).
pub fn parse_search_results(html: &str) -> Option<Vec<SearchCard>> {
    let doc = Html::parse_document(html);
    let slot = doc.select(&MAIN_SLOT).next()?;
    let base = Url::parse(BASE_URL).ok();

    let cards = slot
        .select(&CARD)
        .filter_map(|card| {
            let asin = card.value().attr("data-asin")?.trim().to_string();
            if asin.is_empty() {
                return None;
            }
            Some(SearchCard {
                title: card_title(card),
                price_text: card_price(card),
                url: card_url(card, base.as_ref()),
                asin,
            })
        })
        .collect();
    Some(cards)
}

fn card_title(card: ElementRef) -> Option<String> {
    if let Some(t) = CARD_TITLES
        .iter()
        .find_map(|sel| card.select(sel).next())
        .map(|el| text_of(el, " "))
    {
        return Some(t).filter(|t| !t.is_empty());
    }
    card.select(&CARD_IMAGE)
        .next()
        .and_then(|img| img.value().attr("alt"))
        .map(|alt| alt.trim().to_string())
        .filter(|alt| !alt.is_empty())
}

fn card_price(card: ElementRef) -> Option<String> {
    if let Some(p) = first_text(card, &PRICE_OFFSCREEN, "") {
        return Some(p);
    }
    if let Some(whole) = first_text(card, &PRICE_WHOLE, "") {
        return match first_text(card, &PRICE_FRACTION, "") {
            Some(frac) => Some(format!("{}.{}", whole.trim_end_matches('.'), frac)),
            None => Some(whole),
        };
    }
    CARD_PRICES.iter().find_map(|sel| first_text(card, sel, ""))
}

fn card_url(card: ElementRef, base: Option<&Url>) -> Option<String> {
    let href = card
        .select(&CARD_LINK)
        .next()?
        .value()
        .attr("href")?
        .trim();
    if href.is_empty() {
        return None;
    }
    match base {
        Some(b) => b.join(href).ok().map(String::from),
        None => Some(href.to_string()),
    }
}

pub fn parse_detail_page(html: &str) -> DetailInfo {
    let doc = Html::parse_document(html);
    DetailInfo {
        title: doc_text(&doc, &PRODUCT_TITLE, " "),
        price_text: DETAIL_PRICES.iter().find_map(|sel| doc_text(&doc, sel, "")),
        availability_text: DETAIL_AVAILABILITY
            .iter()
            .find_map(|sel| doc_text(&doc, sel, "")),
        image_url: doc
            .select(&DETAIL_IMAGE)
            .next()
            .and_then(|img| img.value().attr("src"))
            .map(str::to_string)
            .filter(|s| !s.is_empty()),
    }
}

// ── Fetching ──

/// Detail pages fetched during one run, keyed by ASIN. Owned by the caller so
/// every run starts empty.
#[derive(Debug, Default)]
pub struct DetailCache {
    entries: HashMap<String, DetailInfo>,
    pub hits: usize,
}

impl DetailCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }
}

fn page_request(url: String) -> HttpRequest {
    HttpRequest::get(url)
        .header("User-Agent", USER_AGENT)
        .header("Accept-Language", ACCEPT_LANGUAGE)
}

async fn fetch_detail<T: Transport>(
    transport: &T,
    policy: &RetryPolicy,
    cache: &mut DetailCache,
    asin: &str,
) -> Result<DetailInfo, SourceError> {
    if let Some(hit) = cache.entries.get(asin) {
        cache.hits += 1;
        return Ok(hit.clone());
    }
    let resp = policy.send(transport, &page_request(dp_url(asin))).await?;
    let info = parse_detail_page(&resp.body);
    cache.entries.insert(asin.to_string(), info.clone());
    Ok(info)
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct DetailStats {
    pub used: usize,
    pub filled_title: usize,
    pub filled_price: usize,
}

/// Keyword search snapshot (source id = keyword). `since` does not filter it:
/// every run is a fresh ranking.
pub struct AmazonSearch<'a, T> {
    transport: &'a T,
    policy: RetryPolicy,
    cache: &'a mut DetailCache,
    detail_limit: usize,
    pub stats: DetailStats,
}

impl<'a, T: Transport> AmazonSearch<'a, T> {
    pub fn new(
        transport: &'a T,
        policy: RetryPolicy,
        cache: &'a mut DetailCache,
        detail_limit: usize,
    ) -> Self {
        Self {
            transport,
            policy,
            cache,
            detail_limit,
            stats: DetailStats::default(),
        }
    }
}

impl<T: Transport> Fetcher for AmazonSearch<'_, T> {
    async fn fetch(
        &mut self,
        keyword: &str,
        _since: Cursor,
        limit: usize,
    ) -> Result<FetchBatch, SourceError> {
        let req = page_request(format!("{}/s", BASE_URL)).query("k", keyword);
        let html = self.policy.send(self.transport, &req).await?.body;

        let Some(cards) = parse_search_results(&html) else {
            warn!("s-main-slot not found for keyword: {}", keyword);
            return Ok(FetchBatch::default());
        };

        self.stats = DetailStats::default();
        let mut records = Vec::new();
        for mut card in cards.into_iter().take(limit) {
            let needs_title = card.title.is_none();
            let needs_price = card.price_text.is_none();
            let mut filled = false;

            if (needs_title || needs_price) && self.stats.used < self.detail_limit {
                self.stats.used += 1;
                match fetch_detail(self.transport, &self.policy, self.cache, &card.asin).await {
                    Ok(detail) => {
                        if needs_title && detail.title.is_some() {
                            card.title = detail.title;
                            self.stats.filled_title += 1;
                            filled = true;
                        }
                        if needs_price && detail.price_text.is_some() {
                            card.price_text = detail.price_text;
                            self.stats.filled_price += 1;
                            filled = true;
                        }
                    }
                    Err(e) => debug!("detail fallback failed for {}: {}", card.asin, e),
                }
            }

            if card.title.is_none() || card.url.is_none() {
                warn!(
                    "missing field asin={} title={} url={}",
                    card.asin,
                    card.title.is_some(),
                    card.url.is_some()
                );
            }

            let mut raw = RawRecord::default();
            raw.insert("asin", card.asin);
            raw.insert("title", card.title.unwrap_or_default());
            raw.insert("price_text", card.price_text.unwrap_or_default());
            raw.insert("url", card.url.unwrap_or_default());
            raw.insert("detail_filled", filled);
            records.push(raw);
        }

        info!(
            "[{}] {} cards, detail_fallback_used={} (title {}, price {})",
            keyword,
            records.len(),
            self.stats.used,
            self.stats.filled_title,
            self.stats.filled_price
        );

        Ok(FetchBatch {
            records,
            next_cursor_hint: None,
            skipped: Vec::new(),
        })
    }

    /// Titles still missing after dedupe get a detail lookup, at most
    /// `TITLE_LOOKUP_LIMIT` per keyword, through the shared cache.
    async fn refine(&mut self, records: &mut [CanonicalRecord]) {
        let mut lookups = 0;
        for r in records.iter_mut() {
            if lookups >= TITLE_LOOKUP_LIMIT {
                break;
            }
            let Payload::Product(p) = &mut r.payload else {
                continue;
            };
            if p.title.is_some() {
                continue;
            }
            lookups += 1;
            match fetch_detail(self.transport, &self.policy, self.cache, &r.key).await {
                Ok(DetailInfo { title: Some(t), .. }) => {
                    info!("title filled for {}: {}", r.key, t.chars().take(50).collect::<String>());
                    p.title = Some(t);
                }
                Ok(_) => debug!("detail page of {} has no title either", r.key),
                Err(e) => warn!("title lookup failed for {}: {}", r.key, e),
            }
        }
    }
}

/// Detail page per ASIN of a watch list. A page that cannot be fetched is
/// skipped; the rest of the list proceeds.
pub struct ProductDetails<'a, T> {
    transport: &'a T,
    policy: RetryPolicy,
    cache: &'a mut DetailCache,
    asins: Vec<String>,
}

impl<'a, T: Transport> ProductDetails<'a, T> {
    pub fn new(
        transport: &'a T,
        policy: RetryPolicy,
        cache: &'a mut DetailCache,
        asins: Vec<String>,
    ) -> Self {
        Self {
            transport,
            policy,
            cache,
            asins,
        }
    }
}

impl<T: Transport> Fetcher for ProductDetails<'_, T> {
    async fn fetch(
        &mut self,
        source_id: &str,
        _since: Cursor,
        limit: usize,
    ) -> Result<FetchBatch, SourceError> {
        let mut batch = FetchBatch::default();
        for asin in self.asins.iter().take(limit) {
            match fetch_detail(self.transport, &self.policy, self.cache, asin).await {
                Ok(detail) => {
                    let raw = RawRecord::from_value(json!({
                        "asin": asin,
                        "title": detail.title.unwrap_or_default(),
                        "price_text": detail.price_text.unwrap_or_default(),
                        "availability_text": detail.availability_text.unwrap_or_default(),
                        "url": dp_url(asin),
                        "image_url": detail.image_url.unwrap_or_default(),
                    }))
                    .unwrap_or_default();
                    batch.records.push(raw);
                }
                Err(e) => {
                    warn!("{}: detail page for {} failed: {}", source_id, asin, e);
                    batch
                        .skipped
                        .push(RecordSkipped::new("fetch", Some(asin), e.to_string()));
                }
            }
        }
        Ok(batch)
    }
}

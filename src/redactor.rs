//! Screenshot redaction.
//!
//! The originating page's URL decides which sensitive-pattern classes apply.
//! Redaction is deliberately coarse: when any pattern class is enabled for a
//! page type the whole image is blurred, since a missed region is worse than
//! an over-blurred screenshot. When the image cannot be decoded the bytes are
//! passed through unchanged, but the metadata still records which classes the
//! policy asked for.

use std::collections::BTreeMap;
use std::io::Cursor;

use chrono::Utc;
use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::models::BlurMetadata;

const BLUR_SIGMA: f32 = 15.0;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PageType {
    Checkout,
    Dashboard,
    Settings,
    Product,
    Marketing,
    Default,
}

impl PageType {
    /// Fixed ordered path-pattern table; first match wins.
    pub fn detect(page_url: Option<&str>) -> PageType {
        let Some(url) = page_url else { return PageType::Default };
        let path = url_path(url);
        if path.contains("/checkout") || path.contains("/cart") {
            PageType::Checkout
        } else if path.contains("/dashboard") || path.contains("/sales") || path.contains("/analytics") {
            PageType::Dashboard
        } else if path.contains("/settings") || path.contains("/account") {
            PageType::Settings
        } else if path.contains("/p/") || path.contains("/products") {
            PageType::Product
        } else if path.contains("/discover") || path == "/" || path.is_empty() {
            PageType::Marketing
        } else {
            PageType::Default
        }
    }
}

/// Path component of a URL without pulling in a parser: drop the scheme and
/// authority, then cut at the query/fragment.
fn url_path(url: &str) -> &str {
    let rest = match url.find("://") {
        Some(idx) => {
            let after = &url[idx + 3..];
            match after.find('/') {
                Some(slash) => &after[slash..],
                None => "/",
            }
        }
        None => url,
    };
    let end = rest.find(['?', '#']).unwrap_or(rest.len());
    &rest[..end]
}

/// Which pattern classes and UI selectors a page type wants blurred.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PageRules {
    #[serde(default)]
    pub blur_patterns: BTreeMap<String, bool>,
    #[serde(default)]
    pub blur_selectors: Vec<String>,
}

impl PageRules {
    pub fn requested_patterns(&self) -> Vec<String> {
        self.blur_patterns
            .iter()
            .filter(|(_, enabled)| **enabled)
            .map(|(k, _)| k.clone())
            .collect()
    }

    pub fn wants_redaction(&self) -> bool {
        self.blur_patterns.values().any(|v| *v) || !self.blur_selectors.is_empty()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SanitizationConfig {
    pub pages: BTreeMap<PageType, PageRules>,
}

impl SanitizationConfig {
    /// Loads the externally-managed mapping; the compiled-in table below is
    /// used when the file is absent or unreadable.
    pub fn from_env() -> Self {
        let Ok(path) = std::env::var("BUGRELAY_SANITIZATION_CONFIG") else {
            return Self::builtin();
        };
        match std::fs::read(&path) {
            Ok(bytes) => match serde_json::from_slice(&bytes) {
                Ok(cfg) => cfg,
                Err(e) => {
                    warn!("failed to parse sanitization config '{path}': {e}; using builtin");
                    Self::builtin()
                }
            },
            Err(e) => {
                warn!("failed to read sanitization config '{path}': {e}; using builtin");
                Self::builtin()
            }
        }
    }

    pub fn builtin() -> Self {
        fn patterns(entries: &[(&str, bool)]) -> BTreeMap<String, bool> {
            entries.iter().map(|(k, v)| (k.to_string(), *v)).collect()
        }
        fn selectors(entries: &[&str]) -> Vec<String> {
            entries.iter().map(|s| s.to_string()).collect()
        }

        let mut pages = BTreeMap::new();
        pages.insert(
            PageType::Checkout,
            PageRules {
                blur_patterns: patterns(&[
                    ("email_addresses", true),
                    ("credit_card_numbers", true),
                    ("phone_numbers", true),
                ]),
                blur_selectors: selectors(&[".customer-email", ".payment-form", ".billing-address"]),
            },
        );
        pages.insert(
            PageType::Dashboard,
            PageRules {
                blur_patterns: patterns(&[
                    ("email_addresses", true),
                    ("credit_card_numbers", false),
                    ("phone_numbers", false),
                ]),
                blur_selectors: selectors(&[".customer-list", ".payout-balance"]),
            },
        );
        pages.insert(
            PageType::Settings,
            PageRules {
                blur_patterns: patterns(&[
                    ("email_addresses", true),
                    ("credit_card_numbers", true),
                    ("phone_numbers", true),
                ]),
                blur_selectors: selectors(&[".api-keys", ".connected-accounts"]),
            },
        );
        pages.insert(PageType::Product, PageRules::default());
        pages.insert(PageType::Marketing, PageRules::default());
        pages.insert(PageType::Default, PageRules::default());
        Self { pages }
    }

    pub fn rules_for(&self, page_type: PageType) -> PageRules {
        self.pages
            .get(&page_type)
            .or_else(|| self.pages.get(&PageType::Default))
            .cloned()
            .unwrap_or_default()
    }
}

pub struct RedactionOutcome {
    pub sanitized: Vec<u8>,
    pub metadata: Option<BlurMetadata>,
}

pub struct Redactor {
    config: SanitizationConfig,
}

impl Redactor {
    pub fn new(config: SanitizationConfig) -> Self {
        Self { config }
    }

    pub fn from_env() -> Self {
        Self::new(SanitizationConfig::from_env())
    }

    /// Produces the sanitized copy for a screenshot. Returns `None` only on
    /// unexpected processing errors; the orchestrator then reuses the
    /// original bytes as the sanitized asset.
    pub fn process(&self, screenshot: &[u8], page_url: Option<&str>) -> Option<RedactionOutcome> {
        let page_type = PageType::detect(page_url);
        let rules = self.config.rules_for(page_type);

        if !rules.wants_redaction() {
            return Some(RedactionOutcome { sanitized: screenshot.to_vec(), metadata: None });
        }

        let metadata = BlurMetadata {
            blurred_patterns: rules.requested_patterns(),
            blurred_selectors: rules.blur_selectors.clone(),
            timestamp: Utc::now(),
        };

        let sanitized = match blur_image(screenshot) {
            Ok(bytes) => bytes,
            Err(e) => {
                // Degrade to an unredacted copy rather than failing the
                // submission; the metadata still records intent.
                warn!("screenshot blur failed, storing unredacted copy: {e}");
                screenshot.to_vec()
            }
        };

        Some(RedactionOutcome { sanitized, metadata: Some(metadata) })
    }
}

fn blur_image(bytes: &[u8]) -> Result<Vec<u8>, image::ImageError> {
    let img = image::load_from_memory(bytes)?;
    let blurred = img.blur(BLUR_SIGMA);
    let mut out = Cursor::new(Vec::new());
    blurred.write_to(&mut out, image::ImageFormat::Png)?;
    Ok(out.into_inner())
}

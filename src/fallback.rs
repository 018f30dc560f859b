//! Deterministic fallback classifier.
//!
//! Runs whenever the remote model call fails, times out, or returns content
//! that cannot be parsed. The vocabulary (categories, severities, score range)
//! matches the remote path exactly so downstream gating is agnostic to which
//! path produced the verdict. The spam-signature table here is also the one
//! the publication job re-runs before opening a public issue.

use crate::models::{Severity, Verdict};

/// Below this many characters a plausible report is asked for more detail
/// instead of being rejected outright.
pub const MIN_DESCRIPTION_CHARS: usize = 25;

/// Fallback scores span this range; anything accepted is at least worth
/// looking at, nothing is auto-promoted to a perfect score.
const SCORE_FLOOR: f64 = 60.0;
const SCORE_CEILING: f64 = 100.0;

const TITLE_MAX_CHARS: usize = 80;

const CLARIFICATION_MESSAGE: &str = "Could you add more detail? What page were you on, what did you do, and what did you expect to happen instead?";

/// Placeholder words rejected on word boundaries.
const PLACEHOLDER_WORDS: &[&str] = &["test", "testing", "test123", "asdf", "qwerty"];

/// Keyboard-mash fragments rejected anywhere in the text.
const MASH_FRAGMENTS: &[&str] = &["asdf", "qwert", "zxcv", "hjkl", "test123"];

/// Promotional keywords; single words match on boundaries, phrases anywhere.
const PROMO_WORDS: &[&str] = &["free", "discount", "promo", "offer"];
const PROMO_PHRASES: &[&str] = &["buy now", "click here"];

/// Longest run of one repeated character tolerated before the text is
/// treated as gibberish.
const MAX_REPEAT_RUN: usize = 7;

/// Ordered keyword table for category inference; first match wins.
const CATEGORY_TABLE: &[(&str, &[&str])] = &[
    (
        "payment",
        &[
            "payment", "checkout", "charge", "charged", "card", "refund", "payout", "billing",
        ],
    ),
    (
        "performance",
        &[
            "slow", "timeout", "lag", "loading", "performance", "spinner", "freez", "hang",
        ],
    ),
    (
        "data",
        &[
            "export", "csv", "data", "missing", "lost", "import", "sync", "duplicate",
        ],
    ),
    (
        "ui",
        &[
            "button", "click", "display", "layout", "render", "overlap", "screen", "scroll",
            "style",
        ],
    ),
    (
        "authentication",
        &[
            "login", "log in", "password", "sign in", "signin", "logout", "session", "2fa",
        ],
    ),
];

/// Ordered keyword table for severity inference; highest tier checked first.
const SEVERITY_TABLE: &[(Severity, &[&str])] = &[
    (
        Severity::Critical,
        &[
            "crash",
            "data loss",
            "lost all",
            "cannot access",
            "can't access",
            "security",
            "charged twice",
            "payment failed",
        ],
    ),
    (
        Severity::High,
        &[
            "error", "broken", "fail", "500", "exception", "doesn't save", "not saving",
        ],
    ),
    (
        Severity::Medium,
        &[
            "incorrect",
            "wrong",
            "unexpected",
            "sometimes",
            "intermittent",
        ],
    ),
];

pub struct FallbackValidator;

impl FallbackValidator {
    /// Pure decision tree over the description text. Never errors.
    pub fn classify(description: &str) -> Verdict {
        let text = normalize(description);

        if text.is_empty() {
            return Verdict {
                valid: false,
                rejection_reason: Some("Bug report description is empty.".into()),
                ..Verdict::default()
            };
        }

        if let Some(signature) = matches_spam_signature(&text) {
            return Verdict {
                valid: false,
                rejection_reason: Some(format!(
                    "Report looks like {signature} rather than a bug description."
                )),
                ..Verdict::default()
            };
        }

        if text.chars().count() < MIN_DESCRIPTION_CHARS {
            return Verdict {
                valid: false,
                needs_clarification: true,
                clarification_message: Some(CLARIFICATION_MESSAGE.into()),
                sanitized_description: Some(text),
                ..Verdict::default()
            };
        }

        let category = infer_category(&text);
        let severity = infer_severity(&text);
        let score = quality_score(&text);

        Verdict {
            valid: true,
            quality_score: Some(score),
            category: Some(category.into()),
            severity: Some(severity),
            title: Some(derive_title(&text)),
            sanitized_description: Some(text),
            ..Verdict::default()
        }
    }
}

/// Strip HTML tags and collapse runs of whitespace.
pub fn normalize(raw: &str) -> String {
    let mut out = String::with_capacity(raw.len());
    let mut in_tag = false;
    for c in raw.chars() {
        match c {
            '<' => in_tag = true,
            '>' if in_tag => in_tag = false,
            c if !in_tag => out.push(c),
            _ => {}
        }
    }
    out.split_whitespace().collect::<Vec<_>>().join(" ")
}

/// The shared spam/gibberish table. Returns a short label for the matched
/// signature, used both in fallback rejection reasons and publication-gate
/// log lines.
pub fn matches_spam_signature(text: &str) -> Option<&'static str> {
    let lower = text.to_lowercase();

    if word_match(&lower, PLACEHOLDER_WORDS) {
        return Some("test or placeholder content");
    }
    let squeezed: String = lower.chars().filter(|c| !c.is_whitespace()).collect();
    if MASH_FRAGMENTS.iter().any(|f| squeezed.contains(f)) {
        return Some("keyboard mashing");
    }
    if !lower.chars().any(|c| c.is_alphabetic()) {
        return Some("non-alphabetic content");
    }
    if has_repeat_run(&lower) {
        return Some("repeated characters");
    }
    if PROMO_PHRASES.iter().any(|p| lower.contains(p)) || word_match(&lower, PROMO_WORDS) {
        return Some("promotional content");
    }
    None
}

fn word_match(lower: &str, words: &[&str]) -> bool {
    lower
        .split(|c: char| !c.is_alphanumeric())
        .any(|token| words.contains(&token))
}

fn has_repeat_run(text: &str) -> bool {
    let mut run = 0usize;
    let mut prev = None;
    for c in text.chars() {
        if Some(c) == prev {
            run += 1;
            if run > MAX_REPEAT_RUN {
                return true;
            }
        } else {
            prev = Some(c);
            run = 1;
        }
    }
    false
}

fn infer_category(text: &str) -> &'static str {
    let lower = text.to_lowercase();
    for (category, keywords) in CATEGORY_TABLE {
        if keywords.iter().any(|k| lower.contains(k)) {
            return *category;
        }
    }
    "other"
}

fn infer_severity(text: &str) -> Severity {
    let lower = text.to_lowercase();
    for (severity, keywords) in SEVERITY_TABLE {
        if keywords.iter().any(|k| lower.contains(k)) {
            return *severity;
        }
    }
    Severity::Low
}

/// Monotonic in text length: longer reports carry more signal, but the
/// fallback never awards a perfect score.
fn quality_score(text: &str) -> f64 {
    let len = text.chars().count() as f64;
    (SCORE_FLOOR + len / 10.0).clamp(SCORE_FLOOR, SCORE_CEILING)
}

fn derive_title(text: &str) -> String {
    if text.chars().count() <= TITLE_MAX_CHARS {
        return text.to_string();
    }
    let cut: String = text.chars().take(TITLE_MAX_CHARS - 1).collect();
    // Break on the last word boundary so titles don't end mid-word.
    let cut = match cut.rfind(' ') {
        Some(idx) if idx > TITLE_MAX_CHARS / 2 => &cut[..idx],
        _ => cut.as_str(),
    };
    format!("{cut}…")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_description_is_rejected() {
        let v = FallbackValidator::classify("   ");
        assert!(!v.valid);
        assert!(!v.needs_clarification);
        assert!(v.rejection_reason.is_some());
    }

    #[test]
    fn html_is_stripped_before_anything_else() {
        let v = FallbackValidator::classify("<p></p> <br/>");
        assert!(!v.valid);
    }

    #[test]
    fn keyboard_mash_is_spam() {
        assert!(matches_spam_signature("asdfasdf").is_some());
        assert!(matches_spam_signature("qwertyqwerty").is_some());
    }

    #[test]
    fn repeated_characters_are_spam() {
        assert!(matches_spam_signature("aaaaaaaaaa").is_some());
        assert_eq!(matches_spam_signature("aaaa is broken on the page"), None);
    }

    #[test]
    fn promo_keywords_are_spam() {
        assert!(matches_spam_signature("buy now click here free discount").is_some());
    }

    #[test]
    fn legitimate_text_is_not_spam() {
        assert_eq!(
            matches_spam_signature(
                "Clicking the 'Export CSV' button on the sales dashboard throws a 500 error"
            ),
            None
        );
    }

    #[test]
    fn short_reports_need_clarification_not_rejection() {
        let v = FallbackValidator::classify("It doesn't work");
        assert!(!v.valid);
        assert!(v.needs_clarification);
        assert!(v.clarification_message.is_some());
        assert!(v.rejection_reason.is_none());
    }

    #[test]
    fn detailed_report_is_accepted_with_publishable_score() {
        let text = "Clicking the 'Export CSV' button on the sales dashboard throws a 500 error; happens every time with more than 50 rows selected.";
        let v = FallbackValidator::classify(text);
        assert!(v.valid);
        assert!(v.quality_score.unwrap() >= 70.0);
        assert_eq!(v.severity, Some(Severity::High));
        // "payment"/"performance" keywords are absent; "export"/"csv" land first.
        assert_eq!(v.category.as_deref(), Some("data"));
        assert!(v.title.as_ref().unwrap().chars().count() <= 80);
    }

    #[test]
    fn category_table_first_match_wins() {
        let v = FallbackValidator::classify(
            "The checkout button renders behind the footer so I cannot finish paying",
        );
        assert_eq!(v.category.as_deref(), Some("payment"));
    }

    #[test]
    fn score_is_monotonic_and_clamped() {
        let short = FallbackValidator::classify(&"a bug happens here every time ".repeat(1));
        let long = FallbackValidator::classify(&"a bug happens here every time ".repeat(30));
        assert!(long.quality_score.unwrap() >= short.quality_score.unwrap());
        assert_eq!(long.quality_score.unwrap(), 100.0);
    }

    #[test]
    fn title_is_truncated_on_word_boundary() {
        let text = "When I open the analytics overview page the revenue chart renders twice and the second copy overlaps the export controls";
        let v = FallbackValidator::classify(text);
        let title = v.title.unwrap();
        assert!(title.chars().count() <= 80);
        assert!(title.ends_with('…'));
    }
}

//! Text heuristics shared by the extractors.

use std::collections::BTreeMap;
use std::sync::LazyLock;

use regex::Regex;
use wm_core::KnownBrand;

static YEAR_WITH_KEYWORD: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)(?:baujahr|jahr|year|papers from|original-papiere: ja \()\s*:?\s*(?:ca\.\s*|um\s*)?(\d{4})\b")
        .expect("valid year regex")
});

static STANDALONE_YEAR: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\b(19[5-9]\d|20[0-3]\d)\b").expect("valid standalone year regex"));

static REFERENCE_JUNK: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"[^\w\-.]").expect("valid reference regex"));

/// Text preceding a number that marks it as an identifier, not a year.
const NON_YEAR_PREFIXES: &[&str] = &[
    "ref", "sku", "id:", "art-nr", "no.", "mod", "artikel", "p/n", "ident", "kal.",
];

const BOTH_KEYWORDS: &[&str] = &[
    "box and paper",
    "box und papieren",
    "fullset",
    "full set",
    "box & papers",
    "box, papiere",
];

const PAPERS_YES: &[&str] = &[
    "papers: yes",
    "papiere: ja",
    "original-papiere: ja",
    "originalzertifikat",
    "zertifikat vorhanden",
    "mit papieren",
    "original papieren",
    "mit zertifikat",
    "papiere vorhanden",
    "service karte",
    "garantiekarte",
    "certificate",
    "papiere",
    "papers",
];

const PAPERS_NO: &[&str] = &["papers: no", "papiere: nein", "ohne papiere", "original-papiere: nein"];

const BOX_YES: &[&str] = &[
    "box: yes",
    "box: ja",
    "original-box: ja",
    "original box",
    "originalbox",
    "mit box",
    "originalverpackung",
    "box vorhanden",
];

const BOX_NO: &[&str] = &["box: no", "box: nein", "ohne box", "original-box: nein"];

/// Condition keyword tiers, best first.
const CONDITION_TIERS: &[(&[&str], &str)] = &[
    (
        &["ungetragen", "unworn", "new old stock", "nos", "fabrikneu", "mint", " neu ", " new ", "neuwertig"],
        "★★★★★",
    ),
    (
        &[
            "excellent",
            "very nice original condition",
            "top zustand",
            "makellos",
            "near mint",
            "perfekter zustand",
            "sehr guter zustand",
            "very good condition",
            "1a zustand",
        ],
        "★★★★☆",
    ),
    (
        &[
            "leichte gebrauchsspuren",
            "leichte tragespuren",
            "good condition",
            "nice condition",
            "gut erhalten",
            "guter zustand",
            "gebraucht",
        ],
        "★★★☆☆",
    ),
    (
        &["light wear", "fair condition", "sichtbare gebrauchsspuren", "getragen"],
        "★★☆☆☆",
    ),
    (
        &[
            "gebrauchsspuren",
            "worn",
            "signs of wear",
            "deutliche gebrauchsspuren",
            "strong signs of use",
            "starke gebrauchsspuren",
        ],
        "★☆☆☆☆",
    ),
];

fn contains_any(haystack: &str, needles: &[&str]) -> bool {
    needles.iter().any(|n| haystack.contains(n))
}

/// Production year mentioned in `text`, falling back to `title`.
pub fn parse_year(text: &str, title: &str) -> Option<String> {
    [text, title]
        .into_iter()
        .filter(|t| !t.is_empty())
        .find_map(year_in)
}

fn year_in(text: &str) -> Option<String> {
    if let Some(caps) = YEAR_WITH_KEYWORD.captures(text) {
        let year = &caps[1];
        if year.parse::<u32>().is_ok_and(|y| (1900..=2030).contains(&y)) {
            return Some(year.to_string());
        }
    }

    STANDALONE_YEAR.find_iter(text).find_map(|m| {
        let context_start = text[..m.start()]
            .char_indices()
            .rev()
            .nth(14)
            .map(|(i, _)| i)
            .unwrap_or(0);
        let context = text[context_start..m.start()].to_lowercase();
        if contains_any(&context, NON_YEAR_PREFIXES) {
            None
        } else {
            Some(m.as_str().to_string())
        }
    })
}

/// `(has_papers, has_box)`; `None` where the text says nothing.
pub fn parse_box_papers(text: &str) -> (Option<bool>, Option<bool>) {
    if text.is_empty() {
        return (None, None);
    }
    let lower = text.to_lowercase();

    if contains_any(&lower, BOTH_KEYWORDS) {
        return (Some(true), Some(true));
    }

    // Negatives first: "ohne papiere" also contains "papiere".
    let mut papers = if contains_any(&lower, PAPERS_NO) {
        Some(false)
    } else if contains_any(&lower, PAPERS_YES) {
        Some(true)
    } else {
        None
    };

    let mut has_box = if contains_any(&lower, BOX_NO) {
        Some(false)
    } else if contains_any(&lower, BOX_YES) {
        Some(true)
    } else if lower.contains("box") {
        Some(true)
    } else {
        None
    };

    if lower.contains("accessories: none") || lower.contains("accessories:none") {
        papers = Some(false);
        has_box = Some(false);
    }

    (papers, has_box)
}

/// Star rating for a condition description. Exact site mappings win over
/// the keyword tiers.
pub fn parse_condition(text: &str, mappings: &BTreeMap<String, String>) -> Option<String> {
    if text.is_empty() {
        return None;
    }
    if let Some(mapped) = mappings.get(text) {
        return Some(mapped.clone());
    }
    let lower = text.to_lowercase();
    CONDITION_TIERS
        .iter()
        .find(|(keywords, _)| contains_any(&lower, keywords))
        .map(|(_, rating)| rating.to_string())
}

/// Uppercased reference with `REF.`-style prefixes and punctuation removed.
pub fn clean_reference(raw: &str) -> Option<String> {
    let mut reference = raw.trim().to_uppercase();
    for prefix in ["REFERENCE", "REF.", "REF", "MODEL"] {
        if let Some(rest) = reference.strip_prefix(prefix) {
            reference = rest.trim().to_string();
        }
    }
    let cleaned = REFERENCE_JUNK.replace_all(&reference, "").into_owned();
    (!cleaned.is_empty()).then_some(cleaned)
}

/// Split a title into brand and model. Known brand prefixes are tried in
/// order; otherwise the first word is taken as the brand.
pub fn split_brand_model(title: &str, known_brands: &[KnownBrand]) -> (Option<String>, Option<String>) {
    let title = title.trim();
    if title.is_empty() {
        return (None, None);
    }
    let lower = title.to_lowercase();

    for brand in known_brands {
        let prefix = brand.prefix.to_lowercase();
        if prefix.is_empty() || !lower.starts_with(&prefix) {
            continue;
        }
        let rest = title.get(prefix.len()..).unwrap_or_default().trim();
        let rest = rest
            .strip_prefix('-')
            .or_else(|| rest.strip_prefix('|'))
            .unwrap_or(rest)
            .trim();
        return (Some(brand.name.clone()), (!rest.is_empty()).then(|| rest.to_string()));
    }

    match title.split_once(' ') {
        Some((brand, model)) => (Some(brand.to_string()), Some(model.trim().to_string())),
        None => (Some(title.to_string()), None),
    }
}

//! Value washers and collation strategies.
//!
//! A washer spec is the text stored with a method, e.g.
//! `sort_alphanumerically_remove_leading_articles:fr`: a washer name and an
//! optional locale. The name selects a [`ValueWasher`] from the
//! [`WasherRegistry`]; the locale selects the [`Collation`] the order index
//! compares with.

use crate::error::ConfigError;
use crate::{RecId, SortValue};
use lazy_static::lazy_static;
use regex::Regex;
use std::cmp::Ordering;
use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;
use unicode_normalization::char::is_combining_mark;
use unicode_normalization::UnicodeNormalization;

pub const NOOP: &str = "NOOP";

lazy_static! {
    static ref LEADING_JUNK: Regex = Regex::new(r"^[^\p{L}\p{N}]+").expect("valid regex");
    static ref LEADING_ARTICLE: Regex =
        Regex::new(r"^(?:(?:the|an|a|les|le|la|der|die|das|el|los|las|il|lo|gli)\s+|l')")
            .expect("valid regex");
    static ref SYMBOLS: Regex = Regex::new(r"[^\p{L}\p{N}\s]+").expect("valid regex");
    static ref SPACES: Regex = Regex::new(r"\s+").expect("valid regex");
    static ref NUMBER: Regex = Regex::new(r"[-+]?\d+(?:\.\d+)?").expect("valid regex");
    static ref DATE: Regex =
        Regex::new(r"^\s*(\d{4})(?:[-/.]?(\d{1,2}))?(?:[-/.]?(\d{1,2}))?").expect("valid regex");
}

/// Normalises a raw value before it is ordered.
pub trait ValueWasher: Send + Sync {
    fn name(&self) -> &str;
    fn transform(&self, raw: SortValue) -> SortValue;
}

struct FnWasher {
    name: &'static str,
    wash: fn(SortValue) -> SortValue,
}

impl ValueWasher for FnWasher {
    fn name(&self) -> &str {
        self.name
    }

    fn transform(&self, raw: SortValue) -> SortValue {
        (self.wash)(raw)
    }
}

/// Washers available to methods, looked up by name.
pub struct WasherRegistry {
    washers: HashMap<String, Box<dyn ValueWasher>>,
}

impl Default for WasherRegistry {
    fn default() -> Self {
        Self::with_builtins()
    }
}

impl WasherRegistry {
    pub fn empty() -> Self {
        Self { washers: HashMap::new() }
    }

    pub fn with_builtins() -> Self {
        let mut registry = Self::empty();
        let builtins: [(&'static str, fn(SortValue) -> SortValue); 6] = [
            (NOOP, |v| v),
            ("sort_alphanumerically_remove_leading_articles", remove_leading_articles),
            ("sort_case_insensitive", case_insensitive),
            ("sort_nosymbols_case_insensitive", nosymbols_case_insensitive),
            ("sort_numerically", numerically),
            ("sort_dates", dates),
        ];
        for (name, wash) in builtins {
            registry.register(Box::new(FnWasher { name, wash }));
        }
        registry
    }

    pub fn register(&mut self, washer: Box<dyn ValueWasher>) {
        self.washers.insert(washer.name().to_string(), washer);
    }

    pub fn get(&self, name: &str) -> Option<&dyn ValueWasher> {
        self.washers.get(name).map(|w| w.as_ref())
    }

    pub fn names(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.washers.keys().map(String::as_str).collect();
        names.sort_unstable();
        names
    }

    /// Fails when `spec` names a washer that is not registered.
    pub fn check(&self, spec: &WasherSpec) -> Result<(), ConfigError> {
        match spec.name() {
            Some(name) if self.get(name).is_none() => {
                Err(ConfigError::UnknownWasher { name: name.to_string() })
            }
            _ => Ok(()),
        }
    }

    /// Wash every value in place.
    pub fn wash_all(
        &self,
        spec: &WasherSpec,
        values: &mut HashMap<RecId, SortValue>,
    ) -> Result<(), ConfigError> {
        let Some(name) = spec.name() else { return Ok(()) };
        let washer = self
            .get(name)
            .ok_or_else(|| ConfigError::UnknownWasher { name: name.to_string() })?;
        tracing::debug!(washer = name, records = values.len(), "washing values");
        for value in values.values_mut() {
            let raw = std::mem::replace(value, SortValue::Number(0.0));
            *value = washer.transform(raw);
        }
        Ok(())
    }
}

/// Washer name plus optional locale, as stored with a method.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct WasherSpec {
    name: Option<String>,
    locale: Option<String>,
}

impl WasherSpec {
    pub fn identity() -> Self {
        Self::default()
    }

    /// `None` when values are used as extracted.
    pub fn name(&self) -> Option<&str> {
        self.name.as_deref()
    }

    pub fn locale(&self) -> Option<&str> {
        self.locale.as_deref()
    }

    pub fn collation(&self) -> Collation {
        match &self.locale {
            Some(locale) => Collation::Folded { locale: locale.clone() },
            None => Collation::Binary,
        }
    }
}

impl FromStr for WasherSpec {
    type Err = std::convert::Infallible;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (name, locale) = match s.split_once(':') {
            Some((name, locale)) => (name.trim(), Some(locale.trim())),
            None => (s.trim(), None),
        };
        let name = (!name.is_empty() && name != NOOP).then(|| name.to_string());
        let locale = locale.filter(|l| !l.is_empty()).map(str::to_string);
        Ok(Self { name, locale })
    }
}

impl fmt::Display for WasherSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name.as_deref().unwrap_or(NOOP))?;
        if let Some(locale) = &self.locale {
            write!(f, ":{locale}")?;
        }
        Ok(())
    }
}

/// How two washed values compare.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub enum Collation {
    /// Numbers by value, text by code point.
    #[default]
    Binary,
    /// Text is compared accent- and case-insensitively first, then by code point.
    Folded { locale: String },
}

impl Collation {
    pub fn compare(&self, a: &SortValue, b: &SortValue) -> Ordering {
        match (self, a, b) {
            (Collation::Folded { .. }, SortValue::Text(x), SortValue::Text(y)) => {
                fold(x).cmp(fold(y)).then_with(|| x.cmp(y))
            }
            _ => a.cmp(b),
        }
    }
}

fn fold(s: &str) -> impl Iterator<Item = char> + '_ {
    s.nfkd().filter(|c| !is_combining_mark(*c)).flat_map(char::to_lowercase)
}

fn map_text(raw: SortValue, f: impl FnOnce(&str) -> String) -> SortValue {
    match raw {
        SortValue::Text(s) => SortValue::Text(f(&s)),
        number => number,
    }
}

fn case_insensitive(raw: SortValue) -> SortValue {
    map_text(raw, |s| s.nfkc().collect::<String>().to_lowercase())
}

fn nosymbols_case_insensitive(raw: SortValue) -> SortValue {
    map_text(raw, |s| {
        let lowered = s.nfkc().collect::<String>().to_lowercase();
        let stripped = SYMBOLS.replace_all(&lowered, "");
        SPACES.replace_all(stripped.trim(), " ").into_owned()
    })
}

fn remove_leading_articles(raw: SortValue) -> SortValue {
    map_text(raw, |s| {
        let lowered = s.nfkc().collect::<String>().to_lowercase();
        let trimmed = LEADING_JUNK.replace(&lowered, "");
        let without_article = LEADING_ARTICLE.replace(&trimmed, "");
        LEADING_JUNK.replace(&without_article, "").into_owned()
    })
}

fn numerically(raw: SortValue) -> SortValue {
    match raw {
        SortValue::Text(s) => match NUMBER.find(&s).and_then(|m| m.as_str().parse::<f64>().ok()) {
            Some(n) => SortValue::Number(n),
            None => SortValue::Text(s),
        },
        number => number,
    }
}

fn dates(raw: SortValue) -> SortValue {
    match raw {
        SortValue::Text(s) => match DATE.captures(&s) {
            Some(caps) => {
                let part = |i: usize| {
                    caps.get(i).and_then(|m| m.as_str().parse::<u32>().ok()).unwrap_or(0)
                };
                SortValue::Text(format!("{}{:02}{:02}", &caps[1], part(2), part(3)))
            }
            None => SortValue::Text(s),
        },
        SortValue::Number(n) => SortValue::Number(n),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn washer_with_locale() {
        let spec: WasherSpec = "sort_case_insensitive:fr".parse().unwrap();
        assert_eq!(spec.name(), Some("sort_case_insensitive"));
        assert_eq!(spec.collation(), Collation::Folded { locale: "fr".into() });
        assert_eq!(spec.to_string(), "sort_case_insensitive:fr");
    }

    #[test]
    fn noop_is_identity() {
        let spec: WasherSpec = "NOOP".parse().unwrap();
        assert_eq!(spec, WasherSpec::identity());
        assert_eq!(spec.collation(), Collation::Binary);
    }

    #[test]
    fn folded_collation_ignores_accents() {
        let folded = Collation::Folded { locale: "fr".into() };
        let e = SortValue::from("ecole");
        let e_acute = SortValue::from("école");
        let f = SortValue::from("fable");
        assert_eq!(folded.compare(&e_acute, &f), Ordering::Less);
        assert_eq!(Collation::Binary.compare(&e_acute, &f), Ordering::Greater);
        // equal folded keys fall back to code points
        assert_eq!(folded.compare(&e, &e_acute), Ordering::Less);
    }
}

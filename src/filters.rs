//! Field filter engine.
//!
//! Each [`Filter`] targets one listing field. The field's declared kind picks
//! the evaluator: string fields run a boolean rule (after preremoval and the
//! disallowed-word check), numeric fields run a range comparison.
//!
//! Combination: every `AND` filter must pass; if any `OR` filter applies, at
//! least one must pass. A filter whose field is absent from the listing is
//! skipped entirely.

use std::collections::HashMap;

use once_cell::sync::OnceCell;
use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::FilterError;
use crate::model::{Filter, FilterId, ListingRecord, RuleType};
use crate::rules::{normalize_text, Expr};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FieldKind {
    String,
    Numeric,
}

/// Declared listing fields across all registered sources.
#[derive(Debug, Clone, Default)]
pub struct FieldSchema {
    fields: HashMap<String, FieldKind>,
}

impl FieldSchema {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_field(mut self, name: impl Into<String>, kind: FieldKind) -> Self {
        self.declare(name, kind);
        self
    }

    /// First declaration of a field name wins. Returns false on a conflicting redeclaration.
    pub fn declare(&mut self, name: impl Into<String>, kind: FieldKind) -> bool {
        let name = name.into();
        match self.fields.get(&name) {
            Some(existing) => *existing == kind,
            None => {
                self.fields.insert(name, kind);
                true
            }
        }
    }

    pub fn kind_of(&self, field: &str) -> Option<FieldKind> {
        self.fields.get(field).copied()
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Bound {
    pub value: f64,
    pub inclusive: bool,
}

/// Numeric comparator with independently inclusive/exclusive ends.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct NumericRange {
    pub min: Option<Bound>,
    pub max: Option<Bound>,
}

impl NumericRange {
    /// Parse comparisons like `>= 100, < 500` (also `and`-separated, or `= 42`).
    pub fn parse(expr: &str) -> Result<Self, FilterError> {
        static RE_CMP: OnceCell<Regex> = OnceCell::new();
        static RE_SEP: OnceCell<Regex> = OnceCell::new();
        let re_cmp = RE_CMP.get_or_init(|| {
            Regex::new(r"^(<=|>=|==|<|>|=)\s*(-?\d+(?:\.\d+)?)$").expect("valid comparison regex")
        });
        let re_sep =
            RE_SEP.get_or_init(|| Regex::new(r"(?i),|\s+and\s+|&").expect("valid separator regex"));

        let invalid = || FilterError::InvalidNumericRule(expr.to_string());
        let mut range = NumericRange::default();
        let mut seen = 0usize;
        for part in re_sep.split(expr) {
            let part = part.trim();
            if part.is_empty() {
                continue;
            }
            let caps = re_cmp.captures(part).ok_or_else(invalid)?;
            let value: f64 = caps[2].parse().map_err(|_| invalid())?;
            match &caps[1] {
                ">" => range.min = Some(Bound { value, inclusive: false }),
                ">=" => range.min = Some(Bound { value, inclusive: true }),
                "<" => range.max = Some(Bound { value, inclusive: false }),
                "<=" => range.max = Some(Bound { value, inclusive: true }),
                _ => {
                    range.min = Some(Bound { value, inclusive: true });
                    range.max = Some(Bound { value, inclusive: true });
                }
            }
            seen += 1;
        }
        if seen == 0 {
            return Err(invalid());
        }
        Ok(range)
    }

    pub fn contains(&self, v: f64) -> bool {
        let min_ok = self
            .min
            .map_or(true, |b| if b.inclusive { v >= b.value } else { v > b.value });
        let max_ok = self
            .max
            .map_or(true, |b| if b.inclusive { v <= b.value } else { v < b.value });
        min_ok && max_ok
    }
}

/// Boolean rule plus the string-field preprocessing lists.
#[derive(Debug, Clone, PartialEq)]
pub struct StringRule {
    pub expr: Expr,
    preremove: Vec<String>,
    disallowed: Vec<String>,
}

impl StringRule {
    pub fn new(expr: Expr, preremove: &[String], disallowed: &[String]) -> Self {
        let clean = |words: &[String]| {
            words
                .iter()
                .map(|w| normalize_text(w))
                .filter(|w| !w.is_empty())
                .collect::<Vec<_>>()
        };
        Self {
            expr,
            preremove: clean(preremove),
            disallowed: clean(disallowed),
        }
    }

    pub fn test(&self, text: &str) -> bool {
        let mut text = normalize_text(text);
        for word in &self.preremove {
            text = text.replace(word.as_str(), "");
        }
        if self.disallowed.iter().any(|w| text.contains(w.as_str())) {
            return false;
        }
        self.expr.evaluate(&text)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum Evaluator {
    Text(StringRule),
    Numeric(NumericRange),
}

#[derive(Debug, Clone, PartialEq)]
pub struct CompiledFilter {
    pub id: FilterId,
    pub field: String,
    pub rule_type: RuleType,
    pub evaluator: Evaluator,
}

impl CompiledFilter {
    pub fn compile(filter: &Filter, schema: &FieldSchema) -> Result<Self, FilterError> {
        let kind = schema
            .kind_of(&filter.field)
            .ok_or_else(|| FilterError::UnknownField(filter.field.clone()))?;
        let evaluator = match kind {
            FieldKind::String => Evaluator::Text(StringRule::new(
                Expr::parse(&filter.rule_expr)?,
                &filter.preremove,
                &filter.disallowed,
            )),
            FieldKind::Numeric => Evaluator::Numeric(NumericRange::parse(&filter.rule_expr)?),
        };
        Ok(Self {
            id: filter.id,
            field: filter.field.clone(),
            rule_type: filter.rule_type,
            evaluator,
        })
    }

    /// Numbers are matched as text by string rules; numeric rules only accept numbers.
    pub fn test(&self, value: &Value) -> bool {
        match (&self.evaluator, value) {
            (Evaluator::Text(rule), Value::String(s)) => rule.test(s),
            (Evaluator::Text(rule), Value::Number(n)) => rule.test(&n.to_string()),
            (Evaluator::Numeric(range), Value::Number(n)) => {
                n.as_f64().is_some_and(|v| range.contains(v))
            }
            _ => {
                tracing::debug!(field = %self.field, "filter kind does not match listing value");
                false
            }
        }
    }
}

/// All of one subscriber's filters, partitioned by rule type.
#[derive(Debug, Clone, Default)]
pub struct FilterSet {
    and: Vec<CompiledFilter>,
    or: Vec<CompiledFilter>,
}

impl FilterSet {
    pub fn compile(filters: &[Filter], schema: &FieldSchema) -> Result<Self, FilterError> {
        let mut set = FilterSet::default();
        for filter in filters {
            set.push(CompiledFilter::compile(filter, schema)?);
        }
        Ok(set)
    }

    /// Like [`FilterSet::compile`], but filters that no longer compile are
    /// logged and left out instead of failing the whole set.
    pub fn compile_lenient(filters: &[Filter], schema: &FieldSchema) -> Self {
        let mut set = FilterSet::default();
        for filter in filters {
            match CompiledFilter::compile(filter, schema) {
                Ok(compiled) => set.push(compiled),
                Err(e) => tracing::warn!(
                    filter = %filter.id,
                    field = %filter.field,
                    error = %e,
                    "skipping filter that does not compile"
                ),
            }
        }
        set
    }

    fn push(&mut self, filter: CompiledFilter) {
        match filter.rule_type {
            RuleType::And => self.and.push(filter),
            RuleType::Or => self.or.push(filter),
        }
    }

    pub fn len(&self) -> usize {
        self.and.len() + self.or.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn matches(&self, listing: &ListingRecord) -> bool {
        let and_ok = self.and.iter().all(|f| match listing.field(&f.field) {
            Some(v) => f.test(v),
            None => true,
        });
        if !and_ok {
            return false;
        }

        let mut or_applied = false;
        let mut or_ok = false;
        for f in &self.or {
            if let Some(v) = listing.field(&f.field) {
                or_applied = true;
                if f.test(v) {
                    or_ok = true;
                    break;
                }
            }
        }
        !or_applied || or_ok
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{NewListing, SearchSpec};
    use chrono::Utc;
    use serde_json::json;

    fn schema() -> FieldSchema {
        FieldSchema::new()
            .with_field("title", FieldKind::String)
            .with_field("price", FieldKind::Numeric)
    }

    fn listing(fields: Value) -> ListingRecord {
        let Value::Object(map) = fields else {
            panic!("fields must be an object")
        };
        let spec = SearchSpec::new("test", &json!({}));
        ListingRecord::from_new(spec.id, NewListing::new(Utc::now(), map), Utc::now())
    }

    #[test]
    fn and_plus_or_combination() {
        let filters = vec![
            Filter::new("price", RuleType::And, ">= 100"),
            Filter::new("title", RuleType::Or, "bike"),
            Filter::new("title", RuleType::Or, "scooter"),
        ];
        let set = FilterSet::compile(&filters, &schema()).unwrap();

        assert!(set.matches(&listing(json!({"title": "Vespa scooter", "price": 150}))));
        assert!(!set.matches(&listing(json!({"title": "Honda car", "price": 150}))));
        assert!(!set.matches(&listing(json!({"title": "bike", "price": 50}))));
    }

    #[test]
    fn no_or_filters_is_vacuously_true() {
        let set = FilterSet::compile(&[Filter::new("price", RuleType::And, "< 10")], &schema()).unwrap();
        assert!(set.matches(&listing(json!({"title": "anything", "price": 5}))));
    }

    #[test]
    fn absent_field_is_skipped() {
        let filters = vec![
            Filter::new("price", RuleType::And, "< 10"),
            Filter::new("price", RuleType::Or, "> 1000"),
        ];
        let set = FilterSet::compile(&filters, &schema()).unwrap();
        assert!(set.matches(&listing(json!({"title": "no price here"}))));
        assert!(set.matches(&listing(json!({"title": "null price", "price": null}))));
    }

    #[test]
    fn preremoval_neutralizes_false_positive() {
        let filters = vec![Filter::new("title", RuleType::And, "exc").with_preremove(["Excellent"])];
        let set = FilterSet::compile(&filters, &schema()).unwrap();
        assert!(!set.matches(&listing(json!({"title": "excellent condition"}))));
        assert!(set.matches(&listing(json!({"title": "2020 KTM EXC 300"}))));
    }

    #[test]
    fn disallowed_word_fails_immediately() {
        let filters =
            vec![Filter::new("title", RuleType::And, "ktm").with_disallowed(["parts only"])];
        let set = FilterSet::compile(&filters, &schema()).unwrap();
        assert!(set.matches(&listing(json!({"title": "KTM 300 XC"}))));
        assert!(!set.matches(&listing(json!({"title": "KTM 300   PARTS only"}))));
    }

    #[test]
    fn numeric_bounds_respect_inclusivity() {
        let r = NumericRange::parse(">= 100, < 500").unwrap();
        assert!(r.contains(100.0));
        assert!(r.contains(499.99));
        assert!(!r.contains(500.0));
        assert!(!r.contains(99.0));

        let r = NumericRange::parse("> 100 and <= 500").unwrap();
        assert!(!r.contains(100.0));
        assert!(r.contains(500.0));

        let r = NumericRange::parse("= 42").unwrap();
        assert!(r.contains(42.0));
        assert!(!r.contains(42.5));
    }

    #[test]
    fn compile_errors_surface() {
        assert!(matches!(
            FilterSet::compile(&[Filter::new("title", RuleType::And, "ktm # exc")], &schema()),
            Err(FilterError::Parse(_))
        ));
        assert!(matches!(
            FilterSet::compile(&[Filter::new("price", RuleType::And, "cheap")], &schema()),
            Err(FilterError::InvalidNumericRule(_))
        ));
        assert!(matches!(
            FilterSet::compile(&[Filter::new("mileage", RuleType::And, "< 5")], &schema()),
            Err(FilterError::UnknownField(_))
        ));
    }

    #[test]
    fn lenient_compile_drops_bad_filters() {
        let filters = vec![
            Filter::new("title", RuleType::And, "("),
            Filter::new("price", RuleType::And, "< 10"),
        ];
        let set = FilterSet::compile_lenient(&filters, &schema());
        assert_eq!(set.len(), 1);
    }

    #[test]
    fn kind_mismatch_fails_the_filter() {
        let set = FilterSet::compile(&[Filter::new("price", RuleType::And, "< 10")], &schema()).unwrap();
        assert!(!set.matches(&listing(json!({"price": "five"}))));
    }
}

// tests/filter_properties.rs
use chrono::Utc;
use serde_json::{json, Value};

use listing_notifier::filters::{FieldKind, FieldSchema, FilterSet};
use listing_notifier::model::NewListing;
use listing_notifier::rules::{parse_rule, Expr};
use listing_notifier::{Filter, ListingRecord, ParseError, RuleType, SearchSpec};

fn schema() -> FieldSchema {
    FieldSchema::new()
        .with_field("title", FieldKind::String)
        .with_field("price", FieldKind::Numeric)
}

fn record(fields: Value) -> ListingRecord {
    let Value::Object(map) = fields else {
        panic!("object expected")
    };
    let now = Utc::now();
    ListingRecord::from_new(SearchSpec::new("feeds.test", &json!({})).id, NewListing::new(now, map), now)
}

#[test]
fn and_filters_gate_or_filters_choose() {
    let set = FilterSet::compile(
        &[
            Filter::new("price", RuleType::And, ">= 100"),
            Filter::new("title", RuleType::Or, "bike"),
            Filter::new("title", RuleType::Or, "scooter"),
        ],
        &schema(),
    )
    .unwrap();

    assert!(set.matches(&record(json!({"title": "Vespa scooter", "price": 150}))));
    assert!(!set.matches(&record(json!({"title": "Honda car", "price": 150}))));
    assert!(!set.matches(&record(json!({"title": "kids bike", "price": 50}))));
}

#[test]
fn preremoval_neutralizes_lookalike_words() {
    let set = FilterSet::compile(
        &[Filter::new("title", RuleType::And, "exc").with_preremove(["excellent"])],
        &schema(),
    )
    .unwrap();
    assert!(!set.matches(&record(json!({"title": "excellent condition"}))));
    assert!(set.matches(&record(json!({"title": "2020 KTM EXC 300"}))));
}

#[test]
fn disallowed_words_fail_the_field() {
    let set = FilterSet::compile(
        &[Filter::new("title", RuleType::And, "ktm").with_disallowed(["parts only"])],
        &schema(),
    )
    .unwrap();
    assert!(set.matches(&record(json!({"title": "KTM 350 runs great"}))));
    assert!(!set.matches(&record(json!({"title": "KTM 350 PARTS ONLY"}))));
}

#[test]
fn phrase_symbol_matches_whole_phrase() {
    let rule = parse_rule("tw 200").unwrap();
    assert_eq!(rule, Expr::Symbol("tw 200".into()));
    assert!(rule.evaluate("Yamaha TW 200 trail bike"));
    assert!(!rule.evaluate("tw"));
    assert!(!rule.evaluate("200cc tw bike"));
}

#[test]
fn operator_spellings_are_interchangeable() {
    let words = parse_rule("ktm and not (duke or sx)").unwrap();
    let symbols = parse_rule("KTM & !(duke | sx)").unwrap();
    let arith = parse_rule("ktm * ~(duke + sx)").unwrap();
    for text in ["ktm exc 300", "ktm duke 690", "ktm 125 sx"] {
        assert_eq!(words.evaluate(text), symbols.evaluate(text));
        assert_eq!(words.evaluate(text), arith.evaluate(text));
    }
}

#[test]
fn unknown_token_is_a_distinct_error() {
    assert!(matches!(
        parse_rule("ktm $ exc"),
        Err(ParseError::UnknownToken { ref token, position: 4 }) if token == "$"
    ));
}

#[test]
fn absent_fields_are_skipped() {
    let set = FilterSet::compile(
        &[
            Filter::new("price", RuleType::And, "< 10"),
            Filter::new("title", RuleType::Or, "bike"),
        ],
        &schema(),
    )
    .unwrap();
    // no price, no title: nothing applies
    assert!(set.matches(&record(json!({"url": "https://example.org"}))));
    assert!(set.matches(&record(json!({"title": "bike", "price": null}))));
}

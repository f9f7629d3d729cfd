#[path = "common/mod.rs"]
mod common;

use common::*;
use redarc::{
    compile_match, search_archive, BulkLoader, InputValidator, IntParam, OrderBy, ResultKind, SafeRegex,
    SearchError, SearchParams, SearchQuery, Searcher, Store, MATCH_ALL,
};

/// Store with:
/// - r/programming: p1 "Learning programming in Rust" (score 10), p2 "Functional programming" (score 3)
/// - r/cooking: p3 "Pasta recipes" (score 50)
/// - comments: c1 on p1 "programming is fun" (score 7), c2 on p3 "add garlic" (score 1)
fn seeded_store() -> (tempfile::TempDir, Store) {
    let (dir, store) = temp_store();
    let loader = BulkLoader::new(&store);
    let mut p2 = post("p2", "programming", "bob", "Functional programming", "monads and functors", 3);
    p2.created_utc += 100;
    loader
        .insert_posts_batch(&[
            post("p1", "programming", "alice", "Learning programming in Rust", "ownership rules", 10),
            p2,
            post("p3", "cooking", "carol", "Pasta recipes", "boil water first", 50),
        ])
        .unwrap();
    loader
        .insert_comments_batch(&[
            comment("c1", "p1", "programming", "dave", "programming is fun", 7),
            comment("c2", "p3", "cooking", "erin", "add garlic", 1),
        ])
        .unwrap();
    (dir, store)
}

/// One matching and one non-matching post: exactly one ranked hit.
#[test]
fn single_match_has_positive_rank() {
    let (_dir, store) = temp_store();
    let loader = BulkLoader::new(&store);
    loader
        .insert_posts_batch(&[
            post("p1", "programming", "alice", "All about programming", "", 1),
            post("p2", "cooking", "bob", "Bread baking", "", 1),
        ])
        .unwrap();

    let (results, total) = Searcher::new(&store).search(&SearchQuery::new("programming")).unwrap();
    assert_eq!(total, 1);
    assert_eq!(results.len(), 1);
    assert_eq!(results[0].id, "p1");
    assert_eq!(results[0].result_type, "post");
    assert!(results[0].rank > 0.0);
    assert!(results[0].headline.as_deref().unwrap().contains("<mark>"));
}

/// Different pages return different rows and agree on the total.
#[test]
fn pagination_keeps_total_stable() {
    let (_dir, store) = temp_store();
    let loader = BulkLoader::new(&store);
    loader
        .insert_posts_batch(&[
            post("p1", "programming", "alice", "Rust programming", "", 1),
            post("p2", "programming", "bob", "Go programming", "", 2),
        ])
        .unwrap();
    let s = Searcher::new(&store);
    let (a, total_a) = s.search(&SearchQuery::new("programming").with_page(1, 0)).unwrap();
    let (b, total_b) = s.search(&SearchQuery::new("programming").with_page(1, 1)).unwrap();
    assert_eq!(a.len(), 1);
    assert_eq!(b.len(), 1);
    assert_ne!(a[0].id, b[0].id);
    assert_eq!(total_a, 2);
    assert_eq!(total_a, total_b);
}

/// Empty or whitespace-only text short-circuits.
#[test]
fn empty_query_returns_nothing() {
    let (_dir, store) = seeded_store();
    let s = Searcher::new(&store);
    assert_eq!(s.search(&SearchQuery::new("")).unwrap(), (Vec::new(), 0));
    assert_eq!(s.search(&SearchQuery::new("   \t")).unwrap(), (Vec::new(), 0));
    assert_eq!(s.search(&SearchQuery::new("!!! ???")).unwrap().1, 0);
}

/// Posts and comments are both searched unless a result type is given.
#[test]
fn result_type_restricts_branches() {
    let (_dir, store) = seeded_store();
    let s = Searcher::new(&store);
    let (_, both) = s.search(&SearchQuery::new("programming")).unwrap();
    assert_eq!(both, 3);

    let (posts, n) = s.search(&SearchQuery::new("programming").with_result_type(ResultKind::Post)).unwrap();
    assert_eq!(n, 2);
    assert!(posts.iter().all(|r| r.result_type == "post" && r.body.is_none()));

    let (comments, n) = s.search(&SearchQuery::new("programming").with_result_type(ResultKind::Comment)).unwrap();
    assert_eq!(n, 1);
    assert_eq!(comments[0].id, "c1");
    assert_eq!(comments[0].post_id.as_deref(), Some("p1"));
    assert_eq!(comments[0].post_title.as_deref(), Some("Learning programming in Rust"));
    assert!(comments[0].title.is_none());
}

/// Subreddit matches ignore case; author and score filters are exact bounds.
#[test]
fn filters_narrow_results() {
    let (_dir, store) = seeded_store();
    let s = Searcher::new(&store);

    let (_, n) = s.search(&SearchQuery::new("programming").with_subreddit("PROGRAMMING")).unwrap();
    assert_eq!(n, 3);
    let (_, n) = s.search(&SearchQuery::new("programming").with_subreddit("cooking")).unwrap();
    assert_eq!(n, 0);

    let (r, n) = s.search(&SearchQuery::new("programming").with_author("bob")).unwrap();
    assert_eq!((n, r[0].id.as_str()), (1, "p2"));

    let (r, n) = s.search(&SearchQuery::new("programming").with_min_score(5)).unwrap();
    assert_eq!(n, 2);
    assert!(r.iter().all(|x| x.score >= 5));

    let t = 1_136_073_600;
    let (r, n) = s.search(&SearchQuery::new("programming").with_date_range(Some(t + 50), Some(t + 200))).unwrap();
    assert_eq!((n, r[0].id.as_str()), (1, "p2"));
}

/// Score and date orderings override relevance.
#[test]
fn ordering_by_score_and_date() {
    let (_dir, store) = seeded_store();
    let s = Searcher::new(&store);
    let q = SearchQuery::new("programming").with_result_type(ResultKind::Post);

    let (r, _) = s.search(&q.clone().with_order_by(OrderBy::Score)).unwrap();
    assert_eq!(r.iter().map(|x| x.id.as_str()).collect::<Vec<_>>(), vec!["p1", "p2"]);

    let (r, _) = s.search(&q.clone().with_order_by(OrderBy::CreatedDesc)).unwrap();
    assert_eq!(r[0].id, "p2");
    let (r, _) = s.search(&q.with_order_by(OrderBy::CreatedAsc)).unwrap();
    assert_eq!(r[0].id, "p1");

    assert_eq!(OrderBy::parse("bogus"), OrderBy::Rank);
    assert_eq!(OrderBy::parse("newest"), OrderBy::CreatedDesc);
}

/// `*` browses every row that passes the filters, with rank 0.
#[test]
fn match_all_browses_with_filters() {
    let (_dir, store) = seeded_store();
    let s = Searcher::new(&store);
    let (r, n) = s.search(&SearchQuery::new(MATCH_ALL).with_subreddit("cooking")).unwrap();
    assert_eq!(n, 2);
    assert!(r.iter().all(|x| x.rank == 0.0 && x.subreddit == "cooking"));

    let by_author = s.search_author("alice", 10).unwrap();
    assert_eq!(by_author.len(), 1);
    assert_eq!(by_author[0].id, "p1");
}

/// Porter stemming lets plural forms match.
#[test]
fn stemmed_terms_match() {
    let (_dir, store) = seeded_store();
    let r = Searcher::new(&store).search_subreddit("cooking", "recipe", 10).unwrap();
    assert_eq!(r.len(), 1);
    assert_eq!(r[0].id, "p3");
}

/// Title suggestions by prefix, highest score first.
#[test]
fn suggestions_by_prefix() {
    let (_dir, store) = seeded_store();
    let s = Searcher::new(&store);
    assert_eq!(s.search_suggestions("pas", 5).unwrap(), vec!["Pasta recipes".to_string()]);
    assert!(s.search_suggestions("", 5).unwrap().is_empty());
    assert!(s.search_suggestions("100%", 5).unwrap().is_empty());
}

/// User text is quoted into a safe MATCH expression.
#[test]
fn compile_match_quotes_every_term() {
    assert_eq!(compile_match("rust").as_deref(), Some(r#"("rust")"#));
    assert_eq!(compile_match(r#""exact phrase" tips"#).as_deref(), Some(r#"("exact phrase" AND "tips")"#));
    assert_eq!(compile_match("cats OR dogs -birds").as_deref(), Some(r#"(("cats" OR "dogs")) NOT "birds""#));
    assert_eq!(compile_match("prog*").as_deref(), Some(r#"("prog"*)"#));
    assert_eq!(compile_match(r#"NEAR(a b) title:x"#).as_deref(), Some(r#"("NEAR(a" AND "b)" AND "title:x")"#));
    assert_eq!(compile_match("-- ** \"\""), None);
}

/// The request flow applies operators from the query text.
#[test]
fn search_archive_applies_operators() {
    let (_dir, store) = seeded_store();
    let v = InputValidator::new();
    let re = SafeRegex::default();
    let params = SearchParams { query: Some("programming type:post sort:score".into()), ..Default::default() };
    let resp = search_archive(&store, &v, &re, &params).unwrap();
    assert_eq!(resp.total, 2);
    assert_eq!(resp.query.order_by, OrderBy::Score);
    assert_eq!(resp.query.result_type, Some(ResultKind::Post));
    assert_eq!(resp.results[0].id, "p1");
    assert_eq!(resp.parsed.query_text, "programming");
}

/// Explicit parameters win over inline operators.
#[test]
fn explicit_params_override_operators() {
    let (_dir, store) = seeded_store();
    let params = SearchParams {
        query: Some("programming sub:cooking".into()),
        subreddit: Some("programming".into()),
        ..Default::default()
    };
    let resp = search_archive(&store, &InputValidator::new(), &SafeRegex::default(), &params).unwrap();
    assert_eq!(resp.query.subreddit.as_deref(), Some("programming"));
    assert_eq!(resp.total, 3);
}

/// Operators alone browse every matching row.
#[test]
fn operator_only_query_browses() {
    let (_dir, store) = seeded_store();
    let params = SearchParams { query: Some("sub:cooking".into()), ..Default::default() };
    let resp = search_archive(&store, &InputValidator::new(), &SafeRegex::default(), &params).unwrap();
    assert_eq!(resp.query.query_text, MATCH_ALL);
    assert_eq!(resp.total, 2);
}

/// Invalid parameters are reported per field and never reach the store.
#[test]
fn invalid_params_are_reported() {
    let (_dir, store) = seeded_store();
    let params = SearchParams {
        query: Some("programming".into()),
        subreddit: Some("x".into()),
        limit: Some(IntParam::from(0)),
        ..Default::default()
    };
    match search_archive(&store, &InputValidator::new(), &SafeRegex::default(), &params) {
        Err(SearchError::Validation(errors)) => {
            let fields: Vec<&str> = errors.iter().map(|e| e.field.as_str()).collect();
            assert!(fields.contains(&"subreddit"));
            assert!(fields.contains(&"limit"));
        }
        other => panic!("expected validation error, got {other:?}"),
    }
}

/// A page number decides the offset when both are supplied.
#[test]
fn page_takes_precedence_over_offset() {
    let (_dir, store) = seeded_store();
    let params = SearchParams {
        query: Some("programming".into()),
        limit: Some(IntParam::from(1)),
        offset: Some(IntParam::from(0)),
        page: Some(IntParam::from(2)),
        ..Default::default()
    };
    let resp = search_archive(&store, &InputValidator::new(), &SafeRegex::default(), &params).unwrap();
    assert_eq!(resp.query.offset, 1);
    assert_eq!(resp.results.len(), 1);
    assert_eq!(resp.total, 3);
}

/// Results serialize without the fields of the other record kind.
#[test]
fn result_serialization_omits_absent_fields() {
    let (_dir, store) = seeded_store();
    let (r, _) = Searcher::new(&store)
        .search(&SearchQuery::new("garlic").with_result_type(ResultKind::Comment))
        .unwrap();
    let v = serde_json::to_value(&r[0]).unwrap();
    assert_eq!(v["body"], "add garlic");
    assert!(v.get("title").is_none());
    assert!(v.get("num_comments").is_none());
    assert!(v["rank"].as_f64().unwrap() > 0.0);
}

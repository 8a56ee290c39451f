//! Watcher filter-policy properties
//!
//! Exercises the match predicate across field combinations: soundness of
//! each filter, monotonicity when filters are unset, and idempotence of
//! the hit bookkeeping.

use chrono::{TimeZone, Utc};

use comet_backend::reddit::Post;
use comet_backend::store::models::{Watcher, WatcherAccount, WatcherDevice, WatcherType};

fn post(author: &str, subreddit: &str, title: &str, score: i64) -> Post {
    Post {
        id: format!("t3_{}_{}", author, score),
        title: title.to_string(),
        author: author.to_string(),
        subreddit: subreddit.to_string(),
        body: String::new(),
        flair: "News".to_string(),
        domain: "example.com".to_string(),
        score,
        num_comments: 0,
        created_at: Utc.with_ymd_and_hms(2023, 6, 1, 12, 0, 0).unwrap(),
        permalink: String::new(),
    }
}

fn watcher() -> Watcher {
    Watcher {
        id: 1,
        created_at: Utc.with_ymd_and_hms(2023, 1, 1, 0, 0, 0).unwrap(),
        last_notified_at: Utc.with_ymd_and_hms(2023, 1, 1, 0, 0, 0).unwrap(),
        label: String::new(),
        device_id: 1,
        account_id: 1,
        watcher_type: WatcherType::Subreddit,
        watchee_id: 10,
        author: String::new(),
        subreddit: String::new(),
        upvotes: 0,
        keyword: String::new(),
        flair: String::new(),
        domain: String::new(),
        hits: 0,
        watchee_label: "r".to_string(),
        device: WatcherDevice {
            id: 1,
            apns_token: "token".to_string(),
            sandbox: false,
        },
        account: WatcherAccount {
            id: 1,
            reddit_account_id: "acct".to_string(),
            access_token: "access".to_string(),
            refresh_token: "refresh".to_string(),
            token_expires_at: Utc.with_ymd_and_hms(2099, 1, 1, 0, 0, 0).unwrap(),
        },
    }
}

fn corpus() -> Vec<Post> {
    vec![
        post("alice", "r", "HELLO world", 10),
        post("alice", "rust", "quiet thread", 3),
        post("bob", "r", "hello again", 50),
        post("carol", "news", "something else", 100),
    ]
}

fn match_set(w: &Watcher, posts: &[Post]) -> Vec<String> {
    posts
        .iter()
        .filter(|p| w.matches(p))
        .map(|p| p.id.clone())
        .collect()
}

#[test]
fn wildcard_watcher_matches_everything_recent() {
    let w = watcher();
    assert_eq!(match_set(&w, &corpus()).len(), corpus().len());
}

#[test]
fn keyword_and_threshold_filters_combine_case_insensitively() {
    let mut w = watcher();
    w.subreddit = "r".to_string();
    w.keyword = "hello".to_string();
    w.upvotes = 5;

    let p = post("alice", "r", "HELLO world", 10);
    assert!(w.matches(&p));

    w.upvotes = 20;
    assert!(!w.matches(&p));
}

#[test]
fn unsetting_any_field_only_broadens_matches() {
    let mut strict = watcher();
    strict.author = "alice".to_string();
    strict.subreddit = "r".to_string();
    strict.keyword = "hello".to_string();
    strict.flair = "News".to_string();
    strict.domain = "example.com".to_string();
    strict.upvotes = 5;

    let posts = corpus();
    let strict_matches = match_set(&strict, &posts);

    let relaxations: Vec<Box<dyn Fn(&mut Watcher)>> = vec![
        Box::new(|w| w.author = String::new()),
        Box::new(|w| w.subreddit = String::new()),
        Box::new(|w| w.keyword = String::new()),
        Box::new(|w| w.flair = String::new()),
        Box::new(|w| w.domain = String::new()),
        Box::new(|w| w.upvotes = 0),
    ];

    for relax in relaxations {
        let mut relaxed = strict.clone();
        relax(&mut relaxed);
        let relaxed_matches = match_set(&relaxed, &posts);
        for id in &strict_matches {
            assert!(
                relaxed_matches.contains(id),
                "relaxing a filter must not drop match {}",
                id
            );
        }
        assert!(relaxed_matches.len() >= strict_matches.len());
    }
}

#[test]
fn hit_bookkeeping_makes_reprocessing_a_noop() {
    let mut w = watcher();
    w.subreddit = "r".to_string();

    let p = post("alice", "r", "HELLO world", 10);
    assert!(w.matches(&p));

    // Recording the hit advances last_notified_at past the post.
    w.hits += 1;
    w.last_notified_at = Utc::now();

    assert!(!w.matches(&p));
    assert_eq!(w.hits, 1);
}

#[test]
fn validation_rejects_filterless_watchers() {
    let w = watcher();
    assert!(w.validate().is_err());

    let mut keyworded = watcher();
    keyworded.keyword = "rust".to_string();
    assert!(keyworded.validate().is_ok());

    let mut thresholded = watcher();
    thresholded.upvotes = 100;
    assert!(thresholded.validate().is_ok());
}

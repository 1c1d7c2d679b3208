mod common;

use std::time::{Duration, SystemTime};

use common::shell_resolver;
use loungecast::resolver::parse_expiry;

#[tokio::test]
async fn test_resolve_returns_helper_output() {
    let resolver = shell_resolver("while read url; do echo \"$url\"; done");

    let url = resolver.resolve("abc123").await;
    assert_eq!(url, "https://www.youtube.com/watch?v=abc123");

    resolver.shutdown();
}

#[tokio::test]
async fn test_concurrent_resolves_coalesce() {
    // The helper numbers its answers, so a second subprocess request would
    // be visible in the URL.
    let resolver = shell_resolver(
        "n=0; while read url; do n=$((n+1)); echo \"$url&fetch=$n\"; done",
    );

    let (a, b) = tokio::join!(resolver.resolve("same"), resolver.resolve("same"));
    assert_eq!(a, b);
    assert!(a.ends_with("&fetch=1"), "one subprocess request: {}", a);

    // And a cached hit afterwards still serves the same fetch.
    let c = resolver.resolve("same").await;
    assert!(c.ends_with("&fetch=1"));

    resolver.shutdown();
}

#[tokio::test]
async fn test_distinct_ids_are_fetched_separately() {
    let resolver = shell_resolver(
        "n=0; while read url; do n=$((n+1)); echo \"$url&fetch=$n\"; done",
    );

    let a = resolver.resolve("aaa").await;
    let b = resolver.resolve("bbb").await;
    assert!(a.contains("aaa"));
    assert!(b.contains("bbb"));
    assert!(a.ends_with("&fetch=1"));
    assert!(b.ends_with("&fetch=2"));

    resolver.shutdown();
}

#[tokio::test]
async fn test_blank_output_fails_and_retries() {
    // First answer is blank (extraction failure); later answers are fine.
    let resolver = shell_resolver("read url; echo; while read url; do echo \"$url\"; done");

    let failed = resolver.resolve("vid").await;
    assert_eq!(failed, "", "failures surface as an empty URL");

    // A failed entry does not poison the cache.
    let retried = resolver.resolve("vid").await;
    assert_eq!(retried, "https://www.youtube.com/watch?v=vid");

    resolver.shutdown();
}

#[tokio::test]
async fn test_helper_death_fails_pending_entries() {
    let resolver = shell_resolver("exit 0");

    // The helper is gone; resolution must fail, not hang.
    let url = tokio::time::timeout(Duration::from_secs(5), resolver.resolve("vid"))
        .await
        .expect("resolve must not hang on a dead helper");
    assert_eq!(url, "");
}

#[tokio::test]
async fn test_near_expiry_entry_is_refetched() {
    // The helper hands out URLs expiring 30 minutes from now, inside the
    // one-hour safety margin, so every resolve triggers a new fetch.
    let expire = SystemTime::now() + Duration::from_secs(30 * 60);
    let expire_secs = expire
        .duration_since(SystemTime::UNIX_EPOCH)
        .unwrap()
        .as_secs();
    let resolver = shell_resolver(&format!(
        "n=0; while read url; do n=$((n+1)); echo \"https://cdn.example/stream?expire={}&fetch=$n\"; done",
        expire_secs
    ));

    let first = resolver.resolve("vid").await;
    assert!(first.ends_with("&fetch=1"));

    let second = resolver.resolve("vid").await;
    assert!(
        second.ends_with("&fetch=2"),
        "entry near expiry must be replaced: {}",
        second
    );

    resolver.shutdown();
}

#[tokio::test]
async fn test_far_expiry_entry_is_cached() {
    let expire = SystemTime::now() + Duration::from_secs(6 * 3600);
    let expire_secs = expire
        .duration_since(SystemTime::UNIX_EPOCH)
        .unwrap()
        .as_secs();
    let resolver = shell_resolver(&format!(
        "n=0; while read url; do n=$((n+1)); echo \"https://cdn.example/stream?expire={}&fetch=$n\"; done",
        expire_secs
    ));

    let first = resolver.resolve("vid").await;
    let second = resolver.resolve("vid").await;
    assert_eq!(first, second);
    assert!(second.ends_with("&fetch=1"));

    resolver.shutdown();
}

#[test]
fn test_parse_expiry() {
    let expires = parse_expiry("https://cdn.example/videoplayback?expire=1700000000&itag=140")
        .expect("expire parses");
    assert_eq!(
        expires,
        SystemTime::UNIX_EPOCH + Duration::from_secs(1_700_000_000)
    );

    assert!(parse_expiry("https://cdn.example/videoplayback?itag=140").is_none());
    assert!(parse_expiry("https://cdn.example/videoplayback?expire=soon").is_none());
    assert!(parse_expiry("not a url").is_none());
}

#[tokio::test]
async fn test_prefetch_warms_the_cache() {
    let resolver = shell_resolver(
        "n=0; while read url; do n=$((n+1)); echo \"$url&fetch=$n\"; done",
    );

    resolver.prefetch("warm");
    // Give the worker a moment; the later resolve rides the same entry.
    tokio::time::sleep(Duration::from_millis(200)).await;

    let url = resolver.resolve("warm").await;
    assert!(url.ends_with("&fetch=1"));

    resolver.shutdown();
}

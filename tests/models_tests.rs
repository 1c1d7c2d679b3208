use std::time::Duration;

use serde_json::json;

use loungecast::models::{
    format_seconds, parse_frame, parse_seconds, split_video_ids, ScreenTokenBatch,
};

#[test]
fn test_split_video_ids() {
    assert_eq!(split_video_ids("a, b,c"), vec!["a", "b", "c"]);
    assert_eq!(split_video_ids("only"), vec!["only"]);
    // Duplicates are the remote's business; they pass through untouched.
    assert_eq!(split_video_ids("x,x"), vec!["x", "x"]);
}

#[test]
fn test_format_seconds() {
    assert_eq!(format_seconds(Duration::ZERO), "0.000");
    assert_eq!(format_seconds(Duration::from_millis(1500)), "1.500");
    assert_eq!(format_seconds(Duration::from_secs_f64(93.4567)), "93.457");
}

#[test]
fn test_seconds_round_trip_within_half_a_millisecond() {
    for &secs in &[0.0, 0.4994, 30.0, 90.0, 12345.678, 0.001] {
        let original = Duration::from_secs_f64(secs);
        let parsed = parse_seconds(&format_seconds(original));
        let difference = if parsed > original {
            parsed - original
        } else {
            original - parsed
        };
        assert!(
            difference <= Duration::from_micros(500),
            "{:?} round-tripped to {:?}",
            original,
            parsed
        );
    }
}

#[test]
fn test_parse_seconds_rejects_garbage() {
    assert_eq!(parse_seconds("nope"), Duration::ZERO);
    assert_eq!(parse_seconds("-5"), Duration::ZERO);
    assert_eq!(parse_seconds(""), Duration::ZERO);
}

#[test]
fn test_parse_frame() {
    let body = r#"[[0,["c","SID_VALUE"]],[1,["S","GSESSION_VALUE"]],[2,["noop"]]]"#;
    let messages = parse_frame(body).unwrap();

    assert_eq!(messages.len(), 3);
    assert_eq!(messages[0].index, 0);
    assert_eq!(messages[0].command, "c");
    assert_eq!(messages[0].string_arg(), Some("SID_VALUE"));
    assert_eq!(messages[1].command, "S");
    assert_eq!(messages[1].string_arg(), Some("GSESSION_VALUE"));
    assert_eq!(messages[2].command, "noop");
    assert_eq!(messages[2].string_arg(), None);
}

#[test]
fn test_parse_frame_with_map_args() {
    let body = r#"[[7,["setVideo",{"videoId":"abc","currentTime":"42.5"}]]]"#;
    let messages = parse_frame(body).unwrap();

    assert_eq!(messages[0].index, 7);
    assert_eq!(messages[0].command, "setVideo");
    assert_eq!(messages[0].arg("videoId"), Some("abc"));
    assert_eq!(messages[0].arg("currentTime"), Some("42.5"));
    assert_eq!(messages[0].arg("missing"), None);
}

#[test]
fn test_parse_frame_rejects_malformed_rows() {
    assert!(parse_frame("not json").is_err());
    assert!(parse_frame(r#"[["no-index"]]"#).is_err());
    assert!(parse_frame(r#"[[1]]"#).is_err());
    assert!(parse_frame(r#"[[1,[42]]]"#).is_err());
}

#[test]
fn test_screen_token_batch() {
    let body = json!({
        "screens": [{
            "screenId": "screen123",
            "loungeToken": "token456",
            "expiration": 1700000000000i64
        }]
    });

    let batch: ScreenTokenBatch = serde_json::from_value(body).unwrap();
    assert_eq!(batch.screens.len(), 1);
    assert_eq!(batch.screens[0].screen_id, "screen123");
    assert_eq!(batch.screens[0].lounge_token, "token456");
    assert_eq!(batch.screens[0].expiration, Some(1700000000000));
}

#[test]
fn test_screen_token_batch_without_expiration() {
    let batch: ScreenTokenBatch = serde_json::from_value(json!({
        "screens": [{"screenId": "s", "loungeToken": "t"}]
    }))
    .unwrap();
    assert_eq!(batch.screens[0].expiration, None);
}

mod common;

use std::sync::Arc;

use vidreason::{ApiContext, ApiError, Segment, SegmentConfig, SelectorConfig};

use common::{colored_video, stub_dispatcher, subtitled_video};

fn context(dispatcher: &vidreason::Dispatcher) -> Arc<ApiContext> {
    Arc::new(ApiContext::new(
        Arc::new(dispatcher.client(0)),
        SegmentConfig::default(),
        SelectorConfig::default(),
    ))
}

fn bounds(segment: &Segment) -> (usize, usize) {
    (segment.start(), segment.end())
}

#[test]
fn nested_trims_compose_and_clamp() {
    let dispatcher = stub_dispatcher();
    let segment = Segment::new(subtitled_video(20), context(&dispatcher)).unwrap();

    let cases = [
        ((2, 15), (3, 8)),
        ((5, 20), (0, 100)),
        ((-4, 12), (10, 11)),
        ((1, 19), (-3, 2)),
    ];
    for ((a, b), (c, d)) in cases {
        let nested = segment.trim(Some(a), Some(b)).unwrap().trim(Some(c), Some(d)).unwrap();
        let outer = (a.clamp(0, 20), b.clamp(0, 20));
        let inner_len = outer.1 - outer.0;
        let composed = segment
            .trim(Some(outer.0 + c.clamp(0, inner_len)), Some(outer.0 + d.clamp(0, inner_len)))
            .unwrap();
        assert_eq!(bounds(&nested), bounds(&composed), "trim({a}, {b}).trim({c}, {d})");
    }

    let tail = segment.trim(Some(18), None).unwrap();
    assert_eq!(bounds(&tail), (18, 20));
    let indexes: Vec<_> = tail.frame_iterator().map(|f| f.index()).collect();
    assert_eq!(indexes, [18, 19]);
    assert!(matches!(segment.trim(Some(7), Some(7)), Err(ApiError::EmptySegment { .. })));
}

#[test]
fn frame_lookup_is_relative_and_clamped() {
    let dispatcher = stub_dispatcher();
    let segment = Segment::new(subtitled_video(10), context(&dispatcher))
        .unwrap()
        .trim(Some(4), Some(7))
        .unwrap();
    assert_eq!(segment.frame_from_index(0).get_subtitles(), ["line 4"]);
    assert_eq!(segment.frame_from_index(99).index(), 6);
    assert_eq!(segment.frame_iterator().len(), 3);
}

#[test]
fn identities_are_stable_within_a_segment_only() {
    let dispatcher = stub_dispatcher();
    let video = colored_video(&[[200, 10, 10], [10, 10, 200], [0, 0, 0], [201, 10, 10]]);
    let segment = Segment::new(video, context(&dispatcher)).unwrap();

    let ids: Vec<_> = segment
        .frame_iterator()
        .map(|frame| segment.face_identify(&frame).unwrap())
        .collect();
    assert!(ids[0].is_some() && ids[1].is_some());
    assert_ne!(ids[0], ids[1]);
    assert_eq!(ids[2], None);
    assert_eq!(ids[0], ids[3]);
    assert_eq!(segment.identity_count(), 2);

    // A trimmed segment starts with an empty cache and never reuses ids.
    let trimmed = segment.trim(Some(0), Some(1)).unwrap();
    assert_eq!(trimmed.identity_count(), 0);
    let again = trimmed.face_identify(&trimmed.frame_from_index(0)).unwrap();
    assert!(again.is_some());
    assert_ne!(again, ids[0]);
    assert_eq!(segment.identity_count(), 2);
}

#[test]
fn select_answer_goes_through_the_decision_model() {
    let dispatcher = stub_dispatcher();
    let segment = Segment::new(subtitled_video(3), context(&dispatcher)).unwrap();
    let evidence = serde_json::json!({"frame 0": "a dog", "frame 1": "a cat"});
    let decision = segment
        .select_answer(&evidence, "Is there a dog?", &["yes".to_string(), "no".to_string()])
        .unwrap();
    assert_eq!(decision.answer.as_deref(), Some("yes"));
    assert_eq!(decision.reason, "seen in the notes");
}

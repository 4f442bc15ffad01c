use intrace::client::{
    CancelToken, FilterControl, FilterOutcome, TextMirror, TraceBufferFilter, FILTER_CHUNK_LINES,
};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

fn continue_always(_: u8) -> FilterControl {
    FilterControl::Continue
}

fn filter_with_lines(lines: &[&str]) -> (TraceBufferFilter, TextMirror) {
    let mirror = TextMirror::new();
    let filter = TraceBufferFilter::spawn(mirror.clone()).expect("Failed to start filter");
    for line in lines {
        filter.append(*line).unwrap();
    }
    (filter, mirror)
}

#[test]
fn test_appended_lines_display_in_arrival_order() {
    let (filter, mirror) = filter_with_lines(&[]);
    filter.apply_filter(".*keep.*", "", continue_always).unwrap();

    let lines = ["keep 1", "skip 2", "keep 3", "keep 4", "skip 5"];
    for line in lines {
        filter.append(line).unwrap();
    }

    let snapshot = filter.snapshot().unwrap();
    assert_eq!(snapshot.text, "keep 1\nkeep 3\nkeep 4\n");
    assert_eq!((snapshot.displayed, snapshot.total), (3, 5));
    assert_eq!(mirror.window(10, 0), vec!["keep 1", "keep 3", "keep 4"]);
}

#[test]
fn test_reapplying_same_pair_is_a_noop() {
    let (filter, _) = filter_with_lines(&["a ERROR", "b", "c ERROR"]);
    assert_eq!(filter.apply_filter(".*ERROR.*", "", continue_always).unwrap(), FilterOutcome::Applied);

    let calls = Arc::new(AtomicUsize::new(0));
    let counter = calls.clone();
    let outcome = filter
        .apply_filter(".*ERROR.*", "", move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
            FilterControl::Continue
        })
        .unwrap();

    assert_eq!(outcome, FilterOutcome::Unchanged);
    assert_eq!(calls.load(Ordering::SeqCst), 0);
    assert_eq!(filter.snapshot().unwrap().text, "a ERROR\nc ERROR\n");
}

#[test]
fn test_cancel_mid_pass_restores_pair_and_text() {
    let lines: Vec<String> = (0..FILTER_CHUNK_LINES * 4).map(|i| format!("line {i}")).collect();
    let (filter, mirror) = filter_with_lines(&[]);
    for line in &lines {
        filter.append(line.as_str()).unwrap();
    }
    filter.apply_filter(".*line.*", "", continue_always).unwrap();
    let before = filter.snapshot().unwrap();

    let token = CancelToken::new();
    let canceller = token.clone();
    let outcome = filter
        .apply_filter(".*7.*", "", move |_| {
            canceller.cancel();
            canceller.control()
        })
        .unwrap();

    assert_eq!(outcome, FilterOutcome::Cancelled);
    assert!(token.is_cancelled());
    let after = filter.snapshot().unwrap();
    assert_eq!(after.active, before.active);
    assert_eq!(after.text, before.text);
    assert_eq!(after.displayed, lines.len());
    assert_eq!(mirror.line_count(), lines.len());
}

#[test]
fn test_cancel_at_completion_still_applies() {
    let (filter, _) = filter_with_lines(&["one", "two"]);
    let outcome = filter.apply_filter("one", "", |_| FilterControl::Cancel).unwrap();
    assert_eq!(outcome, FilterOutcome::Applied);
    assert_eq!(filter.snapshot().unwrap().text, "one\n");
}

#[test]
fn test_clear_resets_counts_but_keeps_patterns() {
    let (filter, mirror) = filter_with_lines(&["x 1", "y 2"]);
    filter.apply_filter(".*x.*", ".*9.*", continue_always).unwrap();
    filter.set_clear_trace().unwrap();

    let snapshot = filter.snapshot().unwrap();
    assert_eq!((snapshot.displayed, snapshot.total), (0, 0));
    assert!(snapshot.text.is_empty());
    assert_eq!(snapshot.active, (".*x.*".to_string(), ".*9.*".to_string()));
    assert_eq!(mirror.counts(), (0, 0));
    assert_eq!(mirror.line_count(), 0);
}

#[test]
fn test_exclude_beats_include() {
    let (filter, _) = filter_with_lines(&[
        "[t]:[1]:a.B:m: ERROR ignore",
        "[t]:[1]:a.B:m: ERROR",
        "[t]:[1]:a.B:m: fine",
    ]);
    filter.apply_filter(".*ERROR.*", ".*ignore.*", continue_always).unwrap();

    let snapshot = filter.snapshot().unwrap();
    assert_eq!(snapshot.text, "[t]:[1]:a.B:m: ERROR\n");
    assert_eq!((snapshot.displayed, snapshot.total), (1, 3));
}

#[test]
fn test_mid_pass_appends_use_resulting_pair() {
    let lines: Vec<String> = (0..FILTER_CHUNK_LINES * 2).map(|i| format!("old {i}")).collect();
    let (filter, _) = filter_with_lines(&[]);
    for line in &lines {
        filter.append(line.as_str()).unwrap();
    }

    let appender = filter.clone();
    let mut appended = false;
    filter
        .apply_filter(".*new.*", "", move |_| {
            if !appended {
                appended = true;
                appender.append("new line").unwrap();
                appender.append("old line").unwrap();
            }
            FilterControl::Continue
        })
        .unwrap();

    let snapshot = filter.snapshot().unwrap();
    assert_eq!(snapshot.text, "new line\n");
    assert_eq!(snapshot.total, lines.len() + 2);
}

#[test]
fn test_include_and_exclude_selection() {
    let (filter, _) = filter_with_lines(&["alpha (1)", "beta", "alpha (2)", "gamma"]);

    filter.include_text("alpha", continue_always).unwrap();
    assert_eq!(filter.snapshot().unwrap().text, "alpha (1)\nalpha (2)\n");

    filter.include_text("gamma", continue_always).unwrap();
    assert_eq!(filter.snapshot().unwrap().text, "alpha (1)\nalpha (2)\ngamma\n");

    filter.exclude_text("(2)", continue_always).unwrap();
    let snapshot = filter.snapshot().unwrap();
    assert_eq!(snapshot.text, "alpha (1)\ngamma\n");
    assert_eq!(snapshot.last_entered, snapshot.active);
}

#[test]
fn test_toggle_filter_switches_between_entered_and_defaults() {
    let (filter, _) = filter_with_lines(&["keep", "drop"]);
    filter.set_filter("keep", "", continue_always).unwrap();
    assert_eq!(filter.snapshot().unwrap().text, "keep\n");

    filter.toggle_filter(false, continue_always).unwrap();
    let snapshot = filter.snapshot().unwrap();
    assert_eq!(snapshot.text, "keep\ndrop\n");
    assert_eq!(snapshot.active, (".*".to_string(), String::new()));

    filter.toggle_filter(true, continue_always).unwrap();
    assert_eq!(filter.snapshot().unwrap().text, "keep\n");
}

#[test]
fn test_save_displayed_trace() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("trace.txt");
    let (filter, _) = filter_with_lines(&["a 1", "b 2", "a 3"]);
    filter.apply_filter("a .*", "", continue_always).unwrap();
    filter.save(&path).unwrap();
    assert_eq!(std::fs::read_to_string(&path).unwrap(), "a 1\na 3\n");
}

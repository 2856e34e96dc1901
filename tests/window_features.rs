use chrono::NaiveDate;
use sf_align::{
    backfill, window_features, ImputationRule, Table, Value, WindowError, WindowOp, WindowSpec,
};

fn month(y: i32, m: u32) -> Value {
    Value::Date(NaiveDate::from_ymd_opt(y, m, 1).expect("valid date"))
}

/// Jan..Jun for one entity, rows shuffled, plus a second entity interleaved.
fn history() -> Table {
    Table::from_rows(
        &["siren", "periode", "ca"],
        vec![
            vec!["123456789".into(), month(2021, 6), 11.0.into()],
            vec!["987654321".into(), month(2021, 1), 1000.0.into()],
            vec!["123456789".into(), month(2021, 1), 10.0.into()],
            vec!["123456789".into(), month(2021, 3), Value::Null],
            vec!["123456789".into(), month(2021, 2), 12.0.into()],
            vec!["987654321".into(), month(2021, 2), 2000.0.into()],
            vec!["123456789".into(), month(2021, 5), 9.0.into()],
            vec!["123456789".into(), month(2021, 4), 15.0.into()],
        ],
    )
    .expect("history table")
}

fn specs() -> Vec<WindowSpec> {
    vec![
        WindowSpec::new("ca", 2, WindowOp::Lag),
        WindowSpec::new("ca", 2, WindowOp::Diff),
        WindowSpec::new("ca", 3, WindowOp::MovingAverage),
    ]
}

#[test]
fn lag_and_diff_count_observed_rows() {
    let out = window_features(&history(), "siren", "periode", &specs()).expect("window succeeds");

    assert_eq!(out.num_rows(), 8);
    assert_eq!(out.value(0, "ca_lag2m").expect("cell"), &Value::Number(15.0));
    assert_eq!(out.value(0, "ca_diff2m").expect("cell"), &Value::Number(-4.0));
    let mean = out.value(0, "ca_mean3m").expect("cell").as_f64().expect("mean present");
    assert!((mean - 35.0 / 3.0).abs() < 1e-12);

    // Apr reads Feb; the missing Mar value is skipped by the mean.
    assert_eq!(out.value(7, "ca_lag2m").expect("cell"), &Value::Number(12.0));
    assert_eq!(out.value(7, "ca_mean3m").expect("cell"), &Value::Number(13.5));
    // May reads the missing Mar value.
    assert_eq!(out.value(6, "ca_lag2m").expect("cell"), &Value::Null);
    assert_eq!(out.value(6, "ca_diff2m").expect("cell"), &Value::Null);
}

#[test]
fn insufficient_history_is_missing_and_entities_stay_isolated() {
    let out = window_features(&history(), "siren", "periode", &specs()).expect("window succeeds");

    for row in [1, 2, 4, 5] {
        assert_eq!(out.value(row, "ca_lag2m").expect("cell"), &Value::Null, "row {row}");
    }
    assert_eq!(out.value(5, "ca_mean3m").expect("cell"), &Value::Number(1500.0));
}

#[test]
fn diff_equals_current_minus_lag_whenever_present() {
    let out = window_features(&history(), "siren", "periode", &specs()).expect("window succeeds");
    for row in 0..out.num_rows() {
        let current = out.value(row, "ca").expect("cell").as_f64();
        let lag = out.value(row, "ca_lag2m").expect("cell").as_f64();
        let diff = out.value(row, "ca_diff2m").expect("cell").as_f64();
        match (current, lag) {
            (Some(c), Some(l)) => assert_eq!(diff, Some(c - l)),
            _ => assert_eq!(diff, None),
        }
    }
}

#[test]
fn backfill_after_window_fills_from_later_periods() {
    let out = window_features(&history(), "siren", "periode", &specs()).expect("window succeeds");
    let filled = backfill(&out, "siren", "periode", &["ca_lag2m"], ImputationRule::Bfill)
        .expect("backfill succeeds");

    let lag = filled.values("ca_lag2m").expect("column");
    // Jan and Feb take the Mar lag, May takes the Jun lag.
    assert_eq!(lag[2], Value::Number(10.0));
    assert_eq!(lag[4], Value::Number(10.0));
    assert_eq!(lag[6], Value::Number(15.0));
    // The second entity has no later value to borrow.
    assert_eq!(lag[1], Value::Null);
    assert_eq!(lag[5], Value::Null);
}

#[test]
fn invalid_specs_are_rejected() {
    let err = window_features(
        &history(),
        "siren",
        "periode",
        &[WindowSpec::new("ca", 0, WindowOp::Lag)],
    )
    .expect_err("zero horizon");
    assert_eq!(
        err,
        WindowError::ZeroHorizon {
            feature: "ca".to_string()
        }
    );

    let with_output = history()
        .with_column("ca_lag1m", vec![Value::Null; 8])
        .expect("extra column");
    let err = window_features(
        &with_output,
        "siren",
        "periode",
        &[WindowSpec::new("ca", 1, WindowOp::Lag)],
    )
    .expect_err("collision");
    assert_eq!(err, WindowError::OutputCollision("ca_lag1m".to_string()));
}

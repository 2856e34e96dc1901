use chrono::NaiveDate;
use sf_align::{
    derive_features, payment_cumulative, window_features, DerivedError, DerivedFeature,
    PaymentConfig, PaymentError, Table, Value, WindowSpec,
};

fn day(y: i32, m: u32, d: u32) -> Value {
    Value::Date(NaiveDate::from_ymd_opt(y, m, d).expect("valid date"))
}

fn with_required_lags(table: &Table, feature: &DerivedFeature) -> Table {
    let specs: Vec<WindowSpec> = feature.required_lags();
    window_features(table, "siren", "periode", &specs).expect("window succeeds")
}

#[test]
fn debt_per_employee_change_is_averaged_over_the_horizon() {
    let history = Table::from_rows(
        &[
            "siren",
            "periode",
            "montant_part_ouvriere",
            "montant_part_patronale",
            "effectif",
        ],
        vec![
            vec!["000000001".into(), day(2021, 1, 1), 100.0.into(), 200.0.into(), 10.0.into()],
            vec!["000000001".into(), day(2021, 2, 1), 0.0.into(), 0.0.into(), 10.0.into()],
            vec!["000000001".into(), day(2021, 3, 1), 0.0.into(), 0.0.into(), 10.0.into()],
            vec!["000000001".into(), day(2021, 4, 1), 400.0.into(), 200.0.into(), 10.0.into()],
        ],
    )
    .expect("history table");
    let feature = DerivedFeature::avg_delta_debt_per_size();

    let out = derive_features(&with_required_lags(&history, &feature), &[feature])
        .expect("derive succeeds");
    let delta = out.values("avg_delta_dette_par_effectif").expect("column");

    // (600 / 10 - 300 / 10) / 3
    assert_eq!(delta[3], Value::Number(10.0));
    assert_eq!(delta[0], Value::Null, "no history three rows back");
    assert_eq!(delta[2], Value::Null);
}

#[test]
fn zero_headcount_yields_a_missing_ratio() {
    let history = Table::from_rows(
        &["siren", "periode", "montant_part_ouvriere", "effectif"],
        vec![
            vec!["000000002".into(), day(2021, 1, 1), 1.0.into(), 0.0.into()],
            vec!["000000002".into(), day(2021, 2, 1), 3.0.into(), 0.0.into()],
        ],
    )
    .expect("history table");
    let feature = DerivedFeature::AvgDeltaPerSize {
        numerators: vec!["montant_part_ouvriere".to_string()],
        denominator: "effectif".to_string(),
        horizon: 1,
        output: "delta_per_size".to_string(),
    };

    let out = derive_features(&with_required_lags(&history, &feature), &[feature])
        .expect("derive succeeds");
    assert_eq!(
        out.values("delta_per_size").expect("column"),
        &[Value::Null, Value::Null]
    );
}

#[test]
fn horizon_delta_subtracts_the_lagged_value() {
    let history = Table::from_rows(
        &["siren", "periode", "paydex_nb_jours"],
        vec![
            vec!["000000001".into(), day(2021, 2, 1), 45.0.into()],
            vec!["000000001".into(), day(2021, 1, 1), 30.0.into()],
            vec!["000000001".into(), day(2021, 3, 1), Value::Null],
        ],
    )
    .expect("history table");
    let feature = DerivedFeature::HorizonDelta {
        feature: "paydex_nb_jours".to_string(),
        horizon: 1,
        output: "paydex_delta".to_string(),
    };

    let out = derive_features(&with_required_lags(&history, &feature), &[feature])
        .expect("derive succeeds");
    assert_eq!(
        out.values("paydex_delta").expect("column"),
        &[Value::Number(15.0), Value::Null, Value::Null]
    );
}

#[test]
fn derive_rejects_missing_inputs_and_collisions() {
    let table = Table::from_rows(
        &["siren", "periode", "paydex_nb_jours", "paydex_yoy"],
        vec![vec!["000000001".into(), day(2021, 1, 1), 1.0.into(), Value::Null]],
    )
    .expect("table");

    let err = derive_features(&table, &[DerivedFeature::paydex_yoy()]).expect_err("collision");
    assert_eq!(err, DerivedError::OutputCollision("paydex_yoy".to_string()));

    let table = table.drop_columns(&["paydex_yoy"]);
    let err = derive_features(&table, &[DerivedFeature::paydex_yoy()]).expect_err("no lag");
    assert!(matches!(err, DerivedError::Table(_)));
}

fn ledger() -> Table {
    Table::from_rows(
        &["frp", "art_cleart", "mvt_deff", "mvt_djc", "mvt_mcrd"],
        vec![
            vec!["A".into(), "X".into(), day(2021, 1, 31), day(2021, 2, 10), 100.0.into()],
            vec!["A".into(), "X".into(), day(2021, 1, 31), day(2021, 2, 3), 50.0.into()],
            // Nets to zero and is dropped.
            vec!["A".into(), "X".into(), day(2021, 2, 28), day(2021, 3, 5), 80.0.into()],
            vec!["A".into(), "X".into(), day(2021, 2, 28), day(2021, 3, 6), (-80.0).into()],
            vec!["A".into(), "X".into(), day(2021, 3, 31), day(2021, 4, 2), 30.0.into()],
            // Same first entry and amount as the March group once the due date is dropped.
            vec!["A".into(), "X".into(), day(2021, 4, 30), day(2021, 4, 2), 30.0.into()],
            // Peer of the January group: same account and first entry date.
            vec!["A".into(), "X".into(), day(2021, 5, 31), day(2021, 2, 3), 10.0.into()],
            vec!["B".into(), "X".into(), day(2021, 1, 31), day(2021, 2, 3), 20.0.into()],
            vec!["A".into(), "Y".into(), day(2021, 1, 31), day(2021, 2, 1), 5.0.into()],
        ],
    )
    .expect("ledger table")
}

#[test]
fn payments_accumulate_per_article_in_account_and_date_order() {
    let out = payment_cumulative(&ledger(), &PaymentConfig::default()).expect("payments");

    assert_eq!(
        out.column_names(),
        vec![
            "frp",
            "art_cleart",
            "min_mvt_djc",
            "sum_mvt_mcrd",
            "mnt_paiement_cum",
            "nb_paiement",
        ]
    );
    assert_eq!(
        out.values("art_cleart").expect("column"),
        &[
            Value::text("X"),
            Value::text("X"),
            Value::text("X"),
            Value::text("X"),
            Value::text("Y"),
        ]
    );
    assert_eq!(
        out.values("sum_mvt_mcrd").expect("column"),
        &[
            Value::Number(150.0),
            Value::Number(10.0),
            Value::Number(30.0),
            Value::Number(20.0),
            Value::Number(5.0),
        ]
    );
    // Peers share the running total of their whole order key.
    assert_eq!(
        out.values("mnt_paiement_cum").expect("column"),
        &[
            Value::Number(160.0),
            Value::Number(160.0),
            Value::Number(190.0),
            Value::Number(210.0),
            Value::Number(5.0),
        ]
    );
    assert_eq!(
        out.values("nb_paiement").expect("column"),
        &[
            Value::Number(2.0),
            Value::Number(2.0),
            Value::Number(3.0),
            Value::Number(4.0),
            Value::Number(1.0),
        ]
    );
    assert_eq!(out.value(0, "min_mvt_djc").expect("cell"), &day(2021, 2, 3));
}

#[test]
fn payment_amounts_must_be_numeric() {
    let bad = Table::from_rows(
        &["frp", "art_cleart", "mvt_deff", "mvt_djc", "mvt_mcrd"],
        vec![vec!["A".into(), "X".into(), day(2021, 1, 31), day(2021, 2, 3), "n/a".into()]],
    )
    .expect("ledger table");
    let err = payment_cumulative(&bad, &PaymentConfig::default()).expect_err("text amount");
    assert!(matches!(
        err,
        PaymentError::UnexpectedType { row: 0, expected: "number", .. }
    ));
}

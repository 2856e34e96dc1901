//! Cumulative payment history per tax article.
//!
//! Ledger movements are first collapsed per (account, article, due date):
//! the earliest entry date and the summed amount. Groups that net to zero are
//! dropped. Within each article, groups are then ordered by (account, first
//! entry date) and carry the running amount and payment count, peers sharing
//! an order key receiving the same running values.

use std::collections::BTreeSet;

use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::info;

use crate::table::{Column, GroupKey, Table, TableError, Value};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PaymentConfig {
    pub account_column: String,
    pub article_column: String,
    pub due_date_column: String,
    pub entry_date_column: String,
    pub amount_column: String,
}

impl Default for PaymentConfig {
    fn default() -> Self {
        Self {
            account_column: "frp".to_string(),
            article_column: "art_cleart".to_string(),
            due_date_column: "mvt_deff".to_string(),
            entry_date_column: "mvt_djc".to_string(),
            amount_column: "mvt_mcrd".to_string(),
        }
    }
}

pub const CUMULATIVE_AMOUNT_COLUMN: &str = "mnt_paiement_cum";
pub const PAYMENT_COUNT_COLUMN: &str = "nb_paiement";

#[derive(Debug, Error, PartialEq)]
pub enum PaymentError {
    #[error("column {column} row {row} holds a {found}, expected {expected}")]
    UnexpectedType {
        column: String,
        row: usize,
        expected: &'static str,
        found: &'static str,
    },
    #[error(transparent)]
    Table(#[from] TableError),
}

#[derive(Debug, Clone, PartialEq)]
struct PaymentGroup {
    account: Value,
    article: Value,
    first_entry: Option<NaiveDate>,
    amount: f64,
}

impl PaymentGroup {
    fn order_key(&self) -> GroupKey {
        GroupKey(vec![self.account.clone(), self.first_entry.map_or(Value::Null, Value::Date)])
    }

    fn dedup_key(&self) -> GroupKey {
        GroupKey(vec![
            self.account.clone(),
            self.article.clone(),
            self.first_entry.map_or(Value::Null, Value::Date),
            Value::Number(self.amount),
        ])
    }
}

/// Output columns: account, article, `min_{entry date}`, `sum_{amount}`,
/// `mnt_paiement_cum`, `nb_paiement`; rows by article, then order key.
pub fn payment_cumulative(ledger: &Table, cfg: &PaymentConfig) -> Result<Table, PaymentError> {
    let entry_dates = ledger.values(&cfg.entry_date_column)?;
    let amounts = ledger.values(&cfg.amount_column)?;

    let mut groups = Vec::new();
    let mut zero_groups = 0usize;
    let partitions = ledger.partition_by(&[
        cfg.account_column.as_str(),
        cfg.article_column.as_str(),
        cfg.due_date_column.as_str(),
    ])?;
    for partition in &partitions {
        let mut first_entry: Option<NaiveDate> = None;
        let mut amount = 0.0;
        for &row in &partition.rows {
            match &entry_dates[row] {
                Value::Date(d) => first_entry = Some(first_entry.map_or(*d, |f| f.min(*d))),
                Value::Null => {}
                other => return Err(unexpected(&cfg.entry_date_column, row, "date", other)),
            }
            match &amounts[row] {
                Value::Number(v) => amount += v,
                Value::Null => {}
                other => return Err(unexpected(&cfg.amount_column, row, "number", other)),
            }
        }
        if amount == 0.0 {
            zero_groups += 1;
            continue;
        }
        groups.push(PaymentGroup {
            account: partition.key.0[0].clone(),
            article: partition.key.0[1].clone(),
            first_entry,
            amount,
        });
    }

    // Distinct due dates can collapse to identical groups once the due date is dropped.
    let mut seen = BTreeSet::new();
    groups.retain(|group| seen.insert(group.dedup_key()));

    groups.sort_by(|a, b| {
        GroupKey(vec![a.article.clone()])
            .cmp(&GroupKey(vec![b.article.clone()]))
            .then_with(|| a.order_key().cmp(&b.order_key()))
    });

    let mut cumulative = vec![0.0; groups.len()];
    let mut counts = vec![0usize; groups.len()];
    let mut start = 0;
    while start < groups.len() {
        let article_end = groups[start..]
            .iter()
            .position(|g| g.article != groups[start].article)
            .map_or(groups.len(), |offset| start + offset);
        let (mut running, mut count) = (0.0, 0usize);
        let mut peer_start = start;
        while peer_start < article_end {
            let key = groups[peer_start].order_key();
            let peer_end = groups[peer_start..article_end]
                .iter()
                .position(|g| g.order_key() != key)
                .map_or(article_end, |offset| peer_start + offset);
            for group in &groups[peer_start..peer_end] {
                running += group.amount;
                count += 1;
            }
            for idx in peer_start..peer_end {
                cumulative[idx] = running;
                counts[idx] = count;
            }
            peer_start = peer_end;
        }
        start = article_end;
    }

    let table = Table::new(vec![
        Column::new(
            cfg.account_column.clone(),
            groups.iter().map(|g| g.account.clone()).collect(),
        ),
        Column::new(
            cfg.article_column.clone(),
            groups.iter().map(|g| g.article.clone()).collect(),
        ),
        Column::new(
            format!("min_{}", cfg.entry_date_column),
            groups.iter().map(|g| g.first_entry.map_or(Value::Null, Value::Date)).collect(),
        ),
        Column::new(
            format!("sum_{}", cfg.amount_column),
            groups.iter().map(|g| Value::number(g.amount)).collect(),
        ),
        Column::new(
            CUMULATIVE_AMOUNT_COLUMN,
            cumulative.into_iter().map(Value::number).collect(),
        ),
        Column::new(
            PAYMENT_COUNT_COLUMN,
            counts.into_iter().map(|c| Value::Number(c as f64)).collect(),
        ),
    ])?;

    info!(
        component = "payment",
        event = "payment.cumulative.finish",
        ledger_rows = ledger.num_rows(),
        groups = partitions.len(),
        zero_groups = zero_groups,
        output_rows = table.num_rows()
    );

    Ok(table)
}

fn unexpected(column: &str, row: usize, expected: &'static str, found: &Value) -> PaymentError {
    PaymentError::UnexpectedType {
        column: column.to_string(),
        row,
        expected,
        found: found.type_name(),
    }
}

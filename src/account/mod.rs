//! Account balance polling.
//!
//! The provider bills per byte; once the balance runs out the tool refuses to
//! work. [`AccountSync`] polls the balance and pauses the task queue while it
//! is not positive.

pub mod client;
pub mod sync;

use chrono::NaiveDate;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

pub use client::{AccountClient, HttpAccountClient};
pub use sync::{AccountSync, spawn_account_sync};

/// Account state as of the latest report.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AccountStatus {
    pub credit: Decimal,
    pub as_of: NaiveDate,
    pub last_machine_activity: Option<NaiveDate>,
}

impl AccountStatus {
    pub fn has_credit(&self) -> bool {
        self.credit > Decimal::ZERO
    }
}

//! Record filtering.

use crate::expr::EvalError;
use crate::record::{Record, NUMBER_ITEM};

/// Selects records for listing or export
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RecordFilter {
    /// Matches when any listed column (other than `[No.]`) contains `text`
    Simple {
        /// Substring to look for; empty matches every record
        text: String,
        /// Columns searched
        columns: Vec<String>,
    },
    /// Matches when the expression does not evaluate to `false`
    Expression(String),
}

impl RecordFilter {
    /// Tests `record`.
    ///
    /// Expression filters fail open like every condition; only resource-limit
    /// failures are returned.
    pub fn matches(&self, record: &Record) -> Result<bool, EvalError> {
        match self {
            RecordFilter::Simple { text, .. } if text.is_empty() => Ok(true),
            RecordFilter::Simple { text, columns } => Ok(columns
                .iter()
                .filter(|column| column.as_str() != NUMBER_ITEM)
                .any(|column| record.value(column).contains(text.as_str()))),
            RecordFilter::Expression(expression) => {
                record.evaluator().eval_bool(Some(record), Some(expression.as_str()), &[])
            }
        }
    }
}

//! Point and file level predicates

use crate::{TimeRange, TimeValuePair, Timestamp, Value};
use std::cmp::Ordering;

/// Comparison operator
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CompareOp {
    Eq, // =
    Ne, // !=
    Lt, // <
    Le, // <=
    Gt, // >
    Ge, // >=
}

impl CompareOp {
    fn holds(self, ordering: Ordering) -> bool {
        match self {
            CompareOp::Eq => ordering == Ordering::Equal,
            CompareOp::Ne => ordering != Ordering::Equal,
            CompareOp::Lt => ordering == Ordering::Less,
            CompareOp::Le => ordering != Ordering::Greater,
            CompareOp::Gt => ordering == Ordering::Greater,
            CompareOp::Ge => ordering != Ordering::Less,
        }
    }
}

/// Predicate over the points of one series
#[derive(Debug, Clone, PartialEq)]
pub enum Filter {
    /// Timestamp inside an inclusive range
    Time(TimeRange),
    /// Value compared against a constant
    Value { op: CompareOp, value: Value },
    And(Box<Filter>, Box<Filter>),
}

impl Filter {
    pub fn time(start: Timestamp, end: Timestamp) -> Self {
        Filter::Time(TimeRange::new(start, end))
    }

    pub fn value(op: CompareOp, value: impl Into<Value>) -> Self {
        Filter::Value {
            op,
            value: value.into(),
        }
    }

    pub fn and(self, other: Filter) -> Self {
        Filter::And(Box::new(self), Box::new(other))
    }

    pub fn satisfy(&self, point: &TimeValuePair) -> bool {
        match self {
            Filter::Time(range) => range.contains(point.timestamp),
            Filter::Value { op, value } => point
                .value
                .compare(value)
                .is_some_and(|ordering| op.holds(ordering)),
            Filter::And(left, right) => left.satisfy(point) && right.satisfy(point),
        }
    }

    /// False only if no point in `[start, end]` can satisfy the filter
    pub fn satisfy_start_end_time(&self, start: Timestamp, end: Timestamp) -> bool {
        match self {
            Filter::Time(range) => range.overlaps(&TimeRange::new(start, end)),
            Filter::Value { .. } => true,
            Filter::And(left, right) => {
                left.satisfy_start_end_time(start, end) && right.satisfy_start_end_time(start, end)
            }
        }
    }

    /// The time-only part of the filter, if any
    pub fn time_component(&self) -> Option<Filter> {
        match self {
            Filter::Time(_) => Some(self.clone()),
            Filter::Value { .. } => None,
            Filter::And(left, right) => match (left.time_component(), right.time_component()) {
                (Some(l), Some(r)) => Some(l.and(r)),
                (l, r) => l.or(r),
            },
        }
    }

    /// True if the filter looks at values
    pub fn has_value_component(&self) -> bool {
        match self {
            Filter::Time(_) => false,
            Filter::Value { .. } => true,
            Filter::And(left, right) => left.has_value_component() || right.has_value_component(),
        }
    }

    /// Smallest time range covering every point the filter accepts
    pub fn time_range(&self) -> TimeRange {
        match self {
            Filter::Time(range) => *range,
            Filter::Value { .. } => TimeRange::all(),
            Filter::And(left, right) => left
                .time_range()
                .intersect(&right.time_range())
                .unwrap_or(TimeRange::new(1, 0)),
        }
    }
}

/// Evaluate an optional filter, accepting everything when absent
pub fn accepts(filter: Option<&Filter>, point: &TimeValuePair) -> bool {
    filter.map_or(true, |f| f.satisfy(point))
}

// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

use std::fmt::Display;

use crate::plan::expr::Expression;
use crate::plan::schema::Schema;

/// Tumbling or sliding window shape.
///
/// A tumbling window is a sliding window whose slide equals its size; the slice store only
/// ever reasons in terms of `size` and `slide`.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum WindowType {
    Tumbling { size_ms: u64 },
    Sliding { size_ms: u64, slide_ms: u64 },
}

impl WindowType {
    pub fn size_ms(self) -> u64 {
        match self {
            WindowType::Tumbling { size_ms } => size_ms,
            WindowType::Sliding { size_ms, .. } => size_ms,
        }
    }

    pub fn slide_ms(self) -> u64 {
        match self {
            WindowType::Tumbling { size_ms } => size_ms,
            WindowType::Sliding { slide_ms, .. } => slide_ms,
        }
    }
}

/// Where the timestamp of a record comes from.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub enum TimeCharacteristic {
    /// The record carries its own event timestamp in the named field.
    EventTime { field: String },
    /// The wall clock at ingestion is the timestamp.
    IngestionTime,
}

/// Complete description of a window: shape plus time characteristic.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct WindowDescriptor {
    pub window_type: WindowType,
    pub time: TimeCharacteristic,
}

impl WindowDescriptor {
    pub fn tumbling(size_ms: u64, time: TimeCharacteristic) -> Self {
        Self {
            window_type: WindowType::Tumbling { size_ms },
            time,
        }
    }

    pub fn sliding(size_ms: u64, slide_ms: u64, time: TimeCharacteristic) -> Self {
        Self {
            window_type: WindowType::Sliding { size_ms, slide_ms },
            time,
        }
    }

    /// The slice covering `ts`: `[k * slide, (k + 1) * slide)`.
    ///
    /// Slices are slide-aligned so that every window is a union of whole slices.
    pub fn slice_bounds(&self, ts: u64) -> (u64, u64) {
        let slide = self.window_type.slide_ms();
        let start = (ts / slide) * slide;
        (start, start + slide)
    }

    /// Windows whose end falls in `(from, to]`, in ascending start order.
    pub fn windows_closing_in(&self, from: u64, to: u64) -> Vec<(u64, u64)> {
        let size = self.window_type.size_ms();
        let slide = self.window_type.slide_ms();
        let mut windows = Vec::new();
        if to <= from {
            return windows;
        }
        // Window ends sit on the slide grid; the first candidate end is strictly above `from`.
        let mut end = (from / slide) * slide;
        while end <= from {
            end += slide;
        }
        while end <= to {
            let start = end.saturating_sub(size);
            windows.push((start, end));
            end += slide;
        }
        windows
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum AggregationKind {
    Sum,
    Min,
    Max,
    Count,
    Avg,
}

impl Display for AggregationKind {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        match self {
            AggregationKind::Sum => write!(f, "sum"),
            AggregationKind::Min => write!(f, "min"),
            AggregationKind::Max => write!(f, "max"),
            AggregationKind::Count => write!(f, "count"),
            AggregationKind::Avg => write!(f, "avg"),
        }
    }
}

/// One aggregate of a windowed aggregation, e.g. `sum(speed) as total_speed`.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct WindowAggregation {
    pub kind: AggregationKind,
    /// Input field; ignored by `count`.
    pub field: String,
    /// Output field name in the window result schema.
    pub output_name: String,
}

impl WindowAggregation {
    pub fn new(
        kind: AggregationKind,
        field: impl Into<String>,
        output_name: impl Into<String>,
    ) -> Self {
        Self {
            kind,
            field: field.into(),
            output_name: output_name.into(),
        }
    }
}

/// Keyed windowed aggregation.
#[derive(Clone, Debug, PartialEq)]
pub struct WindowDefinition {
    pub descriptor: WindowDescriptor,
    /// Grouping keys; empty means a single global group.
    pub keys: Vec<String>,
    pub aggregations: Vec<WindowAggregation>,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum JoinVariant {
    /// Pairs records of both sides whose join keys are equal.
    InnerEqui,
    /// Full cross product per window, ignoring keys.
    CartesianProduct,
}

/// Window-aligned two-stream join.
#[derive(Clone, Debug, PartialEq)]
pub struct JoinDefinition {
    pub variant: JoinVariant,
    /// Key field on the build (left) side.
    pub left_key: String,
    /// Key field on the probe (right) side.
    pub right_key: String,
    pub window: WindowDescriptor,
}

/// How a watermark-assigner operator derives watermarks from the stream.
#[derive(Clone, Debug, PartialEq)]
pub enum WatermarkStrategy {
    /// Watermark trails the maximum observed event time by the allowed lateness.
    EventTime { field: String, allowed_lateness_ms: u64 },
    /// Watermark is the ingestion wall clock.
    IngestionTime,
}

/// Terminal consumer of a query.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub enum SinkDescriptor {
    /// Collects result buffers in memory, for tests and for embedding callers.
    Collect,
    /// Pretty-prints result tuples through the logging layer.
    Print,
    /// Discards results.
    Null,
}

/// One field of a projection, optionally renamed.
#[derive(Clone, Debug, PartialEq)]
pub struct ProjectionField {
    pub expr: Expression,
    pub alias: Option<String>,
}

impl ProjectionField {
    pub fn named(name: impl Into<String>) -> Self {
        Self {
            expr: Expression::Column(name.into()),
            alias: None,
        }
    }

    pub fn renamed(name: impl Into<String>, alias: impl Into<String>) -> Self {
        Self {
            expr: Expression::Column(name.into()),
            alias: Some(alias.into()),
        }
    }
}

/// The logical operator algebra.
///
/// Operators are stored in the plan arena; edges live on the arena nodes, not here.
#[derive(Clone, Debug, PartialEq)]
pub enum LogicalOperator {
    /// Named stream source carrying its qualified schema.
    Source { name: String, schema: Schema },
    Filter { predicate: Expression },
    Projection { fields: Vec<ProjectionField> },
    /// Assigns `field := expr`, replacing the field or appending it to the schema.
    Map { field: String, expr: Expression },
    Union,
    Join(JoinDefinition),
    Window(WindowDefinition),
    WatermarkAssigner(WatermarkStrategy),
    Sink(SinkDescriptor),
}

impl LogicalOperator {
    /// Short kind tag, used in logs and execution-node labels.
    pub fn kind(&self) -> &'static str {
        match self {
            LogicalOperator::Source { .. } => "source",
            LogicalOperator::Filter { .. } => "filter",
            LogicalOperator::Projection { .. } => "projection",
            LogicalOperator::Map { .. } => "map",
            LogicalOperator::Union => "union",
            LogicalOperator::Join(_) => "join",
            LogicalOperator::Window(_) => "window",
            LogicalOperator::WatermarkAssigner(_) => "watermark",
            LogicalOperator::Sink(_) => "sink",
        }
    }

    pub fn is_source(&self) -> bool {
        matches!(self, LogicalOperator::Source { .. })
    }

    pub fn is_sink(&self) -> bool {
        matches!(self, LogicalOperator::Sink(_))
    }

    /// Operators that materialize state and therefore terminate a pipeline.
    pub fn is_pipeline_breaker(&self) -> bool {
        matches!(
            self,
            LogicalOperator::Window(_) | LogicalOperator::Join(_) | LogicalOperator::Union
        )
    }
}

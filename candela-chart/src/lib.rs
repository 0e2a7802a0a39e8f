/// Candela Chart - Real-Time Chart Engine
///
/// The core of the chart: everything between a live candle stream and the
/// pixels a rendering surface puts on screen.
///
/// The library includes:
/// - Time-series store with in-place updates of the forming candle and
///   retention-window eviction
/// - Coordinate mapping between wall-clock time, fractional data-index and
///   pixel space
/// - Off-thread per-frame geometry computation with a coalescing redraw
///   scheduler
/// - Per-symbol drawing annotations with undo/redo and durable persistence
/// - A draggable order overlay reconciled optimistically with the broker
pub mod candle;
pub mod coords;
pub mod drawing;
pub mod error;
pub mod overlay;
pub mod render;
pub mod series;
pub mod view;

// Re-export commonly used types for convenience
pub use candle::{Candle, Resolution};
pub use coords::{PriceScale, index_from_timestamp, timestamp_from_index};
pub use error::ChartError;
pub use series::{CandleSeries, UpsertOutcome};
pub use view::ViewState;

pub use render::{
    CandleColor, CandleGeometry, FrameScheduler, GeometryFrame, GeometryRequest, GeometryWorker,
    PixelDims,
};

pub use drawing::{
    Drawing, DrawingHistory, DrawingKind, DrawingPoint, DrawingStore, DrawingStyle, HistoryEntry,
    fibonacci_levels, to_index_space, to_timestamp_space,
};

pub use overlay::{
    DragOutcome, DragState, GatewayError, ModifyOrder, OrderGateway, OrderId, OrderMarker,
    OrderOverlay, OrderSpec, OverlayHit, OverlayLayout, PendingOrder, RollbackReason, Side,
};

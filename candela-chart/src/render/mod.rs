//! Frame production: pure geometry, the worker task that runs it, and the
//! redraw throttle that paces it.

pub mod geometry;
pub mod scheduler;
pub mod worker;

pub use geometry::{
    CandleColor, CandleGeometry, EmaCache, GeometryFrame, GeometryRequest, PixelDims,
    compute_frame, padded_price_range,
};
pub use scheduler::{FRAME_BUDGET, FrameScheduler};
pub use worker::GeometryWorker;

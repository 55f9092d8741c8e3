//! Domain models - core data types shared by the pipeline
//!
//! This module contains the plain data used throughout the system:
//! - `Frame` - one captured sensor image
//! - `SignalSample` - per-tick scalar signals reduced from a frame pair
//! - `CycleEvent` - the primary business entity, one conveyor pass
//! - `Rect` / `HsvBounds` - region and color parameters for analysis
//! - `RollingWindow` - fixed-size ring buffer with an incremental sum

pub mod cycle;
pub mod types;
pub mod window;

// Re-export commonly used types at module level
pub use cycle::{epoch_secs, CycleEvent};
pub use types::{Frame, HsvBounds, Rect, SignalSample};
pub use window::RollingWindow;

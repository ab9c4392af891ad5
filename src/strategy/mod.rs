//! Entry decision strategies

pub mod signal_monitor;
pub mod triangular;

pub use signal_monitor::{MonitoredExchange, PositionLauncher, Signal, SignalKind, SignalMonitor};
pub use triangular::{TriangleCycle, TriangularDetector, TriangularOpportunity};

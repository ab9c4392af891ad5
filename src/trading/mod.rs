//! Trading execution modules

pub mod events;
pub mod graduated_entry;
pub mod triangular_executor;

pub use events::{PositionEvent, Subscribers};
pub use graduated_entry::{GraduatedEntryEngine, PositionHandle, RecoveryReport};
pub use triangular_executor::{
    spawn_pipeline, TriangularExecutor, TriangularPosition, TriangularRunStats, TriangularStatus,
};

//! The ISO/IEC 7816-3 T=1 block protocol engine (C4): block framing,
//! sequencing, chaining, PPS, IFS negotiation, resynchronization, and
//! timers.

pub mod block;
pub mod config;
pub mod engine;
pub mod timer;

pub use block::{BlockPrm, IBlockPrm, RAck, RBlockPrm, SBlockPrm, SCommand};
pub use config::{CcidFeatures, Config, ConfigId, SENTINEL_DEFAULT, SENTINEL_UNCHANGED};
pub use engine::{EngineCallbacks, EngineEvent, FsmState, T1Engine};

//! ISO/IEC 7816-3 T=1 protocol engine and connection state machine for
//! serial and USB CCID smart card readers.
//!
//! This crate implements the host side of a smart-card session: ATR
//! parsing, the T=1 block protocol ([`t1`]), the connection lifecycle that
//! sits above it ([`connection`]), and the collaborator traits a target
//! integration implements for pin I/O, serial bytes, and a monotonic clock
//! ([`transport`]). It does not contain any target-specific hardware
//! bring-up; see the [`transport`] module documentation for the traits a
//! port must supply.
//!
//! `no_std` by default. The `alloc` feature (on by default) enables
//! heap-backed observer storage; without it, [`observer::ObserverDispatch`]
//! falls back to a fixed-capacity slot array of plain function pointers.

#![no_std]

#[cfg(feature = "alloc")]
extern crate alloc;

pub mod atr;
pub mod connection;
pub mod edc;
pub mod error;
pub mod facade;
pub mod fifo;
pub mod observer;
pub mod reader;
pub mod t1;
pub mod transport;

pub use atr::{AtrByteIdx, AtrDecoded, AtrError};
pub use connection::{ConnState, Connection, PinPolarity};
pub use edc::{edc, EdcMode};
pub use error::{ConnectionError, EngineError, ReaderError};
pub use facade::ProtocolEngineApi;
pub use fifo::ByteFifo;
pub use observer::{Event, EventKind, ObserverDispatch};
pub use reader::{Reader, ReaderConfig};
pub use t1::{BlockPrm, CcidFeatures, Config, ConfigId, EngineCallbacks, EngineEvent, FsmState, T1Engine};
pub use transport::{Clock, Pin, PinIo, PinState, SerialTransport};

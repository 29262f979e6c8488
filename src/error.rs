//! Crate-wide error types, one `thiserror` enum per layer, matching the
//! distilled error-kind table of §7 so `to_string()` is a drop-in
//! replacement for a numeric-code lookup table.

use thiserror::Error;

/// Errors surfaced by the T=1 protocol engine (façade and below).
#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum EngineError {
	#[error("internal")]
	Internal,
	#[error("serial_out")]
	SerialOut,
	#[error("comm_failure")]
	CommFailure,
	#[error("atr_timeout")]
	AtrTimeout,
	#[error("bad_atr")]
	BadAtr,
	#[error("incompatible")]
	Incompatible,
	#[error("oversized_apdu")]
	OversizedApdu,
	#[error("sc_abort")]
	ScAbort,
	#[error("pps_failed")]
	PpsFailed,
}

/// Errors surfaced by the connection state machine.
#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionError {
	#[error(transparent)]
	Engine(#[from] EngineError),
	#[error("no_card")]
	NoCard,
	#[error("already_connected")]
	AlreadyConnected,
	#[error("event_buffer_overflow")]
	EventBufferOverflow,
	#[error("unexpected card removal")]
	UnexpectedRemoval,
}

/// Errors surfaced by [`crate::reader::Reader`] (C8).
#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum ReaderError {
	/// A connection already exists; a reader is exclusive to one at a time.
	#[error("too many connections")]
	AlreadyConnected,
}

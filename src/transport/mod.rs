//! Transport collaborators (C9, §6.1): the thin target-specific surface the
//! connection layer drives. Serial pin bring-up, USART registers, and USB
//! host-controller plumbing are out of scope; only the contracts are
//! specified here, grounded on the teacher's `NetworkDriver`/hardware trait
//! seams (`drivers/net/mod.rs`) generalized from a single device type to
//! three narrow collaborator roles.

#[cfg(feature = "ccid")]
pub mod ccid;

/// Logical identity of a pin the connection drives or samples (§6.5:
/// RST/PRES/PWR pin identifiers and polarities).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Pin {
	Reset,
	Presence,
	Power,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PinState {
	Active,
	Inactive,
}

impl core::ops::Not for PinState {
	type Output = PinState;
	fn not(self) -> PinState {
		match self {
			PinState::Active => PinState::Inactive,
			PinState::Inactive => PinState::Active,
		}
	}
}

/// Half-duplex serial byte transport (§6.1). Implemented by a serial driver
/// wired directly to CLK/IO, or by a CCID adapter (`ccid::CcidTransport`)
/// that wraps bytes in USB bulk transfers.
pub trait SerialTransport {
	/// Transmits `buf`. Returns `false` only if the link is fatally broken;
	/// transient "not ready" conditions must not surface here — the T=1
	/// engine already tolerates a couple of failed sends internally.
	fn serial_tx(&mut self, buf: &[u8]) -> bool;

	/// Copies up to `out.len()` pending received bytes into `out` without
	/// blocking, returning the count actually copied.
	fn serial_rx_available(&mut self, out: &mut [u8]) -> usize;

	/// CCID `IccPowerOn` (§4.6.5). A direct serial link drives VCC through
	/// its own pin instead, so the default is a no-op.
	fn ccid_power_on(&mut self) -> bool {
		true
	}

	/// CCID `IccPowerOff` (§4.6.5); no-op for a direct serial link.
	fn ccid_power_off(&mut self) -> bool {
		true
	}

	/// CCID `SetParameters` with the fixed T=1 parameter block, sent once
	/// PPS has settled (§4.6.5); no-op for a direct serial link.
	fn ccid_set_parameters_t1(&mut self, _ta1: u8) -> bool {
		true
	}

	/// `None` means "consult the presence pin instead" (the serial path);
	/// `Some(bool)` is the CCID slot-status query result (§4.6.3).
	fn ccid_slot_present(&mut self) -> Option<bool> {
		None
	}
}

/// Pin bring-up collaborator (§6.1): reset, presence-detect, and power pins.
pub trait PinIo {
	fn pin_read(&mut self, pin: Pin) -> PinState;
	fn pin_write(&mut self, pin: Pin, state: PinState);
}

/// Monotonic clock collaborator (§6.1).
pub trait Clock {
	/// Monotonic milliseconds; callers diff two readings with wrapping
	/// subtraction to stay correct across a wraparound.
	fn ticks_ms(&mut self) -> u32;
	/// Cooperative delay; never called from interrupt context.
	fn sleep_ms(&mut self, ms: u32);
}

/// Wrapping difference between two `ticks_ms()` readings, `now - earlier`.
pub fn elapsed_ms(earlier: u32, now: u32) -> u32 {
	now.wrapping_sub(earlier)
}

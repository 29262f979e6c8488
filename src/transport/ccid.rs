//! USB CCID wire framing (§4.6.5, §6.3), feature-gated behind `ccid`. This
//! module only builds/parses the bulk-transfer messages; the raw USB pipe
//! (control + bulk endpoints) is a host-specific collaborator below this
//! layer, kept out of scope the same way `§6.1` keeps USART bring-up out of
//! scope for the serial transport.

use log::trace;
use num_enum::{IntoPrimitive, TryFromPrimitive};

use super::SerialTransport;

pub const HEADER_LEN: usize = 10;

// Outgoing (PC_to_RDR) message types.
pub const PC_TO_RDR_ICC_POWER_ON: u8 = 0x62;
pub const PC_TO_RDR_ICC_POWER_OFF: u8 = 0x63;
pub const PC_TO_RDR_GET_SLOT_STATUS: u8 = 0x65;
pub const PC_TO_RDR_XFR_BLOCK: u8 = 0x6F;
pub const PC_TO_RDR_SET_PARAMETERS: u8 = 0x61;
pub const PC_TO_RDR_GET_PARAMETERS: u8 = 0x6C;

/// Incoming (RDR_to_PC) message types (§6.3). Only `DataBlock` carries T=1
/// bytes the engine cares about; the others are acknowledged at the wire
/// level and otherwise dropped by [`CcidTransport::serial_rx_available`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, TryFromPrimitive, IntoPrimitive)]
#[repr(u8)]
pub enum RdrMessageType {
	DataBlock = 0x80,
	SlotStatus = 0x81,
	Parameters = 0x82,
}

/// Voltage selector for `IccPowerOn` byte 7: automatic, 5V, 3V, 1.8V.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Voltage {
	Auto = 0,
	V5_0 = 1,
	V3_0 = 2,
	V1_8 = 3,
}

/// Raw USB bulk pipe: one bulk-out transfer, one bulk-in transfer. Kept
/// separate from `SerialTransport` so a CCID reader's control-endpoint
/// bring-up can live in the host integration, not here.
pub trait UsbBulkPipe {
	fn bulk_out(&mut self, buf: &[u8]) -> bool;
	/// Copies up to `out.len()` bytes from the next bulk-in transfer,
	/// returning the count actually copied (0 if nothing pending).
	fn bulk_in(&mut self, out: &mut [u8]) -> usize;
}

fn build_header(out: &mut [u8; HEADER_LEN], msg_type: u8, len: u32, slot: u8, seq: u8, specific: [u8; 3]) {
	out[0] = msg_type;
	out[1..5].copy_from_slice(&len.to_le_bytes());
	out[5] = slot;
	out[6] = seq;
	out[7..10].copy_from_slice(&specific);
}

/// Wraps a CCID reader's bulk pipe so the connection layer can drive it
/// through the same `SerialTransport` interface as a direct serial link.
/// `XfrBlock`/`DataBlock` carry the T=1 bytes; `bulk_in` responses that
/// aren't a `DataBlock` (e.g. an interim `SlotStatus`) are dropped.
pub struct CcidTransport<P: UsbBulkPipe> {
	pipe: P,
	slot: u8,
	seq: u8,
	rx_scratch: [u8; 512],
}

impl<P: UsbBulkPipe> CcidTransport<P> {
	pub fn new(pipe: P, slot: u8) -> Self {
		Self {
			pipe,
			slot,
			seq: 0,
			rx_scratch: [0; 512],
		}
	}

	fn next_seq(&mut self) -> u8 {
		let s = self.seq;
        self.seq = self.seq.wrapping_add(1);
		s
	}

	pub fn power_on(&mut self, voltage: Voltage) -> bool {
		let seq = self.next_seq();
		let mut header = [0u8; HEADER_LEN];
		build_header(&mut header, PC_TO_RDR_ICC_POWER_ON, 0, self.slot, seq, [voltage as u8, 0, 0]);
		self.pipe.bulk_out(&header)
	}

	pub fn power_off(&mut self) -> bool {
		let seq = self.next_seq();
		let mut header = [0u8; HEADER_LEN];
		build_header(&mut header, PC_TO_RDR_ICC_POWER_OFF, 0, self.slot, seq, [0, 0, 0]);
		self.pipe.bulk_out(&header)
	}

	/// Sends `PC_to_RDR_GetSlotStatus` and reads back the `bStatus` byte of
	/// the `RDR_to_PC_SlotStatus` reply (offset 7: bits 0:1 are the ICC
	/// status, 0/1 = present, 2 = not present). Returns `None` if the reader
	/// didn't answer with a `SlotStatus` message.
	pub fn get_slot_status(&mut self) -> Option<bool> {
		let seq = self.next_seq();
		let mut header = [0u8; HEADER_LEN];
		build_header(&mut header, PC_TO_RDR_GET_SLOT_STATUS, 0, self.slot, seq, [0, 0, 0]);
		if !self.pipe.bulk_out(&header) {
			return None;
		}
		let n = self.pipe.bulk_in(&mut self.rx_scratch);
		if n < HEADER_LEN {
			return None;
		}
		match RdrMessageType::try_from(self.rx_scratch[0]) {
			Ok(RdrMessageType::SlotStatus) => Some(self.rx_scratch[7] & 0x03 != 2),
			_ => None,
		}
	}

	/// `PC_to_RDR_SetParameters` with the fixed T=1 parameter block the
	/// connection applies right after PPS (§4.6.5): Fi/Di from TA1,
	/// TCCKS=0x10, BWI/CWI=0x4D, IFSC=0x20.
	pub fn set_parameters_t1(&mut self, ta1: u8) -> bool {
		let seq = self.next_seq();
		let payload = [ta1, 0x10, 0x4D, 0x20, 0x00, 0x00, 0x00];
		let mut header = [0u8; HEADER_LEN];
		build_header(
			&mut header,
			PC_TO_RDR_SET_PARAMETERS,
			payload.len() as u32,
			self.slot,
			seq,
			[0x01, 0x00, 0x00],
		);
		self.pipe.bulk_out(&header) && self.pipe.bulk_out(&payload)
	}

	/// Wraps a T=1 byte sequence in `PC_to_RDR_XfrBlock` (§4.6.5); `bwi` is
	/// the block-waiting-time-integer override, 0 for none.
	fn xfr_block(&mut self, buf: &[u8], bwi: u8) -> bool {
		let seq = self.next_seq();
		let level: u16 = 0; // single block, no extended-APDU chaining
		let mut header = [0u8; HEADER_LEN];
		build_header(
			&mut header,
			PC_TO_RDR_XFR_BLOCK,
			buf.len() as u32,
			self.slot,
			seq,
			[bwi, level.to_le_bytes()[0], level.to_le_bytes()[1]],
		);
		self.pipe.bulk_out(&header) && self.pipe.bulk_out(buf)
	}
}

impl<P: UsbBulkPipe> SerialTransport for CcidTransport<P> {
	fn serial_tx(&mut self, buf: &[u8]) -> bool {
		self.xfr_block(buf, 0)
	}

	fn serial_rx_available(&mut self, out: &mut [u8]) -> usize {
		let n = self.pipe.bulk_in(&mut self.rx_scratch);
		if n < HEADER_LEN {
			return 0;
		}
		match RdrMessageType::try_from(self.rx_scratch[0]) {
			Ok(RdrMessageType::DataBlock) => {}
			Ok(other) => {
				trace!("ccid: dropping interim {other:?}");
				return 0;
			}
			Err(_) => return 0,
		}
		let payload_len = u32::from_le_bytes(self.rx_scratch[1..5].try_into().unwrap()) as usize;
		let copy_len = payload_len.min(n - HEADER_LEN).min(out.len());
		out[..copy_len].copy_from_slice(&self.rx_scratch[HEADER_LEN..HEADER_LEN + copy_len]);
		copy_len
	}

	fn ccid_power_on(&mut self) -> bool {
		self.power_on(Voltage::Auto)
	}

	fn ccid_power_off(&mut self) -> bool {
		self.power_off()
	}

	fn ccid_set_parameters_t1(&mut self, ta1: u8) -> bool {
		self.set_parameters_t1(ta1)
	}

	fn ccid_slot_present(&mut self) -> Option<bool> {
		self.get_slot_status()
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	struct LoopbackPipe {
		out: heapless::Vec<u8, 64>,
	}

	impl UsbBulkPipe for LoopbackPipe {
		fn bulk_out(&mut self, buf: &[u8]) -> bool {
			self.out.extend_from_slice(buf).is_ok()
		}
		fn bulk_in(&mut self, _out: &mut [u8]) -> usize {
			0
		}
	}

	#[test]
	fn xfr_block_header_carries_payload_length() {
		let mut t = CcidTransport::new(LoopbackPipe { out: heapless::Vec::new() }, 0);
		assert!(t.serial_tx(&[0x00, 0x00, 0x00, 0x00]));
		assert_eq!(t.pipe.out[0], PC_TO_RDR_XFR_BLOCK);
		assert_eq!(u32::from_le_bytes(t.pipe.out[1..5].try_into().unwrap()), 4);
	}

	#[test]
	fn seq_counter_wraps_mod_256() {
		let mut t = CcidTransport::new(LoopbackPipe { out: heapless::Vec::new() }, 0);
		t.seq = 255;
		assert_eq!(t.next_seq(), 255);
		assert_eq!(t.seq, 0);
	}
}

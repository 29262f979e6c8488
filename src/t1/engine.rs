//! The T=1 engine state machine: ATR handling, PPS, IFSD negotiation, block
//! chaining, retransmission, and resynchronization (§4.4).
//!
//! Unlike the original C driver, the engine does not store its callback
//! handle: every entry point that can raise a protocol event takes
//! `cb: &mut dyn EngineCallbacks` for the duration of that one call. This
//! avoids a self-referential cycle where the connection (which implements
//! `EngineCallbacks`) would otherwise need to own the engine that owns a
//! handle back to the connection.

use log::{debug, trace, warn};

use crate::atr::{self, AtrByteIdx, AtrDecoded};
use crate::edc::{edc, EdcMode};
use crate::error::EngineError;
use crate::fifo::ByteFifo;

use super::block::{BlockPrm, IBlockPrm, RAck, RBlockPrm, SBlockPrm, SCommand};
use super::config::{CcidFeatures, Config, ConfigId};
use super::timer::Timer;

const DELIVERY_ATTEMPTS: u32 = 10;
const RESYNC_ATTEMPTS: u32 = 3;
const IFS_MIN: i16 = 1;
const IFS_MAX: i16 = 254;

const RX_BUF_LEN: usize = 259;
const MAX_APDU_LEN: usize = 255;
const TX_FIFO_CAP: usize = 1024;
const MAX_BLOCK_WIRE_LEN: usize = 3 + 254 + 2; // NAD PCB LEN + INF + EDC
const MAX_PPS_LEN: usize = 5;

/// PPS response interlock: after a valid PPS response, a short response
/// timer is armed instead of leaving it unset, so a silent card still
/// times out promptly (§4.4 "PPS response interlock").
const PPS_RESPONSE_INTERLOCK_MS: u32 = 50;

/// Top-level engine state (§4.4.1).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FsmState {
	WaitAtr,
	PpsExchange,
	IfsdSetupPrepare,
	IfsdSetup,
	Idle,
	WaitResponse,
	Resync,
	Error,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum RxSubState {
	Skip,
	Nad,
	Pcb,
	Len,
	Inf,
	Edc,
}

/// Protocol events the engine reports to its owner at the end of whichever
/// API call produced them (§4.5, §9 "callback-with-user-pointer").
#[derive(Debug)]
pub enum EngineEvent<'a> {
	AtrReceived(&'a [u8]),
	Connect,
	ApduReceived(&'a [u8]),
	PpsExchangeDone,
	Error(EngineError),
}

/// The engine's two collaborator responsibilities: pushing bytes onto the
/// wire, and receiving protocol events. Implemented by the connection layer.
pub trait EngineCallbacks {
	fn serial_out(&mut self, buf: &[u8]) -> bool;
	fn handle_event(&mut self, event: EngineEvent<'_>);
}

pub struct T1Engine {
	state: FsmState,
	config: Config,

	rx_sub: RxSubState,
	rx_skip_remaining: usize,
	rx_nad: u8,
	rx_pcb: u8,
	rx_len: usize,
	rx_inf: [u8; 254],
	rx_inf_collected: usize,
	rx_edc: [u8; 2],
	rx_edc_collected: usize,

	atr_buf: [u8; RX_BUF_LEN],
	atr_len: usize,
	atr_decoded: Option<AtrDecoded>,

	pps_buf: [u8; MAX_PPS_LEN],
	pps_len: usize,

	apdu_buf: [u8; MAX_APDU_LEN],
	apdu_len: usize,

	tx_fifo: ByteFifo<{ TX_FIFO_CAP + 1 }>,
	tx_seq: u8,
	last_sent_seq: u8,
	last_tx_had_more_data: bool,
	delivery_attempts: u32,
	last_tx_block: [u8; MAX_BLOCK_WIRE_LEN],
	last_tx_block_len: usize,
	tx_block_ctr: u64,

	rx_seq: u8,
	rx_bad_block: bool,

	resync_attempts: u32,
	serial_fail_count: u8,

	tm_interbyte: Timer,
	tm_atr: Timer,
	tm_response: Timer,
}

impl T1Engine {
	pub fn new() -> Self {
		Self {
			state: FsmState::Idle,
			config: Config::defaults(),
			rx_sub: RxSubState::Nad,
			rx_skip_remaining: 0,
			rx_nad: 0,
			rx_pcb: 0,
			rx_len: 0,
			rx_inf: [0; 254],
			rx_inf_collected: 0,
			rx_edc: [0; 2],
			rx_edc_collected: 0,
			atr_buf: [0; RX_BUF_LEN],
			atr_len: 0,
			atr_decoded: None,
			pps_buf: [0; MAX_PPS_LEN],
			pps_len: 0,
			apdu_buf: [0; MAX_APDU_LEN],
			apdu_len: 0,
			tx_fifo: ByteFifo::new(),
			tx_seq: 0,
			last_sent_seq: 0,
			last_tx_had_more_data: false,
			delivery_attempts: 0,
			last_tx_block: [0; MAX_BLOCK_WIRE_LEN],
			last_tx_block_len: 0,
			tx_block_ctr: 0,
			rx_seq: 0,
			rx_bad_block: false,
			resync_attempts: 0,
			serial_fail_count: 0,
			tm_interbyte: Timer::new(),
			tm_atr: Timer::new(),
			tm_response: Timer::new(),
		}
	}

	pub fn state(&self) -> FsmState {
		self.state
	}

	pub fn atr(&self) -> Option<&AtrDecoded> {
		self.atr_decoded.as_ref()
	}

	pub fn config(&self) -> &Config {
		&self.config
	}

	/// Sets a single already-resolved configuration value (sentinels are
	/// resolved by the façade before reaching here).
	pub fn set_config(&mut self, id: ConfigId, value: i32) -> bool {
		self.config.set(id, value)
	}

	/// Re-initializes the engine. `wait_atr = true` expects a fresh ATR
	/// before any `transmit_apdu` is accepted; `wait_atr = false` is used by
	/// a disconnect/teardown path that does not expect a session.
	pub fn reset(&mut self, wait_atr: bool) {
		debug!("t1: reset(wait_atr={wait_atr})");
		self.rx_sub = RxSubState::Nad;
		self.rx_skip_remaining = self.config.get(ConfigId::RxSkipBytes) as usize;
		if self.rx_skip_remaining > 0 {
			self.rx_sub = RxSubState::Skip;
		}
		self.atr_len = 0;
		self.atr_decoded = None;
		self.pps_len = 0;
		self.apdu_len = 0;
		self.tx_fifo.clear();
		self.tx_seq = 0;
		self.last_sent_seq = 0;
		self.last_tx_had_more_data = false;
		self.delivery_attempts = 0;
		self.last_tx_block_len = 0;
		self.tx_block_ctr = 0;
		self.rx_seq = 0;
		self.rx_bad_block = false;
		self.resync_attempts = 0;
		self.serial_fail_count = 0;
		self.tm_interbyte.disarm();
		self.tm_atr.disarm();
		self.tm_response.disarm();

		if wait_atr {
			self.state = FsmState::WaitAtr;
			self.tm_atr.arm(self.config.get(ConfigId::TmAtr) as u32);
		} else {
			self.state = FsmState::Idle;
		}
	}

	/// Minimum number of milliseconds a cooperative host may sleep before it
	/// must call `timer_task` again, or `u32::MAX` if no timer is armed.
	/// Valid only until the next engine API call mutates timer state.
	pub fn can_sleep_ms(&self) -> u32 {
		[
			self.tm_interbyte.remaining_ms(),
			self.tm_atr.remaining_ms(),
			self.tm_response.remaining_ms(),
		]
		.into_iter()
		.flatten()
		.min()
		.unwrap_or(u32::MAX)
	}

	pub fn timer_task(&mut self, elapsed_ms: u32, cb: &mut dyn EngineCallbacks) {
		if self.state == FsmState::Error {
			return;
		}

		if self.tm_interbyte.tick(elapsed_ms) {
			match self.state {
				FsmState::WaitAtr => self.try_parse_atr(cb),
				FsmState::PpsExchange => self.emit_error(EngineError::PpsFailed, cb),
				FsmState::IfsdSetupPrepare | FsmState::IfsdSetup => {
					self.emit_error(EngineError::CommFailure, cb)
				}
				FsmState::WaitResponse => self.handle_bad_block(RAck::ErrOther, cb),
				_ => {}
			}
		}

		if self.tm_atr.tick(elapsed_ms) && self.state == FsmState::WaitAtr {
			self.emit_error(EngineError::AtrTimeout, cb);
		}

		if self.tm_response.tick(elapsed_ms) && self.state == FsmState::WaitResponse {
			self.handle_bad_block(RAck::ErrOther, cb);
		}

		if self.state == FsmState::IfsdSetupPrepare {
			self.send_ifsd_request(cb);
			self.state = FsmState::IfsdSetup;
		}
	}

	pub fn serial_in(&mut self, buf: &[u8], cb: &mut dyn EngineCallbacks) {
		for &byte in buf {
			if self.state == FsmState::Error {
				break;
			}
			self.tm_interbyte.arm(self.config.get(ConfigId::TmInterbyte) as u32);
			match self.state {
				FsmState::WaitAtr => self.push_atr_byte(byte, cb),
				FsmState::PpsExchange => self.push_pps_byte(byte, cb),
				_ => self.feed_byte(byte, cb),
			}
		}
	}

	/// Queues `apdu` as one or more chained I-blocks (§4.4.8) and attempts
	/// the first send. Returns `false` without effect if the engine is not
	/// `idle` or the chain would not fit in the outbound FIFO.
	pub fn transmit_apdu(&mut self, apdu: &[u8], cb: &mut dyn EngineCallbacks) -> bool {
		if self.state != FsmState::Idle {
			warn!("t1: transmit_apdu rejected, engine not idle ({:?})", self.state);
			return false;
		}
		trace!("t1: transmit_apdu, {} bytes", apdu.len());
		let ifsc = (self.config.get(ConfigId::Ifsc) as usize).max(1);
		let total_chunks = if apdu.is_empty() {
			1
		} else {
			apdu.len().div_ceil(ifsc)
		};
		let mode = self.edc_mode();
		let needed: usize = (0..total_chunks)
			.map(|i| {
				let len = chunk_len(apdu, ifsc, i, total_chunks);
				2 + 3 + len + mode.size()
			})
			.sum();
		if needed > self.tx_fifo.free() {
			return false;
		}

		let base_seq = self.tx_seq;
		for i in 0..total_chunks {
			let start = i * ifsc;
			let len = chunk_len(apdu, ifsc, i, total_chunks);
			let chunk = &apdu[start.min(apdu.len())..(start + len).min(apdu.len())];
			let more = i + 1 < total_chunks;
			let seq = (base_seq + i as u8) & 1;
			let prm = BlockPrm::I(IBlockPrm {
				more_data: more,
				seq_number: seq,
			});
			self.push_block_to_fifo(prm, chunk, mode);
		}
		self.tx_seq = (base_seq + total_chunks as u8) & 1;
		self.state = FsmState::WaitResponse;
		self.send_next_queued_block(cb);
		true
	}

	fn edc_mode(&self) -> EdcMode {
		if self.config.get(ConfigId::UseCrc) != 0 {
			EdcMode::Crc
		} else {
			EdcMode::Lrc
		}
	}

	fn emit_error(&mut self, err: EngineError, cb: &mut dyn EngineCallbacks) {
		warn!("t1: entering error state: {err}");
		self.state = FsmState::Error;
		cb.handle_event(EngineEvent::Error(err));
	}

	// ---- ATR handling ----

	fn push_atr_byte(&mut self, byte: u8, cb: &mut dyn EngineCallbacks) {
		if self.atr_len >= RX_BUF_LEN {
			self.emit_error(EngineError::BadAtr, cb);
			return;
		}
		self.atr_buf[self.atr_len] = byte;
		self.atr_len += 1;
	}

	fn try_parse_atr(&mut self, cb: &mut dyn EngineCallbacks) {
		match atr::parse_atr(&self.atr_buf[..self.atr_len]) {
			Ok(decoded) => {
				self.tm_atr.disarm();
				let t1_supported = decoded.t1_supported;
				let ta2_absent = decoded.global_byte(AtrByteIdx::Ta2).is_none();
				// PPS1 echoes the card's own TA1, not our default, whenever the
				// ATR actually carried one.
				if let Some(ta1) = decoded.global_byte(AtrByteIdx::Ta1) {
					self.config.set(ConfigId::Ta1Value, ta1 as i32);
				}
				self.atr_decoded = Some(decoded);
				cb.handle_event(EngineEvent::AtrReceived(&self.atr_buf[..self.atr_len]));
				if !t1_supported {
					self.emit_error(EngineError::Incompatible, cb);
					return;
				}
				let features = CcidFeatures::from_bits_retain(self.config.get(ConfigId::DwFeatures));
				let auto_pps = features.contains(CcidFeatures::AUTO_PPS);
				if ta2_absent && !auto_pps {
					self.state = FsmState::PpsExchange;
					self.send_pps_request(cb);
				} else {
					self.state = FsmState::IfsdSetupPrepare;
				}
			}
			Err(_) => self.emit_error(EngineError::BadAtr, cb),
		}
	}

	// ---- PPS exchange ----

	fn send_pps_request(&mut self, cb: &mut dyn EngineCallbacks) {
		let is_usb = self.config.get(ConfigId::IsUsbReader) != 0;
		let pps0 = 0x01 | if is_usb { 0x10 } else { 0x00 };
		let ta1 = self.config.get(ConfigId::Ta1Value) as u8;
		let mut wire = [0xFFu8, pps0, ta1, 0x00];
		wire[3] = wire[..3].iter().fold(0u8, |a, &b| a ^ b);
		self.pps_len = 0;
		self.raw_serial_out(&wire, cb);
		self.tm_interbyte.arm(self.config.get(ConfigId::TmInterbyte) as u32);
	}

	fn push_pps_byte(&mut self, byte: u8, cb: &mut dyn EngineCallbacks) {
		if self.pps_len >= MAX_PPS_LEN {
			self.emit_error(EngineError::PpsFailed, cb);
			return;
		}
		self.pps_buf[self.pps_len] = byte;
		self.pps_len += 1;
		let expected_len = self.config.get(ConfigId::PpsSize) as usize;
		if self.pps_len == expected_len {
			self.check_pps_response(cb);
		}
	}

	fn check_pps_response(&mut self, cb: &mut dyn EngineCallbacks) {
		let resp = &self.pps_buf[..self.pps_len];
		let checksum_ok = resp.iter().fold(0u8, |a, &b| a ^ b) == 0;
		let is_usb = self.config.get(ConfigId::IsUsbReader) != 0;
		// REDESIGN FLAG: explicit parenthesization, not C operator precedence.
		let expected_pps0 = if is_usb { 0x01u8 | 0x10 } else { 0x01u8 };
		// A USB reader's PPS1 must echo the TA1 value we sent (§4.4.4); a
		// serial exchange carries no PPS1 byte to check.
		let pps1_ok = if is_usb {
			let ta1 = self.config.get(ConfigId::Ta1Value) as u8;
			resp.get(2) == Some(&ta1)
		} else {
			true
		};
		let valid =
			checksum_ok && resp.first() == Some(&0xFF) && resp.get(1) == Some(&expected_pps0) && pps1_ok;
		if valid {
			self.tm_response.arm(PPS_RESPONSE_INTERLOCK_MS);
			self.state = FsmState::IfsdSetupPrepare;
			cb.handle_event(EngineEvent::PpsExchangeDone);
		} else {
			self.emit_error(EngineError::PpsFailed, cb);
		}
	}

	// ---- IFSD negotiation ----

	fn send_ifsd_request(&mut self, cb: &mut dyn EngineCallbacks) {
		let ifsd = self.config.get(ConfigId::Ifsd) as i16;
		let prm = BlockPrm::S(SBlockPrm {
			command: SCommand::Ifs,
			is_response: false,
			inf_byte: ifsd,
		});
		self.send_control_block(prm, &[ifsd as u8], cb);
	}

	// ---- receive sub-FSM (§4.4.3) ----

	fn feed_byte(&mut self, byte: u8, cb: &mut dyn EngineCallbacks) {
		match self.rx_sub {
			RxSubState::Skip => {
				self.rx_skip_remaining -= 1;
				if self.rx_skip_remaining == 0 {
					self.rx_sub = RxSubState::Nad;
				}
			}
			RxSubState::Nad => {
				self.rx_nad = byte;
				self.rx_sub = RxSubState::Pcb;
			}
			RxSubState::Pcb => {
				self.rx_pcb = byte;
				self.rx_sub = RxSubState::Len;
			}
			RxSubState::Len => {
				if byte as usize > 254 {
					self.start_new_frame();
					self.handle_bad_block(RAck::ErrOther, cb);
					return;
				}
				self.rx_len = byte as usize;
				self.rx_inf_collected = 0;
				self.rx_edc_collected = 0;
				self.rx_sub = if self.rx_len == 0 {
					RxSubState::Edc
				} else {
					RxSubState::Inf
				};
			}
			RxSubState::Inf => {
				self.rx_inf[self.rx_inf_collected] = byte;
				self.rx_inf_collected += 1;
				if self.rx_inf_collected == self.rx_len {
					self.rx_sub = RxSubState::Edc;
				}
			}
			RxSubState::Edc => {
				self.rx_edc[self.rx_edc_collected] = byte;
				self.rx_edc_collected += 1;
				let needed = self.edc_mode().size();
				if self.rx_edc_collected == needed {
					self.on_frame_complete(cb);
					self.start_new_frame();
				}
			}
		}
	}

	fn start_new_frame(&mut self) {
		self.rx_skip_remaining = self.config.get(ConfigId::RxSkipBytes) as usize;
		self.rx_sub = if self.rx_skip_remaining > 0 {
			RxSubState::Skip
		} else {
			RxSubState::Nad
		};
	}

	fn on_frame_complete(&mut self, cb: &mut dyn EngineCallbacks) {
		let mode = self.edc_mode();
		let len_byte = self.rx_len as u8;
		let computed = edc(
			mode,
			&[&[self.rx_nad, self.rx_pcb, len_byte], &self.rx_inf[..self.rx_len]],
		);
		if computed.as_slice() != &self.rx_edc[..mode.size()] {
			self.handle_bad_block(RAck::ErrEdc, cb);
			return;
		}
		let prm = BlockPrm::from_pcb(self.rx_pcb, &self.rx_inf[..self.rx_len]);
		match prm {
			BlockPrm::I(ib) => self.handle_i_block(ib, cb),
			BlockPrm::R(rb) => self.handle_r_block(rb, cb),
			BlockPrm::S(sb) => self.handle_s_block(sb, cb),
			BlockPrm::Unknown => self.handle_bad_block(RAck::ErrOther, cb),
		}
	}

	// ---- block handlers (§4.4.4) ----

	fn handle_i_block(&mut self, ib: IBlockPrm, cb: &mut dyn EngineCallbacks) {
		if self.state != FsmState::WaitResponse {
			self.handle_bad_block(RAck::ErrOther, cb);
			return;
		}
		if ib.seq_number != self.rx_seq {
			self.handle_bad_block(RAck::ErrOther, cb);
			return;
		}
		self.rx_seq ^= 1;
		let inf_len = self.rx_inf_collected;
		if self.apdu_len + inf_len > MAX_APDU_LEN {
			self.emit_error(EngineError::OversizedApdu, cb);
			return;
		}
		self.apdu_buf[self.apdu_len..self.apdu_len + inf_len].copy_from_slice(&self.rx_inf[..inf_len]);
		self.apdu_len += inf_len;
		self.delivery_attempts = 0;
		self.rx_bad_block = false;

		if ib.more_data {
			self.send_r_block(RAck::Ok, self.rx_seq, cb);
		} else {
			self.pop_delivered_tx_block();
			let sent_more = self.send_next_queued_block(cb);
			if self.state == FsmState::Error {
				// send_next_queued_block escalated a serial-out failure; no
				// apdu_received is emitted for this delivery (§4.4.4).
				return;
			}
			if !sent_more {
				self.state = FsmState::Idle;
			}
			let len = self.apdu_len;
			self.apdu_len = 0;
			cb.handle_event(EngineEvent::ApduReceived(&self.apdu_buf[..len]));
		}
	}

	fn handle_r_block(&mut self, rb: RBlockPrm, cb: &mut dyn EngineCallbacks) {
		if self.state != FsmState::WaitResponse {
			return;
		}
		match rb.ack_code {
			RAck::Ok => {
				if rb.seq_number != self.last_sent_seq && self.last_tx_had_more_data {
					self.delivery_attempts = 0;
					self.pop_delivered_tx_block();
					self.send_next_queued_block(cb);
				}
			}
			RAck::ErrEdc | RAck::ErrOther => {
				// The card is reporting a bad EDC/parity on the block we last
				// sent it, not on something we received: resend that block
				// rather than running the rx-side bad-block policy.
				self.rx_bad_block = true;
				if self.delivery_attempts + 1 < DELIVERY_ATTEMPTS {
					self.delivery_attempts += 1;
					self.resend_prev_block(cb);
				} else {
					self.delivery_attempts = 0;
					self.state = FsmState::Resync;
					self.resync_attempts = 0;
					self.send_s_resynch_request(cb);
				}
			}
		}
	}

	/// Retransmits the most recently sent block verbatim (§4.4.5, called
	/// when the card's R-block reports an EDC/parity error on it).
	fn resend_prev_block(&mut self, cb: &mut dyn EngineCallbacks) {
		let len = self.last_tx_block_len;
		let block = self.last_tx_block;
		self.raw_serial_out(&block[..len], cb);
		self.tm_response.arm(self.config.get(ConfigId::TmResponse) as u32);
	}

	fn handle_s_block(&mut self, sb: SBlockPrm, cb: &mut dyn EngineCallbacks) {
		match (sb.command, sb.is_response) {
			(SCommand::Ifs, false) => {
				let ifsc = sb.inf_byte.clamp(IFS_MIN, IFS_MAX);
				self.config.set(ConfigId::Ifsc, ifsc as i32);
				let reply = BlockPrm::S(SBlockPrm {
					command: SCommand::Ifs,
					is_response: true,
					inf_byte: ifsc,
				});
				self.send_control_block(reply, &[ifsc as u8], cb);
			}
			(SCommand::Ifs, true) => {
				self.tm_response.disarm();
				let was_ifsd_setup = self.state == FsmState::IfsdSetup;
				let sent_more = self.send_next_queued_block(cb);
				if was_ifsd_setup {
					self.state = if sent_more {
						FsmState::WaitResponse
					} else {
						FsmState::Idle
					};
				}
				cb.handle_event(EngineEvent::Connect);
			}
			(SCommand::Abort, _) => self.emit_error(EngineError::ScAbort, cb),
			(SCommand::Wtx, false) => {
				let factor = (sb.inf_byte.max(2)) as u32;
				// Multiplies the live countdown, not the static default, so a
				// second WTX within the same wait compounds on the first.
				let base = self
					.tm_response
					.remaining_ms()
					.unwrap_or_else(|| self.config.get(ConfigId::TmResponse) as u32);
				let max = self.config.get(ConfigId::TmResponseMax) as u32;
				let extended = base.saturating_mul(factor).min(max);
				self.tm_response.arm(extended);
				let reply = BlockPrm::S(SBlockPrm {
					command: SCommand::Wtx,
					is_response: true,
					inf_byte: sb.inf_byte,
				});
				let inf_byte = sb.inf_byte.clamp(0, 255) as u8;
				self.send_control_block(reply, &[inf_byte], cb);
			}
			(SCommand::Resynch, true) if self.state == FsmState::Resync => {
				self.tx_seq = 0;
				self.last_sent_seq = 0;
				self.rx_seq = 0;
				self.config.reset(ConfigId::Ifsc);
				self.resync_attempts = 0;
				self.state = FsmState::WaitResponse;
				self.send_next_queued_block(cb);
			}
			_ => {}
		}
	}

	/// §4.4.5 bad-block policy.
	fn handle_bad_block(&mut self, ack_code: RAck, cb: &mut dyn EngineCallbacks) {
		self.rx_bad_block = true;
		if self.state != FsmState::Resync {
			if self.delivery_attempts + 1 < DELIVERY_ATTEMPTS {
				self.send_r_block(ack_code, self.rx_seq, cb);
				self.delivery_attempts += 1;
			} else if self.tx_block_ctr <= 1 {
				self.emit_error(EngineError::CommFailure, cb);
			} else {
				debug!("t1: delivery attempts exhausted, entering resync");
				self.state = FsmState::Resync;
				self.resync_attempts = 0;
				self.send_s_resynch_request(cb);
			}
		} else if self.resync_attempts + 1 < RESYNC_ATTEMPTS {
			self.send_s_resynch_request(cb);
			self.resync_attempts += 1;
		} else {
			self.emit_error(EngineError::CommFailure, cb);
		}
	}

	fn send_s_resynch_request(&mut self, cb: &mut dyn EngineCallbacks) {
		let prm = BlockPrm::S(SBlockPrm {
			command: SCommand::Resynch,
			is_response: false,
			inf_byte: -1,
		});
		self.send_control_block(prm, &[], cb);
	}

	// ---- low-level senders ----

	fn send_r_block(&mut self, ack: RAck, seq: u8, cb: &mut dyn EngineCallbacks) {
		let prm = BlockPrm::R(RBlockPrm {
			ack_code: ack,
			seq_number: seq,
		});
		self.send_control_block(prm, &[], cb);
	}

	/// Sends a non-chained control block (R-block or S-block) directly,
	/// bypassing the outbound FIFO, and arms the response timer.
	fn send_control_block(&mut self, prm: BlockPrm, inf: &[u8], cb: &mut dyn EngineCallbacks) {
		let mode = self.edc_mode();
		let pcb = prm.pcb();
		let len = inf.len() as u8;
		let mut wire = [0u8; MAX_BLOCK_WIRE_LEN];
		wire[0] = 0x00;
		wire[1] = pcb;
		wire[2] = len;
		wire[3..3 + inf.len()].copy_from_slice(inf);
		let edc_val = edc(mode, &[&wire[..3], inf]);
		let edc_at = 3 + inf.len();
		wire[edc_at..edc_at + mode.size()].copy_from_slice(edc_val.as_slice());
		let total = edc_at + mode.size();
		self.raw_serial_out(&wire[..total], cb);
		self.tm_response.arm(self.config.get(ConfigId::TmResponse) as u32);
	}

	/// Pushes a chained I-block into the outbound FIFO with a 2-byte
	/// little-endian length prefix (§9 "header stored in the TX FIFO").
	fn push_block_to_fifo(&mut self, prm: BlockPrm, chunk: &[u8], mode: EdcMode) {
		let pcb = prm.pcb();
		let len = chunk.len() as u8;
		let header = [0x00u8, pcb, len];
		let edc_val = edc(mode, &[&header, chunk]);
		let total_len = (header.len() + chunk.len() + mode.size()) as u16;
		self.tx_fifo.push_bytes(&total_len.to_le_bytes());
		self.tx_fifo.push_bytes(&header);
		self.tx_fifo.push_bytes(chunk);
		self.tx_fifo.push_bytes(edc_val.as_slice());
	}

	/// Peeks (without consuming) the front-most queued block and transmits
	/// it, recording it for possible retransmission. Returns `false` if the
	/// FIFO is empty.
	fn send_next_queued_block(&mut self, cb: &mut dyn EngineCallbacks) -> bool {
		if self.tx_fifo.used() == 0 {
			return false;
		}
		let mut cursor = self.tx_fifo.peek_cursor();
		let mut len_bytes = [0u8; 2];
		self.tx_fifo.read_at(&mut cursor, &mut len_bytes);
		let total = u16::from_le_bytes(len_bytes) as usize;
		let mut block = [0u8; MAX_BLOCK_WIRE_LEN];
		self.tx_fifo.read_at(&mut cursor, &mut block[..total]);

		self.last_tx_block[..total].copy_from_slice(&block[..total]);
		self.last_tx_block_len = total;
		self.last_sent_seq = (block[1] >> 6) & 1;
		self.last_tx_had_more_data = block[1] & 0x20 != 0;
		self.tx_block_ctr = self.tx_block_ctr.saturating_add(1);

		self.raw_serial_out(&block[..total], cb);
		self.tm_response.arm(self.config.get(ConfigId::TmResponse) as u32);
		true
	}

	/// Drops the front-most queued block (already acknowledged) from the
	/// FIFO, including its 2-byte length prefix.
	fn pop_delivered_tx_block(&mut self) {
		let mut len_bytes = [0u8; 2];
		if self.tx_fifo.pop_bytes(&mut len_bytes) < 2 {
			return;
		}
		let total = u16::from_le_bytes(len_bytes) as usize;
		self.tx_fifo.drop_front(total);
	}

	fn raw_serial_out(&mut self, bytes: &[u8], cb: &mut dyn EngineCallbacks) -> bool {
		if cb.serial_out(bytes) {
			self.serial_fail_count = 0;
			true
		} else {
			self.serial_fail_count = self.serial_fail_count.saturating_add(1);
			if self.serial_fail_count > 2 {
				self.emit_error(EngineError::SerialOut, cb);
			}
			false
		}
	}
}

impl Default for T1Engine {
	fn default() -> Self {
		Self::new()
	}
}

/// Length of chunk `i` of `total` when splitting `apdu` into pieces of at
/// most `ifsc` bytes (§4.4.8). An empty APDU yields a single zero-length
/// chunk.
fn chunk_len(apdu: &[u8], ifsc: usize, i: usize, total: usize) -> usize {
	if apdu.is_empty() {
		return 0;
	}
	let start = i * ifsc;
	let end = if i + 1 == total { apdu.len() } else { (start + ifsc).min(apdu.len()) };
	end - start
}

#[cfg(test)]
mod tests {
	use super::*;
	use alloc::vec::Vec;

	struct Recorder {
		sent: Vec<u8>,
		events: Vec<EventSnapshot>,
	}

	#[derive(Debug, Clone, PartialEq, Eq)]
	enum EventSnapshot {
		Atr(Vec<u8>),
		Connect,
		Apdu(Vec<u8>),
		PpsDone,
		Error(EngineError),
	}

	impl Recorder {
		fn new() -> Self {
			Self {
				sent: Vec::new(),
				events: Vec::new(),
			}
		}
	}

	impl EngineCallbacks for Recorder {
		fn serial_out(&mut self, buf: &[u8]) -> bool {
			self.sent.extend_from_slice(buf);
			true
		}

		fn handle_event(&mut self, event: EngineEvent<'_>) {
			let snap = match event {
				EngineEvent::AtrReceived(b) => EventSnapshot::Atr(b.to_vec()),
				EngineEvent::Connect => EventSnapshot::Connect,
				EngineEvent::ApduReceived(b) => EventSnapshot::Apdu(b.to_vec()),
				EngineEvent::PpsExchangeDone => EventSnapshot::PpsDone,
				EngineEvent::Error(e) => EventSnapshot::Error(e),
			};
			self.events.push(snap);
		}
	}

	#[test]
	fn minimal_atr_without_t1_support_is_incompatible() {
		let mut engine = T1Engine::new();
		let mut rec = Recorder::new();
		engine.reset(true);
		engine.serial_in(&[0x3B, 0x90, 0x11, 0x00], &mut rec);
		engine.timer_task(250, &mut rec);
		assert_eq!(engine.state(), FsmState::Error);
		assert!(rec
			.events
			.iter()
			.any(|e| matches!(e, EventSnapshot::Error(EngineError::Incompatible))));
	}

	#[test]
	fn t1_atr_without_ta2_starts_pps_exchange() {
		let mut engine = T1Engine::new();
		let mut rec = Recorder::new();
		engine.reset(true);
		// TS=3B, T0=0x81 (TD1 only, hist=1), TD1=0x81 (TD2 only, protocol T1),
		// TD2=0x00 (no further interface bytes), hist=1 byte, TCK. No TA2 byte
		// is ever present in this chain, so the engine must start PPS itself.
		let bytes = [0x3Bu8, 0x81, 0x81, 0x00, 0x00, 0x00];
		engine.serial_in(&bytes, &mut rec);
		engine.timer_task(250, &mut rec);
		assert_eq!(engine.state(), FsmState::PpsExchange);
		assert!(!rec.sent.is_empty());
		assert_eq!(rec.sent[0], 0xFF);
	}

	#[test]
	fn apdu_is_split_into_ifsc_sized_chained_blocks() {
		let mut engine = T1Engine::new();
		let mut rec = Recorder::new();
		engine.set_config(ConfigId::Ifsc, 2);
		engine.reset(false); // skip ATR/PPS/IFSD, go straight to idle for unit testing chaining
		let apdu = [1u8, 2, 3, 4, 5];
		assert!(engine.transmit_apdu(&apdu, &mut rec));
		// First chunk: NAD=00 PCB(I,M=1,seq0)=0x20 LEN=2 INF=01 02 LRC
		assert_eq!(&rec.sent[..3], &[0x00, 0x20, 0x02]);
		assert_eq!(&rec.sent[3..5], &[1, 2]);
	}
}

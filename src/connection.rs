//! Connection FSM (C6): one host-card session. Owns the T=1 engine, the
//! transport/pin/clock collaborators, and the observer dispatch; exposes
//! both a cooperative (timer-driven) and a blocking mode of operation
//! (§4.6). Grounded on the teacher's connection/session state machines
//! (`drivers/net` link-state handling) generalized to smart-card session
//! lifecycle.

use log::{debug, info, warn};

use crate::error::{ConnectionError, EngineError};
use crate::facade::ProtocolEngineApi;
use crate::observer::{Event, ObserverDispatch};
use crate::t1::engine::{EngineCallbacks, EngineEvent, FsmState, T1Engine};
use crate::transport::{Clock, Pin, PinIo, PinState, SerialTransport};

const MAX_ATR_LEN: usize = 40;
const MAX_RESPONSE_LEN: usize = 255;
const PRESENCE_THRESHOLD: u8 = 5;
const DEFAULT_DEBOUNCE_MS: u32 = 5;
const RESET_DURATION_MS: u32 = 5;

/// Session lifecycle state (§4.6.1).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnState {
	Closed,
	Disconnected,
	Connecting,
	Connected,
	Error,
}

/// Pin polarity configuration (§6.5): which electrical level counts as
/// "active" for each pin.
#[derive(Debug, Clone, Copy)]
pub struct PinPolarity {
	pub reset_active_low: bool,
	pub presence_active_high: bool,
	pub power_active_low: bool,
}

impl Default for PinPolarity {
	fn default() -> Self {
		Self {
			reset_active_low: true,
			presence_active_high: true,
			power_active_low: true,
		}
	}
}

struct AtrRecord {
	buf: [u8; MAX_ATR_LEN],
	len: usize,
}

impl AtrRecord {
	const fn empty() -> Self {
		Self {
			buf: [0; MAX_ATR_LEN],
			len: 0,
		}
	}

	fn as_slice(&self) -> &[u8] {
		&self.buf[..self.len]
	}
}

/// Borrows just the collaborators an engine call needs for the duration of
/// that one call, leaving the rest of `Connection` (including the engine
/// itself) untouched — this is what lets `Connection` implement
/// `EngineCallbacks`-shaped behavior without owning a reference to itself.
struct ConnSink<'a, T: SerialTransport> {
	transport: &'a mut T,
	observers: &'a mut ObserverDispatch,
	connection_id: u32,
	atr: &'a mut AtrRecord,
	response: &'a mut [u8; MAX_RESPONSE_LEN],
	response_len: &'a mut usize,
	response_ready: &'a mut bool,
	became_connected: &'a mut bool,
	raised_error: &'a mut Option<EngineError>,
}

impl<T: SerialTransport> EngineCallbacks for ConnSink<'_, T> {
	fn serial_out(&mut self, buf: &[u8]) -> bool {
		self.transport.serial_tx(buf)
	}

	fn handle_event(&mut self, event: EngineEvent<'_>) {
		match event {
			EngineEvent::AtrReceived(bytes) => {
				let n = bytes.len().min(MAX_ATR_LEN);
				self.atr.buf[..n].copy_from_slice(&bytes[..n]);
				self.atr.len = n;
			}
			EngineEvent::Connect => {
				*self.became_connected = true;
				let _ = self.observers.enqueue(Event::connect(self.connection_id));
			}
			EngineEvent::ApduReceived(bytes) => {
				let n = bytes.len().min(MAX_RESPONSE_LEN);
				self.response[..n].copy_from_slice(&bytes[..n]);
				*self.response_len = n;
				*self.response_ready = true;
				let _ = self
					.observers
					.enqueue(Event::response(self.connection_id, &bytes[..n]));
			}
			EngineEvent::PpsExchangeDone => {}
			EngineEvent::Error(err) => {
				*self.raised_error = Some(err);
				let _ = self
					.observers
					.enqueue(Event::error(self.connection_id, ConnectionError::Engine(err)));
			}
		}
	}
}

pub struct Connection<T: SerialTransport, P: PinIo, K: Clock> {
	connection_id: u32,
	state: ConnState,
	engine: T1Engine,
	transport: T,
	pins: P,
	clock: K,
	observers: ObserverDispatch,
	polarity: PinPolarity,
	blocking: bool,
	has_timer: bool,

	atr: AtrRecord,
	response: [u8; MAX_RESPONSE_LEN],
	response_len: usize,
	response_ready: bool,

	presence_counter: u8,
	present: bool,

	rx_scratch: [u8; 256],
	last_tick_ms: u32,
}

impl<T: SerialTransport, P: PinIo, K: Clock> Connection<T, P, K> {
	pub fn new(connection_id: u32, transport: T, pins: P, mut clock: K, has_timer: bool) -> Self {
		Self::with_polarity(connection_id, transport, pins, clock, has_timer, PinPolarity::default())
	}

	pub fn with_polarity(
		connection_id: u32,
		transport: T,
		pins: P,
		mut clock: K,
		has_timer: bool,
		polarity: PinPolarity,
	) -> Self {
		let now = clock.ticks_ms();
		Self {
			connection_id,
			state: ConnState::Disconnected,
			engine: T1Engine::new(),
			transport,
			pins,
			clock,
			observers: ObserverDispatch::new(),
			polarity,
			blocking: !has_timer,
			has_timer,
			atr: AtrRecord::empty(),
			response: [0; MAX_RESPONSE_LEN],
			response_len: 0,
			response_ready: false,
			presence_counter: 0,
			present: false,
			rx_scratch: [0; 256],
			last_tick_ms: now,
		}
	}

	pub fn state(&self) -> ConnState {
		self.state
	}

	pub fn get_atr(&self) -> &[u8] {
		self.atr.as_slice()
	}

	pub fn is_active(&self) -> bool {
		!matches!(self.state, ConnState::Closed)
	}

	pub fn is_ready(&self) -> bool {
		self.state == ConnState::Connected
	}

	pub fn observers_mut(&mut self) -> &mut ObserverDispatch {
		&mut self.observers
	}

	fn set_pin(&mut self, pin: Pin, active: bool) {
		let polarity_active_low = match pin {
			Pin::Reset => self.polarity.reset_active_low,
			Pin::Power => self.polarity.power_active_low,
			Pin::Presence => true,
		};
		let electrical = if active == polarity_active_low {
			PinState::Inactive
		} else {
			PinState::Active
		};
		self.pins.pin_write(pin, electrical);
	}

	fn read_presence_pin(&mut self) -> bool {
		if let Some(present) = self.transport.ccid_slot_present() {
			return present;
		}
		let raw = self.pins.pin_read(Pin::Presence);
		let active = raw == PinState::Active;
		if self.polarity.presence_active_high {
			active
		} else {
			!active
		}
	}

	/// `connect(protocol=None)` (§4.6.2). Only T=1 is implemented, so there
	/// is no protocol argument to resolve.
	pub fn connect(&mut self) -> Result<(), ConnectionError> {
		if self.state != ConnState::Disconnected {
			return Err(ConnectionError::AlreadyConnected);
		}
		if !self.is_card_inserted() {
			return Err(ConnectionError::NoCard);
		}
		debug!("connection {}: connect()", self.connection_id);
		self.transport.ccid_power_on();
		self.set_pin(Pin::Power, true);
		self.set_pin(Pin::Reset, true);
		self.clock.sleep_ms(RESET_DURATION_MS);
		self.set_pin(Pin::Reset, false);
		ProtocolEngineApi::reset(&mut self.engine, true);
		self.state = ConnState::Connecting;

		if self.blocking {
			self.wait_connect_blocking()?;
		}
		Ok(())
	}

	/// `transmit(bytes, protocol=None)` (§4.6.2).
	pub fn transmit(&mut self, apdu: &[u8]) -> Result<(), ConnectionError> {
		if self.state != ConnState::Connected {
			return Err(ConnectionError::NoCard);
		}
		self.observers
			.enqueue(Event::command(self.connection_id, apdu, 1))?;
		self.response_ready = false;
		let mut atr = AtrRecord::empty();
		let mut response = [0u8; MAX_RESPONSE_LEN];
		let mut response_len = 0usize;
		let mut response_ready = false;
		let mut became_connected = false;
		let mut raised_error = None;
		{
			let mut sink = ConnSink {
				transport: &mut self.transport,
				observers: &mut self.observers,
				connection_id: self.connection_id,
				atr: &mut atr,
				response: &mut response,
				response_len: &mut response_len,
				response_ready: &mut response_ready,
				became_connected: &mut became_connected,
				raised_error: &mut raised_error,
			};
			ProtocolEngineApi::transmit_apdu(&mut self.engine, apdu, &mut sink);
		}
		if response_ready {
			self.response[..response_len].copy_from_slice(&response[..response_len]);
			self.response_len = response_len;
			self.response_ready = true;
		}
		self.apply_raised_error(raised_error);

		if self.blocking {
			self.wait_response_blocking()?;
		}
		Ok(())
	}

	/// Consumes and clears the most recently received response, if any.
	pub fn take_response(&mut self) -> Option<&[u8]> {
		if self.response_ready {
			self.response_ready = false;
			Some(&self.response[..self.response_len])
		} else {
			None
		}
	}

	/// `disconnect` (§4.6.2). Idempotent on `closed`/`disconnected`.
	pub fn disconnect(&mut self) {
		if matches!(self.state, ConnState::Closed | ConnState::Disconnected) {
			return;
		}
		ProtocolEngineApi::reset(&mut self.engine, false);
		self.atr = AtrRecord::empty();
		self.response_ready = false;
		self.set_pin(Pin::Reset, true);
		self.set_pin(Pin::Power, false);
		self.transport.ccid_power_off();
		self.state = ConnState::Disconnected;
		let _ = self.observers.enqueue(Event::disconnect(self.connection_id));
		self.observers.notify_all();
	}

	/// `close` (§4.6.2): disconnect, drop observers, mark closed.
	pub fn close(&mut self) {
		self.disconnect();
		self.observers = ObserverDispatch::new();
		self.has_timer = false;
		self.state = ConnState::Closed;
	}

	/// `set_blocking(bool)`: refuses `false` unless a timer exists.
	pub fn set_blocking(&mut self, blocking: bool) -> bool {
		if !blocking && !self.has_timer {
			return false;
		}
		self.blocking = blocking;
		true
	}

	/// `set_timeouts(atr, rsp, max)` (§4.6.2): `None` leaves a timeout
	/// unchanged, routed through the façade's `unchanged` sentinel (§4.5)
	/// rather than skipping the call, so a single future protocol switch
	/// still sees a uniform three-value call.
	pub fn set_timeouts(&mut self, atr_ms: Option<i32>, rsp_ms: Option<i32>, max_ms: Option<i32>) {
		ProtocolEngineApi::set_timeouts(
			&mut self.engine,
			atr_ms.unwrap_or(crate::t1::config::SENTINEL_UNCHANGED),
			rsp_ms.unwrap_or(crate::t1::config::SENTINEL_UNCHANGED),
			max_ms.unwrap_or(crate::t1::config::SENTINEL_UNCHANGED),
		);
	}

	/// For a timer-less connection there is no periodic `poll_presence_nonblocking`
	/// to keep `self.present` current, so this performs the same on-demand
	/// synchronous debounce the original's `card_present()` does before
	/// answering — otherwise a cold-start `connect()` would always see the
	/// construction-time default of "absent".
	pub fn is_card_inserted(&mut self) -> bool {
		if !self.has_timer {
			self.refresh_presence_blocking();
		}
		self.present
	}

	/// Shared by `is_card_inserted` and `wait_connect_blocking`: debounces the
	/// pin and emits `insertion`/`removal` on a change (§4.6.3 blocking path).
	fn refresh_presence_blocking(&mut self) {
		let present = self.debounce_presence_blocking(DEFAULT_DEBOUNCE_MS);
		if present != self.present {
			self.present = present;
			if present {
				let _ = self.observers.enqueue(Event::insertion(self.connection_id));
			} else {
				self.on_removal();
			}
		}
	}

	fn apply_raised_error(&mut self, raised: Option<EngineError>) {
		if let Some(err) = raised {
			warn!("connection {}: engine error {err}, entering Error state", self.connection_id);
			self.state = ConnState::Error;
		}
	}

	/// One tick of the periodic host timer (default 10 ms, §5): advances
	/// engine timers, reads any pending serial bytes, and debounces card
	/// presence (non-blocking path, §4.6.3).
	pub fn timer_task(&mut self) -> Result<(), ConnectionError> {
		if matches!(self.state, ConnState::Closed) {
			return Ok(());
		}
		let now = self.clock.ticks_ms();
		let elapsed = crate::transport::elapsed_ms(self.last_tick_ms, now);
		self.last_tick_ms = now;

		self.poll_presence_nonblocking();

		let n = self.transport.serial_rx_available(&mut self.rx_scratch);
		if n > 0 {
			self.feed_bytes(n);
		}

		let mut atr = AtrRecord::empty();
		let mut response = [0u8; MAX_RESPONSE_LEN];
		let mut response_len = 0usize;
		let mut response_ready = false;
		let mut became_connected = false;
		let mut raised_error = None;
		{
			let mut sink = ConnSink {
				transport: &mut self.transport,
				observers: &mut self.observers,
				connection_id: self.connection_id,
				atr: &mut atr,
				response: &mut response,
				response_len: &mut response_len,
				response_ready: &mut response_ready,
				became_connected: &mut became_connected,
				raised_error: &mut raised_error,
			};
			ProtocolEngineApi::timer_task(&mut self.engine, elapsed, &mut sink);
		}
		if atr.len > 0 {
			self.atr = atr;
		}
		if response_ready {
			self.response[..response_len].copy_from_slice(&response[..response_len]);
			self.response_len = response_len;
			self.response_ready = true;
		}
		if became_connected {
			let ta1 = self.atr.as_slice().get(2).copied().unwrap_or(0x11);
			self.transport.ccid_set_parameters_t1(ta1);
			self.state = ConnState::Connected;
		}
		self.apply_raised_error(raised_error);
		if self.observers.has_pending() {
			self.observers.notify_all();
		}
		Ok(())
	}

	fn feed_bytes(&mut self, n: usize) {
		let mut atr = AtrRecord::empty();
		let mut response = [0u8; MAX_RESPONSE_LEN];
		let mut response_len = 0usize;
		let mut response_ready = false;
		let mut became_connected = false;
		let mut raised_error = None;
		let buf: heapless::Vec<u8, 256> = heapless::Vec::from_slice(&self.rx_scratch[..n]).unwrap_or_default();
		{
			let mut sink = ConnSink {
				transport: &mut self.transport,
				observers: &mut self.observers,
				connection_id: self.connection_id,
				atr: &mut atr,
				response: &mut response,
				response_len: &mut response_len,
				response_ready: &mut response_ready,
				became_connected: &mut became_connected,
				raised_error: &mut raised_error,
			};
			ProtocolEngineApi::serial_in(&mut self.engine, &buf, &mut sink);
		}
		if atr.len > 0 {
			self.atr = atr;
		}
		if response_ready {
			self.response[..response_len].copy_from_slice(&response[..response_len]);
			self.response_len = response_len;
			self.response_ready = true;
		}
		if became_connected {
			let ta1 = self.atr.as_slice().get(2).copied().unwrap_or(0x11);
			self.transport.ccid_set_parameters_t1(ta1);
			self.state = ConnState::Connected;
		}
		self.apply_raised_error(raised_error);
	}

	/// Non-blocking debounce path (§4.6.3): counts consecutive present ticks
	/// up to `PRESENCE_THRESHOLD` before validating an insertion; an absent
	/// reading is immediately valid.
	fn poll_presence_nonblocking(&mut self) {
		let raw_present = self.read_presence_pin();
		if raw_present {
			if self.presence_counter < PRESENCE_THRESHOLD {
				self.presence_counter += 1;
			}
			if self.presence_counter == PRESENCE_THRESHOLD && !self.present {
				self.present = true;
				let _ = self.observers.enqueue(Event::insertion(self.connection_id));
			}
		} else {
			self.presence_counter = 0;
			if self.present {
				self.present = false;
				self.on_removal();
			}
		}
	}

	/// Blocking debounce path (§4.6.3): used when no timer drives
	/// `poll_presence_nonblocking`. Samples the pin, restarts on any change,
	/// and exits once stable for `debounce_ms` or a 10x timeout elapses.
	fn debounce_presence_blocking(&mut self, debounce_ms: u32) -> bool {
		let timeout_ms = debounce_ms * 10;
		let start = self.clock.ticks_ms();
		let mut last = self.read_presence_pin();
		let mut stable_since = start;
		loop {
			self.clock.sleep_ms(1);
			let now = self.clock.ticks_ms();
			let current = self.read_presence_pin();
			if current != last {
				last = current;
				stable_since = now;
			}
			if crate::transport::elapsed_ms(stable_since, now) >= debounce_ms {
				return last;
			}
			if crate::transport::elapsed_ms(start, now) >= timeout_ms {
				return last;
			}
		}
	}

	fn on_removal(&mut self) {
		info!("connection {}: card removed", self.connection_id);
		let _ = self.observers.enqueue(Event::removal(self.connection_id));
		if matches!(self.state, ConnState::Connecting | ConnState::Connected) {
			self.disconnect();
			self.state = ConnState::Error;
			let _ = self.observers.enqueue(Event::error(
				self.connection_id,
				ConnectionError::UnexpectedRemoval,
			));
		}
	}

	/// §4.6.4: read bytes, push into the engine, advance the timer, yield.
	/// Exits on state change rather than a fixed iteration count.
	fn wait_connect_blocking(&mut self) -> Result<(), ConnectionError> {
		loop {
			if !self.has_timer {
				self.refresh_presence_blocking();
			}
			self.timer_task()?;
			match self.state {
				ConnState::Connecting => {
					self.clock.sleep_ms(1);
					continue;
				}
				ConnState::Connected => return Ok(()),
				ConnState::Error => {
					self.observers.notify_all();
					return Err(ConnectionError::Engine(EngineError::CommFailure));
				}
				_ => return Ok(()),
			}
		}
	}

	fn wait_response_blocking(&mut self) -> Result<(), ConnectionError> {
		loop {
			self.timer_task()?;
			if self.response_ready {
				return Ok(());
			}
			if self.state == ConnState::Error {
				self.observers.notify_all();
				return Err(ConnectionError::Engine(EngineError::CommFailure));
			}
			self.clock.sleep_ms(1);
		}
	}
}

//! End-to-end scenario against the public `Connection` API: a scripted
//! transport/pin/clock trio drives a session from card insertion through a
//! full ATR + IFSD handshake to `connected`, then an unexpected removal.

use std::cell::{Cell, RefCell};
use std::collections::VecDeque;
use std::rc::Rc;

use scard_t1::{Clock, Connection, Event, EventKind, Pin, PinIo, PinPolarity, PinState, SerialTransport};

fn lrc(parts: &[&[u8]]) -> u8 {
	parts.iter().flat_map(|p| p.iter()).fold(0u8, |a, &b| a ^ b)
}

fn s_block(cmd: u8, is_response: bool, inf: Option<u8>) -> Vec<u8> {
	let pcb = 0xC0 | cmd | (if is_response { 0x20 } else { 0 });
	let inf_bytes: Vec<u8> = inf.into_iter().collect();
	let mut wire = vec![0x00u8, pcb, inf_bytes.len() as u8];
	wire.extend_from_slice(&inf_bytes);
	wire.push(lrc(&[&wire[..3], &inf_bytes]));
	wire
}

/// TS=3B, T0=0x81 (TD1 only, hist=1), TD1=0x31 (Y2 selects TA2+TB2, protocol
/// T1), TA2=0x00, TB2=0x00, 1 historical byte, TCK. TA2 present, so the
/// engine skips PPS and goes straight to IFSD setup.
const ATR_T1_WITH_TA2: [u8; 7] = [0x3B, 0x81, 0x31, 0x00, 0x00, 0x00, 0xB0];

struct MockTransport {
	tx: Rc<RefCell<Vec<u8>>>,
	rx: Rc<RefCell<VecDeque<u8>>>,
}

impl SerialTransport for MockTransport {
	fn serial_tx(&mut self, buf: &[u8]) -> bool {
		self.tx.borrow_mut().extend_from_slice(buf);
		true
	}

	fn serial_rx_available(&mut self, out: &mut [u8]) -> usize {
		let mut rx = self.rx.borrow_mut();
		let n = rx.len().min(out.len());
		for slot in out.iter_mut().take(n) {
			*slot = rx.pop_front().expect("checked len above");
		}
		n
	}
}

struct MockPins {
	present: Rc<Cell<bool>>,
}

impl PinIo for MockPins {
	fn pin_read(&mut self, pin: Pin) -> PinState {
		match pin {
			Pin::Presence if self.present.get() => PinState::Active,
			Pin::Presence => PinState::Inactive,
			_ => PinState::Inactive,
		}
	}

	fn pin_write(&mut self, _pin: Pin, _state: PinState) {}
}

/// Advances by a fixed 250 ms step on every read, comfortably past the
/// engine's 200 ms default inter-byte timeout, so each `timer_task` call
/// reliably ticks any armed engine timer.
struct MockClock {
	now: Rc<Cell<u32>>,
}

impl Clock for MockClock {
	fn ticks_ms(&mut self) -> u32 {
		let v = self.now.get();
		self.now.set(v.wrapping_add(250));
		v
	}

	fn sleep_ms(&mut self, _ms: u32) {}
}

/// S6 plus its precondition: card insertion, full ATR/IFSD handshake up to
/// `connected`, then an unexpected removal while connected.
#[test]
fn s6_connect_then_unexpected_removal() {
	let tx = Rc::new(RefCell::new(Vec::new()));
	let rx = Rc::new(RefCell::new(VecDeque::new()));
	let present = Rc::new(Cell::new(false));
	let now = Rc::new(Cell::new(0u32));

	let transport = MockTransport { tx: tx.clone(), rx: rx.clone() };
	let pins = MockPins { present: present.clone() };
	let clock = MockClock { now: now.clone() };

	let mut conn = Connection::with_polarity(1, transport, pins, clock, true, PinPolarity::default());

	let seen: Rc<RefCell<Vec<EventKind>>> = Rc::new(RefCell::new(Vec::new()));
	let seen2 = seen.clone();
	conn.observers_mut()
		.add_observer(Box::new(move |e: &Event| seen2.borrow_mut().push(e.kind)));

	// Debounce: presence must hold for PRESENCE_THRESHOLD (5) consecutive
	// ticks before `is_card_inserted` validates it.
	present.set(true);
	for _ in 0..5 {
		conn.timer_task().unwrap();
	}
	assert!(conn.is_card_inserted());
	assert_eq!(*seen.borrow(), [EventKind::Insertion]);

	conn.connect().unwrap();

	// Push the ATR onto the wire. A single tick both feeds the bytes to the
	// engine (`feed_bytes`, ahead of the per-call engine timer advance) and
	// then runs that timer advance, which parses the buffered ATR off the
	// inter-byte timer and immediately walks IfsdSetupPrepare -> IfsdSetup,
	// sending the request (mirrors `t1_engine_scenarios.rs`'s s2 case).
	rx.borrow_mut().extend(ATR_T1_WITH_TA2);
	conn.timer_task().unwrap();

	let expected_ifsd_request = s_block(0x01, false, Some(0xFE));
	assert_eq!(*tx.borrow(), expected_ifsd_request);

	// Card answers the IFSD request; the engine's `connect` event resolves
	// synchronously within the same `serial_in` call.
	rx.borrow_mut().extend(s_block(0x01, true, Some(0xFE)));
	conn.timer_task().unwrap();

	assert_eq!(conn.state(), scard_t1::ConnState::Connected);
	assert!(seen.borrow().contains(&EventKind::Connect));

	// Card is pulled: absence is immediately valid (no debounce on removal),
	// so a single tick drives the full removal -> disconnect -> error path.
	present.set(false);
	conn.timer_task().unwrap();

	assert_eq!(conn.state(), scard_t1::ConnState::Error);
	let events = seen.borrow();
	let removal_idx = events.iter().position(|k| *k == EventKind::Removal).unwrap();
	let error_idx = events.iter().position(|k| *k == EventKind::Error).unwrap();
	assert!(removal_idx < error_idx);
}

/// A card that is never inserted refuses `connect` with `no_card` rather
/// than driving any pin or engine state.
#[test]
fn connect_without_card_is_rejected() {
	let transport = MockTransport {
		tx: Rc::new(RefCell::new(Vec::new())),
		rx: Rc::new(RefCell::new(VecDeque::new())),
	};
	let pins = MockPins { present: Rc::new(Cell::new(false)) };
	let clock = MockClock { now: Rc::new(Cell::new(0)) };

	let mut conn = Connection::with_polarity(2, transport, pins, clock, true, PinPolarity::default());
	let err = conn.connect().unwrap_err();
	assert_eq!(err, scard_t1::ConnectionError::NoCard);
}

//! Observer dispatch (C7): deferred fan-out of connection events. Events are
//! queued (owned, not borrowed — the producing API call may already have
//! returned by the time `notify_all` drains them) up to a fixed depth of 4
//! per connection; a 5th enqueue before a drain is an overflow.

use crate::error::ConnectionError;

/// Symbolic event type (§6.4).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventKind {
	Connect,
	Disconnect,
	Command,
	Response,
	Insertion,
	Removal,
	Error,
}

const EVENT_DATA_MAX: usize = 255;

/// One queued event. Payloads are copied into a fixed-size inline buffer so
/// the event can outlive the call that produced it without borrowing.
#[derive(Debug, Clone, Copy)]
pub struct Event {
	pub connection_id: u32,
	pub kind: EventKind,
	data: [u8; EVENT_DATA_MAX],
	data_len: u8,
	pub protocol_id: u8,
	pub sw1: u8,
	pub sw2: u8,
	pub error: Option<ConnectionError>,
}

impl Event {
	pub fn data(&self) -> &[u8] {
		&self.data[..self.data_len as usize]
	}

	fn bare(connection_id: u32, kind: EventKind) -> Self {
		Self {
			connection_id,
			kind,
			data: [0; EVENT_DATA_MAX],
			data_len: 0,
			protocol_id: 0,
			sw1: 0,
			sw2: 0,
			error: None,
		}
	}

	pub fn connect(connection_id: u32) -> Self {
		Self::bare(connection_id, EventKind::Connect)
	}

	pub fn disconnect(connection_id: u32) -> Self {
		Self::bare(connection_id, EventKind::Disconnect)
	}

	pub fn insertion(connection_id: u32) -> Self {
		Self::bare(connection_id, EventKind::Insertion)
	}

	pub fn removal(connection_id: u32) -> Self {
		Self::bare(connection_id, EventKind::Removal)
	}

	pub fn error(connection_id: u32, err: ConnectionError) -> Self {
		let mut e = Self::bare(connection_id, EventKind::Error);
		e.error = Some(err);
		e
	}

	/// `command` payload: `[apdu_bytes, protocol_id]` (§6.4).
	pub fn command(connection_id: u32, apdu: &[u8], protocol_id: u8) -> Self {
		let mut e = Self::bare(connection_id, EventKind::Command);
		let n = apdu.len().min(EVENT_DATA_MAX);
		e.data[..n].copy_from_slice(&apdu[..n]);
		e.data_len = n as u8;
		e.protocol_id = protocol_id;
		e
	}

	/// `response` payload: `[data_bytes, sw1, sw2]`, or `[data_bytes]` alone
	/// if the response is shorter than 2 bytes (§6.4).
	pub fn response(connection_id: u32, full: &[u8]) -> Self {
		let mut e = Self::bare(connection_id, EventKind::Response);
		if full.len() >= 2 {
			let data = &full[..full.len() - 2];
			let n = data.len().min(EVENT_DATA_MAX);
			e.data[..n].copy_from_slice(&data[..n]);
			e.data_len = n as u8;
			e.sw1 = full[full.len() - 2];
			e.sw2 = full[full.len() - 1];
		} else {
			let n = full.len().min(EVENT_DATA_MAX);
			e.data[..n].copy_from_slice(&full[..n]);
			e.data_len = n as u8;
		}
		e
	}
}

/// Maximum buffered events per connection before an enqueue overflows.
pub const EVENT_BUFFER_DEPTH: usize = 4;

/// A bounded FIFO of pending events plus the registered observers.
///
/// Observers are boxed `FnMut(&Event)` closures behind the `alloc` feature;
/// pure `no_std` callers without a global allocator instead register plain
/// function pointers in a fixed-capacity slot array (no captured context),
/// mirroring the teacher's `cfg(feature = "...")`-gated driver registration.
pub struct ObserverDispatch {
	events: heapless::Vec<Event, EVENT_BUFFER_DEPTH>,
	#[cfg(feature = "alloc")]
	observers: alloc::vec::Vec<(usize, alloc::boxed::Box<dyn FnMut(&Event)>)>,
	#[cfg(not(feature = "alloc"))]
	observers: heapless::Vec<(usize, fn(&Event)), 8>,
	next_id: usize,
}

impl ObserverDispatch {
	pub fn new() -> Self {
		Self {
			events: heapless::Vec::new(),
			observers: Default::default(),
			next_id: 0,
		}
	}

	#[cfg(feature = "alloc")]
	pub fn add_observer(&mut self, f: alloc::boxed::Box<dyn FnMut(&Event)>) -> usize {
		let id = self.next_id;
		self.next_id += 1;
		self.observers.push((id, f));
		id
	}

	#[cfg(not(feature = "alloc"))]
	pub fn add_observer(&mut self, f: fn(&Event)) -> usize {
		let id = self.next_id;
		self.next_id += 1;
		let _ = self.observers.push((id, f));
		id
	}

	/// Removes a previously registered observer by the identity token
	/// returned from `add_observer`.
	pub fn remove_observer(&mut self, id: usize) {
		self.observers.retain(|(oid, _)| *oid != id);
	}

	pub fn count_observers(&self) -> usize {
		self.observers.len()
	}

	/// Enqueues an event. Returns an overflow error (without enqueueing) if
	/// the buffer already holds `EVENT_BUFFER_DEPTH` undrained events.
	pub fn enqueue(&mut self, event: Event) -> Result<(), ConnectionError> {
		self.events
			.push(event)
			.map_err(|_| ConnectionError::EventBufferOverflow)
	}

	/// Drains all queued events in enqueue order, calling every registered
	/// observer for each. An observer is free to stop the drain from within
	/// its own call by not returning — this implementation always completes
	/// the drain since Rust closures cannot "raise" without panicking; a
	/// panicking observer aborts in the usual way and the remaining events
	/// are lost, matching §4.7.
	pub fn notify_all(&mut self) {
		let pending = core::mem::take(&mut self.events);
		for event in &pending {
			for (_, observer) in self.observers.iter_mut() {
				observer(event);
			}
		}
	}

	pub fn has_pending(&self) -> bool {
		!self.events.is_empty()
	}
}

impl Default for ObserverDispatch {
	fn default() -> Self {
		Self::new()
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[cfg(feature = "alloc")]
	#[test]
	fn notifies_observers_in_enqueue_order() {
		use alloc::boxed::Box;
		use alloc::vec::Vec;
		use core::cell::RefCell;
		use alloc::rc::Rc;

		let seen: Rc<RefCell<Vec<EventKind>>> = Rc::new(RefCell::new(Vec::new()));
		let mut dispatch = ObserverDispatch::new();
		let seen2 = seen.clone();
		dispatch.add_observer(Box::new(move |e: &Event| seen2.borrow_mut().push(e.kind)));

		dispatch.enqueue(Event::connect(1)).unwrap();
		dispatch.enqueue(Event::insertion(1)).unwrap();
		dispatch.notify_all();

		assert_eq!(*seen.borrow(), [EventKind::Connect, EventKind::Insertion]);
	}

	#[test]
	fn overflow_is_rejected_past_depth() {
		let mut dispatch = ObserverDispatch::new();
		for _ in 0..EVENT_BUFFER_DEPTH {
			dispatch.enqueue(Event::connect(1)).unwrap();
		}
		assert_eq!(
			dispatch.enqueue(Event::connect(1)),
			Err(ConnectionError::EventBufferOverflow)
		);
	}

	#[test]
	fn add_then_delete_observer_restores_count() {
		let mut dispatch = ObserverDispatch::new();
		let before = dispatch.count_observers();
		#[cfg(feature = "alloc")]
		let id = dispatch.add_observer(alloc::boxed::Box::new(|_: &Event| {}));
		#[cfg(not(feature = "alloc"))]
		let id = dispatch.add_observer(|_: &Event| {});
		assert_eq!(dispatch.count_observers(), before + 1);
		dispatch.remove_observer(id);
		assert_eq!(dispatch.count_observers(), before);
	}
}

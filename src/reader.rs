//! Reader (C8): static connection parameters plus at most one active
//! [`Connection`], grounded on `original_source/usermods/scard/reader.c`'s
//! `Reader` class (`createConnection`/`getName`, exclusive-connection check).
//!
//! Unlike the original, which has the `Connection` hold a back-pointer to its
//! owning `Reader` so `close()` can call `reader_deleteConnection`, this
//! crate has `Reader` own the `Connection` directly: Rust's borrow checker
//! does not allow a safe mutual back-reference here without `Rc<RefCell<_>>`,
//! and direct ownership expresses the same "exclusive, reader-scoped
//! connection" invariant without it. `Connection::close` still tears down the
//! session; `Reader::delete_connection` additionally drops the `Connection`
//! itself, freeing the slot for a new `create_connection` call.

use crate::connection::{Connection, PinPolarity};
use crate::error::ReaderError;
use crate::transport::{Clock, PinIo, SerialTransport};

/// Static parameters describing one physical reader slot (§6.5): interface
/// identifier, pin polarities, the background timer this reader's
/// connection should use, and an optional display name.
#[derive(Debug, Clone, Copy)]
pub struct ReaderConfig {
	pub interface_id: u8,
	pub polarity: PinPolarity,
	/// `None` denies creation of a background timer for the connection, so
	/// the host must drive `timer_task` manually at least once per ~50 ms
	/// and the connection falls back to blocking mode (§4.6.2 `connect`).
	pub timer_id: Option<u8>,
	pub name: Option<&'static str>,
}

impl ReaderConfig {
	pub const fn new(interface_id: u8) -> Self {
		Self {
			interface_id,
			polarity: PinPolarity {
				reset_active_low: true,
				presence_active_high: true,
				power_active_low: true,
			},
			timer_id: None,
			name: None,
		}
	}

	pub const fn with_timer(mut self, timer_id: u8) -> Self {
		self.timer_id = Some(timer_id);
		self
	}

	pub const fn with_name(mut self, name: &'static str) -> Self {
		self.name = Some(name);
		self
	}

	pub const fn with_polarity(mut self, polarity: PinPolarity) -> Self {
		self.polarity = polarity;
		self
	}
}

/// Owns static reader parameters and, at most, one active [`Connection`].
pub struct Reader<T: SerialTransport, P: PinIo, K: Clock> {
	config: ReaderConfig,
	connection: Option<Connection<T, P, K>>,
	next_connection_id: u32,
}

impl<T: SerialTransport, P: PinIo, K: Clock> Reader<T, P, K> {
	pub const fn new(config: ReaderConfig) -> Self {
		Self {
			config,
			connection: None,
			next_connection_id: 0,
		}
	}

	pub fn name(&self) -> Option<&'static str> {
		self.config.name
	}

	pub fn interface_id(&self) -> u8 {
		self.config.interface_id
	}

	pub fn has_connection(&self) -> bool {
		self.connection.is_some()
	}

	/// `Reader.createConnection()`: fails with [`ReaderError::AlreadyConnected`]
	/// if a connection already exists (exclusive, §4.8).
	pub fn create_connection(
		&mut self,
		transport: T,
		pins: P,
		clock: K,
	) -> Result<&mut Connection<T, P, K>, ReaderError> {
		if self.connection.is_some() {
			return Err(ReaderError::AlreadyConnected);
		}
		let id = self.next_connection_id;
		self.next_connection_id = self.next_connection_id.wrapping_add(1);
		let has_timer = self.config.timer_id.is_some();
		let conn = Connection::with_polarity(id, transport, pins, clock, has_timer, self.config.polarity);
		self.connection = Some(conn);
		Ok(self.connection.as_mut().expect("just inserted"))
	}

	/// `reader_deleteConnection`: closes and drops the active connection, if
	/// any, clearing the back-reference so a later `create_connection` can
	/// succeed again.
	pub fn delete_connection(&mut self) {
		if let Some(mut conn) = self.connection.take() {
			conn.close();
		}
	}

	pub fn connection(&self) -> Option<&Connection<T, P, K>> {
		self.connection.as_ref()
	}

	pub fn connection_mut(&mut self) -> Option<&mut Connection<T, P, K>> {
		self.connection.as_mut()
	}
}

//! Protocol façade (C5): operations that do not depend on which protocol is
//! active, expressed as a Rust trait object instead of a C
//! struct-of-function-pointers vtable (grounded on
//! `protocols.h`'s `proto_impl_t`, and on the teacher's
//! `NetworkInterface`/`DriverError` trait pattern). Only T=1 is implemented
//! today; the trait exists so a future protocol slots in without touching
//! the connection layer.

use crate::t1::config::{ConfigId, SENTINEL_DEFAULT, SENTINEL_UNCHANGED};
use crate::t1::engine::{EngineCallbacks, FsmState, T1Engine};

/// Uniform engine operations independent of the concrete protocol
/// implementation (§4.5). `cb` receives whatever events the call raises;
/// the engine itself never stores a callback handle (see `engine` module
/// doc comment for why).
pub trait ProtocolEngineApi {
	fn reset(&mut self, wait_atr: bool);
	fn timer_task(&mut self, elapsed_ms: u32, cb: &mut dyn EngineCallbacks);
	fn can_sleep_ms(&self) -> u32;
	fn serial_in(&mut self, buf: &[u8], cb: &mut dyn EngineCallbacks);
	fn transmit_apdu(&mut self, apdu: &[u8], cb: &mut dyn EngineCallbacks) -> bool;
	/// `atr_ms`/`rsp_ms`/`max_ms` accept `SENTINEL_DEFAULT` (-1) to restore
	/// the engine default or `SENTINEL_UNCHANGED` (-2) to leave a timeout
	/// untouched.
	fn set_timeouts(&mut self, atr_ms: i32, rsp_ms: i32, max_ms: i32);
	fn set_usb_features(&mut self, dw_features: i32, max_ifsd: i32);
	fn state(&self) -> FsmState;
}

fn apply_sentinel(current: i32, requested: i32, default: i32) -> i32 {
	match requested {
		SENTINEL_UNCHANGED => current,
		SENTINEL_DEFAULT => default,
		other => other,
	}
}

impl ProtocolEngineApi for T1Engine {
	fn reset(&mut self, wait_atr: bool) {
		T1Engine::reset(self, wait_atr);
	}

	fn timer_task(&mut self, elapsed_ms: u32, cb: &mut dyn EngineCallbacks) {
		T1Engine::timer_task(self, elapsed_ms, cb);
	}

	fn can_sleep_ms(&self) -> u32 {
		T1Engine::can_sleep_ms(self)
	}

	fn serial_in(&mut self, buf: &[u8], cb: &mut dyn EngineCallbacks) {
		T1Engine::serial_in(self, buf, cb);
	}

	fn transmit_apdu(&mut self, apdu: &[u8], cb: &mut dyn EngineCallbacks) -> bool {
		T1Engine::transmit_apdu(self, apdu, cb)
	}

	fn set_timeouts(&mut self, atr_ms: i32, rsp_ms: i32, max_ms: i32) {
		let cfg = self.config();
		let atr = apply_sentinel(cfg.get(ConfigId::TmAtr), atr_ms, 1000);
		let rsp = apply_sentinel(cfg.get(ConfigId::TmResponse), rsp_ms, 2000);
		let max = apply_sentinel(cfg.get(ConfigId::TmResponseMax), max_ms, 4000);
		self.set_config(ConfigId::TmAtr, atr);
		self.set_config(ConfigId::TmResponse, rsp);
		self.set_config(ConfigId::TmResponseMax, max);
	}

	fn set_usb_features(&mut self, dw_features: i32, max_ifsd: i32) {
		self.set_config(ConfigId::DwFeatures, dw_features);
		self.set_config(ConfigId::Ifsd, max_ifsd);
	}

	fn state(&self) -> FsmState {
		T1Engine::state(self)
	}
}

//! Engine configuration: an indexed array of bounded integers, mirroring
//! `ext_config` in the original driver. Unknown IDs and out-of-range values
//! are rejected; the façade layer translates the sentinel values
//! `unchanged` (-2) and `default` (-1) before they ever reach here.

use bitflags::bitflags;

bitflags! {
	/// CCID `dwFeatures` bits the engine inspects to decide whether the
	/// reader already handles a piece of negotiation itself (§4.4.7,
	/// §4.6.5). Only the bits this crate acts on are named; readers may set
	/// others, so unknown bits round-trip through the catch-all.
	#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
	pub struct CcidFeatures: i32 {
		const AUTO_VOLTAGE_SELECTION = 0x0000_0002;
		const AUTO_CLOCK_CHANGE = 0x0000_0010;
		const AUTO_BAUD_CHANGE = 0x0000_0020;
		/// Reader performs PPS itself; the engine must not also send PPS.
		const AUTO_PPS = 0x0000_0040;
		const AUTO_IFSD = 0x0000_0400;

		const _ = !0;
	}
}

/// Identifies one configurable engine parameter.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(usize)]
pub enum ConfigId {
	TmInterbyte = 0,
	TmAtr = 1,
	TmResponse = 2,
	TmResponseMax = 3,
	UseCrc = 4,
	Ifsc = 5,
	Ifsd = 6,
	DwFeatures = 7,
	PpsSize = 8,
	Ta1Value = 9,
	IsUsbReader = 10,
	RxSkipBytes = 11,
}

pub const CONFIG_COUNT: usize = 12;

struct Bounds {
	min: i32,
	max: i32,
	default: i32,
}

const BOUNDS: [Bounds; CONFIG_COUNT] = [
	Bounds { min: 1, max: 0x7FFF_FFFF, default: 200 },   // TmInterbyte
	Bounds { min: 1, max: 0x7FFF_FFFF, default: 1000 },  // TmAtr
	Bounds { min: 1, max: 0x7FFF_FFFF, default: 2000 },  // TmResponse
	Bounds { min: 1, max: 0x7FFF_FFFF, default: 4000 },  // TmResponseMax
	Bounds { min: 0, max: 1, default: 0 },                // UseCrc
	Bounds { min: 1, max: 254, default: 32 },             // Ifsc
	Bounds { min: 1, max: 254, default: 254 },            // Ifsd
	Bounds { min: 0, max: 0x7FFF_FFFF, default: 0 },      // DwFeatures
	Bounds { min: 3, max: 5, default: 3 },                // PpsSize
	Bounds { min: 0, max: 255, default: 0x11 },           // Ta1Value
	Bounds { min: 0, max: 1, default: 0 },                // IsUsbReader
	Bounds { min: 0, max: 255, default: 0 },              // RxSkipBytes
];

/// Sentinel accepted at the façade layer meaning "restore default".
pub const SENTINEL_DEFAULT: i32 = -1;
/// Sentinel accepted at the façade layer meaning "leave unchanged".
pub const SENTINEL_UNCHANGED: i32 = -2;

/// The full configuration vector backing one engine instance.
#[derive(Debug, Clone, Copy)]
pub struct Config {
	values: [i32; CONFIG_COUNT],
}

impl Config {
	pub fn defaults() -> Self {
		let mut values = [0; CONFIG_COUNT];
		for (slot, bound) in values.iter_mut().zip(BOUNDS.iter()) {
			*slot = bound.default;
		}
		Self { values }
	}

	pub fn get(&self, id: ConfigId) -> i32 {
		self.values[id as usize]
	}

	/// Sets `id` to `value` after validating it against `id`'s bounds.
	/// Returns `false` without effect if `value` is out of range.
	pub fn set(&mut self, id: ConfigId, value: i32) -> bool {
		let bound = &BOUNDS[id as usize];
		if value < bound.min || value > bound.max {
			return false;
		}
		self.values[id as usize] = value;
		true
	}

	/// Resets a single parameter to its default.
	pub fn reset(&mut self, id: ConfigId) {
		self.values[id as usize] = BOUNDS[id as usize].default;
	}
}

impl Default for Config {
	fn default() -> Self {
		Self::defaults()
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn defaults_match_documented_values() {
		let cfg = Config::defaults();
		assert_eq!(cfg.get(ConfigId::TmInterbyte), 200);
		assert_eq!(cfg.get(ConfigId::TmAtr), 1000);
		assert_eq!(cfg.get(ConfigId::TmResponse), 2000);
		assert_eq!(cfg.get(ConfigId::TmResponseMax), 4000);
		assert_eq!(cfg.get(ConfigId::Ifsc), 32);
		assert_eq!(cfg.get(ConfigId::Ifsd), 254);
		assert_eq!(cfg.get(ConfigId::PpsSize), 3);
		assert_eq!(cfg.get(ConfigId::Ta1Value), 0x11);
	}

	#[test]
	fn out_of_range_is_rejected_without_effect() {
		let mut cfg = Config::defaults();
		assert!(!cfg.set(ConfigId::Ifsc, 0));
		assert!(!cfg.set(ConfigId::Ifsc, 255));
		assert_eq!(cfg.get(ConfigId::Ifsc), 32);
		assert!(cfg.set(ConfigId::Ifsc, 254));
		assert_eq!(cfg.get(ConfigId::Ifsc), 254);
	}
}

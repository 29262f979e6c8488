//! ATR (Answer To Reset) parsing: direct-convention byte stream into a
//! decoded interface-byte table, per ISO/IEC 7816-3.

use thiserror::Error;

/// Maximum raw ATR length this crate will buffer. Generously above the
/// historical 33-byte ceiling to tolerate odd readers.
pub const ATR_MAX_LEN: usize = 40;

const TS_DIRECT: u8 = 0x3B;

/// Index of a global or T=1-specific interface byte within the nine-slot
/// TA1..TC3 table.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(usize)]
pub enum AtrByteIdx {
	Ta1 = 0,
	Tb1 = 1,
	Tc1 = 2,
	Ta2 = 3,
	Tb2 = 4,
	Tc2 = 5,
	Ta3 = 6,
	Tb3 = 7,
	Tc3 = 8,
}

#[derive(Debug, Error, PartialEq, Eq, Clone, Copy)]
pub enum AtrError {
	#[error("bad_atr")]
	BadAtr,
}

/// A fully decoded ATR.
#[derive(Debug, Clone)]
pub struct AtrDecoded {
	raw: [u8; ATR_MAX_LEN],
	raw_len: usize,
	pub t0_supported: bool,
	pub t1_supported: bool,
	global_bytes: [Option<u8>; 9],
	t1_bytes: [Option<u8>; 9],
	hist_offset: usize,
	hist_len: usize,
}

impl AtrDecoded {
	pub fn raw(&self) -> &[u8] {
		&self.raw[..self.raw_len]
	}

	pub fn global_byte(&self, idx: AtrByteIdx) -> Option<u8> {
		self.global_bytes[idx as usize]
	}

	pub fn t1_byte(&self, idx: AtrByteIdx) -> Option<u8> {
		self.t1_bytes[idx as usize]
	}

	pub fn historical_bytes(&self) -> &[u8] {
		&self.raw[self.hist_offset..self.hist_offset + self.hist_len]
	}
}

const TA_BIT: u8 = 0x10;
const TB_BIT: u8 = 0x20;
const TC_BIT: u8 = 0x40;
const TD_BIT: u8 = 0x80;

/// Parses a raw ATR byte stream into [`AtrDecoded`], per §4.3: TS byte, T0
/// historical count + Y1, the TAi/TBi/TCi/TDi interface-byte chain, and a
/// mandatory TCK whenever any TDi selected a protocol other than T=0.
pub fn parse_atr(bytes: &[u8]) -> Result<AtrDecoded, AtrError> {
	if bytes.len() < 2 || bytes.len() > ATR_MAX_LEN {
		return Err(AtrError::BadAtr);
	}
	if bytes[0] != TS_DIRECT {
		return Err(AtrError::BadAtr);
	}

	let t0 = bytes[1];
	let hist_count = (t0 & 0x0F) as usize;
	let mut y = t0 & 0xF0;

	let mut global_bytes = [None; 9];
	let mut t1_bytes = [None; 9];
	let mut t0_supported = true; // implied unless a TDi explicitly names only T=1
	let mut t1_supported = false;
	let mut any_non_t0_protocol = false;

	let mut pos = 2usize;
	let mut group = 0usize; // 0-based: group 0 => TA1/TB1/TC1/TD1

	while y != 0 {
		if (y & TA_BIT) != 0 {
			let b = *bytes.get(pos).ok_or(AtrError::BadAtr)?;
			store(&mut global_bytes, &mut t1_bytes, group, 0, b);
			pos += 1;
		}
		if (y & TB_BIT) != 0 {
			let b = *bytes.get(pos).ok_or(AtrError::BadAtr)?;
			store(&mut global_bytes, &mut t1_bytes, group, 1, b);
			pos += 1;
		}
		if (y & TC_BIT) != 0 {
			let b = *bytes.get(pos).ok_or(AtrError::BadAtr)?;
			store(&mut global_bytes, &mut t1_bytes, group, 2, b);
			pos += 1;
		}
		if (y & TD_BIT) != 0 {
			let td = *bytes.get(pos).ok_or(AtrError::BadAtr)?;
			pos += 1;
			y = td & 0xF0;
			let protocol = td & 0x0F;
			match protocol {
				0 => t0_supported = true,
				1 => {
					t1_supported = true;
					any_non_t0_protocol = true;
				}
				_ => any_non_t0_protocol = true,
			}
			group += 1;
		} else {
			y = 0;
		}
	}

	let hist_offset = pos;
	let hist_end = hist_offset + hist_count;
	if hist_end > bytes.len() {
		return Err(AtrError::BadAtr);
	}
	pos = hist_end;

	if any_non_t0_protocol {
		let tck_pos = pos;
		if tck_pos >= bytes.len() {
			return Err(AtrError::BadAtr);
		}
		let xor = bytes[1..=tck_pos].iter().fold(0u8, |a, &b| a ^ b);
		if xor != 0 {
			return Err(AtrError::BadAtr);
		}
		pos = tck_pos + 1;
	}

	if pos != bytes.len() {
		return Err(AtrError::BadAtr);
	}

	let mut raw = [0u8; ATR_MAX_LEN];
	raw[..bytes.len()].copy_from_slice(bytes);

	Ok(AtrDecoded {
		raw,
		raw_len: bytes.len(),
		t0_supported,
		t1_supported,
		global_bytes,
		t1_bytes,
		hist_offset,
		hist_len: hist_count,
	})
}

/// Routes a parsed interface byte to the global table (groups 0..2, i.e.
/// TA1..TC3) or the T=1-specific table (group 3 onward, intf index ≥ 3).
/// Slots beyond the nine-entry tables are silently dropped (robust parse,
/// per §4.3 step 5).
fn store(global: &mut [Option<u8>; 9], t1: &mut [Option<u8>; 9], group: usize, offset: usize, byte: u8) {
	if group < 3 {
		let slot = group * 3 + offset;
		if slot < 9 {
			global[slot] = Some(byte);
		}
	} else {
		let slot = (group - 3) * 3 + offset;
		if slot < 9 {
			t1[slot] = Some(byte);
		}
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn minimal_t0_only_atr_parses_without_t1_support() {
		// TS=3B, T0=0x90 (Y1=9: TA1+TD1 present, hist=0), TA1=0x11, TD1=0x00 (T=0, no more groups)
		let atr = parse_atr(&[0x3B, 0x90, 0x11, 0x00]).expect("well-formed");
		assert!(atr.t0_supported);
		assert!(!atr.t1_supported);
		assert_eq!(atr.global_byte(AtrByteIdx::Ta1), Some(0x11));
	}

	#[test]
	fn t1_capable_atr_requires_and_validates_tck() {
		// TS=3B, T0=0x81 (Y1=8: TD1 only, hist=1), TD1=0x31 (Y2=3: TA2+TB2, protocol T1),
		// TA2=0x00, TB2=0x00, hist[0]=0x00, TCK = xor(T0..hist) so total xor == 0.
		let atr = parse_atr(&[0x3B, 0x81, 0x31, 0x00, 0x00, 0x00, 0xB0]).expect("well-formed");
		assert!(atr.t1_supported);
		assert_eq!(atr.historical_bytes(), &[0x00]);
	}

	#[test]
	fn inverse_convention_is_rejected() {
		assert_eq!(parse_atr(&[0x3F, 0x00]), Err(AtrError::BadAtr));
	}

	#[test]
	fn truncated_atr_is_rejected() {
		// Y1=9 claims TA1+TD1 but only TA1 follows.
		assert_eq!(parse_atr(&[0x3B, 0x90, 0x11]), Err(AtrError::BadAtr));
    }

	#[test]
	fn bad_checksum_is_rejected() {
		let mut full = [0x3Bu8, 0x81, 0x31, 0x00, 0x00, 0x00, 0x00];
		// Deliberately wrong TCK (should be xor of bytes[1..=5]).
		let correct = full[1..6].iter().fold(0u8, |a, &b| a ^ b);
		full[6] = correct ^ 0xFF;
		assert_eq!(parse_atr(&full), Err(AtrError::BadAtr));
	}
}

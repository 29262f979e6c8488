//! T=1 block framing: PCB decoding/encoding and the tagged block-descriptor
//! sum type (§4.4.2, §9 "Tagged block variants").

/// Maximum INF field length a single block may carry.
pub const LEN_MAX: usize = 254;

const PCB_TYPE_MASK: u8 = 0xC0;
const PCB_I_BLOCK: u8 = 0x00;
const PCB_R_BLOCK: u8 = 0x80;
const PCB_S_BLOCK: u8 = 0xC0;

const I_MORE_BIT: u8 = 0x20;
const I_SEQ_BIT: u8 = 0x40;
const R_SEQ_BIT: u8 = 0x10;
const S_RESPONSE_BIT: u8 = 0x20;

/// R-block acknowledgement code (low nibble of the PCB).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RAck {
	Ok,
	ErrEdc,
	ErrOther,
}

impl RAck {
	fn from_pcb_low(low: u8) -> Self {
		match low & 0x0F {
			0 => RAck::Ok,
			1 => RAck::ErrEdc,
			_ => RAck::ErrOther,
		}
	}

	fn pcb_low(self) -> u8 {
		match self {
			RAck::Ok => 0,
			RAck::ErrEdc => 1,
			RAck::ErrOther => 2,
		}
	}
}

/// S-block command (low 5 bits of the PCB).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SCommand {
	Resynch,
	Ifs,
	Abort,
	Wtx,
	Other(u8),
}

impl SCommand {
	fn from_pcb_low(low: u8) -> Self {
		match low & 0x1F {
			0 => SCommand::Resynch,
			1 => SCommand::Ifs,
			2 => SCommand::Abort,
			3 => SCommand::Wtx,
			other => SCommand::Other(other),
		}
	}

	fn pcb_low(self) -> u8 {
		match self {
			SCommand::Resynch => 0,
			SCommand::Ifs => 1,
			SCommand::Abort => 2,
			SCommand::Wtx => 3,
			SCommand::Other(v) => v & 0x1F,
		}
	}
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IBlockPrm {
	pub more_data: bool,
	pub seq_number: u8,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RBlockPrm {
	pub ack_code: RAck,
	pub seq_number: u8,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SBlockPrm {
	pub command: SCommand,
	pub is_response: bool,
	/// INF byte when the S-block carries exactly one (IFS, WTX); `-1` if absent.
	pub inf_byte: i16,
}

/// Tagged block-descriptor variant, replacing the original C union over
/// I/R/S block parameters.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BlockPrm {
	I(IBlockPrm),
	R(RBlockPrm),
	S(SBlockPrm),
	Unknown,
}

impl BlockPrm {
	/// Decodes a PCB byte, given the block's actual INF length (S-blocks with
	/// exactly one INF byte embed it in the descriptor).
	pub fn from_pcb(pcb: u8, inf: &[u8]) -> BlockPrm {
		match pcb & PCB_TYPE_MASK {
			PCB_I_BLOCK => BlockPrm::I(IBlockPrm {
				more_data: pcb & I_MORE_BIT != 0,
				seq_number: (pcb & I_SEQ_BIT != 0) as u8,
			}),
			PCB_R_BLOCK => BlockPrm::R(RBlockPrm {
				ack_code: RAck::from_pcb_low(pcb),
				seq_number: (pcb & R_SEQ_BIT != 0) as u8,
			}),
			PCB_S_BLOCK => BlockPrm::S(SBlockPrm {
				command: SCommand::from_pcb_low(pcb),
				is_response: pcb & S_RESPONSE_BIT != 0,
				inf_byte: inf.first().copied().map_or(-1, |b| b as i16),
			}),
			_ => BlockPrm::Unknown,
		}
	}

	pub fn pcb(self) -> u8 {
		match self {
			BlockPrm::I(p) => {
				PCB_I_BLOCK
					| if p.more_data { I_MORE_BIT } else { 0 }
					| if p.seq_number != 0 { I_SEQ_BIT } else { 0 }
			}
			BlockPrm::R(p) => {
				PCB_R_BLOCK | p.ack_code.pcb_low() | if p.seq_number != 0 { R_SEQ_BIT } else { 0 }
			}
			BlockPrm::S(p) => {
				PCB_S_BLOCK | p.command.pcb_low() | if p.is_response { S_RESPONSE_BIT } else { 0 }
			}
			BlockPrm::Unknown => 0,
		}
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn i_block_roundtrips_through_pcb() {
		let prm = BlockPrm::I(IBlockPrm {
			more_data: true,
			seq_number: 1,
		});
		let pcb = prm.pcb();
		assert_eq!(BlockPrm::from_pcb(pcb, &[]), prm);
	}

	#[test]
	fn r_block_roundtrips_through_pcb() {
		let prm = BlockPrm::R(RBlockPrm {
			ack_code: RAck::ErrEdc,
			seq_number: 0,
		});
		let pcb = prm.pcb();
		assert_eq!(BlockPrm::from_pcb(pcb, &[]), prm);
	}

	#[test]
	fn s_block_ifs_request_carries_inf_byte() {
		let prm = BlockPrm::S(SBlockPrm {
			command: SCommand::Ifs,
			is_response: false,
			inf_byte: 0xFE,
		});
		let pcb = prm.pcb();
		assert_eq!(BlockPrm::from_pcb(pcb, &[0xFE]), prm);
	}
}

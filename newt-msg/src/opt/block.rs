use crate::error::OptionsError;
use crate::opt::{num, OptNumber, Options};

/// Which block option a [`Block`] travels in.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BlockKind {
  /// Block1: describes the request payload
  Block1,
  /// Block2: describes the response payload
  Block2,
  /// Both options in one request ("composite block"): Block1 for this
  /// request, Block2 number 0 with More set to preview the response
  Both,
}

impl BlockKind {
  /// The option number carrying this kind ([`BlockKind::Both`] maps to
  /// Block1; the preview Block2 is emitted separately)
  pub fn number(&self) -> OptNumber {
    match self {
      | BlockKind::Block2 => num::BLOCK2,
      | _ => num::BLOCK1,
    }
  }
}

/// One RFC 7959 block option value: `(num << 4) | (more << 3) | szx`
/// with `size = 16 << szx`.
///
/// ```
/// use newt_msg::Block;
///
/// let b = Block::new(2, true, 128).unwrap();
/// assert_eq!(u32::from(b), 0b10_1_011);
/// assert_eq!(Block::try_from(0b10_1_011u32).unwrap(), b);
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Block {
  /// Block number, counting `size`-byte offsets into the full resource
  pub num: u32,
  /// Whether more blocks follow this one
  pub more: bool,
  /// Block size in bytes; a power of two in `16..=1024`
  pub size: u16,
}

/// Block numbers are limited to 20 bits by the 3-byte option value
pub const MAX_BLOCK_NUM: u32 = (1 << 20) - 1;

impl Block {
  /// Build a block value, rejecting sizes that are not a power of two
  /// in `16..=1024` and numbers past [`MAX_BLOCK_NUM`]
  pub fn new(num: u32, more: bool, size: u16) -> Result<Self, OptionsError> {
    if !(16..=1024).contains(&size) || !size.is_power_of_two() || num > MAX_BLOCK_NUM {
      return Err(OptionsError::Format);
    }
    Ok(Self { num, more, size })
  }

  /// The block-size exponent: `size = 16 << szx`
  pub fn szx(&self) -> u8 {
    (self.size.trailing_zeros() - 4) as u8
  }

  /// Largest legal block size that fits `budget` bytes (clamped into
  /// `16..=1024`); used to derive the block size from the transport MTU
  pub fn size_for_budget(budget: usize) -> u16 {
    let mut size = 1024u16;
    while size > 16 && usize::from(size) > budget {
      size >>= 1;
    }
    size
  }

  /// Read Block1 and/or Block2 out of an option table.
  ///
  /// Yields `(kind, block)`; when both are present the Block1 value
  /// wins the `num`/`size` slots and the kind is [`BlockKind::Both`]
  /// (the server answering a composite request echoes both).
  pub fn decode(opts: &Options) -> Result<Option<(BlockKind, Block)>, OptionsError> {
    let b1 = opts.get_u32(num::BLOCK1)?;
    let b2 = opts.get_u32(num::BLOCK2)?;

    match (b1, b2) {
      | (None, None) => Ok(None),
      | (Some(raw), None) => Ok(Some((BlockKind::Block1, Block::try_from(raw)?))),
      | (None, Some(raw)) => Ok(Some((BlockKind::Block2, Block::try_from(raw)?))),
      | (Some(raw1), Some(raw2)) => {
        Block::try_from(raw2)?;
        Ok(Some((BlockKind::Both, Block::try_from(raw1)?)))
      },
    }
  }

  /// Append this block to an option table as `kind`
  pub fn encode(&self, kind: BlockKind, opts: &mut Options) -> Result<(), OptionsError> {
    match kind {
      | BlockKind::Both => {
        opts.add_u32(num::BLOCK1, u32::from(*self))?;
        let preview = Block { num: 0,
                              more: true,
                              size: self.size };
        opts.add_u32(num::BLOCK2, u32::from(preview))
      },
      | k => opts.add_u32(k.number(), u32::from(*self)),
    }
  }
}

impl TryFrom<u32> for Block {
  type Error = OptionsError;

  fn try_from(raw: u32) -> Result<Self, Self::Error> {
    let szx = raw & 0b111;
    if szx == 7 || raw >> 4 > MAX_BLOCK_NUM {
      return Err(OptionsError::Format);
    }
    Ok(Block { num: raw >> 4,
               more: raw & 0b1000 != 0,
               size: 16 << szx })
  }
}

impl From<Block> for u32 {
  fn from(b: Block) -> u32 {
    b.num << 4 | u32::from(b.more) << 3 | u32::from(b.szx())
  }
}

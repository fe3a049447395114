use crate::codec::{Decode, Encode, Error, FixedSize};

//
// Implementations for primitives
//
impl FixedSize for u8 {
    const SIZE: usize = 1;
}

impl FixedSize for u16 {
    const SIZE: usize = 2;
}

impl Decode<'_> for u8 {
    fn decode(src: &[u8]) -> Result<Self, Error> {
        src.first().copied().ok_or(Error::InsufficientSpace)
    }
}

impl Decode<'_> for u16 {
    fn decode(src: &[u8]) -> Result<Self, Error> {
        match src {
            [a, b, ..] => Ok(u16::from_le_bytes([*a, *b])),
            _ => Err(Error::InsufficientSpace),
        }
    }
}

impl Encode for u8 {
    fn encode(&self, dest: &mut [u8]) -> Result<(), Error> {
        let slot = dest.first_mut().ok_or(Error::InsufficientSpace)?;
        *slot = *self;
        Ok(())
    }
}

impl Encode for u16 {
    fn encode(&self, dest: &mut [u8]) -> Result<(), Error> {
        if dest.len() < 2 {
            return Err(Error::InsufficientSpace);
        }
        dest[..2].copy_from_slice(&self.to_le_bytes()[..]);
        Ok(())
    }
}

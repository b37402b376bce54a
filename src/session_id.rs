use std::fmt;

use nom::bytes::complete::take;
use nom::IResult;

use crate::buffer::Buf;
use crate::SeededRng;

/// Random 64-bit identifier each side picks for a TLS session.
///
/// All zeroes means "not yet known".
#[derive(Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct SessionId([u8; SessionId::LEN]);

impl SessionId {
    pub const LEN: usize = 8;

    pub fn random(rng: &mut SeededRng) -> Self {
        let mut id = [0; Self::LEN];
        while id == [0; Self::LEN] {
            rng.fill_bytes(&mut id);
        }
        SessionId(id)
    }

    pub fn from_bytes(bytes: [u8; Self::LEN]) -> Self {
        SessionId(bytes)
    }

    pub fn is_defined(&self) -> bool {
        self.0 != [0; Self::LEN]
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    pub fn parse(input: &[u8]) -> IResult<&[u8], Self> {
        let (input, bytes) = take(Self::LEN)(input)?;
        let mut id = [0; Self::LEN];
        id.copy_from_slice(bytes);
        Ok((input, SessionId(id)))
    }

    pub fn serialize(&self, output: &mut Buf) {
        output.extend_from_slice(&self.0);
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&hex::encode(self.0))
    }
}

impl fmt::Debug for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "SessionId({})", self)
    }
}

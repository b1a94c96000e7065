//! nom-backed primitive readers that surface [`CorruptMessage`] instead of
//! nom's own error tree, so every parser in this crate reports the exact
//! NOTIFICATION code/subcode the session layer must emit.

use nom::Parser;
use nom::bytes::complete::take;
use nom::number::complete::{be_u16, be_u32, be_u8};

use crate::error::CorruptMessage;

type NomErr<'a> = nom::error::Error<&'a [u8]>;

pub(crate) type WResult<'a, T> = Result<(&'a [u8], T), CorruptMessage>;

pub(crate) fn read_u8<'a>(input: &'a [u8], short: impl Fn() -> CorruptMessage) -> WResult<'a, u8> {
    be_u8::<_, NomErr>(input).map_err(|_| short())
}

pub(crate) fn read_u16<'a>(input: &'a [u8], short: impl Fn() -> CorruptMessage) -> WResult<'a, u16> {
    be_u16::<_, NomErr>(input).map_err(|_| short())
}

pub(crate) fn read_u32<'a>(input: &'a [u8], short: impl Fn() -> CorruptMessage) -> WResult<'a, u32> {
    be_u32::<_, NomErr>(input).map_err(|_| short())
}

pub(crate) fn read_bytes<'a>(
    input: &'a [u8],
    count: usize,
    short: impl Fn() -> CorruptMessage,
) -> WResult<'a, &'a [u8]> {
    take::<_, _, NomErr>(count).parse(input).map_err(|_| short())
}

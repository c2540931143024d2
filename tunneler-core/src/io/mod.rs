use std::io::Cursor;

use bytes::Buf;

use crate::TunnelError;

fn check_cursor_size<T>(src: &Cursor<&[u8]>) -> Result<(), TunnelError>
where
    T: Sized,
{
    if std::mem::size_of::<T>() > src.remaining() {
        return Err(TunnelError::MalformedFrame(format!(
            "truncated: needed {} more bytes, {} left",
            std::mem::size_of::<T>(),
            src.remaining()
        )));
    }

    Ok(())
}

pub fn get_u32(src: &mut Cursor<&[u8]>) -> Result<u32, TunnelError> {
    check_cursor_size::<u32>(src)?;
    Ok(src.get_u32())
}

pub fn get_u8(src: &mut Cursor<&[u8]>) -> Result<u8, TunnelError> {
    check_cursor_size::<u8>(src)?;
    Ok(src.get_u8())
}

/// Reads the rest of the cursor as UTF-8 text.
pub fn get_utf8(src: &mut Cursor<&[u8]>) -> Result<String, TunnelError> {
    let remaining = src.chunk().to_vec();
    src.advance(remaining.len());

    String::from_utf8(remaining)
        .map_err(|_| TunnelError::MalformedFrame("payload is not valid utf-8".into()))
}

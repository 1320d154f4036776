//! # Utility module

use crate::prelude::v1::*;
use std::io::{Read, Write};

/// Magic number opening every Middlebury `.flo` file ("PIEH" in ASCII).
pub const FLO_MAGIC: f32 = 202021.25;

/// Write a flow field in the Middlebury `.flo` format.
///
/// The layout is the magic number, `i32` width and height, followed by row-major `(dx, dy)`
/// float pairs, everything little-endian.
pub fn write_flo(mut writer: impl Write, flow: &FlowField) -> Result<()> {
    let (w, h) = flow.dim();
    writer.write_all(&FLO_MAGIC.to_le_bytes())?;
    writer.write_all(&(w as i32).to_le_bytes())?;
    writer.write_all(&(h as i32).to_le_bytes())?;
    for v in flow.as_slice() {
        writer.write_all(&v.to_le_bytes())?;
    }
    Ok(())
}

/// Read a flow field in the Middlebury `.flo` format.
///
/// The payload is read before any field is allocated, so a header claiming more data than the
/// stream holds fails with an error.
pub fn read_flo(mut reader: impl Read) -> Result<FlowField> {
    let mut word = [0u8; 4];

    reader.read_exact(&mut word)?;
    if f32::from_le_bytes(word) != FLO_MAGIC {
        return Err(anyhow!("Invalid .flo magic"));
    }

    reader.read_exact(&mut word)?;
    let w = i32::from_le_bytes(word);
    reader.read_exact(&mut word)?;
    let h = i32::from_le_bytes(word);

    if w < 0 || h < 0 {
        return Err(anyhow!("Invalid .flo dimensions {}x{}", w, h));
    }

    let (w, h) = (w as usize, h as usize);

    let len = w
        .checked_mul(h)
        .and_then(|n| n.checked_mul(8))
        .ok_or_else(|| anyhow!(".flo dimensions {}x{} overflow", w, h))?;

    let mut payload = vec![];
    reader.take(len as u64).read_to_end(&mut payload)?;

    if payload.len() != len {
        return Err(anyhow!(
            "Truncated .flo payload: {} of {} bytes",
            payload.len(),
            len
        ));
    }

    let mut flow = FlowField::new(w, h);
    for (v, b) in flow.as_mut_slice().iter_mut().zip(payload.chunks_exact(4)) {
        *v = f32::from_le_bytes([b[0], b[1], b[2], b[3]]);
    }

    Ok(flow)
}

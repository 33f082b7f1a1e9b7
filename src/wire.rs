// SPDX-License-Identifier: Parity-7.0.0 OR PolyForm-Noncommercial-1.0.0
/*!
Typed wire-channel primitives and resource payload codecs.

One resource record on the wire:

```text
bool   uses_gpu_image
bool   is_properties_dirty
u64    unique id (pid-shifted)
rect   src (4 le f32)
rect   dst (4 le f32)
slot   gpu image payload      (skip marker when !uses_gpu_image)
slot   pixel buffer payload   (skip marker when uses_gpu_image)
```

Payload slots are u32-length-prefixed, so a receiver whose cache already
holds the id can advance over a slot without materializing it, consuming
exactly the bytes deserializing would have.  Malformed data fails the one
resource being read; it never takes the process down.
*/

use crate::geometry::Rect;
use crate::gpu::{Backend, GpuImage, ImagePayload};
use crate::pixels::{AllocatorKind, PixelBuffer, PixelFlags};

#[derive(Debug, thiserror::Error)]
#[non_exhaustive]
pub enum WireError {
    #[error("unexpected end of wire data at byte {0}")]
    UnexpectedEof(usize),
    #[error("malformed payload: {0}")]
    MalformedPayload(&'static str),
}

/// Write half of the wire channel: typed little-endian appends into an
/// in-memory record.
#[derive(Debug, Default)]
pub struct WireWriter {
    bytes: Vec<u8>,
}

impl WireWriter {
    pub fn new() -> Self {
        WireWriter { bytes: Vec::new() }
    }

    pub fn write_bool(&mut self, value: bool) {
        self.bytes.push(value as u8);
    }
    pub fn write_u8(&mut self, value: u8) {
        self.bytes.push(value);
    }
    pub fn write_u32(&mut self, value: u32) {
        self.bytes.extend_from_slice(&value.to_le_bytes());
    }
    pub fn write_u64(&mut self, value: u64) {
        self.bytes.extend_from_slice(&value.to_le_bytes());
    }
    pub fn write_f32(&mut self, value: f32) {
        self.bytes.extend_from_slice(&value.to_le_bytes());
    }
    pub fn write_rect(&mut self, rect: Rect) {
        self.write_f32(rect.x);
        self.write_f32(rect.y);
        self.write_f32(rect.width);
        self.write_f32(rect.height);
    }

    /// Writes one length-prefixed payload slot.
    pub fn write_payload(&mut self, payload: &[u8]) {
        self.write_u32(payload.len() as u32);
        self.bytes.extend_from_slice(payload);
    }

    /// Writes the empty slot a record leaves unused.
    pub fn write_skip_marker(&mut self) {
        self.write_u32(0);
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.bytes
    }
    pub fn into_bytes(self) -> Vec<u8> {
        self.bytes
    }
}

/// Read half of the wire channel: a cursor over received bytes.
#[derive(Debug)]
pub struct WireReader<'a> {
    bytes: &'a [u8],
    cursor: usize,
}

impl<'a> WireReader<'a> {
    pub fn new(bytes: &'a [u8]) -> Self {
        WireReader { bytes, cursor: 0 }
    }

    pub fn position(&self) -> usize {
        self.cursor
    }
    pub fn remaining(&self) -> usize {
        self.bytes.len() - self.cursor
    }

    fn take(&mut self, len: usize) -> Result<&'a [u8], WireError> {
        let end = self
            .cursor
            .checked_add(len)
            .ok_or(WireError::UnexpectedEof(self.cursor))?;
        if end > self.bytes.len() {
            return Err(WireError::UnexpectedEof(self.cursor));
        }
        let slice = &self.bytes[self.cursor..end];
        self.cursor = end;
        Ok(slice)
    }

    pub fn read_bool(&mut self) -> Result<bool, WireError> {
        match self.take(1)?[0] {
            0 => Ok(false),
            1 => Ok(true),
            _ => Err(WireError::MalformedPayload("bool")),
        }
    }
    pub fn read_u8(&mut self) -> Result<u8, WireError> {
        Ok(self.take(1)?[0])
    }
    pub fn read_u32(&mut self) -> Result<u32, WireError> {
        let bytes = self.take(4)?;
        Ok(u32::from_le_bytes(bytes.try_into().expect("4 bytes")))
    }
    pub fn read_u64(&mut self) -> Result<u64, WireError> {
        let bytes = self.take(8)?;
        Ok(u64::from_le_bytes(bytes.try_into().expect("8 bytes")))
    }
    pub fn read_f32(&mut self) -> Result<f32, WireError> {
        let bytes = self.take(4)?;
        Ok(f32::from_le_bytes(bytes.try_into().expect("4 bytes")))
    }
    pub fn read_rect(&mut self) -> Result<Rect, WireError> {
        Ok(Rect {
            x: self.read_f32()?,
            y: self.read_f32()?,
            width: self.read_f32()?,
            height: self.read_f32()?,
        })
    }

    /// Reads one length-prefixed payload slot.
    pub fn read_payload(&mut self) -> Result<&'a [u8], WireError> {
        let len = self.read_u32()? as usize;
        self.take(len)
    }

    /// Advances over one payload slot without materializing it.  Returns the
    /// bytes consumed, length prefix included, which equals what
    /// [Self::read_payload] would have consumed.
    pub fn skip_payload(&mut self) -> Result<usize, WireError> {
        let len = self.read_u32()? as usize;
        self.take(len)?;
        Ok(len + 4)
    }
}

// resource payload codecs

pub(crate) fn encode_pixel_buffer(buffer: &PixelBuffer) -> Vec<u8> {
    let mut w = WireWriter::new();
    w.write_u32(buffer.width());
    w.write_u32(buffer.height());
    w.write_u8(buffer.allocator().as_wire());
    w.write_u8(buffer.flags().as_wire());
    w.write_u32(buffer.content_id());
    let wrote = buffer.with_bytes(|bytes| w.write_payload(bytes));
    if wrote.is_none() {
        //unmapped at marshal time; callers unpurge first, so this is the
        //no-content case, not data loss
        w.write_skip_marker();
    }
    w.into_bytes()
}

pub(crate) fn decode_pixel_buffer(payload: &[u8]) -> Result<PixelBuffer, WireError> {
    let mut r = WireReader::new(payload);
    let width = r.read_u32()?;
    let height = r.read_u32()?;
    let allocator = AllocatorKind::from_wire(r.read_u8()?)
        .ok_or(WireError::MalformedPayload("allocator kind"))?;
    let flags = PixelFlags::from_wire(r.read_u8()?);
    let content_id = r.read_u32()?;
    let bytes = r.read_payload()?.to_vec();
    Ok(PixelBuffer::new(
        width, height, allocator, flags, content_id, bytes,
    ))
}

pub(crate) fn encode_gpu_image(image: &GpuImage) -> Vec<u8> {
    let mut w = WireWriter::new();
    w.write_u32(image.width());
    w.write_u32(image.height());
    w.write_u8(image.backend().as_wire());
    match image.snapshot() {
        Some(bytes) => w.write_payload(bytes),
        None => w.write_skip_marker(),
    }
    w.into_bytes()
}

pub(crate) fn decode_gpu_image(payload: &[u8]) -> Result<GpuImage, WireError> {
    let mut r = WireReader::new(payload);
    let width = r.read_u32()?;
    let height = r.read_u32()?;
    let backend =
        Backend::from_wire(r.read_u8()?).ok_or(WireError::MalformedPayload("backend"))?;
    let snapshot = r.read_payload()?;
    let payload = if snapshot.is_empty() {
        ImagePayload::Opaque
    } else {
        ImagePayload::Software(snapshot.to_vec().into_boxed_slice())
    };
    Ok(GpuImage::new(backend, width, height, payload))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn primitive_round_trip() {
        let mut w = WireWriter::new();
        w.write_bool(true);
        w.write_u32(7);
        w.write_u64(u64::MAX);
        w.write_rect(Rect::new(1.0, 2.0, 3.0, 4.0));
        let bytes = w.into_bytes();

        let mut r = WireReader::new(&bytes);
        assert!(r.read_bool().unwrap());
        assert_eq!(r.read_u32().unwrap(), 7);
        assert_eq!(r.read_u64().unwrap(), u64::MAX);
        assert_eq!(r.read_rect().unwrap(), Rect::new(1.0, 2.0, 3.0, 4.0));
        assert_eq!(r.remaining(), 0);
    }

    #[test]
    fn skip_consumes_exactly_a_payload() {
        let mut w = WireWriter::new();
        w.write_payload(&[1, 2, 3, 4, 5]);
        let bytes = w.into_bytes();

        let mut read = WireReader::new(&bytes);
        let payload = read.read_payload().unwrap();
        assert_eq!(payload, &[1, 2, 3, 4, 5]);

        let mut skip = WireReader::new(&bytes);
        let skipped = skip.skip_payload().unwrap();
        assert_eq!(skipped, bytes.len());
        assert_eq!(skip.position(), read.position());
    }

    #[test]
    fn truncated_data_is_an_error() {
        let mut w = WireWriter::new();
        w.write_payload(&[1, 2, 3]);
        let mut bytes = w.into_bytes();
        bytes.truncate(5);
        let mut r = WireReader::new(&bytes);
        assert!(matches!(
            r.read_payload(),
            Err(WireError::UnexpectedEof(_))
        ));
    }

    #[test]
    fn bad_bool_is_malformed() {
        let bytes = [7u8];
        let mut r = WireReader::new(&bytes);
        assert!(matches!(
            r.read_bool(),
            Err(WireError::MalformedPayload(_))
        ));
    }

    #[test]
    fn pixel_buffer_codec_round_trip() {
        use crate::pixels::{AllocatorKind, PixelFlags};
        let buffer = PixelBuffer::new(
            2,
            3,
            AllocatorKind::SharedMemory,
            PixelFlags {
                is_hdr: true,
                ..Default::default()
            },
            11,
            vec![9; 24],
        );
        let encoded = encode_pixel_buffer(&buffer);
        let decoded = decode_pixel_buffer(&encoded).unwrap();
        assert_eq!(decoded.width(), 2);
        assert_eq!(decoded.height(), 3);
        assert_eq!(decoded.allocator(), AllocatorKind::SharedMemory);
        assert!(decoded.flags().is_hdr);
        assert_eq!(decoded.content_id(), 11);
        assert_eq!(decoded.with_bytes(|b| b.to_vec()).unwrap(), vec![9; 24]);
    }
}

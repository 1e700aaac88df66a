/*!
 * Binary telemetry frame codec.
 *
 * Frame format for N streamed parameters:
 * ```text
 * +---------+-----+---------+-----+-----+-----------+
 * | value 0 | 0x7C| value 1 | 0x7C| ... | value N-1 |
 * | w0 B LE | 1 B | w1 B LE | 1 B |     | wN-1 B LE |
 * +---------+-----+---------+-----+-----+-----------+
 * ```
 * Each width comes from the parameter's wire type (1, 2, 4 or 8 bytes).
 */
use bytes::{Buf, BufMut, Bytes, BytesMut};
use tracing::{debug, warn};

use hermes_core::types::DataValue;

use crate::protocol::{CodecError, DataType};

/// Byte inserted between two consecutive fields of a frame
pub const FRAME_DELIMITER: u8 = b'|';

/// One field of a frame layout
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FrameField {
    /// Parameter name reported to clients
    pub name: String,
    /// Wire type of the field
    pub data_type: DataType,
    /// Width of the field in bytes
    pub width: usize,
}

/// The fixed-width layout of one stream session's frames
///
/// The length is always derived from the field types. A length announced by
/// the device is kept only as a hint until the first frame is decoded.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FrameLayout {
    fields: Vec<FrameField>,
    frame_len: usize,
    declared_len: Option<usize>,
    confirmed: bool,
}

impl FrameLayout {
    /// Build a layout from ordered (name, wire type) pairs
    pub fn new<I, S>(fields: I) -> Result<Self, CodecError>
    where
        I: IntoIterator<Item = (S, DataType)>,
        S: Into<String>,
    {
        let fields = fields
            .into_iter()
            .map(|(name, data_type)| {
                let width = data_type
                    .frame_width()
                    .ok_or(CodecError::UnframeableType(data_type))?;
                Ok(FrameField {
                    name: name.into(),
                    data_type,
                    width,
                })
            })
            .collect::<Result<Vec<_>, CodecError>>()?;

        if fields.is_empty() {
            return Err(CodecError::Layout("a frame needs at least one field".to_string()));
        }

        let frame_len = Self::wire_len(&fields);
        Ok(Self {
            fields,
            frame_len,
            declared_len: None,
            confirmed: false,
        })
    }

    fn wire_len(fields: &[FrameField]) -> usize {
        let values: usize = fields.iter().map(|f| f.width).sum();
        values + fields.len().saturating_sub(1)
    }

    /// Attach the frame length announced by the device
    pub fn with_declared_len(mut self, declared_len: usize) -> Self {
        if declared_len != self.frame_len {
            warn!(
                declared = declared_len,
                computed = self.frame_len,
                "Device announced a frame length that differs from the field types"
            );
        }
        self.declared_len = Some(declared_len);
        self
    }

    /// The authoritative on-wire length of one frame
    pub fn frame_len(&self) -> usize {
        self.frame_len
    }

    /// The length announced by the device, until the first decode
    pub fn declared_len(&self) -> Option<usize> {
        self.declared_len
    }

    /// Number of values per frame
    pub fn item_count(&self) -> usize {
        self.fields.len()
    }

    /// The ordered fields
    pub fn fields(&self) -> &[FrameField] {
        &self.fields
    }

    /// Whether a real frame has been decoded with this layout
    pub fn is_confirmed(&self) -> bool {
        self.confirmed
    }

    /// Pack one value per field into a frame
    pub fn encode(&self, values: &[DataValue]) -> Result<Bytes, CodecError> {
        if values.len() != self.fields.len() {
            return Err(CodecError::Layout(format!(
                "expected {} values, got {}",
                self.fields.len(),
                values.len()
            )));
        }

        let mut buf = BytesMut::with_capacity(self.frame_len);
        for (index, (field, value)) in self.fields.iter().zip(values).enumerate() {
            if index > 0 {
                buf.put_u8(FRAME_DELIMITER);
            }
            put_value(&mut buf, field.data_type, value)?;
        }
        Ok(buf.freeze())
    }

    /// Unpack a frame into named values, in layout order
    ///
    /// Delimiter bytes are skipped and never reported.
    pub fn decode(&mut self, frame: &[u8]) -> Result<Vec<(String, DataValue)>, CodecError> {
        if !self.confirmed {
            if let Some(declared) = self.declared_len.take() {
                if declared != self.frame_len {
                    debug!(
                        declared,
                        authoritative = self.frame_len,
                        "Replacing announced frame length with the one derived from field types"
                    );
                }
            }
        }

        if frame.len() != self.frame_len {
            return Err(CodecError::FrameLength {
                expected: self.frame_len,
                actual: frame.len(),
            });
        }

        let mut buf = frame;
        let mut values = Vec::with_capacity(self.fields.len());
        for (index, field) in self.fields.iter().enumerate() {
            if index > 0 {
                buf.advance(1);
            }
            values.push((field.name.clone(), get_value(&mut buf, field.data_type)?));
        }

        self.confirmed = true;
        Ok(values)
    }
}

fn mismatch(value: &DataValue, data_type: DataType) -> CodecError {
    CodecError::ValueMismatch {
        value: value.to_string(),
        data_type,
    }
}

fn put_value(buf: &mut BytesMut, data_type: DataType, value: &DataValue) -> Result<(), CodecError> {
    match data_type {
        DataType::Int8 => {
            let v = value
                .as_integer()
                .and_then(|v| u8::try_from(v).ok())
                .ok_or_else(|| mismatch(value, data_type))?;
            buf.put_u8(v);
        }
        DataType::Int16 => {
            let v = value
                .as_integer()
                .and_then(|v| u16::try_from(v).ok())
                .ok_or_else(|| mismatch(value, data_type))?;
            buf.put_u16_le(v);
        }
        DataType::Int32 => {
            let v = value
                .as_integer()
                .and_then(|v| u32::try_from(v).ok())
                .ok_or_else(|| mismatch(value, data_type))?;
            buf.put_u32_le(v);
        }
        DataType::Float => {
            let v = value.as_float().ok_or_else(|| mismatch(value, data_type))?;
            buf.put_f32_le(v as f32);
        }
        DataType::Double => {
            let v = value.as_float().ok_or_else(|| mismatch(value, data_type))?;
            buf.put_f64_le(v);
        }
        DataType::Bool => {
            let v = match value {
                DataValue::Bool(b) => *b,
                DataValue::Integer(0) => false,
                DataValue::Integer(1) => true,
                _ => return Err(mismatch(value, data_type)),
            };
            buf.put_u8(u8::from(v));
        }
        DataType::None | DataType::String => return Err(CodecError::UnframeableType(data_type)),
    }
    Ok(())
}

fn get_value(buf: &mut &[u8], data_type: DataType) -> Result<DataValue, CodecError> {
    let value = match data_type {
        DataType::Int8 => DataValue::Integer(i64::from(buf.get_u8())),
        DataType::Int16 => DataValue::Integer(i64::from(buf.get_u16_le())),
        DataType::Int32 => DataValue::Integer(i64::from(buf.get_u32_le())),
        DataType::Float => DataValue::Float(f64::from(buf.get_f32_le())),
        DataType::Double => DataValue::Float(buf.get_f64_le()),
        DataType::Bool => DataValue::Bool(buf.get_u8() != 0),
        DataType::None | DataType::String => return Err(CodecError::UnframeableType(data_type)),
    };
    Ok(value)
}

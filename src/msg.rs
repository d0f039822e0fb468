/// Label carried by the single dimension of every raw data message
pub const RAW_DATA_LABEL: &str = "raw_data_stream";

#[derive(Debug, Clone, PartialEq, Eq, Default)]
/// One dimension of a multi-dimensional array layout
pub struct MultiArrayDimension {
    /// Name of the dimension
    pub label: String,
    /// Number of elements along this dimension
    pub size: u32,
    /// Number of elements spanned by one step along this dimension
    pub stride: u32,
}

#[derive(Debug, Clone, PartialEq, Eq, Default)]
/// Layout of the data in a multi-dimensional array message
pub struct MultiArrayLayout {
    /// Dimensions, outermost first
    pub dim: Vec<MultiArrayDimension>,
    /// Padding elements at the front of the data
    pub data_offset: u32,
}

#[derive(Debug, Clone, PartialEq, Eq, Default)]
/// A byte array message as it travels over the bus
pub struct UInt8MultiArray {
    /// Layout description
    pub layout: MultiArrayLayout,
    /// Payload
    pub data: Vec<u8>,
}

/// Dimension size for a payload of `len` bytes. Payloads of 4 GiB and more
/// saturate at `u32::MAX`.
fn dim_size(len: usize) -> u32 {
    u32::try_from(len).unwrap_or(u32::MAX)
}

impl UInt8MultiArray {
    /// Wrap a chunk of raw receiver data as a one-dimensional byte array.
    pub fn from_bytes(data: &[u8]) -> Self {
        Self {
            layout: MultiArrayLayout {
                dim: vec![MultiArrayDimension {
                    label: RAW_DATA_LABEL.into(),
                    size: dim_size(data.len()),
                    stride: 1,
                }],
                data_offset: 0,
            },
            data: data.to_vec(),
        }
    }

    /// Get the payload of the message
    pub fn as_bytes(&self) -> &[u8] {
        &self.data
    }

    /// Number of payload bytes
    pub fn len(&self) -> usize {
        self.data.len()
    }

    /// Check whether the message carries no payload
    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }
}

impl From<Vec<u8>> for UInt8MultiArray {
    fn from(data: Vec<u8>) -> Self {
        let mut msg = Self::from_bytes(&[]);
        msg.layout.dim[0].size = dim_size(data.len());
        msg.data = data;
        msg
    }
}

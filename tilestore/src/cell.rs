//! Fixed width numeric cell types that can be stored in an array attribute.
//!
use std::fmt::{self, Debug};

use num_traits::{Num, NumCast, ToPrimitive};
use paste::paste;
use serde::{Deserialize, Serialize};

/// The kind of numeric data stored in an array attribute.
///
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DataType {
    U8,
    U16,
    U32,
    U64,
    I8,
    I16,
    I32,
    I64,
    F32,
    F64,
}

impl DataType {
    pub(crate) const ALL: [DataType; 10] = [
        DataType::U8,
        DataType::U16,
        DataType::U32,
        DataType::U64,
        DataType::I8,
        DataType::I16,
        DataType::I32,
        DataType::I64,
        DataType::F32,
        DataType::F64,
    ];

    /// Size in bytes of a single cell
    pub fn size(&self) -> usize {
        match self {
            DataType::U8 | DataType::I8 => 1,
            DataType::U16 | DataType::I16 => 2,
            DataType::U32 | DataType::I32 | DataType::F32 => 4,
            DataType::U64 | DataType::I64 | DataType::F64 => 8,
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            DataType::U8 => "u8",
            DataType::U16 => "u16",
            DataType::U32 => "u32",
            DataType::U64 => "u64",
            DataType::I8 => "i8",
            DataType::I16 => "i16",
            DataType::I32 => "i32",
            DataType::I64 => "i64",
            DataType::F32 => "f32",
            DataType::F64 => "f64",
        }
    }

    pub(crate) fn code(&self) -> u8 {
        Self::ALL.iter().position(|dtype| dtype == self).unwrap_or(0) as u8
    }

    pub(crate) fn from_code(code: u8) -> Option<Self> {
        Self::ALL.get(code as usize).copied()
    }

    /// Encode `value` as a little endian cell of this type.
    ///
    /// Returns `None` if `value` can't be represented by this type. Integer types only take
    /// whole numbers in range.
    ///
    pub fn encode(&self, value: f64) -> Option<Vec<u8>> {
        macro_rules! encode {
            ($type:ty) => {{
                let cell: $type = NumCast::from(value)?;
                Some(cell.to_le_bytes().to_vec())
            }};
        }

        macro_rules! exact {
            ($type:ty) => {{
                if value.fract() != 0.0 {
                    return None;
                }
                encode!($type)
            }};
        }

        match self {
            DataType::U8 => exact!(u8),
            DataType::U16 => exact!(u16),
            DataType::U32 => exact!(u32),
            DataType::U64 => exact!(u64),
            DataType::I8 => exact!(i8),
            DataType::I16 => exact!(i16),
            DataType::I32 => exact!(i32),
            DataType::I64 => exact!(i64),
            DataType::F32 => encode!(f32),
            DataType::F64 => encode!(f64),
        }
    }
}

impl fmt::Display for DataType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// A numeric type that can be stored in an array.
///
pub trait Cell: Num + NumCast + ToPrimitive + Copy + Debug + Send + Sync + 'static {
    const DATA_TYPE: DataType;

    /// Append the little endian representation of this value to `bytes`
    fn put_le(self, bytes: &mut Vec<u8>);

    /// Read a value from the first `DATA_TYPE.size()` bytes of `bytes`
    fn get_le(bytes: &[u8]) -> Self;

    /// Whether this is an integer type, in which case averages are rounded.
    fn is_integer() -> bool;
}

macro_rules! Cell {
    ($variant:ident, $integer:expr) => {
        paste! {
            impl Cell for [<$variant:lower>] {
                const DATA_TYPE: DataType = DataType::$variant;

                fn put_le(self, bytes: &mut Vec<u8>) {
                    bytes.extend_from_slice(&self.to_le_bytes());
                }

                fn get_le(bytes: &[u8]) -> Self {
                    const SIZE: usize = std::mem::size_of::<[<$variant:lower>]>();
                    let mut buffer = [0; SIZE];
                    buffer.copy_from_slice(&bytes[..SIZE]);

                    [<$variant:lower>]::from_le_bytes(buffer)
                }

                fn is_integer() -> bool {
                    $integer
                }
            }
        }
    };
}

Cell!(U8, true);
Cell!(U16, true);
Cell!(U32, true);
Cell!(U64, true);
Cell!(I8, true);
Cell!(I16, true);
Cell!(I32, true);
Cell!(I64, true);
Cell!(F32, false);
Cell!(F64, false);

/// Decode a buffer of little endian cells.
///
pub(crate) fn decode<N: Cell>(bytes: &[u8]) -> Vec<N> {
    bytes
        .chunks_exact(N::DATA_TYPE.size())
        .map(N::get_le)
        .collect()
}

/// Encode cells into a buffer of little endian bytes.
///
pub(crate) fn encode<'a, N: Cell>(cells: impl Iterator<Item = &'a N>) -> Vec<u8> {
    let mut bytes = Vec::new();
    for cell in cells {
        cell.put_le(&mut bytes);
    }

    bytes
}

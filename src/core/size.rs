//! Memory footprint of array shapes.
//!
//! Pure functions used to decide whether an allocation is feasible before
//! anything is requested from the OS.

use crate::core::error::{StackError, StackResult};

/// Number of elements described by `shape`.
///
/// Every dimension must be positive. The product is computed with checked
/// arithmetic so a shape that overflows `u64` is rejected rather than wrapped.
pub fn element_count(shape: &[usize]) -> StackResult<u64> {
    if shape.is_empty() {
        return Err(StackError::invalid_shape(shape, "shape has no dimensions"));
    }

    let mut count: u64 = 1;
    for (axis, &dim) in shape.iter().enumerate() {
        if dim == 0 {
            return Err(StackError::invalid_shape(
                shape,
                format!("dimension {} must be positive", axis),
            ));
        }
        count = count
            .checked_mul(dim as u64)
            .ok_or_else(|| StackError::invalid_shape(shape, "element count overflows u64"))?;
    }
    Ok(count)
}

/// Exact number of bytes needed to hold `shape` with elements of `element_size` bytes.
pub fn required_bytes(shape: &[usize], element_size: usize) -> StackResult<u64> {
    if element_size == 0 {
        return Err(StackError::invalid_shape(shape, "element size must be positive"));
    }
    element_count(shape)?
        .checked_mul(element_size as u64)
        .ok_or_else(|| StackError::invalid_shape(shape, "byte size overflows u64"))
}

/// Size in whole kilobytes, for log messages.
pub fn full_size_kb(shape: &[usize], element_size: usize) -> StackResult<u64> {
    Ok(required_bytes(shape, element_size)? / 1024)
}

/// Whether an array of `shape` fits strictly within `available_bytes`.
pub fn fits_in_memory(shape: &[usize], element_size: usize, available_bytes: u64) -> StackResult<bool> {
    Ok(required_bytes(shape, element_size)? < available_bytes)
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn test_required_bytes_exact() {
        assert_eq!(required_bytes(&[500, 2048, 2048], 4).unwrap(), 8_388_608_000);
        assert_eq!(required_bytes(&[1], 1).unwrap(), 1);
        assert_eq!(required_bytes(&[3, 4, 4], std::mem::size_of::<f64>()).unwrap(), 384);
    }

    #[test]
    fn test_invalid_shapes() {
        assert!(matches!(required_bytes(&[], 4), Err(StackError::InvalidShape { .. })));
        assert!(matches!(required_bytes(&[3, 0, 4], 4), Err(StackError::InvalidShape { .. })));
        assert!(matches!(required_bytes(&[3, 4], 0), Err(StackError::InvalidShape { .. })));
        assert!(matches!(
            required_bytes(&[usize::MAX, usize::MAX, 2], 4),
            Err(StackError::InvalidShape { .. })
        ));
    }

    #[test]
    fn test_fits_in_memory_is_strict() {
        assert!(fits_in_memory(&[2, 2], 4, 17).unwrap());
        assert!(!fits_in_memory(&[2, 2], 4, 16).unwrap());
        assert!(!fits_in_memory(&[2, 2], 4, 0).unwrap());
    }

    #[test]
    fn test_full_size_kb() {
        assert_eq!(full_size_kb(&[1, 1024, 1024], 4).unwrap(), 4096);
    }

    proptest! {
        #[test]
        fn required_bytes_is_product(dims in prop::collection::vec(1usize..64, 1..5), elem in 1usize..9) {
            let expected: u64 = dims.iter().map(|&d| d as u64).product::<u64>() * elem as u64;
            prop_assert_eq!(required_bytes(&dims, elem).unwrap(), expected);
        }
    }
}

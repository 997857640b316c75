#![forbid(unsafe_code)]

use crate::domain::{ByteDelta, MutationDepth};
use crate::error::Error;

/// Every position where `before` and `after` differ, in ascending offset
/// order. Fails without partial output when the lengths differ.
pub fn compute_deltas(before: &[u8], after: &[u8]) -> Result<Vec<ByteDelta>, Error> {
    if before.len() != after.len() {
        return Err(Error::LengthMismatch {
            before: before.len(),
            after: after.len(),
        });
    }

    Ok(before
        .iter()
        .zip(after)
        .enumerate()
        .filter(|(_, (b, a))| b != a)
        .map(|(offset, (&before, &after))| ByteDelta {
            offset,
            before,
            after,
        })
        .collect())
}

/// Like [`compute_deltas`], restricted to the window selected by `depth`.
/// Offsets stay relative to the start of the buffers.
pub fn compute_region_deltas(
    before: &[u8],
    after: &[u8],
    depth: MutationDepth,
) -> Result<Vec<ByteDelta>, Error> {
    if before.len() != after.len() {
        return Err(Error::LengthMismatch {
            before: before.len(),
            after: after.len(),
        });
    }

    let window = depth.window(before.len());
    let start = window.start;
    let mut deltas = compute_deltas(&before[window.clone()], &after[window])?;
    for delta in &mut deltas {
        delta.offset += start;
    }
    Ok(deltas)
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn identical_buffers_have_no_deltas() {
        let page = vec![0xabu8; 4096];
        assert!(compute_deltas(&page, &page).unwrap().is_empty());
    }

    #[test]
    fn single_byte_change() {
        let before = [0u8, 1, 2, 3];
        let after = [0u8, 1, 9, 3];
        assert_eq!(
            compute_deltas(&before, &after).unwrap(),
            vec![ByteDelta {
                offset: 2,
                before: 2,
                after: 9
            }]
        );
    }

    #[test]
    fn range_depth_ignores_bytes_outside_window() {
        let before = [0u8; 16];
        let mut after = [0u8; 16];
        after[1] = 1;
        after[10] = 2;

        let deltas =
            compute_region_deltas(&before, &after, MutationDepth::Range { offset: 8, len: 4 })
                .unwrap();
        assert_eq!(
            deltas,
            vec![ByteDelta {
                offset: 10,
                before: 0,
                after: 2
            }]
        );
    }

    proptest! {
        #[test]
        fn deltas_are_exactly_the_differing_positions(
            pairs in prop::collection::vec((any::<u8>(), any::<u8>()), 0..512)
        ) {
            let before: Vec<u8> = pairs.iter().map(|p| p.0).collect();
            let after: Vec<u8> = pairs.iter().map(|p| p.1).collect();
            let deltas = compute_deltas(&before, &after).unwrap();

            let expected: Vec<usize> = (0..before.len()).filter(|&i| before[i] != after[i]).collect();
            let offsets: Vec<usize> = deltas.iter().map(|d| d.offset).collect();
            prop_assert_eq!(offsets, expected);
            for d in &deltas {
                prop_assert_eq!(d.before, before[d.offset]);
                prop_assert_eq!(d.after, after[d.offset]);
            }
        }

        #[test]
        fn mismatched_lengths_fail(a in prop::collection::vec(any::<u8>(), 0..64), extra in 1usize..8) {
            let b = vec![0u8; a.len() + extra];
            let mismatch = matches!(
                compute_deltas(&a, &b),
                Err(Error::LengthMismatch { before, after }) if before == a.len() && after == b.len()
            );
            prop_assert!(mismatch);
        }
    }
}

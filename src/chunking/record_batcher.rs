//! Greedy byte-size grouping of JSON records.

use serde::Serialize;

use crate::error::AppError;

/// Returns the UTF-8 byte length of the compact JSON form of `record`.
pub fn serialized_size<T: Serialize>(record: &T) -> Result<usize, AppError> {
    serde_json::to_vec(record)
        .map(|bytes| bytes.len())
        .map_err(|e| AppError::Internal(format!("Failed to serialize record: {}", e)))
}

/// Splits `records` into the fewest contiguous groups whose summed
/// serialized size stays within `max_bytes`.
///
/// Single pass: a record joins the current group while the running total
/// plus its own size is `<= max_bytes`, otherwise it opens the next group.
/// A record larger than `max_bytes` is never split and ends up alone in an
/// oversized group.
///
/// The groups borrow from `records`, so order within and across groups is
/// the input order. Empty input yields no groups; no group is ever empty.
pub fn split_records<T: Serialize>(
    records: &[T],
    max_bytes: usize,
) -> Result<Vec<&[T]>, AppError> {
    let mut groups: Vec<&[T]> = Vec::new();
    let mut group_start = 0usize;
    let mut group_bytes = 0usize;

    for (index, record) in records.iter().enumerate() {
        let size = serialized_size(record)?;

        if index > group_start && group_bytes + size > max_bytes {
            groups.push(&records[group_start..index]);
            group_start = index;
            group_bytes = 0;
        }

        group_bytes += size;
    }

    if group_start < records.len() {
        groups.push(&records[group_start..]);
    }

    #[cfg(debug_assertions)]
    tracing::debug!(
        records = records.len(),
        groups = groups.len(),
        max_bytes,
        "Split records into groups"
    );

    Ok(groups)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::{json, Value};

    fn group_sizes(groups: &[&[Value]]) -> Vec<usize> {
        groups.iter().map(|g| g.len()).collect()
    }

    fn group_bytes(group: &[Value]) -> usize {
        group.iter().map(|r| serialized_size(r).unwrap()).sum()
    }

    #[test]
    fn empty_input_yields_no_groups() {
        let records: Vec<Value> = Vec::new();
        let groups = split_records(&records, 100).unwrap();
        assert!(groups.is_empty());
    }

    #[test]
    fn oversized_records_form_singleton_groups() {
        // Each {"a":1} serializes to 7 bytes, well over the 1-byte limit
        let records = vec![json!({"a": 1}); 10];

        let groups = split_records(&records, 1).unwrap();

        assert_eq!(groups.len(), 10);
        for group in &groups {
            assert_eq!(group.len(), 1);
            assert!(group_bytes(group) > 1);
        }
    }

    #[test]
    fn small_records_share_one_group() {
        let records = vec![
            json!({"maid": 123, "first_name": "Sandeep"}),
            json!({"maid": 124, "first_name": "Aaron"}),
        ];

        let groups = split_records(&records, 200_000).unwrap();

        assert_eq!(group_sizes(&groups), vec![2]);
    }

    #[test]
    fn exact_fit_stays_in_group() {
        // 7 bytes each; 21 bytes fit three records exactly
        let records = vec![json!({"a": 1}); 4];

        let groups = split_records(&records, 21).unwrap();

        assert_eq!(group_sizes(&groups), vec![3, 1]);
    }

    #[test]
    fn oversized_record_in_the_middle_is_isolated() {
        let records = vec![
            json!({"id": 1}),
            json!({"id": 2, "blob": "x".repeat(100)}),
            json!({"id": 3}),
            json!({"id": 4}),
        ];

        let groups = split_records(&records, 20).unwrap();

        assert_eq!(group_sizes(&groups), vec![1, 1, 2]);
        assert_eq!(groups[1][0]["id"], 2);
    }

    #[test]
    fn groups_preserve_order_and_respect_limit() {
        let records: Vec<Value> = (0..50)
            .map(|i| json!({"id": i, "pad": "p".repeat(i % 7)}))
            .collect();
        let max_bytes = 64;

        let groups = split_records(&records, max_bytes).unwrap();

        let flattened: Vec<&Value> = groups.iter().flat_map(|g| g.iter()).collect();
        assert_eq!(flattened.len(), records.len());
        for (original, grouped) in records.iter().zip(flattened) {
            assert_eq!(original, grouped);
        }

        for group in &groups {
            assert!(!group.is_empty());
            assert!(group.len() == 1 || group_bytes(group) <= max_bytes);
        }
    }

    #[test]
    fn grouping_is_greedy() {
        // A group is closed only when the next record would not fit
        let records: Vec<Value> = (0..20).map(|i| json!({"n": i})).collect();
        let max_bytes = 30;

        let groups = split_records(&records, max_bytes).unwrap();

        for pair in groups.windows(2) {
            let next_size = serialized_size(&pair[1][0]).unwrap();
            assert!(group_bytes(pair[0]) + next_size > max_bytes);
        }
    }

    #[test]
    fn serialized_size_counts_utf8_bytes() {
        // "é" is two bytes in UTF-8
        assert_eq!(serialized_size(&json!("é")).unwrap(), 4);
        assert_eq!(serialized_size(&json!({"a": 1})).unwrap(), 7);
    }
}

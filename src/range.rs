//! Identifier-set expressions.
//!
//! Operators address boxes, probes, channels, stimulation units and electrodes with short
//! textual expressions such as `"1,2,5-8"` or `"-"`. Expressions are 1-indexed; the parsed
//! result is 0-indexed, ascending and free of duplicates.
//!
//! ```text
//! expr := "-" | item ("," item)*
//! item := INT | INT "-" INT
//! ```
//!
//! A reversed range (`"6-4"`) is read as its ascending counterpart. Doubled separators
//! (`",,"`, `"--"`), empty items and items that start or end with a dash are rejected.
//!
//! Reference expressions use the same grammar with two differences: `b` is an alias for
//! reference `0` (the bulk reference) and values are not shifted.

use std::collections::BTreeSet;

use crate::error::{AppResult, ViperError};

/// Number of selectable references, bulk included.
pub const REFERENCE_COUNT: usize = 9;

/// Parse a 1-indexed expression into sorted 0-indexed ids, all of which must be in `universe`.
///
/// A single-character expression is read literally as one number, so `"0"` resolves to id
/// `-1` and is reported as outside the universe.
pub fn parse_indices(expr: &str, universe: &[usize]) -> AppResult<Vec<usize>> {
    parse_shifted(expr, 1, universe)
}

/// Parse a reference expression (`"b,2"`) into a per-reference selection vector.
///
/// Position 0 is the bulk reference; positions 1-8 are the probe references.
pub fn parse_reference_mask(expr: &str) -> AppResult<[bool; REFERENCE_COUNT]> {
    let normalized = expr.replace(['b', 'B'], "0");
    let universe: Vec<usize> = (0..REFERENCE_COUNT).collect();
    let ids = parse_shifted(&normalized, 0, &universe).map_err(|e| match e {
        ViperError::MalformedExpression { reason, .. } => ViperError::MalformedExpression {
            expr: expr.to_string(),
            reason,
        },
        ViperError::OutOfUniverse { ids, .. } => ViperError::OutOfUniverse {
            expr: expr.to_string(),
            ids,
        },
        other => other,
    })?;

    let mut mask = [false; REFERENCE_COUNT];
    for id in ids {
        mask[id] = true;
    }
    Ok(mask)
}

fn malformed(expr: &str, reason: &str) -> ViperError {
    ViperError::MalformedExpression {
        expr: expr.to_string(),
        reason: reason.to_string(),
    }
}

fn parse_int(expr: &str, token: &str) -> AppResult<i64> {
    token
        .trim()
        .parse::<i64>()
        .map_err(|_| malformed(expr, &format!("'{}' is not a number", token.trim())))
}

fn parse_shifted(expr: &str, shift: i64, universe: &[usize]) -> AppResult<Vec<usize>> {
    let trimmed = expr.trim();
    if trimmed.is_empty() {
        return Err(malformed(expr, "expression is empty"));
    }
    if trimmed.contains(",,") {
        return Err(malformed(expr, "double comma"));
    }
    if trimmed.contains("--") {
        return Err(malformed(expr, "double dash"));
    }

    if trimmed == "-" {
        let all: BTreeSet<usize> = universe.iter().copied().collect();
        return Ok(all.into_iter().collect());
    }

    let mut spans = Vec::new();
    if trimmed.chars().count() == 1 {
        let value = parse_int(expr, trimmed)?;
        spans.push((value, value));
    } else {
        for item in trimmed.split(',') {
            let item = item.trim();
            if item.is_empty() {
                return Err(malformed(expr, "empty item"));
            }
            if item.starts_with('-') || item.ends_with('-') {
                return Err(malformed(
                    expr,
                    &format!("item '{item}' starts or ends with a dash"),
                ));
            }
            let bounds: Vec<&str> = item.split('-').collect();
            match bounds.as_slice() {
                [single] => {
                    let value = parse_int(expr, single)?;
                    spans.push((value, value));
                }
                [low, high] => {
                    let (low, high) = (parse_int(expr, low)?, parse_int(expr, high)?);
                    spans.push((low.min(high), low.max(high)));
                }
                _ => {
                    return Err(malformed(
                        expr,
                        &format!("range '{item}' must have exactly two bounds"),
                    ))
                }
            }
        }
    }
    let spans = merge_spans(spans);

    // Spans are never expanded; only universe members are enumerated.
    let available: BTreeSet<i64> = universe.iter().map(|&id| id as i64 + shift).collect();
    let resolved: Vec<usize> = available
        .iter()
        .filter(|value| spans.iter().any(|(low, high)| (low..=high).contains(value)))
        .map(|value| (value - shift) as usize)
        .collect();

    let missing = missing_spans(&spans, &available);
    if !missing.is_empty() {
        return Err(ViperError::OutOfUniverse {
            expr: expr.to_string(),
            ids: format_spans(&missing),
        });
    }
    Ok(resolved)
}

/// Sort inclusive spans and join overlapping or adjacent ones.
fn merge_spans(mut spans: Vec<(i64, i64)>) -> Vec<(i64, i64)> {
    spans.sort_unstable();
    let mut merged: Vec<(i64, i64)> = Vec::with_capacity(spans.len());
    for (low, high) in spans {
        match merged.last_mut() {
            Some((_, last_high)) if low <= last_high.saturating_add(1) => {
                *last_high = (*last_high).max(high);
            }
            _ => merged.push((low, high)),
        }
    }
    merged
}

/// Parts of `spans` not covered by `available`, as inclusive spans.
fn missing_spans(spans: &[(i64, i64)], available: &BTreeSet<i64>) -> Vec<(i64, i64)> {
    let mut missing = Vec::new();
    for &(low, high) in spans {
        let mut next = Some(low);
        for &value in available.range(low..=high) {
            if let Some(start) = next {
                if value > start {
                    missing.push((start, value - 1));
                }
            }
            next = value.checked_add(1);
        }
        if let Some(start) = next {
            if start <= high {
                missing.push((start, high));
            }
        }
    }
    missing
}

/// Render 1-indexed spans as `"5-6, 9"`.
pub fn format_spans(spans: &[(i64, i64)]) -> String {
    spans
        .iter()
        .map(|&(low, high)| {
            if low == high {
                low.to_string()
            } else {
                format!("{low}-{high}")
            }
        })
        .collect::<Vec<_>>()
        .join(", ")
}

/// Render 0-indexed ids as a 1-indexed list, e.g. `[0, 4]` becomes `"1, 5"`.
pub fn format_indices(ids: &[usize]) -> String {
    ids.iter()
        .map(|id| (id + 1).to_string())
        .collect::<Vec<_>>()
        .join(", ")
}

/// Render a reference selection as `"b, 2"`.
pub fn format_references(mask: &[bool; REFERENCE_COUNT]) -> String {
    mask.iter()
        .enumerate()
        .filter(|(_, selected)| **selected)
        .map(|(i, _)| if i == 0 { "b".to_string() } else { i.to_string() })
        .collect::<Vec<_>>()
        .join(", ")
}

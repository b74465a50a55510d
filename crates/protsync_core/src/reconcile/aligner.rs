//! Sequence aligner for feature ranges.
//!
//! # Responsibility
//! - Locate the residues a range spans on an old sequence inside a new one
//!   and compute the range's new coordinates.
//!
//! # Invariants
//! - Pure: inputs are never mutated.
//! - A shift moves all four bounds by the same offset, so endpoint widths
//!   are preserved; terminal endpoints are re-anchored to the new ends.
//! - Several matches are only accepted at the offset implied by the
//!   sequence-length delta; anything else is `Ambiguous`.

use crate::model::range::{Position, PositionStatus, Range};
use serde::Serialize;

/// New coordinates of a range that could be placed on the new sequence.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ShiftedRange {
    pub start: Position,
    pub end: Position,
    /// Residues the shifted range spans on the new sequence.
    pub subsequence: String,
}

impl ShiftedRange {
    /// Copies the shifted coordinates onto `range`; returns whether it changed.
    pub fn apply_to(&self, range: &mut Range) -> bool {
        let subsequence = Some(self.subsequence.clone());
        let changed =
            range.start != self.start || range.end != self.end || range.sequence != subsequence;
        range.start = self.start;
        range.end = self.end;
        range.sequence = subsequence;
        changed
    }
}

/// Result of [`locate`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum AlignmentOutcome {
    Shifted(ShiftedRange),
    /// The range does not fit the old sequence.
    OutOfBounds { message: String },
    /// The range's residues cannot be placed uniquely on the new sequence.
    Ambiguous { message: String },
}

/// Places `range`, recorded against `old_sequence`, onto `new_sequence`.
pub fn locate(old_sequence: &str, new_sequence: &str, range: &Range) -> AlignmentOutcome {
    let old = old_sequence.as_bytes();
    let new = new_sequence.as_bytes();

    let (first, last) = match range.span(old.len()) {
        Ok(span) => span,
        Err(err) => {
            return AlignmentOutcome::OutOfBounds {
                message: format!(
                    "range {} does not fit the previous sequence: {err}",
                    range.position_string()
                ),
            }
        }
    };

    if range.is_terminal_only() {
        if new.is_empty() {
            return AlignmentOutcome::Ambiguous {
                message: "the new sequence is empty".to_string(),
            };
        }
        return AlignmentOutcome::Shifted(shift(range, new, first, 0, new.len()));
    }

    let needle = &old[first..=last];
    let hits = find_all(new, needle);
    match hits.as_slice() {
        [] => AlignmentOutcome::Ambiguous {
            message: format!(
                "residues {} of range {} are not present in the new sequence",
                describe(needle),
                range.position_string()
            ),
        },
        [only] => AlignmentOutcome::Shifted(shift(range, new, first, *only, needle.len())),
        _ => {
            let delta = new.len() as i64 - old.len() as i64;
            let expected = first as i64 + delta;
            match hits.iter().find(|hit| **hit as i64 == expected) {
                Some(hit) => AlignmentOutcome::Shifted(shift(range, new, first, *hit, needle.len())),
                None => AlignmentOutcome::Ambiguous {
                    message: format!(
                        "residues {} of range {} occur {} times in the new sequence and none at the expected offset {}",
                        describe(needle),
                        range.position_string(),
                        hits.len(),
                        expected
                    ),
                },
            }
        }
    }
}

fn shift(range: &Range, new: &[u8], first: usize, hit: usize, length: usize) -> ShiftedRange {
    let delta = hit as i64 - first as i64;
    let last_residue = new.len() as i64 - 1;

    let anchor = |position: Position| match position.status {
        Some(PositionStatus::NTerminal) => Position::with_status(PositionStatus::NTerminal, 0, 0),
        Some(PositionStatus::CTerminal) => {
            Position::with_status(PositionStatus::CTerminal, last_residue, last_residue)
        }
        _ => position.offset_by(delta),
    };

    let start = anchor(range.start);
    let end = anchor(range.end);
    let from = hit.min(new.len());
    let to = (hit + length).min(new.len());

    ShiftedRange {
        start,
        end,
        subsequence: String::from_utf8_lossy(&new[from..to]).into_owned(),
    }
}

fn find_all(haystack: &[u8], needle: &[u8]) -> Vec<usize> {
    if needle.is_empty() || needle.len() > haystack.len() {
        return Vec::new();
    }
    haystack
        .windows(needle.len())
        .enumerate()
        .filter(|(_, window)| *window == needle)
        .map(|(offset, _)| offset)
        .collect()
}

fn describe(residues: &[u8]) -> String {
    const MAX_SHOWN: usize = 20;
    let text = String::from_utf8_lossy(residues);
    if text.chars().count() > MAX_SHOWN {
        format!("`{}...`", text.chars().take(MAX_SHOWN).collect::<String>())
    } else {
        format!("`{text}`")
    }
}

#[cfg(test)]
mod tests {
    use super::{locate, AlignmentOutcome};
    use crate::model::range::{Position, PositionStatus, Range};

    fn shifted(outcome: AlignmentOutcome) -> super::ShiftedRange {
        match outcome {
            AlignmentOutcome::Shifted(shifted) => shifted,
            other => panic!("expected shifted outcome, got {other:?}"),
        }
    }

    #[test]
    fn insertion_before_range_shifts_right() {
        let outcome = locate("ABCDE", "ABXCDE", &Range::certain(2, 3));
        let shifted = shifted(outcome);
        assert_eq!(shifted.start, Position::certain(3));
        assert_eq!(shifted.end, Position::certain(4));
        assert_eq!(shifted.subsequence, "CD");
    }

    #[test]
    fn fuzzy_widths_are_preserved() {
        let range = Range::new(Position::fuzzy(1, 2), Position::fuzzy(4, 5));
        let shifted = shifted(locate("MKVLAAG", "PPMKVLAAG", &range));
        assert_eq!(shifted.start, Position::fuzzy(3, 4));
        assert_eq!(shifted.end, Position::fuzzy(6, 7));
        assert_eq!(shifted.start.width(), 1);
        assert_eq!(shifted.end.width(), 1);
    }

    #[test]
    fn range_beyond_old_sequence_is_out_of_bounds() {
        let outcome = locate("ABC", "ABCD", &Range::certain(1, 5));
        assert!(matches!(outcome, AlignmentOutcome::OutOfBounds { .. }));
    }

    #[test]
    fn missing_residues_are_ambiguous() {
        let outcome = locate("ABCDE", "ABXDE", &Range::certain(1, 2));
        let AlignmentOutcome::Ambiguous { message } = outcome else {
            panic!("expected ambiguous outcome");
        };
        assert!(message.contains("`BC`"));
    }

    #[test]
    fn repeated_match_resolves_at_length_delta_offset() {
        // "KV" occurs twice in the new sequence; a two-residue insertion at
        // the front puts the expected hit at offset 4.
        let outcome = locate("MAKVLL", "KVMAKVLL", &Range::certain(2, 3));
        let shifted = shifted(outcome);
        assert_eq!(shifted.start, Position::certain(4));
        assert_eq!(shifted.end, Position::certain(5));
    }

    #[test]
    fn repeated_match_away_from_expected_offset_is_ambiguous() {
        // Hits at 0 and 4, expected offset 3.
        let outcome = locate("MAKVLL", "KVAAKVL", &Range::certain(2, 3));
        assert!(matches!(outcome, AlignmentOutcome::Ambiguous { .. }));
    }

    #[test]
    fn terminal_range_follows_new_sequence_ends() {
        let range = Range::new(
            Position::with_status(PositionStatus::NTerminal, 0, 0),
            Position::with_status(PositionStatus::CTerminal, 4, 4),
        );
        let shifted = shifted(locate("ABCDE", "ABCDEFG", &range));
        assert_eq!(shifted.start.min, 0);
        assert_eq!(shifted.end, Position::with_status(PositionStatus::CTerminal, 6, 6));
        assert_eq!(shifted.subsequence, "ABCDEFG");
    }

    #[test]
    fn undetermined_range_cannot_be_located() {
        let outcome = locate("ABC", "ABC", &Range::undetermined());
        assert!(matches!(outcome, AlignmentOutcome::OutOfBounds { .. }));
    }
}

//! Feature range model.
//!
//! # Responsibility
//! - Describe start/end coordinates of a feature on its record's sequence.
//! - Encode and decode the textual position form kept in the range ledger.
//!
//! # Invariants
//! - Coordinates are 0-based residue offsets, both ends inclusive.
//! - `start.min <= start.max <= end.min <= end.max` unless undetermined.
//! - A `Certain` endpoint has `min == max`; `Undetermined` endpoints only
//!   appear in pairs.
//! - An undetermined range written by the engine has both statuses set to
//!   `Undetermined` and all four bounds equal to 0.

use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

pub type RangeId = Uuid;

static POSITION_SIDE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^(?:(?P<unknown>\?)|(?P<nterm>n)|(?P<cterm>c)|(?P<cmp>[<>])(?P<bound>\d+)|(?P<min>\d+)(?:\.\.(?P<max>\d+))?)$")
        .expect("position side pattern is valid")
});

/// Kind of one range endpoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PositionStatus {
    Certain,
    /// Fuzzy endpoint spanning `min..=max`.
    Range,
    LessThan,
    GreaterThan,
    NTerminal,
    CTerminal,
    Undetermined,
}

impl PositionStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Certain => "certain",
            Self::Range => "range",
            Self::LessThan => "less_than",
            Self::GreaterThan => "greater_than",
            Self::NTerminal => "n_terminal",
            Self::CTerminal => "c_terminal",
            Self::Undetermined => "undetermined",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "certain" => Some(Self::Certain),
            "range" => Some(Self::Range),
            "less_than" => Some(Self::LessThan),
            "greater_than" => Some(Self::GreaterThan),
            "n_terminal" => Some(Self::NTerminal),
            "c_terminal" => Some(Self::CTerminal),
            "undetermined" => Some(Self::Undetermined),
            _ => None,
        }
    }

    /// Terminal endpoints follow the sequence ends instead of residues.
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::NTerminal | Self::CTerminal)
    }
}

/// One range endpoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Position {
    /// `None` means the endpoint type was never recorded.
    pub status: Option<PositionStatus>,
    pub min: i64,
    pub max: i64,
}

impl Position {
    pub fn certain(at: i64) -> Self {
        Self {
            status: Some(PositionStatus::Certain),
            min: at,
            max: at,
        }
    }

    pub fn fuzzy(min: i64, max: i64) -> Self {
        Self {
            status: Some(PositionStatus::Range),
            min,
            max,
        }
    }

    pub fn with_status(status: PositionStatus, min: i64, max: i64) -> Self {
        Self {
            status: Some(status),
            min,
            max,
        }
    }

    pub fn undetermined() -> Self {
        Self {
            status: Some(PositionStatus::Undetermined),
            min: 0,
            max: 0,
        }
    }

    pub fn width(&self) -> i64 {
        self.max - self.min
    }

    pub fn offset_by(&self, delta: i64) -> Self {
        Self {
            status: self.status,
            min: self.min + delta,
            max: self.max + delta,
        }
    }

    fn is_terminal(&self) -> bool {
        self.status.is_some_and(PositionStatus::is_terminal)
    }

    fn to_text(self) -> String {
        match self.status {
            None | Some(PositionStatus::Undetermined) => "?".to_string(),
            Some(PositionStatus::NTerminal) => "n".to_string(),
            Some(PositionStatus::CTerminal) => "c".to_string(),
            Some(PositionStatus::LessThan) => format!("<{}", self.min),
            Some(PositionStatus::GreaterThan) => format!(">{}", self.min),
            Some(PositionStatus::Certain) if self.min == self.max => self.min.to_string(),
            Some(PositionStatus::Certain | PositionStatus::Range) => {
                format!("{}..{}", self.min, self.max)
            }
        }
    }
}

/// Range position errors.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RangePositionError {
    #[error("range position `{0}` cannot be parsed")]
    Unparseable(String),
    #[error("range has negative bound {0}")]
    NegativeBound(i64),
    #[error("range bounds are out of order: {0}")]
    OutOfOrder(String),
    #[error("range bound {bound} lies beyond sequence length {length}")]
    BeyondSequence { bound: i64, length: usize },
    #[error("range is undetermined and has no residue span")]
    Undetermined,
    #[error("range {0} mixes an undetermined endpoint with a determined one")]
    UndeterminedEndpoint(String),
    #[error("certain endpoint spans several residues: {0}")]
    WidenedCertain(String),
}

/// Feature coordinates on a sequence.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Range {
    pub id: RangeId,
    pub start: Position,
    pub end: Position,
    /// Feature-local subsequence spanned by the range, when known.
    pub sequence: Option<String>,
}

impl Range {
    pub fn new(start: Position, end: Position) -> Self {
        Self {
            id: Uuid::new_v4(),
            start,
            end,
            sequence: None,
        }
    }

    /// Certain range covering `from..=to`.
    pub fn certain(from: i64, to: i64) -> Self {
        Self::new(Position::certain(from), Position::certain(to))
    }

    pub fn undetermined() -> Self {
        Self::new(Position::undetermined(), Position::undetermined())
    }

    pub fn is_undetermined(&self) -> bool {
        match (self.start.status, self.end.status) {
            (None, _) | (_, None) => true,
            (Some(PositionStatus::Undetermined), Some(PositionStatus::Undetermined)) => {
                self.start.min == 0 && self.start.max == 0 && self.end.min == 0 && self.end.max == 0
            }
            _ => false,
        }
    }

    /// Undetermined with zeroed bounds and no subsequence.
    pub fn is_canonical_undetermined(&self) -> bool {
        self.start == Position::undetermined()
            && self.end == Position::undetermined()
            && self.sequence.is_none()
    }

    /// Rewrites this range to the canonical undetermined state.
    pub fn set_undetermined(&mut self) {
        self.start = Position::undetermined();
        self.end = Position::undetermined();
        self.sequence = None;
    }

    /// Both endpoints follow sequence ends; no residue needs to be located.
    pub fn is_terminal_only(&self) -> bool {
        self.start.is_terminal() && self.end.is_terminal()
    }

    /// Residue span `first..=last` on a sequence of `length` residues.
    ///
    /// Terminal endpoints resolve against `length`; fuzzy endpoints widen to
    /// `start.min` and `end.max`.
    pub fn span(&self, length: usize) -> Result<(usize, usize), RangePositionError> {
        if self.is_undetermined() {
            return Err(RangePositionError::Undetermined);
        }
        self.validate()?;

        let last_residue = length as i64 - 1;
        let first = if self.start.status == Some(PositionStatus::NTerminal) {
            0
        } else {
            self.start.min
        };
        let last = if self.end.status == Some(PositionStatus::CTerminal) {
            last_residue
        } else {
            self.end.max
        };

        if length == 0 || last > last_residue || first > last_residue {
            return Err(RangePositionError::BeyondSequence {
                bound: last.max(first),
                length,
            });
        }
        if first > last {
            return Err(RangePositionError::OutOfOrder(self.position_string()));
        }

        Ok((first as usize, last as usize))
    }

    /// Checks bound ordering independent of any sequence.
    pub fn validate(&self) -> Result<(), RangePositionError> {
        if self.is_undetermined() {
            return Ok(());
        }

        let positional = |position: &Position| {
            !matches!(
                position.status,
                Some(PositionStatus::NTerminal | PositionStatus::CTerminal)
            )
        };

        for position in [&self.start, &self.end] {
            match position.status {
                Some(PositionStatus::Undetermined) => {
                    return Err(RangePositionError::UndeterminedEndpoint(
                        self.position_string(),
                    ))
                }
                Some(PositionStatus::Certain) if position.min != position.max => {
                    return Err(RangePositionError::WidenedCertain(self.position_string()))
                }
                _ => {}
            }
        }
        for bound in [self.start.min, self.start.max, self.end.min, self.end.max] {
            if bound < 0 {
                return Err(RangePositionError::NegativeBound(bound));
            }
        }
        if self.start.min > self.start.max || self.end.min > self.end.max {
            return Err(RangePositionError::OutOfOrder(self.position_string()));
        }
        if positional(&self.start) && positional(&self.end) && self.start.max > self.end.min {
            return Err(RangePositionError::OutOfOrder(self.position_string()));
        }

        Ok(())
    }

    /// Textual form `start-end`, e.g. `3-7`, `2..4-9`, `n-c`, `?-?`.
    pub fn position_string(&self) -> String {
        format!("{}-{}", self.start.to_text(), self.end.to_text())
    }

    /// Parses the textual form produced by [`Range::position_string`].
    pub fn parse_positions(text: &str) -> Result<(Position, Position), RangePositionError> {
        let trimmed = text.trim();
        let (start, end) = trimmed
            .split_once('-')
            .ok_or_else(|| RangePositionError::Unparseable(trimmed.to_string()))?;
        Ok((parse_side(start, trimmed)?, parse_side(end, trimmed)?))
    }
}

fn parse_side(side: &str, whole: &str) -> Result<Position, RangePositionError> {
    let unparseable = || RangePositionError::Unparseable(whole.to_string());
    let lowered = side.trim().to_ascii_lowercase();
    let captures = POSITION_SIDE.captures(&lowered).ok_or_else(unparseable)?;

    let number = |name: &str| -> Result<Option<i64>, RangePositionError> {
        captures
            .name(name)
            .map(|m| m.as_str().parse::<i64>().map_err(|_| unparseable()))
            .transpose()
    };

    if captures.name("unknown").is_some() {
        return Ok(Position::undetermined());
    }
    if captures.name("nterm").is_some() {
        return Ok(Position::with_status(PositionStatus::NTerminal, 0, 0));
    }
    if captures.name("cterm").is_some() {
        return Ok(Position::with_status(PositionStatus::CTerminal, 0, 0));
    }
    if let Some(cmp) = captures.name("cmp") {
        let bound = number("bound")?.ok_or_else(unparseable)?;
        let status = if cmp.as_str() == "<" {
            PositionStatus::LessThan
        } else {
            PositionStatus::GreaterThan
        };
        return Ok(Position::with_status(status, bound, bound));
    }

    let min = number("min")?.ok_or_else(unparseable)?;
    match number("max")? {
        Some(max) => Ok(Position::fuzzy(min, max)),
        None => Ok(Position::certain(min)),
    }
}

#[cfg(test)]
mod tests {
    use super::{Position, PositionStatus, Range, RangePositionError};

    #[test]
    fn null_status_makes_range_undetermined() {
        let range = Range::new(
            Position {
                status: None,
                min: 3,
                max: 3,
            },
            Position::certain(5),
        );
        assert!(range.is_undetermined());
    }

    #[test]
    fn undetermined_status_with_nonzero_bounds_is_not_undetermined() {
        let range = Range::new(
            Position::with_status(PositionStatus::Undetermined, 2, 2),
            Position::with_status(PositionStatus::Undetermined, 4, 4),
        );
        assert!(!range.is_undetermined());
    }

    #[test]
    fn set_undetermined_zeroes_all_bounds() {
        let mut range = Range::certain(4, 9);
        range.sequence = Some("ABCDEF".to_string());
        range.set_undetermined();

        assert!(range.is_undetermined());
        assert_eq!(range.start, Position::undetermined());
        assert_eq!(range.end, Position::undetermined());
        assert!(range.sequence.is_none());
    }

    #[test]
    fn position_string_parses_back() {
        let fuzzy = Range::new(Position::fuzzy(2, 4), Position::certain(9));
        assert_eq!(fuzzy.position_string(), "2..4-9");
        assert_eq!(
            Range::parse_positions("2..4-9").unwrap(),
            (fuzzy.start, fuzzy.end)
        );

        let (start, end) = Range::parse_positions("n-c").unwrap();
        assert_eq!(start.status, Some(PositionStatus::NTerminal));
        assert_eq!(end.status, Some(PositionStatus::CTerminal));

        let (start, end) = Range::parse_positions("<3->7").unwrap();
        assert_eq!(start, Position::with_status(PositionStatus::LessThan, 3, 3));
        assert_eq!(end, Position::with_status(PositionStatus::GreaterThan, 7, 7));
    }

    #[test]
    fn position_sides_parse_case_insensitively() {
        let (start, end) = Range::parse_positions(" N - C ").unwrap();
        assert_eq!(start.status, Some(PositionStatus::NTerminal));
        assert_eq!(end.status, Some(PositionStatus::CTerminal));
    }

    #[test]
    fn malformed_position_string_is_rejected() {
        let err = Range::parse_positions("abc").unwrap_err();
        assert!(matches!(err, RangePositionError::Unparseable(_)));
        assert!(Range::parse_positions("3..x-5").is_err());
    }

    #[test]
    fn span_resolves_terminal_endpoints() {
        let range = Range::new(
            Position::with_status(PositionStatus::NTerminal, 0, 0),
            Position::with_status(PositionStatus::CTerminal, 0, 0),
        );
        assert_eq!(range.span(6).unwrap(), (0, 5));
    }

    #[test]
    fn span_rejects_bounds_beyond_sequence() {
        let err = Range::certain(2, 8).span(5).unwrap_err();
        assert_eq!(
            err,
            RangePositionError::BeyondSequence {
                bound: 8,
                length: 5
            }
        );
    }

    #[test]
    fn lone_undetermined_endpoint_is_rejected() {
        let range = Range::new(Position::undetermined(), Position::certain(3));
        assert!(!range.is_undetermined());
        assert!(matches!(
            range.validate().unwrap_err(),
            RangePositionError::UndeterminedEndpoint(_)
        ));
        assert!(range.span(10).is_err());
    }

    #[test]
    fn certain_endpoint_must_be_a_single_residue() {
        let range = Range::new(Position::with_status(PositionStatus::Certain, 2, 4), Position::certain(9));
        assert!(matches!(
            range.validate().unwrap_err(),
            RangePositionError::WidenedCertain(_)
        ));

        let fuzzy = Range::new(Position::fuzzy(2, 4), Position::certain(9));
        assert!(fuzzy.validate().is_ok());
    }

    #[test]
    fn canonical_undetermined_requires_zeroed_bounds() {
        let mut range = Range::new(
            Position {
                status: None,
                min: 2,
                max: 2,
            },
            Position::certain(3),
        );
        assert!(range.is_undetermined());
        assert!(!range.is_canonical_undetermined());

        range.set_undetermined();
        assert!(range.is_canonical_undetermined());
    }

    #[test]
    fn validate_rejects_start_after_end() {
        let err = Range::certain(7, 3).validate().unwrap_err();
        assert!(matches!(err, RangePositionError::OutOfOrder(_)));
    }
}

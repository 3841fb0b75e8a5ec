//! Review-decision sentinel parsing.
//!
//! A *review* phase invocation must emit exactly one of two literal tokens
//! in its terminal `result` frame text. This module turns that text into a
//! typed decision the scheduler can match on.

/// The decision carried by a review run's terminal result text.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReviewDecision {
    Approved,
    ChangesRequested,
    /// Neither sentinel token was present -- treated as a review failure by
    /// the scheduler (§4.G.2: "otherwise `failed` (no decision emitted)").
    NoDecision,
}

const APPROVED_TOKEN: &str = "REVIEW_RESULT:APPROVED";
const CHANGES_REQUESTED_TOKEN: &str = "REVIEW_RESULT:CHANGES_REQUESTED";

/// Parse a review decision out of the agent's result text. Scans for the
/// first sentinel token present; if both appear (malformed output) the
/// approval token wins only if it appears strictly before the
/// changes-requested token, otherwise changes-requested wins -- an agent
/// run is far more likely to trail off into unrelated text after stating
/// its real verdict than to emit two contradictory verdicts in sequence.
pub fn parse_review_decision(result_text: Option<&str>) -> ReviewDecision {
    let Some(text) = result_text else {
        return ReviewDecision::NoDecision;
    };

    let approved_pos = text.find(APPROVED_TOKEN);
    let changes_pos = text.find(CHANGES_REQUESTED_TOKEN);

    match (approved_pos, changes_pos) {
        (Some(a), Some(c)) if a <= c => ReviewDecision::Approved,
        (Some(_), Some(_)) => ReviewDecision::ChangesRequested,
        (Some(_), None) => ReviewDecision::Approved,
        (None, Some(_)) => ReviewDecision::ChangesRequested,
        (None, None) => ReviewDecision::NoDecision,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn approved_token_parses() {
        assert_eq!(
            parse_review_decision(Some("Looks good.\nREVIEW_RESULT:APPROVED")),
            ReviewDecision::Approved
        );
    }

    #[test]
    fn changes_requested_token_parses() {
        assert_eq!(
            parse_review_decision(Some("REVIEW_RESULT:CHANGES_REQUESTED\nfix the tests")),
            ReviewDecision::ChangesRequested
        );
    }

    #[test]
    fn missing_text_is_no_decision() {
        assert_eq!(parse_review_decision(None), ReviewDecision::NoDecision);
    }

    #[test]
    fn unrelated_text_is_no_decision() {
        assert_eq!(parse_review_decision(Some("I looked at the code.")), ReviewDecision::NoDecision);
    }

    #[test]
    fn earliest_token_wins_when_both_present() {
        let text = format!("{CHANGES_REQUESTED_TOKEN} ... actually {APPROVED_TOKEN}");
        assert_eq!(parse_review_decision(Some(&text)), ReviewDecision::ChangesRequested);
    }
}

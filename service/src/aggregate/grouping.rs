//! Error message normalization.
//!
//! Raw upstream error messages embed block numbers, request ids and node
//! specific text. Messages are collapsed into a small set of groups so error
//! counts stay comparable across nodes.

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum PhraseMode {
    /// Group under the phrase itself.
    First,
    /// Matched with the second word removed; the message is discarded.
    CutMiddle,
    /// Envelope noise; the message is discarded.
    Second,
}

/// Known phrases, checked in order against the text before the first `:`.
const KNOWN_PHRASES: &[(&str, PhraseMode)] = &[
    ("missing trie node", PhraseMode::First),
    ("No state available for block", PhraseMode::First),
    ("Reverted", PhraseMode::First),
    ("Bad Gateway", PhraseMode::First),
    ("Service Unavailable", PhraseMode::First),
    ("Bad Request", PhraseMode::First),
    ("Not Found", PhraseMode::First),
    ("Not Allowed", PhraseMode::First),
    ("Gateway Time-out", PhraseMode::First),
    ("Internal Server Error", PhraseMode::First),
    ("Service Temporarily Unavailable", PhraseMode::First),
    ("the block height passed is invalid", PhraseMode::First),
    ("error", PhraseMode::First),
    ("Block could not be found", PhraseMode::CutMiddle),
    ("tx.origin is not authorized to deploy a contract", PhraseMode::CutMiddle),
    ("getdeletestateobject error", PhraseMode::CutMiddle),
    ("{\"response\"", PhraseMode::Second),
];

fn phrase_matches(phrase: &str, head: &str, mode: PhraseMode) -> bool {
    match mode {
        PhraseMode::CutMiddle => {
            let words: Vec<&str> = head.split(' ').collect();
            let mut kept = Vec::with_capacity(words.len());
            kept.extend(words.first().copied());
            kept.extend(words.iter().skip(2).copied());
            kept.join(" ").contains(phrase)
        }
        PhraseMode::First | PhraseMode::Second => head.contains(phrase),
    }
}

/// Normalized group for `message`, or `None` when it should not be counted.
pub fn normalize_error_message(message: &str) -> Option<String> {
    let cleaned: String = message
        .chars()
        .filter(|c| !c.is_ascii_digit())
        .collect::<String>()
        .to_lowercase();
    let head = cleaned.split(':').next().unwrap_or_default();
    for (phrase, mode) in KNOWN_PHRASES {
        let phrase = phrase.to_lowercase();
        if phrase_matches(&phrase, head, *mode) {
            return match mode {
                PhraseMode::First => Some(phrase),
                PhraseMode::CutMiddle | PhraseMode::Second => None,
            };
        }
    }
    Some(head.to_string())
}

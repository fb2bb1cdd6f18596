//! Yes/no sentiment classification for free-form generated text.
//!
//! No single heuristic survives the stylistic variety of generative output
//! (hedged answers, restated questions, markdown emphasis), so four
//! interchangeable strategies are provided. `Weighted` runs `Pattern` first
//! and only falls back to positional scoring when the anchored patterns are
//! inconclusive.

use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Vote {
    Yes,
    No,
    Unclear,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum VoteStrategy {
    Pattern,
    First,
    Count,
    Weighted,
}

// Scan windows, in characters. Each strategy only looks at the head of the
// text; verdicts buried deeper than this are treated as inconclusive.
const META_WINDOW: usize = 100;
const HEDGE_WINDOW: usize = 150;
const PATTERN_WINDOW: usize = 200;
const FIRST_WINDOW: usize = 150;
const COUNT_WINDOW: usize = 200;
const WEIGHTED_WINDOW: usize = 250;

// Weighted scoring constants. The bands and the minimum score are carried
// over verbatim from the proven tuning; the literal classification scenarios
// depend on them.
const EARLY_WINDOW: usize = 50;
const MID_WINDOW: usize = 150;
const SENTENCE_INITIAL_WEIGHT: u32 = 10;
const EARLY_WEIGHT: u32 = 5;
const MID_WEIGHT: u32 = 2;
const TAIL_WEIGHT: u32 = 1;
const WEIGHTED_MIN_SCORE: u32 = 5;

static PREFIX_CLEANUP: Lazy<Regex> = Lazy::new(|| {
    Regex::new(
        "^[\\s\u{200B}\u{A0}\u{FE0F}❌✅✓✗☑☒▶►•●○◆◇■□▪▫★☆→←↑↓✔✖❎❓❗⚠🔴🟢🟡⭐💡📌🎯✨💫🔥👍👎]+",
    )
    .expect("prefix cleanup pattern")
});

static WHITESPACE_RUN: Lazy<Regex> = Lazy::new(|| Regex::new(r"\s+").expect("whitespace pattern"));

fn compile(patterns: &[&str]) -> Vec<Regex> {
    patterns
        .iter()
        .map(|p| Regex::new(p).expect("vote pattern"))
        .collect()
}

static YES_PATTERNS: Lazy<Vec<Regex>> = Lazy::new(|| {
    compile(&[
        // Directly at the start.
        r"(?i)^ja[\s.,!\-–:;\n\r]",
        r"(?i)^yes[\s.,!\-–:;\n\r]",
        r"(?i)^jawohl[\s.,!\-–:;\n\r]",
        r"(?i)^absolut[\s.,!\-–:;\n\r]",
        r"(?i)^definitiv[\s.,!\-–:;\n\r]",
        r"(?i)^genau[\s.,!\-–:;\n\r]",
        r"(?i)^sicher[\s.,!\-–:;\n\r]",
        r"(?i)^selbstverst[aä]ndlich[\s.,!\-–:;\n\r]",
        // After a short label prefix ("Short answer: yes").
        r"(?i)^.{0,30}:\s*ja[\s.,!\-–:;\n\r]",
        r"(?i)^.{0,30}:\s*yes[\s.,!\-–:;\n\r]",
        // Bold / formatted.
        r"(?i)^\*\*ja\*\*",
        r"(?i)^\*\*yes\*\*",
        r"(?i)^__ja__",
        // Trailing colon ("Ja:").
        r"(?i)^ja:",
        r"(?i)^yes:",
    ])
});

static NO_PATTERNS: Lazy<Vec<Regex>> = Lazy::new(|| {
    compile(&[
        r"(?i)^nein[\s.,!\-–:;\n\r]",
        r"(?i)^no[\s.,!\-–:;\n\r]",
        r"(?i)^nicht[\s.,!\-–:;\n\r]",
        r"(?i)^keineswegs[\s.,!\-–:;\n\r]",
        r"(?i)^niemals[\s.,!\-–:;\n\r]",
        r"(?i)^auf keinen fall",
        r"(?i)^leider nein",
        r"(?i)^leider nicht",
        r"(?i)^.{0,30}:\s*nein[\s.,!\-–:;\n\r]",
        r"(?i)^.{0,30}:\s*no[\s.,!\-–:;\n\r]",
        r"(?i)^.{0,30}:\s*nicht[\s.,!\-–:;\n\r]",
        r"(?i)^\*\*nein\*\*",
        r"(?i)^\*\*no\*\*",
        r"(?i)^__nein__",
        r"(?i)^nein:",
        r"(?i)^no:",
    ])
});

// Hedging and clarifying-question openers. Any of these short-circuits the
// classification to Unclear before a strategy runs.
static HEDGE_PATTERNS: Lazy<Vec<Regex>> = Lazy::new(|| {
    compile(&[
        r"(?i)^k[oö]nntest du",
        r"(?i)^k[oö]nnten sie",
        r"(?i)^was meinst du",
        r"(?i)^was meinen sie",
        r"(?i)^worauf bezieht",
        r"(?i)^ich verstehe nicht",
        r"(?i)^ich bin mir nicht sicher",
        r"(?i)^das h[aä]ngt davon ab",
        r"(?i)^das kommt darauf an",
        r"(?i)^es kommt darauf an",
        r"(?i)^bitte pr[aä]zisieren",
        r"(?i)^kannst du genauer",
        r"(?i)^k[oö]nnen sie genauer",
        r"(?i)^was genau meinst",
        r"(?i)^ich brauche mehr",
        r"(?i)^mehr kontext",
        r"(?i)^um .{0,30} zu beantworten",
        r"(?i)^diese frage",
        r"(?i)^sowohl .{0,20} als auch",
        r"(?i)^einerseits .{0,30} andererseits",
        r"(?i)^jein",
        r"(?i)^vielleicht",
        r"(?i)^m[oö]glicherweise",
        r"(?i)^unter umst[aä]nden",
        r"(?i)^teils.{0,5}teils",
        r"(?i)^it depends",
        r"(?i)^that depends",
        r"(?i)^could you clarify",
        r"(?i)^i'?m not sure",
        r"(?i)^i am not sure",
        r"(?i)^perhaps",
        r"(?i)^maybe",
    ])
});

// Ranking/comparison/meta discussion about multiple answers. Such text talks
// about yes/no answers rather than giving one.
static META_PATTERNS: Lazy<Vec<Regex>> = Lazy::new(|| {
    compile(&[
        r"(?i)rangliste",
        r"(?i)ranking",
        r"(?i)bewertung",
        r"(?i)vergleich",
        r"(?i)comparison",
        r"^1\.\s",
        r"^#1",
        r"(?i)platz\s*\d",
        r"(?i)beste antwort",
        r"(?i)best answer",
        r"(?i)qualit[aä]t",
        r"(?i)alle antworten",
        r"(?i)beide antworten",
    ])
});

const YES_WORDS: &[&str] = &[
    "ja",
    "yes",
    "jawohl",
    "genau",
    "richtig",
    "korrekt",
    "stimmt",
    "absolut",
    "definitiv",
    "sicher",
    "natürlich",
];

const NO_WORDS: &[&str] = &[
    "nein",
    "no",
    "nicht",
    "falsch",
    "incorrect",
    "wrong",
    "keineswegs",
    "niemals",
];

fn word_alternation(words: &[&str]) -> String {
    format!(r"(?i)\b({})\b", words.join("|"))
}

static YES_WORD_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(&word_alternation(YES_WORDS)).expect("yes words"));
static NO_WORD_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(&word_alternation(NO_WORDS)).expect("no words"));

static YES_COUNT_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?i)\b(ja|yes|jawohl)\b").expect("yes count"));
static NO_COUNT_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?i)\b(nein|no|nicht)\b").expect("no count"));

static YES_FIRST_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?i)(?:^|[.!?]\s*)(ja|yes|jawohl|genau|absolut|definitiv)[\s.,!\-–:;\n\r]")
        .expect("yes first")
});
static NO_FIRST_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?i)(?:^|[.!?]\s*)(nein|no|nicht|keineswegs|niemals)[\s.,!\-–:;\n\r]")
        .expect("no first")
});

static SENTENCE_TAIL: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"[.!?\n]\s*$").expect("sentence tail"));

/// Strip leading decorative symbols, collapse whitespace runs, trim.
fn clean_text(text: &str) -> String {
    let stripped = PREFIX_CLEANUP.replace(text, "");
    WHITESPACE_RUN.replace_all(&stripped, " ").trim().to_string()
}

/// Head of `text`, at most `chars` characters, on a char boundary.
fn window(text: &str, chars: usize) -> &str {
    match text.char_indices().nth(chars) {
        Some((idx, _)) => &text[..idx],
        None => text,
    }
}

fn is_meta(lower: &str) -> bool {
    let start = window(lower, META_WINDOW);
    META_PATTERNS.iter().any(|p| p.is_match(start))
}

fn is_hedged(lower: &str) -> bool {
    let start = window(lower, HEDGE_WINDOW);
    HEDGE_PATTERNS.iter().any(|p| p.is_match(start))
}

fn pattern_vote(lower: &str) -> Vote {
    let start = window(lower, PATTERN_WINDOW);
    let yes = YES_PATTERNS.iter().any(|p| p.is_match(start));
    let no = NO_PATTERNS.iter().any(|p| p.is_match(start));
    match (yes, no) {
        (true, false) => Vote::Yes,
        (false, true) => Vote::No,
        _ => Vote::Unclear,
    }
}

fn first_vote(lower: &str) -> Vote {
    let start = window(lower, FIRST_WINDOW);
    let yes = YES_FIRST_RE.find(start);
    let no = NO_FIRST_RE.find(start);
    match (yes, no) {
        (None, None) => Vote::Unclear,
        (Some(_), None) => Vote::Yes,
        (None, Some(_)) => Vote::No,
        (Some(y), Some(n)) => {
            if y.start() < n.start() {
                Vote::Yes
            } else if n.start() < y.start() {
                Vote::No
            } else {
                // Distinct words cannot share an offset; handled anyway.
                Vote::Unclear
            }
        }
    }
}

fn count_vote(lower: &str) -> Vote {
    let start = window(lower, COUNT_WINDOW);
    let yes = YES_COUNT_RE.find_iter(start).count();
    let no = NO_COUNT_RE.find_iter(start).count();
    if yes > no {
        Vote::Yes
    } else if no > yes {
        Vote::No
    } else {
        Vote::Unclear
    }
}

/// Position weight of a vocabulary hit: sentence-initial hits near the start
/// count for much more than passing mentions later in the text.
fn position_weight(start: &str, byte_pos: usize) -> u32 {
    let char_pos = start[..byte_pos].chars().count();
    let before = &start[..byte_pos];
    let tail_from = before
        .char_indices()
        .rev()
        .nth(4)
        .map(|(i, _)| i)
        .unwrap_or(0);
    let sentence_initial = SENTENCE_TAIL.is_match(&before[tail_from..]) || char_pos < 3;
    if sentence_initial && char_pos < EARLY_WINDOW {
        SENTENCE_INITIAL_WEIGHT
    } else if char_pos < EARLY_WINDOW {
        EARLY_WEIGHT
    } else if char_pos < MID_WINDOW {
        MID_WEIGHT
    } else {
        TAIL_WEIGHT
    }
}

fn weighted_vote(lower: &str) -> Vote {
    let start = window(lower, WEIGHTED_WINDOW);
    let yes_score: u32 = YES_WORD_RE
        .find_iter(start)
        .map(|m| position_weight(start, m.start()))
        .sum();
    let no_score: u32 = NO_WORD_RE
        .find_iter(start)
        .map(|m| position_weight(start, m.start()))
        .sum();

    if yes_score == 0 && no_score == 0 {
        return Vote::Unclear;
    }
    if yes_score >= WEIGHTED_MIN_SCORE && yes_score > no_score {
        Vote::Yes
    } else if no_score >= WEIGHTED_MIN_SCORE && no_score > yes_score {
        Vote::No
    } else {
        Vote::Unclear
    }
}

/// Classify a block of free text as yes/no/unclear with respect to an
/// implicit yes/no question. Pure function of `(text, strategy)`.
pub fn classify(text: &str, strategy: VoteStrategy) -> Vote {
    let lower = clean_text(text).to_lowercase();

    if is_meta(&lower) || is_hedged(&lower) {
        return Vote::Unclear;
    }

    match strategy {
        VoteStrategy::Pattern => pattern_vote(&lower),
        VoteStrategy::First => first_vote(&lower),
        VoteStrategy::Count => count_vote(&lower),
        VoteStrategy::Weighted => match pattern_vote(&lower) {
            Vote::Unclear => weighted_vote(&lower),
            decided => decided,
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pattern_detects_yes() {
        assert_eq!(classify("Ja, das stimmt.", VoteStrategy::Pattern), Vote::Yes);
        assert_eq!(classify("Yes absolutely.", VoteStrategy::Pattern), Vote::Yes);
        assert_eq!(classify("Absolut richtig.", VoteStrategy::Pattern), Vote::Yes);
    }

    #[test]
    fn pattern_detects_no() {
        assert_eq!(classify("Nein, das ist falsch.", VoteStrategy::Pattern), Vote::No);
        assert_eq!(classify("No, incorrect.", VoteStrategy::Pattern), Vote::No);
        assert_eq!(classify("Keineswegs.", VoteStrategy::Pattern), Vote::No);
    }

    #[test]
    fn pattern_unclear_when_unsure() {
        assert_eq!(
            classify("Das weiß ich nicht genau.", VoteStrategy::Pattern),
            Vote::Unclear
        );
    }

    #[test]
    fn first_strategy_prefers_earliest_occurrence() {
        assert_eq!(classify("Ja, aber nein.", VoteStrategy::First), Vote::Yes);
        assert_eq!(classify("Nein, obwohl ja.", VoteStrategy::First), Vote::No);
    }

    #[test]
    fn count_strategy_majority_and_tie() {
        assert_eq!(classify("Ja ja ja. Nein.", VoteStrategy::Count), Vote::Yes);
        assert_eq!(classify("Nein nein. Ja.", VoteStrategy::Count), Vote::No);
        assert_eq!(classify("Ja. Nein.", VoteStrategy::Count), Vote::Unclear);
    }

    #[test]
    fn count_tie_law_holds_for_nonzero_ties() {
        assert_eq!(
            classify("Ja und nein, ja oder nein.", VoteStrategy::Count),
            Vote::Unclear
        );
        assert_eq!(classify("Ganz ohne klare Worte.", VoteStrategy::Count), Vote::Unclear);
    }

    #[test]
    fn weighted_prefers_sentence_initial_verdict() {
        assert_eq!(
            classify("Ja. Das ist ein langer Text mit nein später.", VoteStrategy::Weighted),
            Vote::Yes
        );
        assert_eq!(
            classify("Nein. Auch wenn da ja steht.", VoteStrategy::Weighted),
            Vote::No
        );
    }

    #[test]
    fn weighted_agrees_with_pattern_when_pattern_decides() {
        let texts = [
            "Ja, das stimmt.",
            "Nein, das ist falsch.",
            "Yes absolutely.",
            "**Nein** auf ganzer Linie.",
        ];
        for text in texts {
            let p = classify(text, VoteStrategy::Pattern);
            if p != Vote::Unclear {
                assert_eq!(classify(text, VoteStrategy::Weighted), p, "text: {text}");
            }
        }
    }

    #[test]
    fn hedged_answers_are_unclear() {
        assert_eq!(classify("Das kommt darauf an.", VoteStrategy::Weighted), Vote::Unclear);
        assert_eq!(
            classify("Ich bin mir nicht sicher.", VoteStrategy::Weighted),
            Vote::Unclear
        );
        assert_eq!(
            classify("Könntest du das präzisieren?", VoteStrategy::Weighted),
            Vote::Unclear
        );
        assert_eq!(classify("It depends on context.", VoteStrategy::Weighted), Vote::Unclear);
    }

    #[test]
    fn meta_statements_win_over_strong_vocabulary() {
        for strategy in [
            VoteStrategy::Pattern,
            VoteStrategy::First,
            VoteStrategy::Count,
            VoteStrategy::Weighted,
        ] {
            assert_eq!(
                classify("Here is a ranking. 1. Yes is best.", strategy),
                Vote::Unclear,
                "strategy: {strategy:?}"
            );
        }
        assert_eq!(
            classify("Hier ist ein Vergleich der Antworten.", VoteStrategy::Weighted),
            Vote::Unclear
        );
        assert_eq!(classify("Platz 1: ...", VoteStrategy::Weighted), Vote::Unclear);
    }

    #[test]
    fn leading_symbols_are_stripped() {
        assert_eq!(classify("✅ Ja, das stimmt.", VoteStrategy::Pattern), Vote::Yes);
        assert_eq!(classify("❌ Nein, falsch.", VoteStrategy::Pattern), Vote::No);
    }

    #[test]
    fn classification_is_idempotent() {
        let text = "Ja, aber mit Einschränkungen. Nein bei Regen.";
        for strategy in [
            VoteStrategy::Pattern,
            VoteStrategy::First,
            VoteStrategy::Count,
            VoteStrategy::Weighted,
        ] {
            assert_eq!(classify(text, strategy), classify(text, strategy));
        }
    }
}

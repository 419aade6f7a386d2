//! Scans free text (a session transcript, a standup note) for sentences that
//! read like a learning, and proposes memories a caller can choose to save.
//! Entirely heuristic and entirely optional — nothing else in the crate
//! depends on it.

use std::collections::HashSet;
use std::sync::OnceLock;

use regex::Regex;

use crate::chunker::split_sentences;
use crate::config::CortexPaths;
use crate::embedding::Embedder;
use crate::error::Result;
use crate::memory::{self, NewMemory};

#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord)]
pub enum Confidence {
    Low,
    Medium,
    High,
}

impl Confidence {
    fn as_str(&self) -> &'static str {
        match self {
            Confidence::Low => "low",
            Confidence::Medium => "medium",
            Confidence::High => "high",
        }
    }

    fn parse(s: &str) -> Option<Self> {
        match s {
            "low" => Some(Confidence::Low),
            "medium" => Some(Confidence::Medium),
            "high" => Some(Confidence::High),
            _ => None,
        }
    }
}

#[derive(Debug, Clone)]
pub struct ProposedMemory {
    pub learning: String,
    pub context: String,
    pub memory_type: &'static str,
    pub confidence: &'static str,
    pub domain: String,
    pub trigger: &'static str,
    pub source_text: String,
}

struct Pattern {
    groups: usize,
    memory_type: &'static str,
    confidence: Confidence,
    trigger: &'static str,
    regex_src: &'static str,
}

fn extraction_patterns() -> &'static [Pattern] {
    static PATTERNS: OnceLock<Vec<Pattern>> = OnceLock::new();
    PATTERNS.get_or_init(|| {
        vec![
            Pattern {
                groups: 1,
                memory_type: "experiential",
                confidence: Confidence::High,
                trigger: "verified_fix",
                regex_src: r"(?mi)(?:fixed|solved|resolved)\s+(?:by|with|using)\s+(.+?)(?:\.|$)",
            },
            Pattern {
                groups: 1,
                memory_type: "experiential",
                confidence: Confidence::High,
                trigger: "issue_resolution",
                regex_src: r"(?mi)the\s+(?:issue|problem|bug)\s+was\s+(.+?)(?:\.|$)",
            },
            Pattern {
                groups: 1,
                memory_type: "experiential",
                confidence: Confidence::High,
                trigger: "explicit_remember",
                regex_src: r"(?mi)(?:remember|note|important):\s*(.+?)(?:\.|$)",
            },
            Pattern {
                groups: 1,
                memory_type: "experiential",
                confidence: Confidence::Medium,
                trigger: "discovery",
                regex_src: r"(?mi)(?:found|discovered|learned)\s+that\s+(.+?)(?:\.|$)",
            },
            Pattern {
                groups: 1,
                memory_type: "experiential",
                confidence: Confidence::Medium,
                trigger: "realization",
                regex_src: r"(?mi)(?:turns out|it appears|apparently)\s+(.+?)(?:\.|$)",
            },
            Pattern {
                groups: 1,
                memory_type: "factual",
                confidence: Confidence::Medium,
                trigger: "requirement",
                regex_src: r"(?mi)(?:this|that)\s+(?:requires?|needs?)\s+(.+?)(?:\.|$)",
            },
            Pattern {
                groups: 1,
                memory_type: "procedural",
                confidence: Confidence::Medium,
                trigger: "rule",
                regex_src: r"(?mi)(?:always|never|must|should)\s+(.+?)(?:\.|$)",
            },
            Pattern {
                groups: 2,
                memory_type: "procedural",
                confidence: Confidence::Medium,
                trigger: "procedure",
                regex_src: r"(?mi)(?:to|in order to)\s+(.+?),?\s+(?:you need to|we need to|must)\s+(.+?)(?:\.|$)",
            },
            Pattern {
                groups: 2,
                memory_type: "procedural",
                confidence: Confidence::Medium,
                trigger: "sequence",
                regex_src: r"(?mi)(?:before|after)\s+(.+?),?\s+(?:make sure|ensure|verify)\s+(.+?)(?:\.|$)",
            },
            Pattern {
                groups: 2,
                memory_type: "factual",
                confidence: Confidence::Low,
                trigger: "fact",
                regex_src: r"(?mi)(.+?)\s+(?:uses?|expects?|requires?)\s+(.+?)(?:\.|$)",
            },
            Pattern {
                groups: 2,
                memory_type: "factual",
                confidence: Confidence::Low,
                trigger: "location",
                regex_src: r"(?mi)(.+?)\s+is\s+(?:located|stored|found)\s+(?:in|at)\s+(.+?)(?:\.|$)",
            },
        ]
    })
}

fn pattern_regex(pattern: &Pattern) -> Regex {
    Regex::new(pattern.regex_src).expect("extraction pattern is a fixed, valid regex")
}

const DOMAIN_PATTERNS: &[(&str, &str)] = &[
    (
        "AUTH",
        r"\b(?:auth|login|logout|session|token|password|credential|oauth|jwt)\b",
    ),
    (
        "UI",
        r"\b(?:component|button|form|input|modal|dialog|ui|ux|style|css|layout)\b",
    ),
    (
        "API",
        r"\b(?:api|endpoint|request|response|rest|graphql|fetch|axios)\b",
    ),
    (
        "DB",
        r"\b(?:database|query|sql|mongodb|postgres|mysql|schema|migration)\b",
    ),
    (
        "TEST",
        r"\b(?:test|spec|jest|pytest|unittest|mock|fixture|assert)\b",
    ),
    (
        "DEV",
        r"\b(?:build|deploy|ci|cd|docker|kubernetes|git|npm|pip)\b",
    ),
];

fn domain_regexes() -> &'static [(&'static str, Regex)] {
    static RES: OnceLock<Vec<(&'static str, Regex)>> = OnceLock::new();
    RES.get_or_init(|| {
        DOMAIN_PATTERNS
            .iter()
            .map(|(domain, pattern)| {
                let re = Regex::new(&format!("(?i){pattern}")).unwrap();
                (*domain, re)
            })
            .collect()
    })
}

/// Pick the domain whose keyword bucket matches most often; `GENERAL` if
/// nothing matches at all.
pub fn detect_domain(text: &str) -> String {
    let mut best: Option<(&str, usize)> = None;
    for (domain, re) in domain_regexes() {
        let count = re.find_iter(text).count();
        if count > 0 && best.map(|(_, best_count)| count > best_count).unwrap_or(true) {
            best = Some((domain, count));
        }
    }
    best.map(|(domain, _)| domain.to_string())
        .unwrap_or_else(|| "GENERAL".to_string())
}

/// Collapse whitespace, trim surrounding punctuation, and capitalize the
/// first letter.
fn clean_extracted_text(text: &str) -> String {
    let collapsed = text.split_whitespace().collect::<Vec<_>>().join(" ");
    let trimmed = collapsed.trim_matches(|c: char| ".,;:!? ".contains(c));
    let mut chars = trimmed.chars();
    match chars.next() {
        Some(first) => first.to_uppercase().collect::<String>() + chars.as_str(),
        None => String::new(),
    }
}

fn find_context(text: &str, sentences: &[String], match_pos: usize) -> String {
    let mut char_count = 0usize;
    for (idx, sentence) in sentences.iter().enumerate() {
        let Some(rel_start) = text[char_count..].find(sentence.as_str()) else {
            continue;
        };
        let sent_start = char_count + rel_start;
        let sent_end = sent_start + sentence.len();
        if sent_start <= match_pos && match_pos <= sent_end {
            let mut parts = Vec::new();
            if idx > 0 {
                parts.push(sentences[idx - 1].trim());
            }
            parts.push(sentence.trim());
            if idx + 1 < sentences.len() {
                parts.push(sentences[idx + 1].trim());
            }
            return parts.join(" ");
        }
        char_count = sent_end;
    }
    String::new()
}

/// Run every extraction pattern over `text` and return the proposed
/// memories whose confidence is at or above `min_confidence`, sorted
/// highest-confidence first. Duplicate learnings (case-insensitive) are
/// collapsed to their first occurrence.
pub fn extract_memories(text: &str, min_confidence: &str) -> Vec<ProposedMemory> {
    let min_confidence = Confidence::parse(min_confidence).unwrap_or(Confidence::Low);
    let sentences = split_sentences(text);

    let mut proposed = Vec::new();
    let mut seen: HashSet<String> = HashSet::new();

    for pattern in extraction_patterns() {
        if pattern.confidence < min_confidence {
            continue;
        }
        let re = pattern_regex(pattern);

        for caps in re.captures_iter(text) {
            let whole = caps.get(0).unwrap();
            let learning = match pattern.groups {
                1 => clean_extracted_text(caps.get(1).map(|m| m.as_str()).unwrap_or("")),
                2 => clean_extracted_text(&format!(
                    "{} - {}",
                    caps.get(1).map(|m| m.as_str()).unwrap_or(""),
                    caps.get(2).map(|m| m.as_str()).unwrap_or("")
                )),
                _ => clean_extracted_text(whole.as_str()),
            };

            if learning.chars().count() < 10 || seen.contains(&learning.to_lowercase()) {
                continue;
            }
            seen.insert(learning.to_lowercase());

            let context = find_context(text, &sentences, whole.start());
            let context: String = context.chars().take(500).collect();
            let domain = detect_domain(&format!("{learning} {context}"));
            let source_text: String = whole.as_str().chars().take(200).collect();

            proposed.push(ProposedMemory {
                learning,
                context,
                memory_type: pattern.memory_type,
                confidence: pattern.confidence.as_str(),
                domain,
                trigger: pattern.trigger,
                source_text,
            });
        }
    }

    proposed.sort_by(|a, b| {
        let a_rank = Confidence::parse(a.confidence).unwrap_or(Confidence::Low);
        let b_rank = Confidence::parse(b.confidence).unwrap_or(Confidence::Low);
        b_rank.cmp(&a_rank)
    });
    proposed
}

/// Human-readable listing of every proposed memory, 1-indexed for use with
/// [`save_proposed_memories`].
pub fn extract_and_format(text: &str, min_confidence: &str) -> String {
    let proposed = extract_memories(text, min_confidence);
    if proposed.is_empty() {
        return "No potential memories detected.".to_string();
    }

    let mut lines = vec![format!("Found {} potential memories:\n", proposed.len())];
    for (i, mem) in proposed.iter().enumerate() {
        let conf_icon = match mem.confidence {
            "high" => "[H]",
            "medium" => "[M]",
            _ => "[L]",
        };
        let type_icon = match mem.memory_type {
            "factual" => "F",
            "experiential" => "E",
            "procedural" => "P",
            _ => "?",
        };
        lines.push(format!("{}. {conf_icon} [{type_icon}] {}", i + 1, mem.domain));
        lines.push(format!("   Learning: {}", mem.learning));
        if !mem.context.is_empty() {
            let preview: String = if mem.context.chars().count() > 100 {
                let truncated: String = mem.context.chars().take(100).collect();
                format!("{truncated}...")
            } else {
                mem.context.clone()
            };
            lines.push(format!("   Context: {preview}"));
        }
        lines.push(format!("   Trigger: {}", mem.trigger));
        lines.push(String::new());
    }
    lines.join("\n")
}

/// Persist the proposals at the given 1-based `indices` as memories,
/// returning the ids assigned. Out-of-range indices are skipped.
pub fn save_proposed_memories(
    paths: &CortexPaths,
    embedder: &dyn Embedder,
    proposed: &[ProposedMemory],
    indices: &[usize],
    source_session: Option<&str>,
) -> Result<Vec<String>> {
    let mut created_ids = Vec::new();
    for &idx in indices {
        if idx == 0 || idx > proposed.len() {
            continue;
        }
        let mem = &proposed[idx - 1];
        let created = memory::create(
            paths,
            embedder,
            NewMemory {
                learning: &mem.learning,
                context: &mem.context,
                memory_type: mem.memory_type,
                domain: &mem.domain,
                confidence: mem.confidence,
                source_session,
                source_task: None,
                trigger: Some(mem.trigger),
            },
        )?;
        created_ids.push(created.id);
    }
    Ok(created_ids)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::embedding::test_support::StubEmbedder;
    use tempfile::TempDir;

    #[test]
    fn extracts_high_confidence_verified_fix() {
        let text = "We fixed the login timeout by increasing the token expiry to 30 minutes.";
        let proposed = extract_memories(text, "low");
        assert!(proposed
            .iter()
            .any(|m| m.trigger == "verified_fix" && m.confidence == "high"));
    }

    #[test]
    fn min_confidence_filters_out_lower_tiers() {
        let text = "The button uses a custom icon font.";
        let low = extract_memories(text, "low");
        let high = extract_memories(text, "high");
        assert!(!low.is_empty());
        assert!(high.is_empty());
    }

    #[test]
    fn duplicate_learnings_are_collapsed() {
        let text = "Remember: always pool database connections. Remember: always pool database connections.";
        let proposed = extract_memories(text, "low");
        let count = proposed
            .iter()
            .filter(|m| m.learning.to_lowercase().contains("pool database connections"))
            .count();
        assert_eq!(count, 1);
    }

    #[test]
    fn detect_domain_matches_auth_keywords() {
        assert_eq!(detect_domain("the login session token expired"), "AUTH");
        assert_eq!(detect_domain("nothing keyword related here"), "GENERAL");
    }

    #[test]
    fn save_proposed_memories_skips_out_of_range_indices() {
        let dir = TempDir::new().unwrap();
        let paths = CortexPaths::new(dir.path());
        std::fs::create_dir_all(paths.memories_dir()).unwrap();
        let embedder = StubEmbedder::new(16);

        let proposed = vec![ProposedMemory {
            learning: "Tokens expire after thirty minutes".to_string(),
            context: "Found while debugging the login flow".to_string(),
            memory_type: "experiential",
            confidence: "high",
            domain: "AUTH".to_string(),
            trigger: "verified_fix",
            source_text: "fixed by increasing expiry".to_string(),
        }];

        let ids = save_proposed_memories(&paths, &embedder, &proposed, &[1, 5, 0], None).unwrap();
        assert_eq!(ids.len(), 1);
    }
}

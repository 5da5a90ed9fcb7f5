//! Topic pattern matching
//!
//! Binding patterns are dot-separated words where `*` matches exactly one
//! word and `#` matches zero or more words. Patterns are tokenized once at
//! bind time and matched segment by segment against routing keys.

use std::fmt;

use serde::{Deserialize, Deserializer, Serialize, Serializer};

use crate::error::BrokerError;

/// A single token of a topic pattern
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PatternSegment {
    /// Literal word, matched exactly
    Word(String),
    /// `*` - exactly one word
    AnyWord,
    /// `#` - zero or more words
    AnyWords,
}

/// A tokenized topic binding pattern
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TopicPattern {
    source: String,
    segments: Vec<PatternSegment>,
}

impl TopicPattern {
    /// Tokenize a pattern such as `run.#` or `activity.*.end`
    pub fn parse(pattern: &str) -> Result<Self, BrokerError> {
        if pattern.is_empty() {
            return Err(BrokerError::InvalidPattern {
                pattern: pattern.to_string(),
                reason: "pattern is empty".to_string(),
            });
        }

        let segments = pattern
            .split('.')
            .map(|word| match word {
                "*" => PatternSegment::AnyWord,
                "#" => PatternSegment::AnyWords,
                literal => PatternSegment::Word(literal.to_string()),
            })
            .collect();

        Ok(Self {
            source: pattern.to_string(),
            segments,
        })
    }

    /// The pattern as it was declared
    pub fn as_str(&self) -> &str {
        &self.source
    }

    /// Test a routing key against the pattern
    pub fn matches(&self, routing_key: &str) -> bool {
        let words: Vec<&str> = routing_key.split('.').collect();
        match_segments(&self.segments, &words)
    }
}

fn match_segments(segments: &[PatternSegment], words: &[&str]) -> bool {
    match segments.split_first() {
        None => words.is_empty(),
        Some((PatternSegment::AnyWords, rest)) => {
            if rest.is_empty() {
                return true;
            }
            (0..=words.len()).any(|skip| match_segments(rest, &words[skip..]))
        }
        Some((PatternSegment::AnyWord, rest)) => {
            !words.is_empty() && match_segments(rest, &words[1..])
        }
        Some((PatternSegment::Word(word), rest)) => {
            words.first().is_some_and(|w| w == word) && match_segments(rest, &words[1..])
        }
    }
}

impl fmt::Display for TopicPattern {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.source)
    }
}

impl Serialize for TopicPattern {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.source)
    }
}

impl<'de> Deserialize<'de> for TopicPattern {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let source = String::deserialize(deserializer)?;
        TopicPattern::parse(&source).map_err(serde::de::Error::custom)
    }
}

//! Conversation analysis for contact memory
//!
//! [`KeywordAnalyzer`] is a placeholder heuristic; anything smarter plugs
//! in behind [`ConversationAnalyzer`].

use crate::config::AnalysisConfig;
use crate::context::truncate_chars;
use crate::domain::{Message, SenderType, Sentiment};
use async_trait::async_trait;

/// What the analyzer learned from recent messages
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ConversationInsights {
    pub narrative: String,
    pub sentiment: Sentiment,
    pub needs_human: bool,
    pub active_topic: Option<String>,
    pub last_open_question: Option<String>,
}

/// Derives insights from a conversation excerpt (oldest first)
#[async_trait]
pub trait ConversationAnalyzer: Send + Sync {
    async fn analyze(&self, messages: &[Message]) -> ConversationInsights;
}

/// Keyword-list analyzer
#[derive(Debug, Clone, Default)]
pub struct KeywordAnalyzer {
    config: AnalysisConfig,
}

impl KeywordAnalyzer {
    pub fn new(config: AnalysisConfig) -> Self {
        let lower = |list: Vec<String>| list.into_iter().map(|k| k.to_lowercase()).collect();
        Self {
            config: AnalysisConfig {
                positive_keywords: lower(config.positive_keywords),
                negative_keywords: lower(config.negative_keywords),
                escalation_keywords: lower(config.escalation_keywords),
            },
        }
    }

    /// Positive minus negative keyword hits decides the label
    pub fn sentiment_of(&self, text: &str) -> Sentiment {
        let text = text.to_lowercase();
        let positive = count_hits(&text, &self.config.positive_keywords);
        let negative = count_hits(&text, &self.config.negative_keywords);
        match positive.cmp(&negative) {
            std::cmp::Ordering::Greater => Sentiment::Positive,
            std::cmp::Ordering::Less => Sentiment::Negative,
            std::cmp::Ordering::Equal => Sentiment::Neutral,
        }
    }

    pub fn wants_human(&self, text: &str) -> bool {
        count_hits(&text.to_lowercase(), &self.config.escalation_keywords) > 0
    }
}

fn count_hits(text: &str, keywords: &[String]) -> usize {
    let words: Vec<&str> = text
        .split(|c: char| !c.is_alphanumeric() && c != '\'')
        .filter(|w| !w.is_empty())
        .collect();
    keywords
        .iter()
        .filter(|keyword| {
            if keyword.contains(' ') {
                text.contains(keyword.as_str())
            } else {
                words.iter().any(|w| w == keyword)
            }
        })
        .count()
}

/// First sentence, at most 80 characters
fn topic_of(content: &str) -> Option<String> {
    let first = content
        .split_terminator(|c: char| matches!(c, '.' | '?' | '!' | '\n'))
        .map(str::trim)
        .find(|s| !s.is_empty())?;
    Some(truncate_chars(first, 80))
}

#[async_trait]
impl ConversationAnalyzer for KeywordAnalyzer {
    async fn analyze(&self, messages: &[Message]) -> ConversationInsights {
        let customer: Vec<&Message> = messages
            .iter()
            .filter(|m| m.sender_type == SenderType::Contact && !m.content.trim().is_empty())
            .collect();

        let customer_text = customer
            .iter()
            .map(|m| m.content.as_str())
            .collect::<Vec<_>>()
            .join("\n");
        let sentiment = self.sentiment_of(&customer_text);
        let needs_human = self.wants_human(&customer_text);

        let latest = customer.last().map(|m| m.content.trim());
        let last_open_question = customer
            .iter()
            .rev()
            .map(|m| m.content.trim())
            .find(|c| c.ends_with('?'))
            .map(|c| truncate_chars(c, 200));

        let mut narrative = format!(
            "{} recent messages, {} from the customer.",
            messages.len(),
            customer.len()
        );
        if let Some(latest) = latest {
            narrative.push_str(&format!(
                " Latest customer message: \"{}\".",
                truncate_chars(latest, 160)
            ));
        }
        if needs_human {
            narrative.push_str(" The customer asked for a human.");
        }

        ConversationInsights {
            narrative,
            sentiment,
            needs_human,
            active_topic: latest.and_then(topic_of),
            last_open_question,
        }
    }
}

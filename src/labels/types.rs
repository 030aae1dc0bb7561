use serde::{de, Deserialize, Deserializer, Serialize};
use serde_json::Value;
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

use crate::table::key_of;

/// Sentinel written into every label column of an irrelevant article.
pub const NOT_RELATED: &str = "Not related";

#[derive(Debug, Error, PartialEq)]
pub enum LabelError {
    #[error("unknown factor label: {0}")]
    UnknownFactor(String),
    #[error("unknown sentiment label: {0}")]
    UnknownSentiment(String),
    #[error("label record for article {0} is missing `{1}`")]
    MissingField(String, &'static str),
}

/// Rule-of-law factor (pillar) a news article can be tagged with.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Factor {
    NoFactor,
    ConstraintsOnGovernmentPowers,
    AbsenceOfCorruption,
    OpenGovernment,
    FundamentalRights,
    OrderAndSecurity,
    RegulatoryEnforcement,
    CivilJustice,
    CriminalJustice,
}

impl Factor {
    pub const ALL: [Factor; 9] = [
        Factor::NoFactor,
        Factor::ConstraintsOnGovernmentPowers,
        Factor::AbsenceOfCorruption,
        Factor::OpenGovernment,
        Factor::FundamentalRights,
        Factor::OrderAndSecurity,
        Factor::RegulatoryEnforcement,
        Factor::CivilJustice,
        Factor::CriminalJustice,
    ];

    pub fn label(&self) -> &'static str {
        match self {
            Factor::NoFactor => "No Factor",
            Factor::ConstraintsOnGovernmentPowers => "Factor 1: Constraints on Government Powers",
            Factor::AbsenceOfCorruption => "Factor 2: Absence of Corruption",
            Factor::OpenGovernment => "Factor 3: Open Government",
            Factor::FundamentalRights => "Factor 4: Fundamental Rights",
            Factor::OrderAndSecurity => "Factor 5: Order and Security",
            Factor::RegulatoryEnforcement => "Factor 6: Regulatory Enforcement",
            Factor::CivilJustice => "Factor 7: Civil Justice",
            Factor::CriminalJustice => "Factor 8: Criminal Justice",
        }
    }
}

impl fmt::Display for Factor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

impl FromStr for Factor {
    type Err = LabelError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let trimmed = s.trim();
        Factor::ALL
            .iter()
            .find(|factor| factor.label().eq_ignore_ascii_case(trimmed))
            .copied()
            .ok_or_else(|| LabelError::UnknownFactor(trimmed.to_string()))
    }
}

/// How an article moves the rule of law in its country.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Sentiment {
    VeryPositive,
    Positive,
    Neutral,
    Negative,
    VeryNegative,
}

impl Sentiment {
    pub const ALL: [Sentiment; 5] = [
        Sentiment::VeryPositive,
        Sentiment::Positive,
        Sentiment::Neutral,
        Sentiment::Negative,
        Sentiment::VeryNegative,
    ];

    pub fn label(&self) -> &'static str {
        match self {
            Sentiment::VeryPositive => "Very positive",
            Sentiment::Positive => "Positive",
            Sentiment::Neutral => "Neutral",
            Sentiment::Negative => "Negative",
            Sentiment::VeryNegative => "Very negative",
        }
    }
}

impl fmt::Display for Sentiment {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

impl FromStr for Sentiment {
    type Err = LabelError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let trimmed = s.trim();
        Sentiment::ALL
            .iter()
            .find(|sentiment| sentiment.label().eq_ignore_ascii_case(trimmed))
            .copied()
            .ok_or_else(|| LabelError::UnknownSentiment(trimmed.to_string()))
    }
}

/// Answer to "is this news text related to the rule of law?"
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Relevance {
    Related,
    NotRelated,
}

/// Stable article identifier.
///
/// Source tables carry ids either as strings or as integers; both are
/// normalized to the same textual key so set operations agree.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
#[serde(transparent)]
pub struct ArticleId(String);

impl ArticleId {
    pub fn new(id: impl Into<String>) -> Self {
        ArticleId(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ArticleId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for ArticleId {
    fn from(s: &str) -> Self {
        ArticleId(s.to_string())
    }
}

impl<'de> Deserialize<'de> for ArticleId {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let value = Value::deserialize(deserializer)?;
        key_of(&value)
            .map(ArticleId)
            .ok_or_else(|| de::Error::custom("article_id must be a non-empty string or an integer"))
    }
}

/// A candidate news article from the unlabeled pool.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Article {
    pub article_id: ArticleId,
    #[serde(default)]
    pub link: Option<String>,
    #[serde(default)]
    pub country: Option<String>,
    #[serde(default)]
    pub title: Option<String>,
    #[serde(default)]
    pub title_eng: Option<String>,
    #[serde(default)]
    pub desc: Option<String>,
    #[serde(default)]
    pub desc_eng: Option<String>,
    #[serde(default)]
    pub content: Option<String>,
    #[serde(default)]
    pub content_eng: Option<String>,
}

impl Article {
    pub fn new(article_id: impl Into<String>) -> Self {
        Article {
            article_id: ArticleId::new(article_id),
            link: None,
            country: None,
            title: None,
            title_eng: None,
            desc: None,
            desc_eng: None,
            content: None,
            content_eng: None,
        }
    }

    /// Translated title, falling back to the original.
    pub fn display_title(&self) -> &str {
        prefer(&self.title_eng, &self.title).unwrap_or("(untitled)")
    }

    pub fn display_description(&self) -> &str {
        prefer(&self.desc_eng, &self.desc).unwrap_or("")
    }

    pub fn display_content(&self) -> &str {
        prefer(&self.content_eng, &self.content).unwrap_or("")
    }

    /// Country name in title case ("el salvador" -> "El Salvador").
    pub fn display_country(&self) -> String {
        let country = self.country.as_deref().unwrap_or("Unknown country");
        country
            .split_whitespace()
            .map(|word| {
                let mut chars = word.chars();
                match chars.next() {
                    Some(first) => first.to_uppercase().chain(chars.flat_map(char::to_lowercase)).collect(),
                    None => String::new(),
                }
            })
            .collect::<Vec<String>>()
            .join(" ")
    }
}

fn prefer<'a>(primary: &'a Option<String>, fallback: &'a Option<String>) -> Option<&'a str> {
    primary
        .as_deref()
        .filter(|s| !s.trim().is_empty())
        .or_else(|| fallback.as_deref().filter(|s| !s.trim().is_empty()))
}

/// The annotator's verdict on a single article.
#[derive(Debug, Clone, PartialEq)]
pub enum Judgment {
    NotRelated,
    Related {
        /// Ordered by relevance, most relevant first.
        factors: Vec<Factor>,
        sentiment: Sentiment,
        comments: String,
    },
}

/// One annotated article.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(into = "LabelRow", try_from = "LabelRow")]
pub struct LabelRecord {
    pub article_id: ArticleId,
    pub link: Option<String>,
    pub judgment: Judgment,
}

impl LabelRecord {
    pub fn not_related(article: &Article) -> Self {
        LabelRecord {
            article_id: article.article_id.clone(),
            link: article.link.clone(),
            judgment: Judgment::NotRelated,
        }
    }

    pub fn related(
        article: &Article,
        factors: Vec<Factor>,
        sentiment: Sentiment,
        comments: impl Into<String>,
    ) -> Self {
        // Keep the first pick of each factor; order encodes relevance.
        let mut ordered: Vec<Factor> = Vec::with_capacity(factors.len());
        for factor in factors {
            if !ordered.contains(&factor) {
                ordered.push(factor);
            }
        }
        LabelRecord {
            article_id: article.article_id.clone(),
            link: article.link.clone(),
            judgment: Judgment::Related {
                factors: ordered,
                sentiment,
                comments: comments.into(),
            },
        }
    }

    /// A record is complete when every stored column carries a value.
    pub fn is_complete(&self) -> bool {
        self.link.as_deref().is_some_and(|link| !link.trim().is_empty())
    }
}

/// Flat column layout of a label record as stored in batch tables.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LabelRow {
    pub article_id: ArticleId,
    #[serde(default)]
    pub link: Option<String>,
    #[serde(rename = "factor(s)", default)]
    pub factors: Option<String>,
    #[serde(default)]
    pub sentiment: Option<String>,
    #[serde(default)]
    pub comments: Option<String>,
}

impl From<LabelRecord> for LabelRow {
    fn from(record: LabelRecord) -> Self {
        let (factors, sentiment, comments) = match record.judgment {
            Judgment::NotRelated => (
                NOT_RELATED.to_string(),
                NOT_RELATED.to_string(),
                NOT_RELATED.to_string(),
            ),
            Judgment::Related {
                factors,
                sentiment,
                comments,
            } => (
                encode_factor_list(&factors),
                sentiment.label().to_string(),
                comments,
            ),
        };
        LabelRow {
            article_id: record.article_id,
            link: record.link,
            factors: Some(factors),
            sentiment: Some(sentiment),
            comments: Some(comments),
        }
    }
}

impl TryFrom<LabelRow> for LabelRecord {
    type Error = LabelError;

    fn try_from(row: LabelRow) -> Result<Self, Self::Error> {
        let factors = row
            .factors
            .ok_or_else(|| LabelError::MissingField(row.article_id.to_string(), "factor(s)"))?;

        let judgment = if factors.trim() == NOT_RELATED {
            Judgment::NotRelated
        } else {
            let sentiment = row
                .sentiment
                .as_deref()
                .ok_or_else(|| LabelError::MissingField(row.article_id.to_string(), "sentiment"))?
                .parse()?;
            Judgment::Related {
                factors: parse_factor_list(&factors)?,
                sentiment,
                comments: row.comments.unwrap_or_default(),
            }
        };

        Ok(LabelRecord {
            article_id: row.article_id,
            link: row.link,
            judgment,
        })
    }
}

/// Encodes an ordered factor list as a JSON array string.
pub fn encode_factor_list(factors: &[Factor]) -> String {
    let labels: Vec<&str> = factors.iter().map(Factor::label).collect();
    serde_json::to_string(&labels).unwrap_or_else(|_| "[]".to_string())
}

/// Parses a stored factor list.
///
/// Accepts JSON arrays as well as Python list literals
/// (`['Factor 1: ...', 'Factor 4: ...']`); factor labels never contain commas.
pub fn parse_factor_list(raw: &str) -> Result<Vec<Factor>, LabelError> {
    let inner = raw.trim().trim_start_matches('[').trim_end_matches(']');
    inner
        .split(',')
        .map(|item| item.trim().trim_matches(|c| c == '\'' || c == '"'))
        .filter(|item| !item.is_empty())
        .map(str::parse)
        .collect()
}

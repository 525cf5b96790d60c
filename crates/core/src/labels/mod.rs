//! Emotion labels: the filename convention, the fixed code-to-name table and
//! the fitted label codec mapping raw codes to dense class indices.

use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::path::Path;

pub const UNKNOWN_EMOTION: &str = "Unknown Emotion";

/// Separator between the fields of a corpus file name.
const FIELD_SEPARATOR: char = '-';
/// Zero-based field holding the emotion code.
const EMOTION_FIELD: usize = 2;

#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Emotion {
    Neutral,
    Calm,
    Happy,
    Sad,
    Angry,
    Fearful,
    Disgust,
    Surprised,
}

impl Emotion {
    pub fn from_code(code: &str) -> Option<Self> {
        Some(match code {
            "01" => Emotion::Neutral,
            "02" => Emotion::Calm,
            "03" => Emotion::Happy,
            "04" => Emotion::Sad,
            "05" => Emotion::Angry,
            "06" => Emotion::Fearful,
            "07" => Emotion::Disgust,
            "08" => Emotion::Surprised,
            _ => return None,
        })
    }

    pub fn name(self) -> &'static str {
        match self {
            Emotion::Neutral => "neutral",
            Emotion::Calm => "calm",
            Emotion::Happy => "happy",
            Emotion::Sad => "sad",
            Emotion::Angry => "angry",
            Emotion::Fearful => "fearful",
            Emotion::Disgust => "disgust",
            Emotion::Surprised => "surprised",
        }
    }
}

/// Human-readable name for a raw code, or [`UNKNOWN_EMOTION`].
pub fn emotion_name(code: &str) -> &'static str {
    Emotion::from_code(code)
        .map(Emotion::name)
        .unwrap_or(UNKNOWN_EMOTION)
}

#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum LabelError {
    #[error("cannot parse emotion label from file name '{0}'")]
    Parse(String),

    #[error("label '{0}' was not seen when the codec was fit")]
    UnknownLabel(String),

    #[error("class index {index} out of range for {classes} classes")]
    UnknownIndex { index: usize, classes: usize },

    #[error("label codec has not been fit")]
    NotFitted,

    #[error("cannot fit a label codec on zero labels")]
    Empty,
}

/// Raw emotion code from a corpus file name such as `03-01-05-02-01-01-12.wav`.
pub fn parse_label(path: &Path) -> Result<String, LabelError> {
    let display = path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();
    let stem = path
        .file_stem()
        .and_then(|s| s.to_str())
        .ok_or_else(|| LabelError::Parse(display.clone()))?;

    match stem.split(FIELD_SEPARATOR).nth(EMOTION_FIELD) {
        Some(code) if !code.trim().is_empty() => Ok(code.trim().to_owned()),
        _ => Err(LabelError::Parse(display)),
    }
}

/// Order-stable mapping between raw label strings and dense class indices.
///
/// Classes are the distinct fitted labels in lexical order, so index `i`
/// always refers to the same label for a given label set.
#[derive(Clone, Debug, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct LabelCodec {
    classes: Vec<String>,
}

impl LabelCodec {
    pub fn fit<I, S>(labels: I) -> Result<Self, LabelError>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let distinct: BTreeSet<String> = labels
            .into_iter()
            .map(|l| l.as_ref().to_owned())
            .collect();
        if distinct.is_empty() {
            return Err(LabelError::Empty);
        }
        Ok(Self {
            classes: distinct.into_iter().collect(),
        })
    }

    pub fn is_fitted(&self) -> bool {
        !self.classes.is_empty()
    }

    pub fn len(&self) -> usize {
        self.classes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.classes.is_empty()
    }

    pub fn classes(&self) -> &[String] {
        &self.classes
    }

    pub fn encode(&self, label: &str) -> Result<u32, LabelError> {
        if !self.is_fitted() {
            return Err(LabelError::NotFitted);
        }
        self.classes
            .binary_search_by(|c| c.as_str().cmp(label))
            .map(|i| i as u32)
            .map_err(|_| LabelError::UnknownLabel(label.to_owned()))
    }

    pub fn encode_all<S: AsRef<str>>(&self, labels: &[S]) -> Result<Vec<u32>, LabelError> {
        labels.iter().map(|l| self.encode(l.as_ref())).collect()
    }

    pub fn decode(&self, index: usize) -> Result<&str, LabelError> {
        if !self.is_fitted() {
            return Err(LabelError::NotFitted);
        }
        self.classes
            .get(index)
            .map(String::as_str)
            .ok_or(LabelError::UnknownIndex {
                index,
                classes: self.classes.len(),
            })
    }

    /// Index to emotion name; codes outside the table map to [`UNKNOWN_EMOTION`].
    pub fn decode_name(&self, index: usize) -> Result<&'static str, LabelError> {
        self.decode(index).map(emotion_name)
    }

    /// Display names for every class, in index order.
    pub fn class_names(&self) -> Vec<&'static str> {
        self.classes.iter().map(|c| emotion_name(c)).collect()
    }
}

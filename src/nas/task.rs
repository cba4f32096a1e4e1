//! Task kinds and their dummy profiling inputs

use serde::{Deserialize, Serialize};

use super::search_space::Region;
use crate::elastic::Extent;

/// Translation corpus, which fixes the dummy sentence length
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TranslationCorpus {
    Iwslt,
    Wmt,
}

impl TranslationCorpus {
    /// Sentence length used when profiling
    pub fn dummy_sentence_length(&self) -> usize {
        match self {
            TranslationCorpus::Iwslt => 23,
            TranslationCorpus::Wmt => 30,
        }
    }
}

/// Kind of task the supernet is trained for
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum TaskKind {
    /// Encoder-decoder sequence-to-sequence model
    Translation { corpus: TranslationCorpus },
    /// Decoder-only language model
    LanguageModeling { max_tokens: usize },
    /// Convolutional image classifier
    Classification { num_classes: usize },
}

impl Default for TaskKind {
    fn default() -> Self {
        Self::translation_wmt()
    }
}

const TRANSLATION_REGIONS: [Region; 2] = [Region::Encoder, Region::Decoder];
const LM_REGIONS: [Region; 1] = [Region::Decoder];
const CLASSIFICATION_REGIONS: [Region; 1] = [Region::Backbone];

/// Token id used for end-of-sentence
const EOS_TOKEN: i64 = 2;
/// Token id used to fill dummy sentences
const FILLER_TOKEN: i64 = 7;

impl TaskKind {
    pub fn translation_wmt() -> Self {
        TaskKind::Translation {
            corpus: TranslationCorpus::Wmt,
        }
    }

    pub fn translation_iwslt() -> Self {
        TaskKind::Translation {
            corpus: TranslationCorpus::Iwslt,
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            TaskKind::Translation { .. } => "translation",
            TaskKind::LanguageModeling { .. } => "language_modeling",
            TaskKind::Classification { .. } => "classification",
        }
    }

    /// Regions a sampled architecture must contain, in sampling order
    pub fn regions(&self) -> &'static [Region] {
        match self {
            TaskKind::Translation { .. } => &TRANSLATION_REGIONS,
            TaskKind::LanguageModeling { .. } => &LM_REGIONS,
            TaskKind::Classification { .. } => &CLASSIFICATION_REGIONS,
        }
    }

    /// Whether the per-epoch ranking check runs for this task
    pub fn ranks_candidates(&self) -> bool {
        !matches!(self, TaskKind::Classification { .. })
    }

    /// Fixed input used for MAC and parameter profiling
    pub fn dummy_input(&self) -> DummyInput {
        match self {
            TaskKind::Translation { corpus } => DummyInput::sentence(corpus.dummy_sentence_length()),
            TaskKind::LanguageModeling { max_tokens } => DummyInput::sentence(*max_tokens),
            TaskKind::Classification { .. } => DummyInput::Image {
                shape: [1, 3, 224, 224],
            },
        }
    }
}

/// Profiling input of a task
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum DummyInput {
    /// Source sentence and shifted target sentence, batch of one
    Tokens {
        src_tokens: Vec<i64>,
        prev_output_tokens: Vec<i64>,
    },
    /// NCHW image batch shape
    Image { shape: [usize; 4] },
}

impl DummyInput {
    /// `src = [eos, filler...]`, `prev = [filler..., eos]`, both of `length`
    pub fn sentence(length: usize) -> Self {
        let length = length.max(1);
        let mut src_tokens = vec![FILLER_TOKEN; length];
        src_tokens[0] = EOS_TOKEN;
        let mut prev_output_tokens = vec![FILLER_TOKEN; length];
        prev_output_tokens[length - 1] = EOS_TOKEN;

        DummyInput::Tokens {
            src_tokens,
            prev_output_tokens,
        }
    }

    /// Extent seen by the first layer
    pub fn extent(&self) -> Extent {
        match self {
            DummyInput::Tokens { src_tokens, .. } => Extent::Tokens(src_tokens.len()),
            DummyInput::Image { shape } => Extent::Spatial(shape[2], shape[3]),
        }
    }

    /// Input channels of an image input
    pub fn channels(&self) -> Option<usize> {
        match self {
            DummyInput::Image { shape } => Some(shape[1]),
            DummyInput::Tokens { .. } => None,
        }
    }
}

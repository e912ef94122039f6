//! Readers turning request text into [`AnalysisInput`].
//!
//! A partially annotated sentence is a sequence of lines. Lines starting with
//! a tab are pre-annotated morphemes, every other line is raw text:
//!
//! ```text
//! 外国
//! \t人参\tpos:名詞\tsubpos:普通名詞
//! 政権
//! ```

use crate::server::backend::{AnalysisInput, Annotation, BackendError, PartialExample, Segment};
use jumanpp_grpc_core::proto::RequestType;
use std::sync::Arc;

/// Shared template new partial-annotation readers are initialized from.
///
/// Holds the field names known to the loaded model so each reader doesn't
/// have to resolve them again.
#[derive(Clone, Debug, Default)]
pub struct PartialReaderTemplate {
    fields: Arc<[String]>,
}

impl PartialReaderTemplate {
    pub fn new(fields: &[String]) -> Self {
        Self {
            fields: fields.into(),
        }
    }

    pub fn reader(&self) -> PartialAnnotationReader {
        PartialAnnotationReader {
            fields: Arc::clone(&self.fields),
        }
    }
}

#[derive(Debug)]
pub struct PartialAnnotationReader {
    fields: Arc<[String]>,
}

impl PartialAnnotationReader {
    fn annotation(&self, line: &str) -> Result<Annotation, BackendError> {
        let mut parts = line.split('\t');
        let surface = parts.next().unwrap_or_default();
        if surface.is_empty() {
            return Err(BackendError::InvalidInput(
                "annotated morpheme without surface".into(),
            ));
        }

        let mut fields = Vec::new();
        for part in parts.filter(|p| !p.is_empty()) {
            let (name, value) = part.split_once(':').ok_or_else(|| {
                BackendError::InvalidInput(format!("expected `field:value`, got `{part}`"))
            })?;
            if !self.fields.iter().any(|f| f == name) {
                return Err(BackendError::InvalidInput(format!("unknown field `{name}`")));
            }
            fields.push((name.to_string(), value.to_string()));
        }

        Ok(Annotation {
            surface: surface.to_string(),
            fields,
        })
    }

    pub fn read(&self, text: &str) -> Result<PartialExample, BackendError> {
        let mut segments = Vec::new();
        for line in text.lines() {
            match line.strip_prefix('\t') {
                Some(rest) => segments.push(Segment::Annotated(self.annotation(rest)?)),
                None if line.is_empty() => {}
                None => segments.push(Segment::Raw(line.to_string())),
            }
        }
        Ok(PartialExample { segments })
    }
}

/// Reader for one [`RequestType`].
#[derive(Debug)]
pub enum InputReader {
    Plain,
    PartialAnnotation(PartialAnnotationReader),
}

impl InputReader {
    pub fn for_kind(kind: RequestType, template: &PartialReaderTemplate) -> Self {
        match kind {
            RequestType::Normal => Self::Plain,
            RequestType::PartialAnnotation => Self::PartialAnnotation(template.reader()),
        }
    }

    pub const fn kind(&self) -> RequestType {
        match self {
            Self::Plain => RequestType::Normal,
            Self::PartialAnnotation(_) => RequestType::PartialAnnotation,
        }
    }

    pub fn read(&self, sentence: &str) -> Result<AnalysisInput, BackendError> {
        match self {
            // Plain input is a single line; anything after it is ignored.
            Self::Plain => Ok(AnalysisInput::Plain(
                sentence.lines().next().unwrap_or_default().to_string(),
            )),
            Self::PartialAnnotation(reader) => reader.read(sentence).map(AnalysisInput::Partial),
        }
    }
}

//! Character-class segmenter.
//!
//! A deliberately small analyzer that splits text into runs of the same
//! Unicode script (kanji, hiragana, katakana, latin, digits, symbols). Each run
//! becomes a lattice node; when the local beam allows alternatives, runs are
//! also offered split into single characters. Annotated spans of partial input
//! are kept as single nodes carrying their `pos` field as tag.

use super::{
    AnalysisEnv, AnalysisInput, Analyzer, AnalyzerConfig, BackendError, Lattice, LatticeNode,
    ScoredPath, ScorerDef, ScorerSpec, ScoringConfig, Segment,
};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum CharClass {
    Kanji,
    Hiragana,
    Katakana,
    Latin,
    Digit,
    Symbol,
}

impl CharClass {
    fn of(c: char) -> Self {
        match c {
            '\u{4E00}'..='\u{9FFF}' | '\u{3400}'..='\u{4DBF}' | '々' => Self::Kanji,
            '\u{3041}'..='\u{309F}' => Self::Hiragana,
            '\u{30A0}'..='\u{30FF}' | '\u{FF66}'..='\u{FF9F}' => Self::Katakana,
            '0'..='9' | '０'..='９' => Self::Digit,
            c if c.is_alphabetic() => Self::Latin,
            _ => Self::Symbol,
        }
    }

    const fn name(self) -> &'static str {
        match self {
            Self::Kanji => "kanji",
            Self::Hiragana => "hiragana",
            Self::Katakana => "katakana",
            Self::Latin => "latin",
            Self::Digit => "digit",
            Self::Symbol => "symbol",
        }
    }

    const fn bias(self) -> f32 {
        match self {
            Self::Kanji => 1.2,
            Self::Katakana => 1.1,
            Self::Hiragana => 0.8,
            Self::Latin | Self::Digit => 1.0,
            Self::Symbol => 0.5,
        }
    }
}

struct Span {
    boundary: usize,
    surface: String,
    length: usize,
    class: CharClass,
    tag: Option<String>,
}

fn push_runs(text: &str, offset: &mut usize, spans: &mut Vec<Span>) {
    let mut current: Option<Span> = None;
    for c in text.chars() {
        if c.is_whitespace() {
            spans.extend(current.take());
            *offset += 1;
            continue;
        }
        let class = CharClass::of(c);
        match current.as_mut() {
            Some(span) if span.class == class => {
                span.surface.push(c);
                span.length += 1;
            }
            _ => {
                spans.extend(current.take());
                current = Some(Span {
                    boundary: *offset,
                    surface: c.to_string(),
                    length: 1,
                    class,
                    tag: None,
                });
            }
        }
        *offset += 1;
    }
    spans.extend(current);
}

fn fnv1a(parts: &[&[u8]]) -> u64 {
    let mut hash = 0xcbf2_9ce4_8422_2325_u64;
    for part in parts {
        for b in *part {
            hash ^= u64::from(*b);
            hash = hash.wrapping_mul(0x0100_0000_01b3);
        }
    }
    hash
}

/// The reference [`AnalysisEnv`].
#[derive(Clone, Debug)]
pub struct CharClassEnv {
    scorers: ScorerDef,
    fields: Vec<String>,
}

impl CharClassEnv {
    pub fn new(scorers: ScorerDef, fields: Vec<String>) -> Self {
        Self { scorers, fields }
    }
}

impl Default for CharClassEnv {
    fn default() -> Self {
        Self::new(
            ScorerDef {
                scorers: vec![
                    ScorerSpec {
                        name: "linear".into(),
                        weight: 1.0,
                    },
                    ScorerSpec {
                        name: "rnn".into(),
                        weight: 0.2,
                    },
                ],
            },
            vec!["pos".into(), "subpos".into(), "baseform".into()],
        )
    }
}

impl AnalysisEnv for CharClassEnv {
    fn scorer_def(&self) -> &ScorerDef {
        &self.scorers
    }

    fn field_names(&self) -> &[String] {
        &self.fields
    }

    fn build_analyzer(
        &self,
        config: &AnalyzerConfig,
        scoring: &ScoringConfig,
        scorers: &ScorerDef,
    ) -> Result<Box<dyn Analyzer>, BackendError> {
        if scoring.beam_size < 1 {
            return Err(BackendError::InvalidConfig(format!(
                "beam size must be positive (got {})",
                scoring.beam_size
            )));
        }
        if scorers.is_empty() || scoring.num_scorers == 0 {
            return Err(BackendError::InvalidConfig("no scorers".into()));
        }
        if scoring.num_scorers > scorers.len() {
            return Err(BackendError::InvalidConfig(format!(
                "{} scorers requested but only {} defined",
                scoring.num_scorers,
                scorers.len()
            )));
        }

        let mut weights = scorers.weights();
        weights.truncate(scoring.num_scorers);

        Ok(Box::new(CharClassAnalyzer {
            config: config.clone(),
            beam: scoring.beam_size as usize,
            weights,
            lattice: Lattice::default(),
        }))
    }
}

pub struct CharClassAnalyzer {
    config: AnalyzerConfig,
    beam: usize,
    weights: Vec<f32>,
    lattice: Lattice,
}

impl CharClassAnalyzer {
    fn node(&self, boundary: usize, surface: String, class: CharClass, tag: String, whole: bool) -> LatticeNode {
        let length = surface.chars().count();
        let mut scores = Vec::with_capacity(self.weights.len());
        scores.push(self.weights[0] * (length as f32).sqrt() * class.bias());
        if let Some(w) = self.weights.get(1) {
            scores.push(w * if whole { 1.0 } else { 0.25 });
        }
        let features = if self.config.store_all_features {
            vec![
                fnv1a(&[b"class:", class.name().as_bytes()]),
                fnv1a(&[b"surface:", surface.as_bytes()]),
                fnv1a(&[b"tag:", tag.as_bytes()]),
                length as u64,
            ]
        } else {
            Vec::new()
        };
        LatticeNode {
            boundary,
            length,
            surface,
            tag,
            scores,
            features,
        }
    }

    fn path_limit(&self) -> usize {
        if self.config.global_beam_left > 0 {
            self.beam.min(self.config.global_beam_left as usize)
        } else {
            self.beam
        }
    }
}

impl Analyzer for CharClassAnalyzer {
    fn analyze(&mut self, input: &AnalysisInput) -> Result<(), BackendError> {
        let mut spans = Vec::new();
        let mut offset = 0;
        let surface = match input {
            AnalysisInput::Plain(text) => {
                push_runs(text, &mut offset, &mut spans);
                text.clone()
            }
            AnalysisInput::Partial(example) => {
                for segment in &example.segments {
                    match segment {
                        Segment::Raw(text) => push_runs(text, &mut offset, &mut spans),
                        Segment::Annotated(a) => {
                            let length = a.surface.chars().count();
                            let first = a.surface.chars().next().ok_or_else(|| {
                                BackendError::InvalidInput("empty annotated surface".into())
                            })?;
                            let class = CharClass::of(first);
                            let tag = a.field("pos").unwrap_or(class.name()).to_string();
                            spans.push(Span {
                                boundary: offset,
                                surface: a.surface.clone(),
                                length,
                                class,
                                tag: Some(tag),
                            });
                            offset += length;
                        }
                    }
                }
                example.surface()
            }
        };

        let mut nodes = Vec::new();
        let mut whole = Vec::with_capacity(spans.len());
        let mut split: Vec<Option<Vec<usize>>> = Vec::with_capacity(spans.len());

        for span in &spans {
            let tag = span
                .tag
                .clone()
                .unwrap_or_else(|| span.class.name().to_string());
            whole.push(nodes.len());
            nodes.push(self.node(
                span.boundary,
                span.surface.clone(),
                span.class,
                tag.clone(),
                true,
            ));

            if span.tag.is_none() && span.length > 1 && self.beam > 1 {
                let mut chars = Vec::with_capacity(span.length);
                for (i, c) in span.surface.chars().enumerate() {
                    chars.push(nodes.len());
                    nodes.push(self.node(
                        span.boundary + i,
                        c.to_string(),
                        span.class,
                        tag.clone(),
                        false,
                    ));
                }
                split.push(Some(chars));
            } else {
                split.push(None);
            }
        }

        let score_of = |path: &[usize]| path.iter().map(|&n| nodes[n].score()).sum::<f32>();

        let mut paths = vec![ScoredPath {
            score: score_of(&whole),
            nodes: whole.clone(),
        }];
        for (i, chars) in split.iter().enumerate() {
            let Some(chars) = chars else { continue };
            let mut path = Vec::with_capacity(whole.len() + chars.len());
            path.extend_from_slice(&whole[..i]);
            path.extend_from_slice(chars);
            path.extend_from_slice(&whole[i + 1..]);
            paths.push(ScoredPath {
                score: score_of(&path),
                nodes: path,
            });
        }
        paths.sort_by(|a, b| b.score.total_cmp(&a.score));
        paths.truncate(self.path_limit());

        self.lattice = Lattice {
            surface,
            nodes,
            paths,
        };
        Ok(())
    }

    fn lattice(&self) -> &Lattice {
        &self.lattice
    }

    fn scorer_weights(&self) -> &[f32] {
        &self.weights
    }

    fn retains_features(&self) -> bool {
        self.config.store_all_features
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::server::backend::{Annotation, PartialExample};

    fn build(beam: i32, num_scorers: usize, all_features: bool) -> Box<dyn Analyzer> {
        let env = CharClassEnv::default();
        env.build_analyzer(
            &AnalyzerConfig {
                store_all_features: all_features,
                ..Default::default()
            },
            &ScoringConfig {
                beam_size: beam,
                num_scorers,
            },
            env.scorer_def(),
        )
        .unwrap()
    }

    #[test]
    fn splits_runs_by_script() {
        let mut analyzer = build(1, 2, false);
        analyzer
            .analyze(&AnalysisInput::Plain("東京タワーへ行く".into()))
            .unwrap();

        let lattice = analyzer.lattice();
        let surfaces: Vec<_> = lattice.nodes.iter().map(|n| n.surface.as_str()).collect();
        assert_eq!(surfaces, ["東京", "タワー", "へ", "行", "く"]);
        assert_eq!(lattice.paths.len(), 1);
        assert_eq!(lattice.nodes[1].boundary, 2);
        assert_eq!(lattice.nodes[1].length, 3);
        assert_eq!(lattice.nodes[0].scores.len(), 2);
        assert!(lattice.nodes[0].features.is_empty());
    }

    #[test]
    fn beam_adds_split_alternatives() {
        let mut analyzer = build(3, 1, false);
        analyzer
            .analyze(&AnalysisInput::Plain("東京タワー".into()))
            .unwrap();

        let lattice = analyzer.lattice();
        // 2 whole runs + 2 + 3 single characters
        assert_eq!(lattice.nodes.len(), 7);
        assert_eq!(lattice.paths.len(), 3);
        assert!(lattice.paths[0].score >= lattice.paths[1].score);
        assert!(lattice.paths[1].score >= lattice.paths[2].score);
        assert_eq!(lattice.nodes[0].scores.len(), 1);
    }

    #[test]
    fn annotated_spans_stay_whole() {
        let mut analyzer = build(5, 2, true);
        let input = AnalysisInput::Partial(PartialExample {
            segments: vec![
                Segment::Raw("外国".into()),
                Segment::Annotated(Annotation {
                    surface: "人参政".into(),
                    fields: vec![("pos".into(), "名詞".into())],
                }),
            ],
        });
        analyzer.analyze(&input).unwrap();

        let lattice = analyzer.lattice();
        assert_eq!(lattice.surface, "外国人参政");
        let annotated = lattice
            .nodes
            .iter()
            .find(|n| n.surface == "人参政")
            .unwrap();
        assert_eq!(annotated.tag, "名詞");
        assert_eq!(annotated.boundary, 2);
        assert!(lattice.nodes.iter().all(|n| !n.features.is_empty()));
        assert!(!lattice.nodes.iter().any(|n| n.surface == "参"));
    }

    #[test]
    fn rejects_impossible_configs() {
        let env = CharClassEnv::default();
        let config = AnalyzerConfig::default();
        let bad_beam = ScoringConfig {
            beam_size: 0,
            num_scorers: 1,
        };
        assert!(
            env.build_analyzer(&config, &bad_beam, env.scorer_def())
                .is_err()
        );

        let too_many = ScoringConfig {
            beam_size: 1,
            num_scorers: 2,
        };
        assert!(
            env.build_analyzer(&config, &too_many, &env.scorer_def().primary_only())
                .is_err()
        );
    }
}

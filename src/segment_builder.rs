/*
 * Chaffee Ingest - Podcast Catalog Ingestion Pipeline
 * Copyright (c) 2024 Meeting Assistant Contributors
 *
 * This work is licensed under the Creative Commons Attribution-NonCommercial 4.0 International License.
 * To view a copy of this license, visit http://creativecommons.org/licenses/by-nc/4.0/
 *
 * You are free to share and adapt this work for non-commercial purposes with attribution.
 * Commercial use is prohibited without explicit written permission.
 *
 * For commercial licensing inquiries, please contact the project maintainers.
 */

use chrono::Utc;
use unicode_normalization::UnicodeNormalization;

use crate::config::SegmentConfig;
use crate::speaker_identifier::IdentifiedTurn;
use crate::types::{Segment, WordTiming, SPEAKER_UNKNOWN};

const ORPHAN_ATTACH_WINDOW_SEC: f64 = 0.5;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum TurnKey {
    Attached(usize),
    Orphan,
}

struct Draft {
    turn_key: TurnKey,
    speaker_label: String,
    speaker_confidence: f32,
    voice_embedding: Option<Vec<f32>>,
    start_sec: f64,
    end_sec: f64,
    words: Vec<String>,
    char_len: usize,
}

impl Draft {
    fn new(turn_key: TurnKey, turns: &[IdentifiedTurn], word: &WordTiming) -> Self {
        let (speaker_label, speaker_confidence, voice_embedding) = resolve(turn_key, turns);
        Self {
            turn_key,
            speaker_label,
            speaker_confidence,
            voice_embedding,
            start_sec: word.start_sec,
            end_sec: word.end_sec,
            words: vec![word.text.clone()],
            char_len: word.text.chars().count(),
        }
    }

    fn push(&mut self, word: &WordTiming) {
        self.end_sec = word.end_sec;
        self.char_len += 1 + word.text.chars().count(); // +1 for the joining space
        self.words.push(word.text.clone());
    }

    fn text(&self) -> String {
        self.words.join(" ")
    }
}

fn resolve(turn_key: TurnKey, turns: &[IdentifiedTurn]) -> (String, f32, Option<Vec<f32>>) {
    match turn_key {
        TurnKey::Attached(idx) => {
            let t = &turns[idx];
            (t.speaker_label.clone(), t.speaker_confidence, t.voice_embedding.clone())
        }
        TurnKey::Orphan => (SPEAKER_UNKNOWN.to_string(), 0.0, None),
    }
}

/// Merges word timings and speaker turns into persistable segment drafts.
/// Pure and deterministic: identical inputs produce a byte-identical
/// output sequence, since every step processes sorted `Vec`s rather
/// than iterating a hash map.
pub struct SegmentBuilder {
    config: SegmentConfig,
}

impl SegmentBuilder {
    pub fn new(config: SegmentConfig) -> Self {
        Self { config }
    }

    pub fn build(&self, source_id: i64, words: &[WordTiming], turns: &[IdentifiedTurn]) -> Vec<Segment> {
        if words.is_empty() {
            return Vec::new();
        }

        let mut sorted_words: Vec<&WordTiming> = words.iter().collect();
        sorted_words.sort_by(|a, b| a.start_sec.partial_cmp(&b.start_sec).unwrap());

        let keys = attach_words(&sorted_words, turns);
        let drafts = self.accumulate(&sorted_words, &keys, turns);
        let merged = self.merge_short_segments(drafts);
        self.finalize(source_id, merged)
    }

    fn accumulate(&self, words: &[&WordTiming], keys: &[TurnKey], turns: &[IdentifiedTurn]) -> Vec<Draft> {
        let mut out: Vec<Draft> = Vec::new();

        for (word, &key) in words.iter().zip(keys.iter()) {
            let should_start_new = match out.last() {
                None => true,
                Some(cur) => {
                    let gap = word.start_sec - cur.end_sec;
                    let prospective_duration = word.end_sec - cur.start_sec;
                    cur.turn_key != key
                        || gap > self.config.max_gap_sec
                        || cur.char_len >= self.config.max_chars
                        || prospective_duration > self.config.max_merge_duration_sec
                }
            };

            if should_start_new {
                out.push(Draft::new(key, turns, word));
                continue;
            }

            let cur = out.last_mut().unwrap();
            let prospective_len = cur.char_len + 1 + word.text.chars().count();
            if prospective_len > self.config.hard_cap_chars {
                out.push(Draft::new(key, turns, word));
            } else {
                cur.push(word);
            }
        }

        out
    }

    /// Floor-merge pass: a too-short segment merges forward
    /// into the next same-speaker segment when the combined length stays
    /// within the hard cap and the gap is small enough. "Same-speaker" is
    /// judged on the resolved label, not the turn index, so two separate
    /// turns correctly assigned to the same identity still merge.
    fn merge_short_segments(&self, drafts: Vec<Draft>) -> Vec<Draft> {
        let mut merged: Vec<Draft> = Vec::with_capacity(drafts.len());
        for draft in drafts {
            let should_merge = match merged.last() {
                Some(last) => {
                    last.char_len < self.config.min_chars
                        && last.speaker_label == draft.speaker_label
                        && (last.char_len + 1 + draft.char_len) <= self.config.hard_cap_chars
                        && (draft.start_sec - last.end_sec) <= self.config.max_gap_sec
                }
                None => false,
            };

            if should_merge {
                let last = merged.last_mut().unwrap();
                last.end_sec = draft.end_sec;
                last.char_len += 1 + draft.char_len;
                last.words.extend(draft.words);
            } else {
                merged.push(draft);
            }
        }
        merged
    }

    fn finalize(&self, source_id: i64, drafts: Vec<Draft>) -> Vec<Segment> {
        let now = Utc::now();
        drafts
            .into_iter()
            .enumerate()
            .map(|(ordinal, draft)| {
                let text = normalize_text(&draft.text());
                Segment {
                    source_id,
                    ordinal: ordinal as u32,
                    start_sec: round3(draft.start_sec),
                    end_sec: round3(draft.end_sec),
                    text,
                    speaker_label: draft.speaker_label,
                    speaker_confidence: draft.speaker_confidence,
                    voice_embedding: draft.voice_embedding,
                    text_embedding: None,
                    text_embedding_model_key: String::new(),
                    created_at: now,
                    updated_at: now,
                }
            })
            .collect()
    }
}

/// Attaches each word to the turn whose interval contains its midpoint;
/// words in gaps attach to the nearest turn within 0.5s; otherwise the word
/// starts a new orphan run.
fn attach_words(words: &[&WordTiming], turns: &[IdentifiedTurn]) -> Vec<TurnKey> {
    words
        .iter()
        .map(|word| {
            let mid = word.midpoint();

            if let Some(idx) = turns.iter().position(|t| t.turn.contains(mid)) {
                return TurnKey::Attached(idx);
            }

            let mut best: Option<(usize, f64)> = None;
            for (idx, t) in turns.iter().enumerate() {
                let dist = if mid < t.turn.start_sec {
                    t.turn.start_sec - mid
                } else {
                    mid - t.turn.end_sec
                };
                if best.map(|(_, d)| dist < d).unwrap_or(true) {
                    best = Some((idx, dist));
                }
            }

            match best {
                Some((idx, dist)) if dist <= ORPHAN_ATTACH_WINDOW_SEC => TurnKey::Attached(idx),
                _ => TurnKey::Orphan,
            }
        })
        .collect()
}

fn normalize_text(s: &str) -> String {
    s.nfc().collect::<String>().trim().to_string()
}

fn round3(v: f64) -> f64 {
    (v * 1000.0).round() / 1000.0
}

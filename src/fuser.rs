/*
 * Transcript Fusion Pipeline
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

//! C6 — assigns a speaker to every transcription segment by maximum
//! temporal overlap with the diarization track (§4.6). Pure and
//! synchronous; no I/O, no async, nothing to mock in tests.

use crate::types::{DiarizationSegment, FusedSegment, TranscriptionSegment, UNKNOWN_SPEAKER};

/// Below this fraction of a transcription segment's own duration, the
/// best diarization match is considered noise and the segment is
/// labeled `UNKNOWN_SPEAKER` instead.
const MIN_OVERLAP_FRACTION: f64 = 0.10;

/// Fuses diarization and transcription tracks into speaker-attributed
/// segments. If `transcription` is a single whole-file segment (the
/// M_mid/M_high shape from §4.4.3), it is first redistributed across
/// diarization boundaries so every speaker turn gets its own text.
pub fn fuse(
    diarization: &[DiarizationSegment],
    transcription: &[TranscriptionSegment],
) -> Vec<FusedSegment> {
    let expanded;
    let transcription = if transcription.len() == 1 && !diarization.is_empty() {
        expanded = split_by_diarization_boundaries(&transcription[0], diarization);
        &expanded
    } else {
        transcription
    };

    let mut fused: Vec<FusedSegment> = transcription
        .iter()
        .map(|t| {
            let best = best_overlap(t, diarization);
            match best {
                Some((speaker, confidence)) => FusedSegment {
                    start: t.start,
                    end: t.end,
                    speaker,
                    text: t.text.clone(),
                    confidence: t.confidence,
                    diarization_speaker: None,
                    identified_as: None,
                    match_score: Some(confidence),
                },
                None => FusedSegment {
                    start: t.start,
                    end: t.end,
                    speaker: UNKNOWN_SPEAKER.to_string(),
                    text: t.text.clone(),
                    confidence: t.confidence,
                    diarization_speaker: None,
                    identified_as: None,
                    match_score: None,
                },
            }
        })
        .collect();

    fused.sort_by(|a, b| a.start.partial_cmp(&b.start).unwrap_or(std::cmp::Ordering::Equal));
    fused
}

/// Finds the diarization segment with maximum overlap against `t`,
/// breaking ties by higher confidence, then earlier start, then
/// lexicographic speaker label. Returns `None` when no candidate clears
/// the 10%-of-duration floor.
fn best_overlap(t: &TranscriptionSegment, diarization: &[DiarizationSegment]) -> Option<(String, f64)> {
    let duration = t.duration().max(0.001);
    let floor = duration * MIN_OVERLAP_FRACTION;

    let mut best: Option<(&DiarizationSegment, f64)> = None;
    for segment in diarization {
        let overlap = overlap_seconds(t.start, t.end, segment.start, segment.end);
        if overlap <= 0.0 {
            continue;
        }
        best = match best {
            None => Some((segment, overlap)),
            Some((current, current_overlap)) => {
                if is_better_candidate(overlap, segment, current_overlap, current) {
                    Some((segment, overlap))
                } else {
                    Some((current, current_overlap))
                }
            }
        };
    }

    let (segment, overlap) = best?;
    if overlap < floor {
        return None;
    }
    let confidence = (overlap / duration).min(1.0);
    Some((segment.speaker.clone(), confidence))
}

fn is_better_candidate(
    overlap: f64,
    candidate: &DiarizationSegment,
    current_overlap: f64,
    current: &DiarizationSegment,
) -> bool {
    if (overlap - current_overlap).abs() > 1e-9 {
        return overlap > current_overlap;
    }
    let candidate_confidence = candidate.confidence.unwrap_or(0.0);
    let current_confidence = current.confidence.unwrap_or(0.0);
    if (candidate_confidence - current_confidence).abs() > 1e-9 {
        return candidate_confidence > current_confidence;
    }
    if (candidate.start - current.start).abs() > 1e-9 {
        return candidate.start < current.start;
    }
    candidate.speaker < current.speaker
}

fn overlap_seconds(a_start: f64, a_end: f64, b_start: f64, b_end: f64) -> f64 {
    (a_end.min(b_end) - a_start.max(b_start)).max(0.0)
}

/// Splits a single whole-file transcription segment into one segment per
/// diarization boundary, weighting each piece's share of text by its
/// share of the total covered duration. Character counts are preserved
/// exactly: every character of the source text lands in exactly one
/// output segment.
fn split_by_diarization_boundaries(
    whole: &TranscriptionSegment,
    diarization: &[DiarizationSegment],
) -> Vec<TranscriptionSegment> {
    let mut boundaries: Vec<&DiarizationSegment> = diarization
        .iter()
        .filter(|d| d.end > whole.start && d.start < whole.end)
        .collect();
    boundaries.sort_by(|a, b| a.start.partial_cmp(&b.start).unwrap_or(std::cmp::Ordering::Equal));

    if boundaries.is_empty() {
        return vec![whole.clone()];
    }

    let chars: Vec<char> = whole.text.chars().collect();
    let total_chars = chars.len();
    let total_duration: f64 = boundaries.iter().map(|b| (b.end.min(whole.end) - b.start.max(whole.start)).max(0.0)).sum();

    if total_duration <= 0.0 || total_chars == 0 {
        return vec![whole.clone()];
    }

    let mut pieces = Vec::with_capacity(boundaries.len());
    let mut consumed_chars = 0usize;

    for (index, boundary) in boundaries.iter().enumerate() {
        let start = boundary.start.max(whole.start);
        let end = boundary.end.min(whole.end);
        let share = (end - start).max(0.0) / total_duration;

        let char_count = if index == boundaries.len() - 1 {
            // Last piece absorbs any rounding remainder so the full
            // character count is preserved exactly.
            total_chars - consumed_chars
        } else {
            ((total_chars as f64) * share).round() as usize
        };
        let char_count = char_count.min(total_chars - consumed_chars);

        let piece_text: String = chars[consumed_chars..consumed_chars + char_count].iter().collect();
        consumed_chars += char_count;

        pieces.push(TranscriptionSegment {
            start,
            end,
            text: piece_text,
            confidence: whole.confidence,
            language: whole.language.clone(),
        });
    }

    pieces
}

#[cfg(test)]
mod tests {
    use super::*;

    fn diar(start: f64, end: f64, speaker: &str) -> DiarizationSegment {
        DiarizationSegment { start, end, speaker: speaker.to_string(), confidence: None }
    }

    fn trans(start: f64, end: f64, text: &str) -> TranscriptionSegment {
        TranscriptionSegment { start, end, text: text.to_string(), confidence: None, language: None }
    }

    #[test]
    fn assigns_speaker_by_maximum_overlap() {
        let diarization = vec![diar(0.0, 5.0, "A"), diar(5.0, 10.0, "B")];
        let transcription = vec![trans(0.5, 4.5, "hello there")];
        let fused = fuse(&diarization, &transcription);
        assert_eq!(fused.len(), 1);
        assert_eq!(fused[0].speaker, "A");
    }

    #[test]
    fn labels_unknown_below_overlap_floor() {
        let diarization = vec![diar(0.0, 1.0, "A")];
        let transcription = vec![trans(0.0, 20.0, "mostly silence then a word")];
        let fused = fuse(&diarization, &transcription);
        assert_eq!(fused[0].speaker, UNKNOWN_SPEAKER);
    }

    #[test]
    fn tie_breaks_by_confidence_then_start_then_speaker() {
        let diarization = vec![
            DiarizationSegment { start: 0.0, end: 5.0, speaker: "B".into(), confidence: Some(0.5) },
            DiarizationSegment { start: 0.0, end: 5.0, speaker: "A".into(), confidence: Some(0.5) },
        ];
        let transcription = vec![trans(0.0, 5.0, "overlap")];
        let fused = fuse(&diarization, &transcription);
        assert_eq!(fused[0].speaker, "A");
    }

    #[test]
    fn redistributes_whole_file_segment_preserving_character_count() {
        let diarization = vec![diar(0.0, 2.0, "A"), diar(2.0, 8.0, "B")];
        let whole = vec![trans(0.0, 8.0, "abcdefghij")];
        let fused = fuse(&diarization, &whole);

        let total_chars: usize = fused.iter().map(|f| f.text.chars().count()).sum();
        assert_eq!(total_chars, "abcdefghij".chars().count());
        assert_eq!(fused.len(), 2);
        assert_eq!(fused[0].speaker, "A");
        assert_eq!(fused[1].speaker, "B");
    }

    #[test]
    fn handles_overlapping_diarization_segments_without_panicking() {
        let diarization = vec![diar(0.0, 5.0, "A"), diar(3.0, 9.0, "B")];
        let transcription = vec![trans(4.0, 4.5, "crosstalk")];
        let fused = fuse(&diarization, &transcription);
        assert_eq!(fused.len(), 1);
    }
}

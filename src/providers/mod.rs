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

//! C4 — thin, stateless wrappers around the three remote service families.
//! Every call here is expected to be driven through the rate budget (C1)
//! and retry executor (C2) by its caller.

pub mod combined;
pub mod diarization;
pub mod transcription;
pub mod voiceprint;

pub use combined::CombinedProvider;
pub use diarization::DiarizationProvider;
pub use transcription::TranscriptionProvider;
pub use voiceprint::VoiceprintProvider;

/// Outcome of a call that may have been dispatched asynchronously. The two
/// cases unify the scheduler's handling of synchronous and webhook-driven
/// stages (see REDESIGN FLAGS in spec.md §9).
pub enum StageOutcome<T> {
    Ready(T),
    Pending(crate::types::JobHandle),
}

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

use anyhow::{Context, Result};
use std::env;
use std::path::PathBuf;

/// Runtime configuration, threaded through every component instead of
/// relying on module-level globals (see REDESIGN FLAGS in spec.md §9).
#[derive(Debug, Clone)]
pub struct Config {
    pub diarization: ProviderEndpoint,
    pub transcription: ProviderEndpoint,
    pub combined: ProviderEndpoint,
    pub webhook_secret: String,
    pub data_root: PathBuf,
    pub rate_limits: RateLimitConfig,
    pub retention_hours: u64,
    pub auto_resume_hours: u64,
}

#[derive(Debug, Clone)]
pub struct ProviderEndpoint {
    pub base_url: String,
    pub api_key: String,
}

#[derive(Debug, Clone)]
pub struct RateLimitConfig {
    pub diarization_per_minute: u32,
    pub transcription_per_minute: u32,
    pub combined_per_minute: u32,
}

impl Config {
    pub fn load() -> Result<Self> {
        dotenv::dotenv().ok();

        let diarization = ProviderEndpoint {
            base_url: env::var("DIARIZATION_BASE_URL")
                .unwrap_or_else(|_| "https://api.diarization-provider.example/v1".to_string()),
            api_key: env::var("DIARIZATION_API_KEY")
                .context("DIARIZATION_API_KEY environment variable not found")?,
        };

        let transcription = ProviderEndpoint {
            base_url: env::var("TRANSCRIPTION_BASE_URL")
                .unwrap_or_else(|_| "https://api.openai.com/v1".to_string()),
            api_key: env::var("TRANSCRIPTION_API_KEY")
                .context("TRANSCRIPTION_API_KEY environment variable not found")?,
        };

        let combined = ProviderEndpoint {
            base_url: env::var("COMBINED_BASE_URL")
                .unwrap_or_else(|_| "https://api.replicate.com/v1".to_string()),
            api_key: env::var("COMBINED_API_KEY").unwrap_or_default(),
        };

        let webhook_secret = env::var("WEBHOOK_SECRET").unwrap_or_default();

        let data_root = env::var("DATA_ROOT")
            .map(PathBuf::from)
            .unwrap_or_else(|_| PathBuf::from("data"));

        std::fs::create_dir_all(data_root.join("interim"))
            .context("Failed to create interim data directory")?;
        std::fs::create_dir_all(data_root.join("checkpoints"))
            .context("Failed to create checkpoints directory")?;

        let rate_limits = RateLimitConfig {
            diarization_per_minute: env::var("RATE_LIMIT_DIARIZATION")
                .unwrap_or_else(|_| "20".to_string())
                .parse()
                .unwrap_or(20),
            transcription_per_minute: env::var("RATE_LIMIT_TRANSCRIPTION")
                .unwrap_or_else(|_| "50".to_string())
                .parse()
                .unwrap_or(50),
            combined_per_minute: env::var("RATE_LIMIT_COMBINED")
                .unwrap_or_else(|_| "100".to_string())
                .parse()
                .unwrap_or(100),
        };

        let retention_hours = env::var("RETENTION_HOURS")
            .unwrap_or_else(|_| "48".to_string())
            .parse()
            .unwrap_or(48);

        let auto_resume_hours = env::var("AUTO_RESUME_HOURS")
            .unwrap_or_else(|_| "24".to_string())
            .parse()
            .unwrap_or(24);

        Ok(Config {
            diarization,
            transcription,
            combined,
            webhook_secret,
            data_root,
            rate_limits,
            retention_hours,
            auto_resume_hours,
        })
    }

    pub fn interim_path(&self, stem: &str, suffix: &str) -> PathBuf {
        self.data_root.join("interim").join(format!("{}_{}.json", stem, suffix))
    }

    /// Canonical config fingerprint input — only the fields that change
    /// stage *output* feed in, matching the `hash(input || canonical(config))`
    /// derivation from §3.
    pub fn canonical(&self) -> String {
        format!(
            "diarization={};transcription={};combined={};rate={:?};retention={}",
            self.diarization.base_url,
            self.transcription.base_url,
            self.combined.base_url,
            (
                self.rate_limits.diarization_per_minute,
                self.rate_limits.transcription_per_minute,
                self.rate_limits.combined_per_minute,
            ),
            self.retention_hours,
        )
    }
}

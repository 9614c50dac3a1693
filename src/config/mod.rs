//! Configuration management for ipassist
//!
//! Every tuning parameter of the ranking and safety layers lives here so the
//! score weights and half-lives stay configurable rather than hardcoded.

use crate::error::{IpError, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

mod validator;

pub use validator::ConfigValidator;

/// Main configuration structure
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub retrieval: RetrievalConfig,
    #[serde(default)]
    pub precedence: PrecedenceConfig,
    #[serde(default)]
    pub safety: SafetyConfig,
    #[serde(default)]
    pub citation: CitationConfig,
    #[serde(default)]
    pub cache: CacheConfig,
    #[serde(default)]
    pub budget: BudgetConfig,
    #[serde(default)]
    pub llm: LlmConfig,
    #[serde(default)]
    pub embedding: EmbeddingConfig,
    #[serde(default)]
    pub session: SessionConfig,
    #[serde(default)]
    pub coding: CodingConfig,
}

/// Retrieval configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetrievalConfig {
    /// Candidate pool size per retriever before merging
    pub top_m: usize,
    /// Default result count
    pub top_k: usize,
    /// Hierarchy-aware score weights
    pub precedence_weight: f32,
    pub semantic_weight: f32,
    pub section_weight: f32,
    pub entity_weight: f32,
    /// Bonus for an exact CPT match
    pub cpt_bonus: f32,
    /// Bonus for coding-classified queries hitting coding_billing chunks
    pub coding_domain_bonus: f32,
    pub reranker: RerankerConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RerankerConfig {
    pub enabled: bool,
    pub model: String,
    /// Candidates fed to the cross-encoder
    pub candidates: usize,
    pub batch_size: usize,
    /// Blend factor between first-stage and cross-encoder scores
    pub blend: f32,
}

/// Precedence model configuration. These are tuning parameters, not
/// invariants; the defaults are the calibrated production values.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PrecedenceConfig {
    /// Recency half-life per domain, in years
    pub halflife_clinical: f32,
    pub halflife_coding_billing: f32,
    pub halflife_ablation: f32,
    pub halflife_lung_volume_reduction: f32,
    pub halflife_technology_navigation: f32,
    /// Minimum recency weight for A1 sources regardless of age
    pub a1_floor: f32,
    /// Component weights: precedence = recency_w*recency + evidence_w*H + authority_w*A
    pub recency_weight: f32,
    pub evidence_weight: f32,
    pub authority_weight: f32,
}

/// Safety layer configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SafetyConfig {
    pub pediatric_keywords: Vec<String>,
    pub emergency_patterns: Vec<String>,
    /// A dose claim must appear in at least this many grounding chunks
    pub dose_confirm_min_sources: usize,
    /// Acceptable numeric variance between a dose claim and its sources
    pub dose_variance_pct: f32,
}

/// Citation visibility configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CitationConfig {
    /// Doc types allowed in the visible reference list. Book chapters may
    /// ground answers but never appear here.
    pub visible_doctypes: Vec<String>,
}

/// Result cache configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheConfig {
    pub ttl_sec: u64,
    pub max: u64,
}

/// Request budget configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BudgetConfig {
    pub request_ms: u64,
    pub emergency_ms: u64,
}

/// LLM configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LlmConfig {
    pub enabled: bool,
    pub provider: String,
    pub api_key_env: String,
    pub model: String,
    pub base_url: String,
    pub max_output_tokens: u32,
}

/// Embedding configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EmbeddingConfig {
    pub model: String,
    pub batch_size: usize,
    pub vector_dim: usize,
    pub hnsw_ef_construction: usize,
    pub hnsw_m: usize,
}

/// Multi-turn session configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionConfig {
    /// Turns of conversation history carried into synthesis
    pub max_turns: usize,
}

/// Procedural coding configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CodingConfig {
    /// KB file paths in fallback order; the first existing file is
    /// authoritative, later files fill missing keys only.
    pub kb_paths: Vec<PathBuf>,
}

impl Default for RetrievalConfig {
    fn default() -> Self {
        Self {
            top_m: 60,
            top_k: 5,
            precedence_weight: 0.45,
            semantic_weight: 0.35,
            section_weight: 0.10,
            entity_weight: 0.10,
            cpt_bonus: 0.05,
            coding_domain_bonus: 0.05,
            reranker: RerankerConfig::default(),
        }
    }
}

impl Default for RerankerConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            model: "Xenova/ms-marco-MiniLM-L-6-v2".to_string(),
            candidates: 30,
            batch_size: 16,
            blend: 0.5,
        }
    }
}

impl Default for PrecedenceConfig {
    fn default() -> Self {
        Self {
            halflife_clinical: 6.0,
            halflife_coding_billing: 3.0,
            halflife_ablation: 5.0,
            halflife_lung_volume_reduction: 5.0,
            halflife_technology_navigation: 4.0,
            a1_floor: 0.7,
            recency_weight: 0.5,
            evidence_weight: 0.3,
            authority_weight: 0.2,
        }
    }
}

impl Default for SafetyConfig {
    fn default() -> Self {
        Self {
            pediatric_keywords: vec![
                "pediatric".to_string(),
                "paediatric".to_string(),
                "child".to_string(),
                "children".to_string(),
                "infant".to_string(),
                "neonate".to_string(),
                "kg/day".to_string(),
                "mg/kg".to_string(),
            ],
            emergency_patterns: vec![
                r"\bmassive\s+hemoptysis\b".to_string(),
                r"\b(?:bleeding|hemorrhage)\s*>?\s*200\s*ml\b".to_string(),
                r"\bforeign\s+body\s+(?:aspiration|removal)\b".to_string(),
                r"\btension\s+pneumothorax\b".to_string(),
                r"\bairway\s+(?:obstruction|emergency)\b".to_string(),
                r"\bcardiac\s+arrest\b".to_string(),
                r"\brespiratory\s+failure\b".to_string(),
                r"\bemergency\s+(?:airway|intubation)\b".to_string(),
            ],
            dose_confirm_min_sources: 2,
            dose_variance_pct: 20.0,
        }
    }
}

impl Default for CitationConfig {
    fn default() -> Self {
        Self {
            visible_doctypes: vec![
                "journal_article".to_string(),
                "guideline".to_string(),
                "systematic_review".to_string(),
            ],
        }
    }
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            ttl_sec: 600,
            max: 256,
        }
    }
}

impl Default for BudgetConfig {
    fn default() -> Self {
        Self {
            request_ms: 5000,
            emergency_ms: 500,
        }
    }
}

impl Default for LlmConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            provider: "openai".to_string(),
            api_key_env: "IPASSIST_LLM_API_KEY".to_string(),
            model: "gpt-5".to_string(),
            base_url: "https://api.openai.com/v1".to_string(),
            max_output_tokens: 8000,
        }
    }
}

impl Default for EmbeddingConfig {
    fn default() -> Self {
        Self {
            model: "all-MiniLM-L6-v2".to_string(),
            batch_size: 32,
            vector_dim: 384,
            hnsw_ef_construction: 200,
            hnsw_m: 16,
        }
    }
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self { max_turns: 6 }
    }
}

impl Default for CodingConfig {
    fn default() -> Self {
        Self {
            kb_paths: vec![
                PathBuf::from("data/ip_coding_billing.json"),
                PathBuf::from("data/coding_module.json"),
            ],
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            retrieval: RetrievalConfig::default(),
            precedence: PrecedenceConfig::default(),
            safety: SafetyConfig::default(),
            citation: CitationConfig::default(),
            cache: CacheConfig::default(),
            budget: BudgetConfig::default(),
            llm: LlmConfig::default(),
            embedding: EmbeddingConfig::default(),
            session: SessionConfig::default(),
            coding: CodingConfig::default(),
        }
    }
}

impl Config {
    /// Load configuration from a file
    pub fn load(path: &Path) -> Result<Self> {
        if !path.exists() {
            return Err(IpError::ConfigNotFound {
                path: path.to_path_buf(),
            });
        }

        let content = std::fs::read_to_string(path).map_err(|e| IpError::Io {
            source: e,
            context: format!("Failed to read config file: {:?}", path),
        })?;
        let mut config: Config = toml::from_str(&content)?;

        config.apply_env_overrides();

        ConfigValidator::validate(&config)?;

        Ok(config)
    }

    /// Save configuration to a file
    pub fn save(&self, path: &Path) -> Result<()> {
        let content = toml::to_string_pretty(self)?;
        std::fs::write(path, content).map_err(|e| IpError::Io {
            source: e,
            context: format!("Failed to write config file: {:?}", path),
        })?;
        Ok(())
    }

    /// Apply environment variable overrides
    /// Environment variables in format: IPASSIST_SECTION__KEY=value
    pub fn apply_env_overrides(&mut self) {
        for (key, value) in std::env::vars() {
            if let Some(config_key) = key.strip_prefix("IPASSIST_") {
                if let Err(e) = self.set_value_from_env(config_key, &value) {
                    tracing::warn!("Failed to apply env override {}: {}", key, e);
                }
            }
        }
    }

    fn set_value_from_env(&mut self, path: &str, value: &str) -> Result<()> {
        fn parse<T: std::str::FromStr>(path: &str, value: &str) -> Result<T> {
            value.parse().map_err(|_| IpError::InvalidConfigValue {
                path: path.to_string(),
                message: format!("Cannot parse '{}'", value),
            })
        }

        match path {
            "RETRIEVAL__TOP_K" => self.retrieval.top_k = parse(path, value)?,
            "RETRIEVAL__TOP_M" => self.retrieval.top_m = parse(path, value)?,
            "RETRIEVAL__RERANKER__ENABLED" => {
                self.retrieval.reranker.enabled = parse(path, value)?
            }
            "LLM__ENABLED" => self.llm.enabled = parse(path, value)?,
            "LLM__MODEL" => self.llm.model = value.to_string(),
            "LLM__BASE_URL" => self.llm.base_url = value.to_string(),
            "EMBEDDING__MODEL" => self.embedding.model = value.to_string(),
            "BUDGET__REQUEST_MS" => self.budget.request_ms = parse(path, value)?,
            "CACHE__TTL_SEC" => self.cache.ttl_sec = parse(path, value)?,
            _ => {
                tracing::debug!("Unknown env config key: {}", path);
            }
        }
        Ok(())
    }

    /// Get the default configuration file path
    pub fn default_path() -> Result<PathBuf> {
        let config_dir = dirs::config_dir()
            .ok_or_else(|| IpError::Config("Cannot determine config directory".to_string()))?;

        Ok(config_dir.join("ipassist").join("config.toml"))
    }
}

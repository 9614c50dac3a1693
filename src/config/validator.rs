use crate::config::Config;
use crate::error::{IpError, Result, ValidationError};

/// Configuration validator
pub struct ConfigValidator;

impl ConfigValidator {
    /// Validate the configuration, collecting every failure before erroring
    pub fn validate(config: &Config) -> Result<()> {
        let mut errors = Vec::new();

        Self::validate_retrieval(config, &mut errors);
        Self::validate_precedence(config, &mut errors);
        Self::validate_safety(config, &mut errors);
        Self::validate_cache(config, &mut errors);
        Self::validate_budget(config, &mut errors);
        Self::validate_llm(config, &mut errors);
        Self::validate_embedding(config, &mut errors);

        if errors.is_empty() {
            Ok(())
        } else {
            Err(IpError::ConfigValidation { errors })
        }
    }

    fn validate_retrieval(config: &Config, errors: &mut Vec<ValidationError>) {
        let r = &config.retrieval;
        if r.top_k == 0 || r.top_k > 50 {
            errors.push(ValidationError::new(
                "retrieval.top_k",
                format!("top_k must be in 1..=50, got {}", r.top_k),
            ));
        }
        if r.top_m < r.top_k {
            errors.push(ValidationError::new(
                "retrieval.top_m",
                "top_m must be at least top_k",
            ));
        }
        for (name, w) in [
            ("precedence_weight", r.precedence_weight),
            ("semantic_weight", r.semantic_weight),
            ("section_weight", r.section_weight),
            ("entity_weight", r.entity_weight),
        ] {
            if !(0.0..=1.0).contains(&w) {
                errors.push(ValidationError::new(
                    format!("retrieval.{}", name),
                    format!("Weight must be in [0, 1], got {}", w),
                ));
            }
        }
        if !(0.0..=1.0).contains(&r.reranker.blend) {
            errors.push(ValidationError::new(
                "retrieval.reranker.blend",
                "Blend factor must be in [0, 1]",
            ));
        }
        if r.reranker.batch_size == 0 {
            errors.push(ValidationError::new(
                "retrieval.reranker.batch_size",
                "Batch size must be greater than 0",
            ));
        }
    }

    fn validate_precedence(config: &Config, errors: &mut Vec<ValidationError>) {
        let p = &config.precedence;
        for (name, hl) in [
            ("halflife_clinical", p.halflife_clinical),
            ("halflife_coding_billing", p.halflife_coding_billing),
            ("halflife_ablation", p.halflife_ablation),
            (
                "halflife_lung_volume_reduction",
                p.halflife_lung_volume_reduction,
            ),
            (
                "halflife_technology_navigation",
                p.halflife_technology_navigation,
            ),
        ] {
            if hl <= 0.0 {
                errors.push(ValidationError::new(
                    format!("precedence.{}", name),
                    "Half-life must be positive",
                ));
            }
        }
        if !(0.0..=1.0).contains(&p.a1_floor) {
            errors.push(ValidationError::new(
                "precedence.a1_floor",
                "A1 floor must be in [0, 1]",
            ));
        }
        let sum = p.recency_weight + p.evidence_weight + p.authority_weight;
        if (sum - 1.0).abs() > 1e-3 {
            errors.push(ValidationError::new(
                "precedence",
                format!("Component weights must sum to 1.0, got {}", sum),
            ));
        }
    }

    fn validate_safety(config: &Config, errors: &mut Vec<ValidationError>) {
        if config.safety.dose_confirm_min_sources == 0 {
            errors.push(ValidationError::new(
                "safety.dose_confirm_min_sources",
                "Must require at least one confirming source",
            ));
        }
        for pattern in &config.safety.emergency_patterns {
            if regex::Regex::new(pattern).is_err() {
                errors.push(ValidationError::new(
                    "safety.emergency_patterns",
                    format!("Invalid regex: {}", pattern),
                ));
            }
        }
    }

    fn validate_cache(config: &Config, errors: &mut Vec<ValidationError>) {
        if config.cache.max == 0 {
            errors.push(ValidationError::new(
                "cache.max",
                "Cache capacity must be greater than 0",
            ));
        }
    }

    fn validate_budget(config: &Config, errors: &mut Vec<ValidationError>) {
        let b = &config.budget;
        if b.request_ms == 0 {
            errors.push(ValidationError::new(
                "budget.request_ms",
                "Request budget must be greater than 0",
            ));
        }
        if b.emergency_ms == 0 || b.emergency_ms > b.request_ms {
            errors.push(ValidationError::new(
                "budget.emergency_ms",
                "Emergency budget must be positive and no larger than the request budget",
            ));
        }
    }

    fn validate_llm(config: &Config, errors: &mut Vec<ValidationError>) {
        if config.llm.enabled {
            let env_var = &config.llm.api_key_env;
            match std::env::var(env_var) {
                Ok(key) if key.is_empty() => {
                    errors.push(ValidationError::new(
                        "llm.api_key_env",
                        format!("Environment variable {} is empty", env_var),
                    ));
                }
                Err(_) => {
                    errors.push(ValidationError::new(
                        "llm.api_key_env",
                        format!("Environment variable {} is not set", env_var),
                    ));
                }
                Ok(_) => {}
            }

            if config.llm.model.is_empty() {
                errors.push(ValidationError::new("llm.model", "Model name cannot be empty"));
            }
        }
    }

    fn validate_embedding(config: &Config, errors: &mut Vec<ValidationError>) {
        let e = &config.embedding;
        if e.vector_dim == 0 {
            errors.push(ValidationError::new(
                "embedding.vector_dim",
                "Vector dimension must be greater than 0",
            ));
        }
        if e.batch_size == 0 {
            errors.push(ValidationError::new(
                "embedding.batch_size",
                "Batch size must be greater than 0",
            ));
        }
        if e.hnsw_ef_construction == 0 || e.hnsw_m == 0 {
            errors.push(ValidationError::new(
                "embedding",
                "HNSW parameters must be greater than 0",
            ));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_valid_config() {
        let config = Config::default();
        assert!(ConfigValidator::validate(&config).is_ok());
    }

    #[test]
    fn test_top_k_out_of_range() {
        let mut config = Config::default();
        config.retrieval.top_k = 51;
        assert!(ConfigValidator::validate(&config).is_err());
    }

    #[test]
    fn test_precedence_weights_must_sum() {
        let mut config = Config::default();
        config.precedence.recency_weight = 0.9;
        assert!(ConfigValidator::validate(&config).is_err());
    }

    #[test]
    fn test_invalid_emergency_pattern() {
        let mut config = Config::default();
        config
            .safety
            .emergency_patterns
            .push("(unclosed".to_string());
        assert!(ConfigValidator::validate(&config).is_err());
    }

    #[test]
    fn test_emergency_budget_bounded_by_request() {
        let mut config = Config::default();
        config.budget.emergency_ms = 10_000;
        assert!(ConfigValidator::validate(&config).is_err());
    }
}

//! ipassist - Interventional Pulmonology Retrieval & Coding Engine
//!
//! A domain-specialized retrieval service that answers clinical questions
//! from an authoritative corpus with hierarchy-aware ranking and hard safety
//! gates, plus a deterministic procedural coder that maps operative notes to
//! CPT / HCPCS / ICD-10-PCS suggestions.

pub mod citations;
pub mod coding;
pub mod config;
pub mod corpus;
pub mod error;
pub mod index;
pub mod llm;
pub mod orchestrator;
pub mod query;
pub mod retrieval;
pub mod safety;
pub mod text;

pub use error::{IpError, Result};

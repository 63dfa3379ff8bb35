//! Input validation shared by job payloads.

use sandcastle_core::{DomainError, DomainResult};

use crate::naming::is_content_hash;

pub const MAX_PROMPT_LEN: usize = 100_000;
pub const MAX_IMAGES: usize = 8;
pub const MAX_NAME_LEN: usize = 120;
pub const MIN_PRODUCTION_PORT: u16 = 1024;

pub fn prompt(value: &str) -> DomainResult<()> {
    if value.trim().is_empty() {
        return Err(DomainError::validation("prompt must not be empty"));
    }
    if value.chars().count() > MAX_PROMPT_LEN {
        return Err(DomainError::validation(format!(
            "prompt longer than {MAX_PROMPT_LEN} characters"
        )));
    }
    Ok(())
}

/// Models are addressed as `provider/model`.
pub fn model(value: &str) -> DomainResult<()> {
    match value.split_once('/') {
        Some((provider, name))
            if !provider.is_empty()
                && !name.is_empty()
                && !value.chars().any(char::is_whitespace) =>
        {
            Ok(())
        }
        _ => Err(DomainError::validation(format!(
            "model must look like provider/model, got {value:?}"
        ))),
    }
}

pub fn name(value: &str) -> DomainResult<()> {
    if value.chars().count() > MAX_NAME_LEN {
        return Err(DomainError::validation(format!(
            "name longer than {MAX_NAME_LEN} characters"
        )));
    }
    Ok(())
}

/// Image references are opaque asset URLs or data URIs handed to the agent.
pub fn images(values: &[String]) -> DomainResult<()> {
    if values.len() > MAX_IMAGES {
        return Err(DomainError::validation(format!(
            "at most {MAX_IMAGES} images allowed"
        )));
    }
    if values.iter().any(|v| v.trim().is_empty()) {
        return Err(DomainError::validation("image reference must not be empty"));
    }
    Ok(())
}

pub fn production_port(port: u16) -> DomainResult<()> {
    if port < MIN_PRODUCTION_PORT {
        return Err(DomainError::validation(format!(
            "production port must be in {MIN_PRODUCTION_PORT}..=65535, got {port}"
        )));
    }
    Ok(())
}

pub fn production_hash(hash: &str) -> DomainResult<()> {
    if !is_content_hash(hash) {
        return Err(DomainError::validation(format!(
            "invalid production hash {hash:?}"
        )));
    }
    Ok(())
}

pub fn session_id(value: &str) -> DomainResult<()> {
    if value.is_empty() || value.len() > 128 || value.contains('/') {
        return Err(DomainError::validation(format!(
            "invalid session id {value:?}"
        )));
    }
    Ok(())
}

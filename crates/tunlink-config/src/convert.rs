//! Batch conversion of pasted share-link text

use crate::descriptor::ProxyDescriptor;
use crate::link;
use crate::store::ConfigError;
use crate::synth::{synthesize, ConfigDocument};
use tracing::info;

/// Result of converting a block of share-link text
#[derive(Debug, Clone)]
pub struct Conversion {
    pub document: ConfigDocument,
    /// Links that became outbounds
    pub parsed: usize,
    /// Non-blank lines that were dropped
    pub skipped: usize,
}

/// Parse every line of `text`, dropping blank, unrecognised and malformed lines
///
/// Returns the descriptors in input order and the number of dropped
/// non-blank lines.
pub fn parse_batch(text: &str) -> (Vec<ProxyDescriptor>, usize) {
    let mut skipped = 0;
    let descriptors = text
        .split('\n')
        .map(str::trim)
        .filter(|line| !line.is_empty())
        .filter_map(|line| {
            let parsed = link::parse(line);
            if parsed.is_none() {
                skipped += 1;
            }
            parsed
        })
        .collect();
    (descriptors, skipped)
}

/// Convert pasted text into an engine document
///
/// Fails only on empty input; a batch where nothing parses yields a
/// document with zero outbounds, which the store refuses to save.
pub fn convert(text: &str) -> Result<Conversion, ConfigError> {
    if text.trim().is_empty() {
        return Err(ConfigError::EmptyInput);
    }

    let (descriptors, skipped) = parse_batch(text);
    info!(
        "Converted {} share-link(s), skipped {}",
        descriptors.len(),
        skipped
    );

    Ok(Conversion {
        document: synthesize(&descriptors),
        parsed: descriptors.len(),
        skipped,
    })
}

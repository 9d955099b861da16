//! Cross-section configuration checks.

use super::ServerConfig;

/// Check that limits from different sections fit together.
///
/// Hard conflicts are returned as errors. Combinations that work but waste
/// resources are logged as warnings.
pub fn validate_resource_limits(config: &ServerConfig) -> Result<(), Vec<String>> {
    let mut errors = Vec::new();
    let mut warnings = Vec::new();

    let pool = &config.netio.buffer_pool;
    let entries = config.netio.uring_entries as usize;

    // A read with a deadline occupies two submission slots.
    let slots_per_read = if config.netio.read_deadline_ms.is_some() { 2 } else { 1 };
    let max_reads = entries / slots_per_read;
    if pool.capacity > max_reads * 4 {
        warnings.push(format!(
            "netio.buffer_pool.capacity ({}) far exceeds what {} ring entries can keep in flight ({}); \
             bursts will see submission failures",
            pool.capacity, entries, max_reads
        ));
    }

    if config.decoder.max_message_size > config.decoder.max_pending_bytes && config.decoder.carry_partial {
        warnings.push(format!(
            "decoder.max_pending_bytes ({}) is smaller than decoder.max_message_size ({}); \
             messages spanning several reads are capped by the former",
            config.decoder.max_pending_bytes, config.decoder.max_message_size
        ));
    }

    if !config.decoder.carry_partial && config.decoder.max_message_size > pool.buffer_size {
        warnings.push(format!(
            "decoder.carry_partial is off, so messages larger than one buffer ({} bytes) \
             can never be decoded",
            pool.buffer_size
        ));
    }

    if config.upgrade.max_request_bytes > 1024 * 1024 {
        errors.push(format!(
            "upgrade.max_request_bytes ({}) exceeds 1 MiB",
            config.upgrade.max_request_bytes
        ));
    }

    for warning in &warnings {
        tracing::warn!("{}", warning);
    }

    if errors.is_empty() {
        Ok(())
    } else {
        Err(errors)
    }
}

//! Lamlet configuration parameters.
//!
//! Parameters may be loaded from a TOML file or constructed with
//! [`LamletParams::default`]. Every constructed parameter set should be
//! passed through [`LamletParams::validate`] before use: several protocol
//! invariants (identifier-space sizing, sync-table capacity) are
//! configuration-time properties, not runtime checks.

use serde::Deserialize;
use std::path::Path;
use thiserror::Error;

/// Errors from loading or validating a parameter file.
#[derive(Debug, Error)]
pub enum ParamsError {
    #[error("failed to read parameter file: {0}")]
    Io(#[from] std::io::Error),
    #[error("failed to parse parameter file: {0}")]
    Parse(#[from] toml::de::Error),
    #[error("invalid parameters: {0}")]
    Invalid(String),
}

/// Lamlet-level configuration.
///
/// All fields have defaults matching the small reference configuration
/// (a 2x2 grid of kamlets, 128 instruction identifiers).
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct LamletParams {
    /// Kamlet grid columns.
    pub k_cols: u8,
    /// Kamlet grid rows.
    pub k_rows: u8,
    /// Instruction identifier modulus `M`. Identifiers wrap at this value.
    pub max_idents: u16,
    /// Depth of each kamlet's inbound instruction queue (credit pool size).
    pub instruction_queue_length: u32,
    /// Maximum instructions batched into one outbound packet.
    pub instructions_in_packet: usize,
    /// Cycles a non-empty, non-full batch may sit idle before it is flushed.
    pub flush_idle_cycles: u32,
    /// Capacity of the dispatch queue FIFO feeding the batching stage.
    pub instruction_buffer_length: usize,
    /// Concurrently trackable aggregation rounds per sync node.
    pub sync_table_capacity: usize,
    /// Cycles a kamlet stub holds an instruction before retiring it
    /// (emulation harness only).
    pub completion_latency: u32,
}

impl Default for LamletParams {
    fn default() -> Self {
        Self {
            k_cols: 2,
            k_rows: 2,
            max_idents: 128,
            instruction_queue_length: 16,
            instructions_in_packet: 4,
            flush_idle_cycles: 3,
            instruction_buffer_length: 8,
            sync_table_capacity: 4,
            completion_latency: 6,
        }
    }
}

impl LamletParams {
    /// Total number of kamlets in the lamlet.
    pub fn k_in_l(&self) -> usize {
        self.k_cols as usize * self.k_rows as usize
    }

    /// Load parameters from a TOML file and validate them.
    pub fn load(path: &Path) -> Result<Self, ParamsError> {
        let content = std::fs::read_to_string(path)?;
        let params: Self = toml::from_str(&content)?;
        params.validate()?;
        log::info!("Loaded parameters from {}: {:?}", path.display(), params);
        Ok(params)
    }

    /// Check configuration-time invariants.
    ///
    /// `max_idents` must leave room for the all-clear sentinel in a single
    /// wire byte, and the sync table must be able to hold at least one
    /// round. The ident space must also be large enough that the in-flight
    /// window (bounded by total credits) cannot alias across a wrap.
    pub fn validate(&self) -> Result<(), ParamsError> {
        if self.k_cols == 0 || self.k_rows == 0 {
            return Err(ParamsError::Invalid("kamlet grid must be non-empty".into()));
        }
        if self.max_idents < 4 || self.max_idents > 255 {
            return Err(ParamsError::Invalid(format!(
                "max_idents must be in 4..=255, got {}",
                self.max_idents
            )));
        }
        if self.instruction_queue_length < 2 {
            return Err(ParamsError::Invalid(
                "instruction_queue_length must be at least 2 (one credit is reserved)".into(),
            ));
        }
        // Credits bound the number of in-flight instructions per kamlet;
        // aliasing is possible once more than M/2 idents are outstanding.
        let max_in_flight = self.instruction_queue_length as u64 * self.k_in_l() as u64;
        if max_in_flight > self.max_idents as u64 / 2 {
            return Err(ParamsError::Invalid(format!(
                "ident space too small: {} credits total but only {} idents",
                max_in_flight, self.max_idents
            )));
        }
        if self.instructions_in_packet == 0 {
            return Err(ParamsError::Invalid("instructions_in_packet must be non-zero".into()));
        }
        if self.instruction_buffer_length == 0 {
            return Err(ParamsError::Invalid("instruction_buffer_length must be non-zero".into()));
        }
        if self.sync_table_capacity == 0 {
            return Err(ParamsError::Invalid("sync_table_capacity must be non-zero".into()));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_validate() {
        LamletParams::default().validate().unwrap();
    }

    #[test]
    fn test_default_grid() {
        let params = LamletParams::default();
        assert_eq!(params.k_in_l(), 4);
        assert_eq!(params.max_idents, 128);
    }

    #[test]
    fn test_rejects_oversized_ident_demand() {
        let params = LamletParams {
            k_cols: 4,
            k_rows: 4,
            instruction_queue_length: 16,
            ..Default::default()
        };
        // 256 credits against 128 idents would allow wrap aliasing.
        assert!(params.validate().is_err());
    }

    #[test]
    fn test_rejects_wide_ident_space() {
        let params = LamletParams { max_idents: 256, ..Default::default() };
        // Sentinel must fit in one wire byte.
        assert!(matches!(params.validate(), Err(ParamsError::Invalid(_))));
    }

    #[test]
    fn test_parses_partial_toml() {
        let params: LamletParams = toml::from_str("k_cols = 3\nk_rows = 1\n").unwrap();
        assert_eq!(params.k_cols, 3);
        assert_eq!(params.k_rows, 1);
        assert_eq!(params.max_idents, 128);
        params.validate().unwrap();
    }
}

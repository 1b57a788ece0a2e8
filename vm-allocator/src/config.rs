// Copyright © 2026 The Cloud Hypervisor Authors
//
// SPDX-License-Identifier: Apache-2.0
//

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::HPT_ALIGN_ORDER;

/// Percentage of memory reserved exclusively for guest hashed page tables.
pub const DEFAULT_HPT_RESV_RATIO: u64 = 2;
/// Percentage of memory handed to the contiguous pool, shared with movable
/// allocations.
pub const DEFAULT_CMA_RESV_RATIO: u64 = 3;

const HPT_RESV_PARAM: &str = "kvm_hpt_resv_ratio";
const CMA_RESV_PARAM: &str = "kvm_cma_resv_ratio";

#[derive(Error, Debug, PartialEq, Eq)]
pub enum ConfigError {
    #[error("Missing value for boot parameter: {0}")]
    MissingValue(String),
    #[error("Unable to convert {1} for {0}")]
    Conversion(String /* parameter */, String /* value */),
    #[error("Reservation ratio out of range: {0}%")]
    RatioOutOfRange(u64),
}

/// Boot-time sizing of the two page table pools.
#[derive(Clone, Debug, PartialEq, Eq, Deserialize, Serialize)]
#[serde(default)]
pub struct ReservoirConfig {
    pub hpt_resv_ratio: u64,
    pub cma_resv_ratio: u64,
}

impl Default for ReservoirConfig {
    fn default() -> Self {
        ReservoirConfig {
            hpt_resv_ratio: DEFAULT_HPT_RESV_RATIO,
            cma_resv_ratio: DEFAULT_CMA_RESV_RATIO,
        }
    }
}

// Same rules as the kernel's kstrtoul() with base 0.
fn parse_ulong(param: &str, value: &str) -> Result<u64, ConfigError> {
    let conversion = || ConfigError::Conversion(param.to_owned(), value.to_owned());
    let v = value.trim();
    let parsed = if let Some(hex) = v.strip_prefix("0x").or_else(|| v.strip_prefix("0X")) {
        u64::from_str_radix(hex, 16)
    } else if v.len() > 1 && v.starts_with('0') {
        u64::from_str_radix(&v[1..], 8)
    } else {
        v.parse::<u64>()
    };
    parsed.map_err(|_| conversion())
}

fn parse_ratio(param: &str, value: &str) -> Result<u64, ConfigError> {
    let ratio = parse_ulong(param, value)?;
    if ratio > 100 {
        return Err(ConfigError::RatioOutOfRange(ratio));
    }
    Ok(ratio)
}

fn align_up(value: u64, align: u64) -> u64 {
    value.div_ceil(align) * align
}

impl ReservoirConfig {
    /// Pick the reservation ratios out of a kernel command line. Parameters
    /// that do not concern the reservoir are ignored.
    pub fn parse(cmdline: &str) -> Result<Self, ConfigError> {
        let mut config = ReservoirConfig::default();

        for param in cmdline.split_whitespace() {
            let mut parts = param.splitn(2, '=');
            let name = parts.next().unwrap_or_default();
            let value = parts.next();

            let field = match name {
                HPT_RESV_PARAM => &mut config.hpt_resv_ratio,
                CMA_RESV_PARAM => &mut config.cma_resv_ratio,
                _ => continue,
            };

            match value {
                Some(v) if !v.is_empty() => *field = parse_ratio(name, v)?,
                _ => return Err(ConfigError::MissingValue(name.to_owned())),
            }
        }

        Ok(config)
    }

    fn reserve_size(mem_size: u64, ratio: u64) -> u64 {
        let size = (mem_size as u128 * ratio as u128 / 100) as u64;
        align_up(size, 1 << HPT_ALIGN_ORDER)
    }

    /// Bytes to set aside for the reserved HPT region.
    pub fn hpt_reserve_size(&self, mem_size: u64) -> u64 {
        Self::reserve_size(mem_size, self.hpt_resv_ratio)
    }

    /// Bytes to set aside for the contiguous pool.
    pub fn cma_reserve_size(&self, mem_size: u64) -> u64 {
        Self::reserve_size(mem_size, self.cma_resv_ratio)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_cmdline() {
        let config =
            ReservoirConfig::parse("root=/dev/sda1 kvm_hpt_resv_ratio=5 quiet kvm_cma_resv_ratio=0x0a")
                .unwrap();
        assert_eq!(config.hpt_resv_ratio, 5);
        assert_eq!(config.cma_resv_ratio, 10);

        let config = ReservoirConfig::parse("console=hvc0").unwrap();
        assert_eq!(config, ReservoirConfig::default());

        let config = ReservoirConfig::parse("kvm_hpt_resv_ratio=010").unwrap();
        assert_eq!(config.hpt_resv_ratio, 8);
        let config = ReservoirConfig::parse("kvm_hpt_resv_ratio=0").unwrap();
        assert_eq!(config.hpt_resv_ratio, 0);
    }

    #[test]
    fn test_parse_cmdline_errors() {
        assert_eq!(
            ReservoirConfig::parse("kvm_hpt_resv_ratio"),
            Err(ConfigError::MissingValue(HPT_RESV_PARAM.to_owned()))
        );
        assert_eq!(
            ReservoirConfig::parse("kvm_cma_resv_ratio=three"),
            Err(ConfigError::Conversion(
                CMA_RESV_PARAM.to_owned(),
                "three".to_owned()
            ))
        );
        assert_eq!(
            ReservoirConfig::parse("kvm_cma_resv_ratio=101"),
            Err(ConfigError::RatioOutOfRange(101))
        );
    }

    #[test]
    fn test_reserve_sizes() {
        let config = ReservoirConfig::default();
        // 2% and 3% of 1 GiB, rounded up to 256 KiB.
        assert_eq!(config.hpt_reserve_size(1 << 30), 0x148_0000);
        assert_eq!(config.cma_reserve_size(1 << 30), 0x1ec_0000);
        assert_eq!(config.hpt_reserve_size(0), 0);
    }

    #[test]
    fn test_deserialize_partial() {
        let config: ReservoirConfig = serde_json::from_str(r#"{"cma_resv_ratio": 7}"#).unwrap();
        assert_eq!(config.hpt_resv_ratio, DEFAULT_HPT_RESV_RATIO);
        assert_eq!(config.cma_resv_ratio, 7);
    }
}

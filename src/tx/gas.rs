//! Fee computation for first attempts and replacements
//!
//! Everything here is pure: inputs are the fee market snapshot, the policy
//! and, for replacements, the previous price.

use super::types::{BlobInputs, GasPrice, PriceOverrides};
use crate::chain::GasSuggestion;
use crate::config::{L1TxConfig, MIN_REPLACEMENT_BUMP_PERCENTAGE};
use crate::error::{L1TxError, L1TxResult};

use ethers::types::U256;

pub const WEI_PER_GWEI: u64 = 1_000_000_000;
const BASIS_POINTS: u64 = 10_000;
const FACTOR_PRECISION: u64 = 1_000_000;

pub fn gwei(amount: u64) -> U256 {
    U256::from(amount) * U256::from(WEI_PER_GWEI)
}

/// `value * (100 + pct) / 100`, rounded down
pub fn bump_by_percentage(value: U256, pct: f64) -> U256 {
    let bps = ((100.0 + pct) * 100.0).round().max(0.0) as u64;
    value * U256::from(bps) / U256::from(BASIS_POINTS)
}

/// Bump that always yields a strictly larger value, even for tiny inputs
fn strict_bump(value: U256, pct: f64) -> U256 {
    let bumped = bump_by_percentage(value, pct);
    if bumped <= value {
        value + U256::one()
    } else {
        bumped
    }
}

fn scale(value: U256, factor: f64) -> U256 {
    let scaled = (factor * FACTOR_PRECISION as f64).round() as u64;
    value * U256::from(scaled) / U256::from(FACTOR_PRECISION)
}

/// Computes gas prices under one policy
pub struct GasPriceCalculator<'a> {
    config: &'a L1TxConfig,
}

impl<'a> GasPriceCalculator<'a> {
    pub fn new(config: &'a L1TxConfig) -> Self {
        Self { config }
    }

    fn max_fee_cap(&self) -> U256 {
        gwei(self.config.max_gwei)
    }

    fn max_blob_fee_cap(&self) -> U256 {
        gwei(self.config.max_blob_gwei)
    }

    fn min_bump(&self) -> f64 {
        self.config
            .minimum_bump_percentage
            .max(MIN_REPLACEMENT_BUMP_PERCENTAGE)
    }

    /// Base fee growth the transaction can absorb while waiting `stall_time_ms`
    pub fn stall_factor(&self) -> f64 {
        let growth = 1.0 + self.config.base_fee_growth_per_block_percentage / 100.0;
        let blocks = self.config.stall_time_ms as f64 / self.config.block_time_ms.max(1) as f64;
        growth.powf(blocks)
    }

    fn priority_fee(&self, fees: &GasSuggestion) -> U256 {
        match self.config.fixed_priority_fee_per_gas {
            Some(fixed) => U256::from((fixed * WEI_PER_GWEI as f64).round() as u64),
            None => bump_by_percentage(fees.priority_fee, self.config.priority_fee_bump_percentage),
        }
    }

    /// Uncapped first-attempt price: `(priority, max_fee, blob_fee)`
    fn market_price(&self, fees: &GasSuggestion, blob_fee: Option<U256>) -> (U256, U256, U256) {
        let factor = self.stall_factor();
        let priority = self.priority_fee(fees);
        let max_fee = scale(fees.base_fee, factor) + priority;
        let blob = blob_fee.unwrap_or_else(|| scale(self.blob_base_fee(fees), factor));
        (priority, max_fee, blob)
    }

    fn blob_base_fee(&self, fees: &GasSuggestion) -> U256 {
        fees.blob_base_fee.unwrap_or_else(U256::one).max(U256::one())
    }

    /// Price for the first attempt.
    ///
    /// Fails when even the minimum viable fee (current base fee plus the
    /// priority fee) is above `max_gwei`.
    pub fn initial_price(
        &self,
        fees: &GasSuggestion,
        blobs: Option<&BlobInputs>,
    ) -> L1TxResult<GasPrice> {
        let explicit_blob_fee = blobs.and_then(|b| b.max_fee_per_blob_gas);
        let (priority, desired_max_fee, desired_blob_fee) =
            self.market_price(fees, explicit_blob_fee);

        let cap = self.max_fee_cap();
        let floor = fees.base_fee + priority;
        if floor > cap {
            return Err(L1TxError::GasPriceExceedsCap {
                field: "max_fee_per_gas",
                required: floor,
                cap,
            });
        }
        let max_fee_per_gas = desired_max_fee.min(cap);

        let max_fee_per_blob_gas = match blobs {
            Some(_) => {
                let blob_cap = self.max_blob_fee_cap();
                let blob_floor = self.blob_base_fee(fees).max(explicit_blob_fee.unwrap_or_default());
                if blob_floor > blob_cap {
                    return Err(L1TxError::GasPriceExceedsCap {
                        field: "max_fee_per_blob_gas",
                        required: blob_floor,
                        cap: blob_cap,
                    });
                }
                Some(desired_blob_fee.min(blob_cap).max(U256::one()))
            }
            None => None,
        };

        Ok(GasPrice {
            max_fee_per_gas,
            max_priority_fee_per_gas: priority.min(max_fee_per_gas),
            max_fee_per_blob_gas,
        })
    }

    /// Price for a same-nonce replacement of `previous`.
    ///
    /// Every field is strictly above the previous one by at least the
    /// replacement floor, and follows the market up when it moved further.
    /// Blob replacements always carry a bumped `max_fee_per_blob_gas`.
    pub fn retry_price(
        &self,
        previous: &GasPrice,
        fees: &GasSuggestion,
        is_blob: bool,
    ) -> L1TxResult<GasPrice> {
        let bump = self.config.retry_bump_percentage();
        let min_bump = self.min_bump();
        let (market_priority, market_max_fee, market_blob_fee) = self.market_price(fees, None);

        let cap = self.max_fee_cap();
        let min_max_fee = strict_bump(previous.max_fee_per_gas, min_bump);
        if min_max_fee > cap {
            return Err(L1TxError::GasPriceExceedsCap {
                field: "max_fee_per_gas",
                required: min_max_fee,
                cap,
            });
        }
        let max_fee_per_gas = strict_bump(previous.max_fee_per_gas, bump)
            .max(market_max_fee)
            .min(cap);

        let min_priority = strict_bump(previous.max_priority_fee_per_gas, min_bump);
        let max_priority_fee_per_gas = strict_bump(previous.max_priority_fee_per_gas, bump)
            .max(market_priority)
            .min(max_fee_per_gas);
        if max_priority_fee_per_gas < min_priority {
            return Err(L1TxError::GasPriceExceedsCap {
                field: "max_priority_fee_per_gas",
                required: min_priority,
                cap: max_fee_per_gas,
            });
        }

        let max_fee_per_blob_gas = if is_blob {
            let blob_cap = self.max_blob_fee_cap();
            let previous_blob = previous.max_fee_per_blob_gas.unwrap_or_default();
            let min_blob = strict_bump(previous_blob, min_bump);
            if min_blob > blob_cap {
                return Err(L1TxError::GasPriceExceedsCap {
                    field: "max_fee_per_blob_gas",
                    required: min_blob,
                    cap: blob_cap,
                });
            }
            Some(
                strict_bump(previous_blob, bump)
                    .max(market_blob_fee)
                    .min(blob_cap),
            )
        } else {
            None
        };

        Ok(GasPrice {
            max_fee_per_gas,
            max_priority_fee_per_gas,
            max_fee_per_blob_gas,
        })
    }

    /// Apply caller overrides to a computed first-attempt price
    pub fn apply_overrides(
        &self,
        mut price: GasPrice,
        overrides: &PriceOverrides,
    ) -> L1TxResult<GasPrice> {
        if let Some(fee) = overrides.max_fee_per_gas {
            price.max_fee_per_gas = fee;
        }
        if let Some(fee) = overrides.max_priority_fee_per_gas {
            price.max_priority_fee_per_gas = fee;
        }
        if price.max_fee_per_blob_gas.is_some() {
            if let Some(fee) = overrides.max_fee_per_blob_gas {
                price.max_fee_per_blob_gas = Some(fee);
            }
        }

        let cap = self.max_fee_cap();
        if price.max_fee_per_gas > cap {
            return Err(L1TxError::GasPriceExceedsCap {
                field: "max_fee_per_gas",
                required: price.max_fee_per_gas,
                cap,
            });
        }
        if let Some(blob_fee) = price.max_fee_per_blob_gas {
            let blob_cap = self.max_blob_fee_cap();
            if blob_fee > blob_cap {
                return Err(L1TxError::GasPriceExceedsCap {
                    field: "max_fee_per_blob_gas",
                    required: blob_fee,
                    cap: blob_cap,
                });
            }
        }
        if price.max_priority_fee_per_gas > price.max_fee_per_gas {
            return Err(L1TxError::Config(
                "max_priority_fee_per_gas above max_fee_per_gas".into(),
            ));
        }
        Ok(price)
    }
}

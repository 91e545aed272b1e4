//! Gas limit estimation and pre-flight simulation

use crate::chain::{
    retry_transient, BlockOverrides, BlockTag, CallRequest, ChainReader, GasOracle,
    StateOverrides,
};
use crate::error::{L1TxError, L1TxResult, NodeErrorKind};

use ethers::abi::{self, Abi, ParamType, Token};
use ethers::types::{Bytes, U256};
use std::sync::Arc;
use tracing::debug;

/// `Error(string)`
const ERROR_SELECTOR: [u8; 4] = [0x08, 0xc3, 0x79, 0xa0];
/// `Panic(uint256)`
const PANIC_SELECTOR: [u8; 4] = [0x4e, 0x48, 0x7b, 0x71];

/// Estimates gas limits and dry-runs calls against the node
pub struct GasEstimator<C: ?Sized> {
    client: Arc<C>,
}

impl<C: GasOracle + ChainReader + ?Sized> GasEstimator<C> {
    pub fn new(client: Arc<C>) -> Self {
        Self { client }
    }

    /// Gas limit for `call`.
    ///
    /// An explicit limit is used as-is. Otherwise the node estimate is taken
    /// against a block whose gas limit is doubled (so large deployments do not
    /// hit the real block limit) and the buffer is added on top.
    pub async fn estimate_gas(
        &self,
        call: &CallRequest,
        explicit_gas: Option<U256>,
        ignore_block_gas_limit: bool,
        buffer_percentage: f64,
    ) -> L1TxResult<U256> {
        if let Some(gas) = explicit_gas {
            return Ok(gas);
        }

        let block_overrides = if ignore_block_gas_limit {
            None
        } else {
            let latest = retry_transient("get latest block", || {
                self.client.get_block(BlockTag::Latest)
            })
            .await?;
            latest.map(|block| BlockOverrides {
                gas_limit: Some(block.gas_limit.saturating_mul(U256::from(2))),
                ..Default::default()
            })
        };

        let estimate = retry_transient("estimate gas", || {
            self.client.estimate_gas(call, block_overrides.clone())
        })
        .await?;
        let gas_limit = apply_buffer(estimate, buffer_percentage);
        debug!("Estimated gas {} (buffered to {})", estimate, gas_limit);
        Ok(gas_limit)
    }

    /// Dry-run `call` without broadcasting.
    ///
    /// On revert the node error is enriched with the decoded reason. Passing
    /// an ABI enables custom error decoding and keeps ABI payloads in the
    /// formatted message.
    pub async fn simulate(
        &self,
        call: &CallRequest,
        block_overrides: Option<BlockOverrides>,
        state_overrides: Option<StateOverrides>,
        abi: Option<&Abi>,
    ) -> L1TxResult<Bytes> {
        let result = retry_transient("simulate", || {
            self.client
                .call(call, block_overrides.clone(), state_overrides.clone())
        })
        .await;

        match result {
            Ok(output) => Ok(output),
            Err(err) if err.kind == NodeErrorKind::SimulationRevert => {
                let reason = err
                    .revert_data
                    .as_ref()
                    .and_then(|data| decode_revert(data, abi));
                let context = match (reason, &err.revert_data) {
                    (Some(reason), _) => Some(format!("Reverted: {}", reason)),
                    (None, Some(data)) if !data.is_empty() => {
                        Some(format!("Reverted with undecoded data 0x{}", hex::encode(data)))
                    }
                    _ => None,
                };
                let mut err = match context {
                    Some(context) => err.with_context(&context),
                    None => err,
                };
                if abi.is_some() {
                    err = err.with_abi_kept();
                }
                Err(L1TxError::Node(err))
            }
            Err(err) => Err(L1TxError::Node(err)),
        }
    }
}

/// `gas * (100 + pct) / 100`, rounded up
pub fn apply_buffer(gas: U256, pct: f64) -> U256 {
    let bps = U256::from(((100.0 + pct) * 100.0).round().max(0.0) as u64);
    let denominator = U256::from(10_000u64);
    (gas * bps + denominator - 1) / denominator
}

/// Human-readable revert reason for `data`, if it can be decoded
pub fn decode_revert(data: &[u8], abi: Option<&Abi>) -> Option<String> {
    if data.len() < 4 {
        return None;
    }
    let (selector, payload) = data.split_at(4);

    if selector == ERROR_SELECTOR {
        let tokens = abi::decode(&[ParamType::String], payload).ok()?;
        return match tokens.into_iter().next()? {
            Token::String(reason) => Some(reason),
            _ => None,
        };
    }

    if selector == PANIC_SELECTOR {
        let tokens = abi::decode(&[ParamType::Uint(256)], payload).ok()?;
        let code = tokens.into_iter().next()?.into_uint()?;
        return Some(format!("Panic(0x{:x}): {}", code, panic_reason(code.low_u64())));
    }

    let abi = abi?;
    abi.errors()
        .find(|error| &error.signature().as_bytes()[..4] == selector)
        .and_then(|error| {
            let tokens = error.decode(payload).ok()?;
            let args = tokens
                .iter()
                .map(|t| t.to_string())
                .collect::<Vec<_>>()
                .join(", ");
            Some(format!("{}({})", error.name, args))
        })
}

fn panic_reason(code: u64) -> &'static str {
    match code {
        0x01 => "assertion failed",
        0x11 => "arithmetic overflow or underflow",
        0x12 => "division or modulo by zero",
        0x21 => "invalid enum value",
        0x31 => "pop on empty array",
        0x32 => "array index out of bounds",
        0x41 => "out of memory",
        0x51 => "call to uninitialized function",
        _ => "unknown panic code",
    }
}

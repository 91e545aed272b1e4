//! Error types for the L1 transaction manager

use ethers::types::{Bytes, H256, U256};
use lazy_static::lazy_static;
use regex::Regex;
use std::fmt;
use thiserror::Error;

lazy_static! {
    static ref ABI_KEY: Regex = Regex::new(r#""?abi"?\s*[:=]\s*\["#).unwrap();
}

/// Main error type for the transaction manager
#[derive(Error, Debug)]
pub enum L1TxError {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("{0}")]
    Node(#[from] NodeError),

    #[error("Transaction with nonce {nonce} timed out ({reason})")]
    Timeout { nonce: u64, reason: TimeoutReason },

    #[error("Nonce {nonce} was mined by a transaction not sent by this manager ({})", fmt_hash(.tx_hash))]
    UnknownMinedTx { nonce: u64, tx_hash: Option<H256> },

    #[error("Required {field} of {required} wei exceeds the configured cap of {cap} wei")]
    GasPriceExceedsCap {
        field: &'static str,
        required: U256,
        cap: U256,
    },

    #[error("Invalid blob inputs: {0}")]
    InvalidBlobInputs(String),

    #[error("Signing error: {0}")]
    Signing(String),

    #[error("Nonce {nonce} is already being monitored")]
    AlreadyMonitored { nonce: u64 },

    #[error("Nonce {nonce} is already held by a live transaction")]
    NonceConflict { nonce: u64 },

    #[error("No tracked state for nonce {nonce}")]
    StateNotFound { nonce: u64 },

    #[error("Internal error: {0}")]
    Internal(String),
}

impl L1TxError {
    /// Check if error is retryable
    pub fn is_retryable(&self) -> bool {
        match self {
            L1TxError::Node(e) => e.is_transient(),
            L1TxError::Database(_) => true,
            _ => false,
        }
    }

    pub fn is_timeout(&self) -> bool {
        matches!(self, L1TxError::Timeout { .. })
    }

    pub fn is_unknown_mined(&self) -> bool {
        matches!(self, L1TxError::UnknownMinedTx { .. })
    }
}

fn fmt_hash(hash: &Option<H256>) -> String {
    match hash {
        Some(h) => format!("{:?}", h),
        None => "hash unknown".to_string(),
    }
}

/// Result type for transaction manager operations
pub type L1TxResult<T> = Result<T, L1TxError>;

/// Why a monitored transaction stopped waiting
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimeoutReason {
    /// `tx_timeout_ms` elapsed or `tx_timeout_at` was reached
    Deadline,
    /// Every broadcast hash disappeared from the node's pool
    Dropped,
    /// The cancellation itself ran out of time
    CancellationDeadline,
    /// `interrupt()` was called
    Interrupted,
}

impl fmt::Display for TimeoutReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            TimeoutReason::Deadline => "deadline reached",
            TimeoutReason::Dropped => "dropped from mempool",
            TimeoutReason::CancellationDeadline => "cancellation deadline reached",
            TimeoutReason::Interrupted => "monitoring interrupted",
        };
        f.write_str(s)
    }
}

/// Classification of a failure reported by the node
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NodeErrorKind {
    FeeTooLow,
    ReplacementUnderpriced,
    NonceTooLow,
    InsufficientFunds,
    SimulationRevert,
    Transport,
    NotFound,
    Other,
}

/// Typed node/RPC error produced at the client boundary
#[derive(Error, Debug, Clone)]
#[error("{message}")]
pub struct NodeError {
    pub kind: NodeErrorKind,
    /// Human-readable, multi-line message with ABI payloads removed
    pub message: String,
    /// Raw revert payload, when the node returned one
    pub revert_data: Option<Bytes>,
    pub request_body: Option<String>,
    /// Unformatted node message, never logged
    raw: String,
}

impl NodeError {
    pub fn new(kind: NodeErrorKind, message: impl Into<String>) -> Self {
        let message = message.into();
        Self {
            kind,
            raw: message.clone(),
            message,
            revert_data: None,
            request_body: None,
        }
    }

    pub fn transport(message: impl Into<String>) -> Self {
        Self::new(NodeErrorKind::Transport, message)
    }

    /// Translate a raw node message into a typed error.
    ///
    /// This is the only place node error strings are inspected; everything
    /// downstream matches on [`NodeErrorKind`].
    pub fn from_rpc_message(
        raw: &str,
        revert_data: Option<Bytes>,
        request_body: Option<String>,
    ) -> Self {
        let lower = raw.to_lowercase();
        let kind = if lower.contains("replacement transaction underpriced")
            || lower.contains("replacement fee too low")
        {
            NodeErrorKind::ReplacementUnderpriced
        } else if lower.contains("less than block base fee")
            || lower.contains("fee cap less than")
            || lower.contains("transaction underpriced")
            || lower.contains("max fee per gas less than")
        {
            NodeErrorKind::FeeTooLow
        } else if lower.contains("nonce too low") {
            NodeErrorKind::NonceTooLow
        } else if lower.contains("insufficient funds") {
            NodeErrorKind::InsufficientFunds
        } else if revert_data.is_some() || lower.contains("execution reverted") || lower.contains("revert") {
            NodeErrorKind::SimulationRevert
        } else if lower.contains("not found") {
            NodeErrorKind::NotFound
        } else if lower.contains("error sending request")
            || lower.contains("connection")
            || lower.contains("timed out")
            || lower.contains("rate limit")
            || lower.contains("429")
            || lower.contains("503")
        {
            NodeErrorKind::Transport
        } else {
            NodeErrorKind::Other
        };

        Self {
            kind,
            message: format_node_error(raw, request_body.as_deref(), false),
            revert_data,
            request_body,
            raw: raw.to_string(),
        }
    }

    pub fn is_transient(&self) -> bool {
        self.kind == NodeErrorKind::Transport
    }

    /// Re-render the message, keeping ABI payloads when the caller supplied one
    pub fn with_abi_kept(mut self) -> Self {
        self.message = format_node_error(&self.raw, self.request_body.as_deref(), true);
        self
    }

    /// Prefix the readable message, e.g. with a decoded revert reason
    pub fn with_context(mut self, context: &str) -> Self {
        self.message = format!("{}\n{}", context, self.message);
        self
    }
}

/// Render a node error for humans.
///
/// Escaped newlines become literal ones, the request body is appended when
/// known, and any `abi: [...]` payload is cut unless `keep_abi` is set.
pub fn format_node_error(message: &str, request_body: Option<&str>, keep_abi: bool) -> String {
    let mut out = message.replace("\\n", "\n");
    if let Some(body) = request_body {
        out.push_str("\nRequest body: ");
        out.push_str(&body.replace("\\n", "\n"));
    }
    if !keep_abi {
        out = strip_abi(&out);
    }
    out.trim_end().to_string()
}

fn strip_abi(input: &str) -> String {
    let mut out = input.to_string();
    while let Some(m) = ABI_KEY.find(&out) {
        let open = m.end() - 1;
        let close = match matching_bracket(&out, open) {
            Some(idx) => idx,
            // Unbalanced payload, drop everything after the key
            None => out.len() - 1,
        };
        let mut end = close + 1;
        let rest = &out[end..];
        let trimmed = rest.trim_start_matches(|c: char| c == ',' || c == ' ');
        end += rest.len() - trimmed.len();
        out.replace_range(m.start()..end, "");
    }
    out
}

fn matching_bracket(s: &str, open: usize) -> Option<usize> {
    let mut depth = 0usize;
    let mut in_string = false;
    let mut escaped = false;
    for (idx, c) in s[open..].char_indices() {
        if in_string {
            match c {
                _ if escaped => escaped = false,
                '\\' => escaped = true,
                '"' => in_string = false,
                _ => {}
            }
            continue;
        }
        match c {
            '"' => in_string = true,
            '[' | '{' => depth += 1,
            ']' | '}' => {
                depth = depth.saturating_sub(1);
                if depth == 0 {
                    return Some(open + idx);
                }
            }
            _ => {}
        }
    }
    None
}
